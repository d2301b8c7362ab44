//! A process group of OS processes communicating through POSIX shared memory.
//!
//! The root process creates one shared memory segment holding a small shared state header
//! followed by one message slot for every ordered `(src, dst)` pair, then re-executes the current
//! binary once per additional rank. Spawned processes find the segment and their rank through
//! environment variables, so every process runs the same program text (SPMD).

use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use log::{debug, warn};
use shared_memory::{Shmem, ShmemConf};

use crate::comm::Communicator;
use crate::{try_alloc, MPIError, Result};

/// Largest group [`World::init`] accepts.
pub const MAX_PROCS: usize = 32;

const MAX_MSG_SIZE: usize = 1024 * 1024; // 1MB per fragment
const HEADER_SIZE: usize = std::mem::size_of::<MessageHeader>();
const SLOT_SIZE: usize = HEADER_SIZE + MAX_MSG_SIZE;
const STATE_SIZE: usize = std::mem::size_of::<SharedState>();
const SPINS_BEFORE_YIELD: u32 = 1 << 10;

/// Set on every spawned process to the rank it should take.
pub const RANK_ENV: &str = "VECSUM_RANK";
pub(crate) const SHM_ENV: &str = "VECSUM_SHM";

#[repr(C)]
struct MessageHeader {
    valid: AtomicBool,
    received: AtomicBool,
    tag: AtomicU32,
    len: AtomicUsize,
    total: AtomicUsize,
}

impl MessageHeader {
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            received: AtomicBool::new(false),
            tag: AtomicU32::new(0),
            len: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }
}

#[repr(C)]
struct SharedState {
    size: AtomicUsize,
    init_flags: [AtomicBool; MAX_PROCS], // Flags for initialization synchronization
    done_flags: [AtomicBool; MAX_PROCS], // Flags for shutdown synchronization
}

/// The process group this process belongs to.
///
/// `World` owns this process's mapping of the shared segment and, on the root, the handles of
/// the spawned processes. Call [`World::destruct`] on every rank for an orderly shutdown; a root
/// `World` dropped without it terminates its children.
///
/// # Examples
///
/// ```rust,no_run
/// use mpi_vector_sum::{Communicator, World};
///
/// let world = World::init(4).unwrap();
///
/// let data: Vec<i32> = (0..8).collect();
/// let source = if world.is_coordinator() { Some(&data[..]) } else { None };
/// let chunk = world.scatter_chunks(source, 2, 0).unwrap();
/// println!("Rank {} got {:?}", world.rank(), chunk);
///
/// world.destruct().unwrap();
/// ```
pub struct World {
    rank: usize,
    size: usize,
    shmem: Shmem,
    children: Vec<Child>,
    finished: bool,
}

impl World {
    /// Initialize the process group and return this process's membership.
    ///
    /// Called in the launched process, this creates the shared segment, spawns `size - 1` copies
    /// of the current executable with inherited stdio and the same arguments, and returns rank 0.
    /// Called in a spawned copy, it attaches to the segment and returns the rank it was given.
    /// Either way it blocks until every rank has attached.
    ///
    /// # Arguments
    ///
    /// * `size` - The total number of processes, in `1..=MAX_PROCS`
    pub fn init(size: usize) -> Result<Self> {
        if size == 0 || size > MAX_PROCS {
            return Err(MPIError::InitError(format!("Size must be in 1..={}, got {}", MAX_PROCS, size)));
        }

        // Check if we're a spawned process
        if let Ok(rank) = std::env::var(RANK_ENV) {
            return Self::init_spawned(size, &rank);
        }

        let os_id = format!("/vecsum_{}", std::process::id());
        let total_size = STATE_SIZE + size * size * SLOT_SIZE;
        debug!("Creating shared memory {} of size {}", os_id, total_size);

        let shmem = ShmemConf::new()
            .size(total_size)
            .os_id(&os_id)
            .create()
            .map_err(|e| MPIError::SharedMemoryError(e.to_string()))?;

        let mut world = World { rank: 0, size, shmem, children: Vec::with_capacity(size - 1), finished: false };

        // A fresh segment is zero-filled, so only the non-zero fields need storing
        world.state().size.store(size, Ordering::SeqCst);
        for slot in 0..size * size {
            // SAFETY: every slot lies inside the segment and is suitably aligned for the header
            unsafe {
                let header_ptr = world.shmem.as_ptr().add(STATE_SIZE + slot * SLOT_SIZE) as *mut MessageHeader;
                std::ptr::write(header_ptr, MessageHeader::new());
            }
        }
        world.state().init_flags[0].store(true, Ordering::SeqCst);

        let exe = std::env::current_exe().map_err(|e| MPIError::ProcessError(e.to_string()))?;
        for rank in 1..size {
            let child = Command::new(&exe)
                .args(std::env::args_os().skip(1))
                .env(RANK_ENV, rank.to_string())
                .env(SHM_ENV, &os_id)
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|e| MPIError::ProcessError(e.to_string()))?;
            debug!("Spawned rank {} as process {}", rank, child.id());
            world.children.push(child);
        }

        world.wait_for_spawned()?;
        debug!("Parent process initialized as rank 0");
        Ok(world)
    }

    /// Initialize as a spawned process
    fn init_spawned(size: usize, rank: &str) -> Result<Self> {
        let rank = parse_rank(rank, size)?;
        let os_id = std::env::var(SHM_ENV)
            .map_err(|_| MPIError::InitError(format!("{} is not set for spawned rank {}", SHM_ENV, rank)))?;
        debug!("Spawned process {} attaching to {} as rank {}", std::process::id(), os_id, rank);

        let shmem = ShmemConf::new()
            .os_id(&os_id)
            .open()
            .map_err(|e| MPIError::SharedMemoryError(e.to_string()))?;

        let world = World { rank, size, shmem, children: Vec::new(), finished: false };

        let group_size = world.state().size.load(Ordering::SeqCst);
        if group_size != size {
            return Err(MPIError::InitError(format!(
                "Group was created with {} processes, rank {} expected {}",
                group_size, rank, size
            )));
        }

        world.state().init_flags[rank].store(true, Ordering::SeqCst);
        world.wait_for_all(|state, rank| state.init_flags[rank].load(Ordering::SeqCst));

        debug!("Process initialized as rank {}", rank);
        Ok(world)
    }

    fn state(&self) -> &SharedState {
        // SAFETY: the segment starts with a `SharedState` and outlives `self`
        unsafe { &*(self.shmem.as_ptr() as *const SharedState) }
    }

    fn slot_ptr(&self, src: usize, dst: usize) -> *mut u8 {
        let slot_index = src * self.size + dst; // Each src->dst pair gets its own slot
        // SAFETY: src and dst are checked ranks, so the slot lies inside the segment
        unsafe { self.shmem.as_ptr().add(STATE_SIZE + slot_index * SLOT_SIZE) }
    }

    fn header(&self, src: usize, dst: usize) -> &MessageHeader {
        // SAFETY: every slot header was initialized by the root before any rank attached
        unsafe { &*(self.slot_ptr(src, dst) as *const MessageHeader) }
    }

    /// Wait on the root until every spawned rank has attached, failing if one exits first.
    fn wait_for_spawned(&mut self) -> Result<()> {
        // SAFETY: the segment starts with a `SharedState` and outlives this call
        let state = unsafe { &*(self.shmem.as_ptr() as *const SharedState) };
        for (index, child) in self.children.iter_mut().enumerate() {
            let rank = index + 1;
            try_spin_until(
                || state.init_flags[rank].load(Ordering::SeqCst),
                || match child.try_wait() {
                    Ok(None) => Ok(()),
                    Ok(Some(status)) => Err(MPIError::ProcessError(format!(
                        "Rank {} exited during initialization with {}",
                        rank, status
                    ))),
                    Err(e) => Err(MPIError::ProcessError(e.to_string())),
                },
            )?;
        }
        Ok(())
    }

    /// Process ids of the ranks this root spawned, in rank order. Empty on spawned ranks.
    pub fn spawned_pids(&self) -> Vec<u32> {
        self.children.iter().map(Child::id).collect()
    }

    fn wait_for_all(&self, flag: impl Fn(&SharedState, usize) -> bool) {
        let state = self.state();
        for rank in 0..self.size {
            spin_until(|| flag(state, rank));
        }
    }

    /// Receive one message from `source`, handing each fragment to `sink` together with the total
    /// message length and the fragment's offset.
    fn recv_fragments<F>(&self, source: usize, tag: u32, mut sink: F) -> Result<()>
    where
        F: FnMut(usize, usize, &[u8]) -> Result<()>,
    {
        self.check_rank(source)?;
        debug!("Rank {} receiving from rank {} with tag {}", self.rank, source, tag);

        let slot_ptr = self.slot_ptr(source, self.rank);
        let header = self.header(source, self.rank);
        let mut offset = 0;

        loop {
            spin_until(|| header.valid.load(Ordering::SeqCst) && header.tag.load(Ordering::SeqCst) == tag);

            let total = header.total.load(Ordering::SeqCst);
            let len = header.len.load(Ordering::SeqCst);
            // SAFETY: the sender wrote `len <= MAX_MSG_SIZE` bytes after the header before
            // publishing `valid`, and does not touch them until we acknowledge
            let fragment = unsafe { std::slice::from_raw_parts(slot_ptr.add(HEADER_SIZE), len) };
            let outcome = sink(total, offset, fragment);

            // Acknowledge receipt and mark slot as free
            header.received.store(true, Ordering::SeqCst);
            header.valid.store(false, Ordering::SeqCst);
            outcome?;

            offset += len;
            if offset >= total {
                break;
            }
        }

        debug!("Rank {} completed receive from rank {}", self.rank, source);
        Ok(())
    }

    /// Synchronize shutdown of the group and release this process's resources.
    ///
    /// Every rank must call this. Spawned ranks flag completion and detach; the root waits for
    /// every flag, reaps the spawned processes and reports any that exited unsuccessfully.
    pub fn destruct(mut self) -> Result<()> {
        if self.rank == 0 {
            debug!("Parent process waiting for children to finish");
            {
                let state = self.state();
                for rank in 1..self.size {
                    spin_until(|| state.done_flags[rank].load(Ordering::SeqCst));
                }
            }

            for (index, child) in self.children.iter_mut().enumerate() {
                let status = child.wait().map_err(|e| MPIError::ProcessError(e.to_string()))?;
                if !status.success() {
                    return Err(MPIError::ProcessError(format!("Rank {} exited with {}", index + 1, status)));
                }
            }
        } else {
            self.state().done_flags[self.rank].store(true, Ordering::SeqCst);
        }

        self.finished = true;
        debug!("Process {} finished", self.rank);
        Ok(())
    }
}

impl Communicator for World {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    /// Messages larger than one slot are sent as consecutive fragments; each fragment blocks
    /// until the receiver has copied it out.
    fn send_bytes(&self, bytes: &[u8], dest: usize, tag: u32) -> Result<()> {
        self.check_rank(dest)?;
        if dest == self.rank {
            // Our own slot would never be drained
            return Err(MPIError::CommunicationError(format!("Rank {} cannot send to itself", dest)));
        }
        debug!("Rank {} sending {} bytes to rank {} with tag {}", self.rank, bytes.len(), dest, tag);

        let slot_ptr = self.slot_ptr(self.rank, dest);
        let header = self.header(self.rank, dest);
        let total = bytes.len();

        let mut fragments = bytes.chunks(MAX_MSG_SIZE);
        // An empty message still travels as one empty fragment
        let first = fragments.next().unwrap_or(&[]);

        for fragment in std::iter::once(first).chain(fragments) {
            // Wait for slot to be free
            spin_until(|| !header.valid.load(Ordering::SeqCst));

            header.tag.store(tag, Ordering::SeqCst);
            header.len.store(fragment.len(), Ordering::SeqCst);
            header.total.store(total, Ordering::SeqCst);
            header.received.store(false, Ordering::SeqCst);
            // SAFETY: the slot is free and a fragment never exceeds MAX_MSG_SIZE
            unsafe {
                std::ptr::copy_nonoverlapping(fragment.as_ptr(), slot_ptr.add(HEADER_SIZE), fragment.len());
            }

            // Mark message as valid and wait for receiver to acknowledge
            header.valid.store(true, Ordering::SeqCst);
            spin_until(|| header.received.load(Ordering::SeqCst));
        }

        debug!("Rank {} completed send to rank {}", self.rank, dest);
        Ok(())
    }

    fn recv_bytes(&self, source: usize, tag: u32) -> Result<Vec<u8>> {
        let mut message = Vec::new();
        self.recv_fragments(source, tag, |total, offset, fragment| {
            if offset == 0 {
                message = try_alloc(total)?;
            }
            message.extend_from_slice(fragment);
            Ok(())
        })?;
        Ok(message)
    }

    fn recv_exact(&self, buf: &mut [u8], source: usize, tag: u32) -> Result<()> {
        self.recv_fragments(source, tag, |total, offset, fragment| {
            if total != buf.len() {
                return Err(MPIError::LengthMismatch { expected: buf.len(), actual: total });
            }
            buf[offset..offset + fragment.len()].copy_from_slice(fragment);
            Ok(())
        })
    }
}

impl Drop for World {
    fn drop(&mut self) {
        if self.finished || self.children.is_empty() {
            return;
        }
        warn!("Rank {} dropped without destruct, terminating {} spawned processes", self.rank, self.children.len());
        for child in &mut self.children {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn parse_rank(value: &str, size: usize) -> Result<usize> {
    let rank: usize = value
        .parse()
        .map_err(|_| MPIError::InitError(format!("{} must be a rank, got {:?}", RANK_ENV, value)))?;
    if rank == 0 || rank >= size {
        return Err(MPIError::InvalidRank(rank));
    }
    Ok(rank)
}

fn spin_until(ready: impl FnMut() -> bool) {
    // An abort check that never fails cannot produce an error
    let _ = try_spin_until(ready, || Ok(()));
}

/// Spin until `ready`, running `abort` every time the loop yields and returning its error.
fn try_spin_until(mut ready: impl FnMut() -> bool, mut abort: impl FnMut() -> Result<()>) -> Result<()> {
    let mut spins = 0;
    while !ready() {
        if spins < SPINS_BEFORE_YIELD {
            spins += 1;
            std::hint::spin_loop();
        } else {
            abort()?;
            std::thread::yield_now();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sum_operands, Operands, Reduction};

    #[test]
    fn test_slot_layout_keeps_headers_aligned() {
        let align = std::mem::align_of::<MessageHeader>();
        assert_eq!(STATE_SIZE % align, 0);
        assert_eq!(SLOT_SIZE % align, 0);
    }

    #[test]
    fn test_init_rejects_bad_sizes() {
        assert!(matches!(World::init(0), Err(MPIError::InitError(_))));
        assert!(matches!(World::init(MAX_PROCS + 1), Err(MPIError::InitError(_))));
    }

    #[test]
    fn test_parse_rank() {
        assert_eq!(parse_rank("3", 4).unwrap(), 3);
        assert!(matches!(parse_rank("0", 4), Err(MPIError::InvalidRank(0))));
        assert!(matches!(parse_rank("4", 4), Err(MPIError::InvalidRank(4))));
        assert!(matches!(parse_rank("two", 4), Err(MPIError::InitError(_))));
    }

    #[test]
    fn test_single_rank_world_runs_protocol() {
        let world = World::init(1).unwrap();
        assert_eq!((world.rank(), world.size()), (0, 1));

        let operands = Operands::new(vec![1, 2, 3, 4], vec![4, 3, 2, 1]).unwrap();
        let report = sum_operands(&world, Some(operands), Reduction::PartialSums).unwrap().unwrap();
        assert_eq!(report.result, vec![5; 4]);
        assert_eq!(report.grand_total, 20);

        // Segment names are per process, so this is the only unit test that creates a World
        assert!(world.spawned_pids().is_empty());
        assert!(matches!(world.send(&1u8, 0, 1), Err(MPIError::CommunicationError(_))));

        world.destruct().unwrap();
    }

    #[test]
    fn test_try_spin_until_stops_on_abort() {
        let mut checks = 0;
        let result = try_spin_until(
            || false,
            || {
                checks += 1;
                if checks == 3 {
                    Err(MPIError::ProcessError("gone".into()))
                } else {
                    Ok(())
                }
            },
        );
        assert!(matches!(result, Err(MPIError::ProcessError(_))));
        assert_eq!(checks, 3);
    }

    #[test]
    fn test_spin_until_returns_once_ready() {
        let mut calls = 0;
        spin_until(|| {
            calls += 1;
            calls > 2000
        });
        assert_eq!(calls, 2001);
    }
}
