//! Point-to-point transport and the collective operations built on it.
//!
//! A transport only has to move tagged byte messages between two ranks, blocking until the
//! receiver has taken them. Everything else (barrier, broadcast, scatter, gather, reduce) is
//! provided by [`Communicator`] on top of those two primitives, so [`crate::World`] and
//! [`crate::ThreadGroup`] share one implementation of the collective protocol.
//!
//! Every collective must be called by all ranks of the group, in the same order, with the same
//! root. A rank that skips a collective leaves the others blocked forever.

use bytemuck::Pod;
use log::debug;
use serde::{de::DeserializeOwned, Serialize};

use crate::{try_alloc, MPIError, Result};

pub(crate) const TAG_BARRIER_ARRIVE: u32 = 1;
pub(crate) const TAG_BARRIER_COMPLETE: u32 = 2;
pub(crate) const TAG_BROADCAST: u32 = 3;
pub(crate) const TAG_SCATTER: u32 = 4;
pub(crate) const TAG_GATHER: u32 = 5;
pub(crate) const TAG_REDUCE: u32 = 6;

/// A member of a fixed, ordered process group.
///
/// Implementors provide identity and blocking byte transport; the collectives are provided
/// methods.
///
/// # Examples
///
/// ```rust
/// use mpi_vector_sum::{Communicator, ThreadGroup};
///
/// let sums = ThreadGroup::run(4, |comm| {
///     comm.reduce(comm.rank() as i64, 0, |a, b| a + b).unwrap()
/// });
///
/// assert_eq!(sums[0], Some(6));
/// assert!(sums[1..].iter().all(Option::is_none));
/// ```
pub trait Communicator {
    /// Rank of this process, in `[0, size())`.
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn size(&self) -> usize;

    /// Send a tagged byte message to `dest`, blocking until it has been received. Sending to
    /// one's own rank is a `CommunicationError`.
    fn send_bytes(&self, bytes: &[u8], dest: usize, tag: u32) -> Result<()>;

    /// Receive a tagged byte message of any length from `source`.
    fn recv_bytes(&self, source: usize, tag: u32) -> Result<Vec<u8>>;

    /// Receive a tagged byte message from `source` whose length must equal `buf.len()`.
    fn recv_exact(&self, buf: &mut [u8], source: usize, tag: u32) -> Result<()>;

    /// Whether this rank is the coordinator, rank 0.
    fn is_coordinator(&self) -> bool {
        self.rank() == crate::COORDINATOR
    }

    /// `InvalidRank` unless `rank` is a member of this group.
    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.size() {
            return Err(MPIError::InvalidRank(rank));
        }
        Ok(())
    }

    /// Serialize `data` with bincode and send it to `dest`.
    fn send<T: Serialize>(&self, data: &T, dest: usize, tag: u32) -> Result<()> {
        let serialized =
            bincode::serialize(data).map_err(|e| MPIError::SerializationError(e.to_string()))?;
        self.send_bytes(&serialized, dest, tag)
    }

    /// Receive a bincode-encoded value from `source`.
    fn recv<T: DeserializeOwned>(&self, source: usize, tag: u32) -> Result<T> {
        let bytes = self.recv_bytes(source, tag)?;
        bincode::deserialize(&bytes).map_err(|e| MPIError::SerializationError(e.to_string()))
    }

    /// Barrier synchronization - blocks until all processes reach this point.
    fn barrier(&self) -> Result<()> {
        let root = crate::COORDINATOR;
        debug!("Rank {} entering barrier", self.rank());

        // First phase: everyone reports to root
        if self.rank() == root {
            for rank in (0..self.size()).filter(|&r| r != root) {
                self.recv::<()>(rank, TAG_BARRIER_ARRIVE)?;
            }
        } else {
            self.send(&(), root, TAG_BARRIER_ARRIVE)?;
        }

        // Second phase: root releases everyone
        if self.rank() == root {
            for rank in (0..self.size()).filter(|&r| r != root) {
                self.send(&(), rank, TAG_BARRIER_COMPLETE)?;
            }
        } else {
            self.recv::<()>(root, TAG_BARRIER_COMPLETE)?;
        }

        debug!("Rank {} exiting barrier", self.rank());
        Ok(())
    }

    /// Broadcast `data` from `root` to all ranks. The value passed by non-root ranks is ignored.
    fn broadcast<T: Serialize + DeserializeOwned + Clone>(&self, data: &T, root: usize) -> Result<T> {
        self.check_rank(root)?;
        debug!("Rank {} entering broadcast", self.rank());

        let result = if self.rank() == root {
            for rank in (0..self.size()).filter(|&r| r != root) {
                self.send(data, rank, TAG_BROADCAST)?;
            }
            data.clone()
        } else {
            self.recv(root, TAG_BROADCAST)?
        };

        debug!("Rank {} completed broadcast", self.rank());
        Ok(result)
    }

    /// Scatter equal contiguous chunks of a root-held slice to every rank, root included.
    ///
    /// The root must pass exactly `chunk_len * size()` elements; rank `r` receives elements
    /// `[r * chunk_len, (r + 1) * chunk_len)`. Other ranks pass `None`. Every rank must pass the
    /// same `chunk_len`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mpi_vector_sum::{Communicator, ThreadGroup};
    ///
    /// let chunks = ThreadGroup::run(2, |comm| {
    ///     let data: Vec<i32> = (0..4).collect();
    ///     let source = if comm.is_coordinator() { Some(&data[..]) } else { None };
    ///     comm.scatter_chunks(source, 2, 0).unwrap()
    /// });
    ///
    /// assert_eq!(chunks, vec![vec![0, 1], vec![2, 3]]);
    /// ```
    fn scatter_chunks<T: Pod>(&self, data: Option<&[T]>, chunk_len: usize, root: usize) -> Result<Vec<T>> {
        self.check_rank(root)?;
        if chunk_len == 0 {
            return Err(MPIError::EmptyVector);
        }

        debug!("Rank {} entering scatter of {} elements per rank", self.rank(), chunk_len);

        let piece = if self.rank() == root {
            let data = data
                .ok_or_else(|| MPIError::InitError("Root must provide data for scatter".into()))?;
            let expected = chunk_len * self.size();
            if data.len() != expected {
                return Err(MPIError::LengthMismatch { expected, actual: data.len() });
            }

            for (rank, chunk) in data.chunks_exact(chunk_len).enumerate() {
                if rank != root {
                    debug!("Root sending chunk to rank {}", rank);
                    self.send_bytes(bytemuck::cast_slice(chunk), rank, TAG_SCATTER)?;
                }
            }

            let own = &data[root * chunk_len..(root + 1) * chunk_len];
            let mut piece = try_alloc(chunk_len)?;
            piece.extend_from_slice(own);
            piece
        } else {
            let mut piece = zeroed_vec::<T>(chunk_len)?;
            self.recv_exact(bytemuck::cast_slice_mut(&mut piece), root, TAG_SCATTER)?;
            piece
        };

        // Barrier to ensure all processes have completed
        self.barrier()?;

        debug!("Rank {} completed scatter", self.rank());
        Ok(piece)
    }

    /// Gather every rank's chunk onto `root`, concatenated in rank order.
    ///
    /// All chunks must have the same length. Returns `Some` on the root and `None` elsewhere.
    fn gather_chunks<T: Pod>(&self, local: &[T], root: usize) -> Result<Option<Vec<T>>> {
        self.check_rank(root)?;
        debug!("Rank {} entering gather", self.rank());

        let result = if self.rank() == root {
            let chunk_len = local.len();
            let mut gathered = try_alloc::<T>(chunk_len * self.size())?;

            for rank in 0..self.size() {
                if rank == root {
                    gathered.extend_from_slice(local);
                } else {
                    debug!("Root receiving chunk from rank {}", rank);
                    let start = gathered.len();
                    gathered.resize(start + chunk_len, T::zeroed());
                    self.recv_exact(bytemuck::cast_slice_mut(&mut gathered[start..]), rank, TAG_GATHER)?;
                }
            }

            Some(gathered)
        } else {
            self.send_bytes(bytemuck::cast_slice(local), root, TAG_GATHER)?;
            None
        };

        // Barrier to ensure all processes have completed
        self.barrier()?;

        debug!("Rank {} completed gather", self.rank());
        Ok(result)
    }

    /// Combine one value per rank into a single value on `root`.
    ///
    /// Values are combined along a binomial tree, so `op` must be associative and commutative.
    /// Returns `Some` on the root and `None` elsewhere.
    fn reduce<T, F>(&self, value: T, root: usize, op: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(T, T) -> T,
    {
        self.check_rank(root)?;
        debug!("Rank {} entering reduce", self.rank());

        let size = self.size();
        // Position relative to root, so the tree is rooted at `root`
        let vrank = (self.rank() + size - root) % size;
        let mut acc = Some(value);
        let mut step = 1;

        while step < size {
            if vrank & step != 0 {
                if let Some(partial) = acc.take() {
                    let parent = (vrank - step + root) % size;
                    self.send(&partial, parent, TAG_REDUCE)?;
                }
                break;
            }
            if vrank + step < size {
                let child = (vrank + step + root) % size;
                let incoming: T = self.recv(child, TAG_REDUCE)?;
                acc = acc.map(|partial| op(partial, incoming));
            }
            step <<= 1;
        }

        // Barrier to ensure all processes have completed
        self.barrier()?;

        debug!("Rank {} completed reduce", self.rank());
        Ok(acc)
    }
}

fn zeroed_vec<T: Pod>(len: usize) -> Result<Vec<T>> {
    let mut buf = try_alloc(len)?;
    buf.resize(len, T::zeroed());
    Ok(buf)
}
