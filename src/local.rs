//! An in-process group whose ranks are threads connected by channels.
//!
//! Useful for exercising the coordinator and worker roles at any group size without spawning
//! processes. Every `(src, dst)` pair is a rendezvous channel, so a send blocks until the peer
//! takes the message, as on [`crate::World`]. A tag mismatch is reported as an error instead of
//! blocking.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;

use log::debug;

use crate::comm::Communicator;
use crate::{MPIError, Result};

type Message = (u32, Vec<u8>);

/// One rank of a [`ThreadGroup`].
pub struct LocalEndpoint {
    rank: usize,
    size: usize,
    // Indexed by destination rank
    outbox: Vec<SyncSender<Message>>,
    // Indexed by source rank
    inbox: Vec<Receiver<Message>>,
}

/// Runs the same closure on a fixed number of threads, one per rank.
pub struct ThreadGroup;

impl ThreadGroup {
    /// Build `size` connected endpoints, in rank order.
    pub fn endpoints(size: usize) -> Result<Vec<LocalEndpoint>> {
        if size == 0 {
            return Err(MPIError::InitError("Size must be positive".into()));
        }

        let mut senders: Vec<Vec<SyncSender<Message>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut receivers: Vec<Vec<Receiver<Message>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();

        // One channel per (src, dst) pair, src-major so each list ends up rank-indexed
        for src in 0..size {
            for dst in 0..size {
                let (tx, rx) = mpsc::sync_channel(0);
                senders[src].push(tx);
                receivers[dst].push(rx);
            }
        }

        Ok(senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (outbox, inbox))| LocalEndpoint { rank, size, outbox, inbox })
            .collect())
    }

    /// Run `f` on every rank of a fresh group of `size` threads and return the results in rank
    /// order.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero. A panic on any rank is propagated to the caller.
    pub fn run<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(&LocalEndpoint) -> T + Sync,
    {
        let endpoints = Self::endpoints(size).expect("thread group size must be positive");
        let f = &f;

        thread::scope(|scope| {
            let handles: Vec<_> = endpoints
                .into_iter()
                .map(|endpoint| scope.spawn(move || f(&endpoint)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }
}

impl LocalEndpoint {
    fn take(&self, source: usize, tag: u32) -> Result<Vec<u8>> {
        self.check_rank(source)?;
        let (got, bytes) = self.inbox[source]
            .recv()
            .map_err(|_| MPIError::CommunicationError(format!("Rank {} hung up", source)))?;
        if got != tag {
            return Err(MPIError::CommunicationError(format!(
                "Rank {} expected tag {} from rank {}, got {}",
                self.rank, tag, source, got
            )));
        }
        Ok(bytes)
    }
}

impl Communicator for LocalEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send_bytes(&self, bytes: &[u8], dest: usize, tag: u32) -> Result<()> {
        self.check_rank(dest)?;
        if dest == self.rank {
            return Err(MPIError::CommunicationError(format!("Rank {} cannot send to itself", dest)));
        }
        debug!("Rank {} sending {} bytes to rank {} with tag {}", self.rank, bytes.len(), dest, tag);
        self.outbox[dest]
            .send((tag, bytes.to_vec()))
            .map_err(|_| MPIError::CommunicationError(format!("Rank {} hung up", dest)))
    }

    fn recv_bytes(&self, source: usize, tag: u32) -> Result<Vec<u8>> {
        self.take(source, tag)
    }

    fn recv_exact(&self, buf: &mut [u8], source: usize, tag: u32) -> Result<()> {
        let bytes = self.take(source, tag)?;
        if bytes.len() != buf.len() {
            return Err(MPIError::LengthMismatch { expected: buf.len(), actual: bytes.len() });
        }
        buf.copy_from_slice(&bytes);
        Ok(())
    }
}
