//! Distributed vector addition over a single-machine process group.
//!
//! A coordinator process generates two operand vectors, scatters equal contiguous chunks of
//! them to every process in the group, each process adds its chunks element-wise, and the
//! coordinator gathers the partial results back in rank order. A group-wide reduction then
//! produces the grand total of the result vector.
//!
//! # Features
//!
//! - **Process Management**: Spawn and coordinate a fixed group of OS processes ([`World`])
//! - **Collective Operations**: Barrier, broadcast, scatter, gather and reduce ([`Communicator`])
//! - **In-process Groups**: The same collectives over threads, for testing roles ([`ThreadGroup`])
//! - **Vector Sum Protocol**: Coordinator and worker roles driving scatter, compute, gather
//!   and reduce ([`Participant`])
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mpi_vector_sum::{run, Reduction, World};
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha8Rng;
//!
//! // Initialize a group of 4 processes
//! let world = World::init(4).unwrap();
//!
//! let mut rng = ChaCha8Rng::seed_from_u64(7);
//! let report = run(&world, 1024, &mut rng, Reduction::PartialSums).unwrap();
//!
//! // Only the coordinator gets a report
//! if let Some(report) = report {
//!     println!("{}", report);
//! }
//!
//! world.destruct().unwrap();
//! ```
//!
//! # Architecture
//!
//! [`World`] uses POSIX shared memory (`/dev/shm` on Linux) to establish communication channels
//! between processes. Each process pair gets a dedicated memory slot for message passing and
//! messages larger than a slot are sent as a sequence of fragments. All collectives are written
//! once against the [`Communicator`] trait and work for any transport that provides blocking
//! point-to-point byte messages.
//!
//! # Error Handling
//!
//! All operations return a `Result` type with detailed error variants through [`MPIError`].
//! A process that never reaches a collective blocks the rest of the group indefinitely; there is
//! no timeout or deadlock detection.

use std::collections::TryReserveError;

use thiserror::Error;

pub mod comm;
pub mod config;
pub mod local;
pub mod vector_sum;
pub mod world;

pub use comm::Communicator;
pub use config::{GroupConfig, Reduction};
pub use local::{LocalEndpoint, ThreadGroup};
pub use vector_sum::{
    add_chunks, fill_operand, generate_operand, run, sum_operands, Coordinator, Operands, Participant,
    Partition, Plan, Report, Worker, VALUE_BOUND,
};
pub use world::{World, MAX_PROCS, RANK_ENV};

/// Length of each operand vector in the reference configuration.
pub const VECTOR_LEN: usize = 100_000_000;

/// Rank of the coordinator process.
pub const COORDINATOR: usize = 0;

#[derive(Error, Debug)]
pub enum MPIError {
    #[error("Invalid rank: {0}")]
    InvalidRank(usize),
    #[error("Communication error: {0}")]
    CommunicationError(String),
    #[error("Initialization error: {0}")]
    InitError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Shared memory error: {0}")]
    SharedMemoryError(String),
    #[error("Process error: {0}")]
    ProcessError(String),
    #[error("Vector length {len} is not divisible by group size {size}")]
    UnevenPartition { len: usize, size: usize },
    #[error("Vector length must be positive")]
    EmptyVector,
    #[error("Length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("Allocation error: {0}")]
    AllocationError(#[from] TryReserveError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, MPIError>;

/// Allocate an empty vector able to hold `len` elements, reporting allocation failure as an error.
pub(crate) fn try_alloc<T>(len: usize) -> Result<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)?;
    Ok(buf)
}
