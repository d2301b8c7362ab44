//! The distributed vector sum.
//!
//! Every process runs the same sequence: the coordinator announces the vector length, every rank
//! derives its [`Partition`], the coordinator generates the operands, both operands are
//! scattered, each rank adds its chunks, the chunks are gathered back in rank order and a
//! reduction produces the grand total. Only the coordinator ends up with a [`Report`].

use std::fmt;
use std::ops::Range;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::config::Reduction;
use crate::{try_alloc, MPIError, Result, COORDINATOR};

/// Generated operand values lie in `[0, VALUE_BOUND)`.
pub const VALUE_BOUND: i32 = 100;

/// Fill caller-provided storage with values drawn uniformly from `[0, VALUE_BOUND)`.
pub fn fill_operand<R: Rng + ?Sized>(buf: &mut [i32], rng: &mut R) {
    for value in buf.iter_mut() {
        *value = rng.gen_range(0..VALUE_BOUND);
    }
}

/// Allocate and fill an operand of `len` values.
pub fn generate_operand<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Result<Vec<i32>> {
    if len == 0 {
        return Err(MPIError::EmptyVector);
    }
    let mut buf = try_alloc(len)?;
    buf.resize(len, 0);
    fill_operand(&mut buf, rng);
    Ok(buf)
}

/// Element-wise sum of two equal-length chunks.
///
/// Pure: the output depends only on the inputs. Overflow wraps.
pub fn add_chunks(a: &[i32], b: &[i32]) -> Result<Vec<i32>> {
    if a.len() != b.len() {
        return Err(MPIError::LengthMismatch { expected: a.len(), actual: b.len() });
    }
    let mut sum = try_alloc(a.len())?;
    sum.extend(a.iter().zip(b).map(|(x, y)| x.wrapping_add(*y)));
    Ok(sum)
}

fn chunk_total(chunk: &[i32]) -> i64 {
    chunk.iter().fold(0i64, |acc, &value| acc.wrapping_add(i64::from(value)))
}

/// The contiguous slice of a vector owned by one rank.
///
/// Rank `r` of `size` owns global indices `[r * len / size, (r + 1) * len / size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    len: usize,
    size: usize,
    rank: usize,
}

impl Partition {
    /// Fails unless `len > 0`, `rank < size` and `size` divides `len`.
    pub fn new(len: usize, size: usize, rank: usize) -> Result<Self> {
        if len == 0 {
            return Err(MPIError::EmptyVector);
        }
        if rank >= size {
            return Err(MPIError::InvalidRank(rank));
        }
        if len % size != 0 {
            return Err(MPIError::UnevenPartition { len, size });
        }
        Ok(Self { len, size, rank })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn chunk_len(&self) -> usize {
        self.len / self.size
    }

    /// Global indices owned by this rank.
    pub fn range(&self) -> Range<usize> {
        let chunk_len = self.chunk_len();
        self.rank * chunk_len..(self.rank + 1) * chunk_len
    }
}

/// The two input vectors, held only by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operands {
    v1: Vec<i32>,
    v2: Vec<i32>,
}

impl Operands {
    /// Wrap two caller-supplied vectors. Both must be non-empty and of equal length.
    pub fn new(v1: Vec<i32>, v2: Vec<i32>) -> Result<Self> {
        if v1.is_empty() {
            return Err(MPIError::EmptyVector);
        }
        if v1.len() != v2.len() {
            return Err(MPIError::LengthMismatch { expected: v1.len(), actual: v2.len() });
        }
        Ok(Self { v1, v2 })
    }

    /// Generate both operands from `rng`, `v1` first.
    pub fn generate<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Result<Self> {
        let v1 = generate_operand(len, rng)?;
        let v2 = generate_operand(len, rng)?;
        Ok(Self { v1, v2 })
    }

    pub fn len(&self) -> usize {
        self.v1.len()
    }

    pub fn v1(&self) -> &[i32] {
        &self.v1
    }

    pub fn v2(&self) -> &[i32] {
        &self.v2
    }

    /// The sum computed directly, without distributing anything.
    pub fn direct_sum(&self) -> Result<Vec<i32>> {
        add_chunks(&self.v1, &self.v2)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct RunHeader {
    len: usize,
    reduction: Reduction,
}

/// What every rank agrees on before any data moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub partition: Partition,
    pub reduction: Reduction,
}

impl Plan {
    /// Broadcast the coordinator's vector length and reduction strategy, then derive this rank's
    /// partition.
    ///
    /// `len` and `reduction` are only read on the coordinator. Since every rank validates the
    /// same broadcast length, an empty or unevenly divisible vector fails on all ranks together.
    pub fn announce<C: Communicator>(comm: &C, len: usize, reduction: Reduction) -> Result<Self> {
        let header = comm.broadcast(&RunHeader { len, reduction }, COORDINATOR)?;
        let partition = Partition::new(header.len, comm.size(), comm.rank())?;
        debug!("Rank {} owns {:?} of {}", comm.rank(), partition.range(), header.len);
        Ok(Self { partition, reduction: header.reduction })
    }
}

/// The coordinator outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Time from just before generation to the end of the gather.
    pub elapsed: Duration,
    /// The assembled result vector.
    pub result: Vec<i32>,
    /// Sum of `result`, computed locally on the coordinator.
    pub assembled_total: i64,
    /// Sum combined across the group by the reduction.
    pub grand_total: i64,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Time taken by function: {} microseconds", self.elapsed.as_micros())?;
        write!(f, "Total sum of all elements in v3: {}", self.grand_total)
    }
}

/// Rank 0: owns the full operands and receives the assembled result.
#[derive(Debug)]
pub struct Coordinator {
    operands: Operands,
}

/// Any rank other than 0: owns nothing beyond its own chunks.
#[derive(Debug, Default)]
pub struct Worker;

/// The role a rank plays in one run, chosen by its rank.
#[derive(Debug)]
pub enum Participant {
    Coordinator(Coordinator),
    Worker(Worker),
}

impl Coordinator {
    /// Take ownership of the operands to distribute.
    pub fn new(operands: Operands) -> Self {
        Self { operands }
    }

    /// Scatter the operands, add this rank's chunk, gather the result and reduce the grand total.
    ///
    /// Fails with `InvalidRank` when called off rank 0 and with `LengthMismatch` when the
    /// operands disagree with `plan`.
    pub fn run<C: Communicator>(self, comm: &C, plan: &Plan, started: Instant) -> Result<Report> {
        if !comm.is_coordinator() {
            return Err(MPIError::InvalidRank(comm.rank()));
        }
        if self.operands.len() != plan.partition.len() {
            return Err(MPIError::LengthMismatch { expected: plan.partition.len(), actual: self.operands.len() });
        }

        let local = scatter_and_add(comm, Some(&self.operands), &plan.partition)?;
        // The full operands are not needed once every rank holds its chunks
        drop(self.operands);

        let result = comm
            .gather_chunks(&local, COORDINATOR)?
            .ok_or_else(|| MPIError::CommunicationError("Coordinator received no gather result".into()))?;
        let elapsed = started.elapsed();
        info!("Rank {} distributed {} elements in {:?}", comm.rank(), result.len(), elapsed);

        let assembled_total = chunk_total(&result);
        let contribution = match plan.reduction {
            Reduction::PartialSums => chunk_total(&local),
            Reduction::CoordinatorTotal => assembled_total,
        };
        drop(local);

        let grand_total = reduce_total(comm, contribution)?
            .ok_or_else(|| MPIError::CommunicationError("Coordinator received no reduction result".into()))?;
        if grand_total != assembled_total {
            warn!("Reduced total {} differs from assembled total {}", grand_total, assembled_total);
        }

        Ok(Report { elapsed, result, assembled_total, grand_total })
    }
}

impl Worker {
    /// Mirror the coordinator's phases with this rank's chunks. Fails with `InvalidRank` on
    /// rank 0.
    pub fn run<C: Communicator>(self, comm: &C, plan: &Plan, started: Instant) -> Result<()> {
        if comm.is_coordinator() {
            return Err(MPIError::InvalidRank(comm.rank()));
        }

        let local = scatter_and_add(comm, None, &plan.partition)?;
        comm.gather_chunks(&local, COORDINATOR)?;
        debug!("Rank {} distributed phase took {:?}", comm.rank(), started.elapsed());

        let contribution = match plan.reduction {
            Reduction::PartialSums => chunk_total(&local),
            Reduction::CoordinatorTotal => 0,
        };
        reduce_total(comm, contribution)?;
        Ok(())
    }
}

impl Participant {
    /// The role for this rank. The coordinator generates the operands here.
    pub fn new<C: Communicator, R: Rng + ?Sized>(comm: &C, plan: &Plan, rng: &mut R) -> Result<Self> {
        if comm.is_coordinator() {
            let operands = Operands::generate(plan.partition.len(), rng)?;
            Ok(Participant::Coordinator(Coordinator::new(operands)))
        } else {
            Ok(Participant::Worker(Worker))
        }
    }

    /// Run the remaining phases. Returns the report on the coordinator and `None` on workers.
    pub fn run<C: Communicator>(self, comm: &C, plan: &Plan, started: Instant) -> Result<Option<Report>> {
        match self {
            Participant::Coordinator(coordinator) => coordinator.run(comm, plan, started).map(Some),
            Participant::Worker(worker) => worker.run(comm, plan, started).map(|()| None),
        }
    }
}

fn scatter_and_add<C: Communicator>(comm: &C, operands: Option<&Operands>, partition: &Partition) -> Result<Vec<i32>> {
    let chunk_len = partition.chunk_len();
    let local_v1 = comm.scatter_chunks(operands.map(Operands::v1), chunk_len, COORDINATOR)?;
    let local_v2 = comm.scatter_chunks(operands.map(Operands::v2), chunk_len, COORDINATOR)?;
    add_chunks(&local_v1, &local_v2)
}

fn reduce_total<C: Communicator>(comm: &C, contribution: i64) -> Result<Option<i64>> {
    comm.reduce(contribution, COORDINATOR, i64::wrapping_add)
}

/// Run the whole protocol on this rank with generated operands of length `len`.
///
/// Must be called by every rank of the group. `len`, `rng` and `reduction` are only used on the
/// coordinator.
pub fn run<C, R>(comm: &C, len: usize, rng: &mut R, reduction: Reduction) -> Result<Option<Report>>
where
    C: Communicator,
    R: Rng + ?Sized,
{
    let started = Instant::now();
    let plan = Plan::announce(comm, len, reduction)?;
    let participant = Participant::new(comm, &plan, rng)?;
    participant.run(comm, &plan, started)
}

/// Run the whole protocol on this rank with caller-supplied operands.
///
/// The coordinator passes `Some(operands)`, every other rank passes `None`.
pub fn sum_operands<C: Communicator>(comm: &C, operands: Option<Operands>, reduction: Reduction) -> Result<Option<Report>> {
    let started = Instant::now();
    let len = operands.as_ref().map_or(0, Operands::len);
    let participant = match (comm.is_coordinator(), operands) {
        (true, Some(operands)) => Participant::Coordinator(Coordinator::new(operands)),
        (false, None) => Participant::Worker(Worker),
        (true, None) => return Err(MPIError::InitError("Coordinator must provide operands".into())),
        (false, Some(_)) => return Err(MPIError::InitError("Only the coordinator may provide operands".into())),
    };
    let plan = Plan::announce(comm, len, reduction)?;
    participant.run(comm, &plan, started)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::ThreadGroup;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const SEED: u64 = 20240611;

    fn seeded() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(SEED)
    }

    #[test]
    fn test_generate_operand_range_and_length() {
        let v = generate_operand(10_000, &mut seeded()).unwrap();
        assert_eq!(v.len(), 10_000);
        assert!(v.iter().all(|x| (0..VALUE_BOUND).contains(x)));
        // Uniform over 100 values: every value shows up in 10k draws
        assert!((0..VALUE_BOUND).all(|x| v.contains(&x)));
    }

    #[test]
    fn test_generate_operand_is_seed_deterministic() {
        let a = generate_operand(64, &mut seeded()).unwrap();
        let b = generate_operand(64, &mut seeded()).unwrap();
        let c = generate_operand(64, &mut ChaCha8Rng::seed_from_u64(SEED + 1)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_generate_empty_operand_fails() {
        assert!(matches!(generate_operand(0, &mut seeded()), Err(MPIError::EmptyVector)));
    }

    #[test]
    fn test_fill_operand_writes_caller_storage() {
        let mut buf = [-1; 32];
        fill_operand(&mut buf, &mut seeded());
        assert!(buf.iter().all(|x| (0..VALUE_BOUND).contains(x)));
    }

    #[test]
    fn test_partition_ranges() {
        let ranges: Vec<_> = (0..4).map(|rank| Partition::new(8, 4, rank).unwrap().range()).collect();
        assert_eq!(ranges, vec![0..2, 2..4, 4..6, 6..8]);
        assert_eq!(Partition::new(8, 4, 3).unwrap().chunk_len(), 2);
    }

    #[test]
    fn test_partition_preconditions() {
        assert!(matches!(Partition::new(10, 4, 0), Err(MPIError::UnevenPartition { len: 10, size: 4 })));
        assert!(matches!(Partition::new(0, 4, 0), Err(MPIError::EmptyVector)));
        assert!(matches!(Partition::new(8, 4, 4), Err(MPIError::InvalidRank(4))));
    }

    #[test]
    fn test_add_chunks() {
        assert_eq!(add_chunks(&[1, 2, 3], &[10, 20, 30]).unwrap(), vec![11, 22, 33]);
        assert!(matches!(add_chunks(&[1], &[1, 2]), Err(MPIError::LengthMismatch { expected: 1, actual: 2 })));
        assert_eq!(add_chunks(&[i32::MAX], &[1]).unwrap(), vec![i32::MIN]);
    }

    #[test]
    fn test_add_chunks_is_idempotent() {
        let a = generate_operand(128, &mut seeded()).unwrap();
        let b = generate_operand(128, &mut ChaCha8Rng::seed_from_u64(7)).unwrap();
        let first = add_chunks(&a, &b).unwrap();
        let second = add_chunks(&a, &b).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_operands_validation() {
        assert!(matches!(Operands::new(vec![], vec![]), Err(MPIError::EmptyVector)));
        assert!(matches!(
            Operands::new(vec![1, 2], vec![1]),
            Err(MPIError::LengthMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_scatter_delivers_contiguous_slices() {
        const LEN: usize = 64;
        for size in [1, 2, 4, 8] {
            let chunks = ThreadGroup::run(size, |comm| {
                let markers: Vec<i32> = (0..LEN as i32).collect();
                let partition = Partition::new(LEN, comm.size(), comm.rank()).unwrap();
                let source = if comm.is_coordinator() { Some(&markers[..]) } else { None };
                let chunk = comm.scatter_chunks(source, partition.chunk_len(), COORDINATOR).unwrap();
                (partition.range(), chunk)
            });
            for (range, chunk) in chunks {
                let expected: Vec<i32> = range.map(|i| i as i32).collect();
                assert_eq!(chunk, expected, "size {}", size);
            }
        }
    }

    #[test]
    fn test_result_matches_operands_for_every_group_size() {
        const LEN: usize = 1024;
        let operands = Operands::generate(LEN, &mut seeded()).unwrap();
        let expected = operands.direct_sum().unwrap();
        let expected_total: i64 = expected.iter().map(|&x| i64::from(x)).sum();

        for size in [1, 2, 4, 8] {
            let reports = ThreadGroup::run(size, |comm| {
                run(comm, LEN, &mut seeded(), Reduction::PartialSums).unwrap()
            });
            let report = reports[0].as_ref().unwrap();
            assert_eq!(report.result, expected, "size {}", size);
            assert_eq!(report.grand_total, expected_total, "size {}", size);
            assert_eq!(report.assembled_total, expected_total, "size {}", size);
            assert!(reports[1..].iter().all(Option::is_none));
        }
    }

    #[test]
    fn test_single_rank_matches_direct_computation() {
        let operands = Operands::generate(100, &mut seeded()).unwrap();
        let expected = operands.direct_sum().unwrap();
        let reports = ThreadGroup::run(1, |comm| {
            sum_operands(comm, Some(operands.clone()), Reduction::PartialSums).unwrap()
        });
        assert_eq!(reports[0].as_ref().unwrap().result, expected);
    }

    #[test]
    fn test_small_vector_chunk_size_two() {
        let reports = ThreadGroup::run(4, |comm| {
            let operands = comm
                .is_coordinator()
                .then(|| Operands::new((0..8).collect(), (0..8).map(|x| x * 10).collect()).unwrap());
            sum_operands(comm, operands, Reduction::PartialSums).unwrap()
        });
        let report = reports[0].as_ref().unwrap();
        assert_eq!(report.result, vec![0, 11, 22, 33, 44, 55, 66, 77]);
        assert_eq!(report.grand_total, 308);
    }

    #[test]
    fn test_two_ranks_concrete_scenario() {
        for reduction in [Reduction::PartialSums, Reduction::CoordinatorTotal] {
            let reports = ThreadGroup::run(2, |comm| {
                let operands = comm
                    .is_coordinator()
                    .then(|| Operands::new(vec![1, 2, 3, 4, 5, 6, 7, 8], vec![8, 7, 6, 5, 4, 3, 2, 1]).unwrap());
                sum_operands(comm, operands, reduction).unwrap()
            });
            let report = reports[0].as_ref().unwrap();
            assert_eq!(report.result, vec![9; 8]);
            assert_eq!(report.grand_total, 72);
            assert_eq!(report.assembled_total, 72);
        }
    }

    #[test]
    fn test_reduction_strategies_agree() {
        let totals: Vec<i64> = [Reduction::PartialSums, Reduction::CoordinatorTotal]
            .into_iter()
            .map(|reduction| {
                let reports = ThreadGroup::run(4, |comm| run(comm, 256, &mut seeded(), reduction).unwrap());
                reports[0].as_ref().unwrap().grand_total
            })
            .collect();
        assert_eq!(totals[0], totals[1]);
    }

    #[test]
    fn test_uneven_length_fails_on_every_rank() {
        let results = ThreadGroup::run(4, |comm| run(comm, 10, &mut seeded(), Reduction::PartialSums));
        for result in results {
            assert!(matches!(result, Err(MPIError::UnevenPartition { len: 10, size: 4 })));
        }
    }

    #[test]
    fn test_worker_role_on_coordinator_rank_is_rejected() {
        let results = ThreadGroup::run(1, |comm| {
            let partition = Partition::new(2, 1, 0).unwrap();
            let plan = Plan { partition, reduction: Reduction::PartialSums };
            Worker.run(comm, &plan, Instant::now())
        });
        assert!(matches!(results[0], Err(MPIError::InvalidRank(0))));
    }

    #[test]
    fn test_report_display() {
        let report = Report {
            elapsed: Duration::from_micros(1234567),
            result: vec![9; 8],
            assembled_total: 72,
            grand_total: 72,
        };
        assert_eq!(
            report.to_string(),
            "Time taken by function: 1234567 microseconds\nTotal sum of all elements in v3: 72"
        );
    }
}
