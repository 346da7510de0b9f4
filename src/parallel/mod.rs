//! Process pools, work partitioning and collective communication.
//!
//! The global set of cooperating processes is split into disjoint pools of
//! equal size. A pool jointly holds one partition of the real-space coupling
//! tensor, so three communication scopes arise naturally: the whole world,
//! the processes within one pool, and the processes holding the same in-pool
//! rank across pools. The [`ProcessGroup`] value owns the rank and size
//! information for all three scopes together with the collective primitives
//! defined over them, and is created once at program start and threaded
//! explicitly through every constructor that needs communication.
//!
//! The default build runs single-process: every scope has size one and every
//! collective degenerates to an identity copy, which is a legal mode of all
//! the contracts below. Enabling the `mpi-support` feature swaps in an MPI
//! backend with identical semantics.

#[cfg(feature = "mpi-support")]
mod mpi;

use crate::error::{CommError, ConfigError};
use num_complex::Complex;
use std::ops::Range;
use std::time::{Duration, Instant};

/// Elements that may travel through a collective.
///
/// The wire representation is always a flat buffer of 8-byte words; complex
/// numbers travel as consecutive (re, im) pairs.
pub trait CommElem: Copy + Send + Sync + sealed::Sealed + 'static {
    /// Wire tag used by the communication backend
    const KIND: ElemKind;
}

/// Wire-level element tag
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElemKind {
    /// Double-precision real
    F64,
    /// Unsigned 64-bit integer
    U64,
    /// Double-precision complex, transported as two reals
    C64,
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f64 {}
    impl Sealed for u64 {}
    impl Sealed for num_complex::Complex<f64> {}
}

impl CommElem for f64 {
    const KIND: ElemKind = ElemKind::F64;
}
impl CommElem for u64 {
    const KIND: ElemKind = ElemKind::U64;
}
impl CommElem for Complex<f64> {
    const KIND: ElemKind = ElemKind::C64;
}

/// The communication scope of a collective call
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    /// All cooperating processes
    World,
    /// The processes sharing this process's pool
    IntraPool,
    /// The processes holding this in-pool rank, one per pool
    InterPool,
}

/// Reduction operations supported by the reduce collectives
#[cfg(feature = "mpi-support")]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ReduceOp {
    Sum,
    Max,
    Min,
}

enum Backend {
    Serial,
    #[cfg(feature = "mpi-support")]
    Mpi(mpi::MpiComms),
}

/// Owns the process topology and the collective primitives over it.
///
/// Collectives are blocking: no process proceeds past one until every
/// participant in the scope has reached it. An unrecoverable communication
/// error is reported with the failing rank and aborts the entire group; no
/// partial results are salvaged.
pub struct ProcessGroup {
    world_rank: usize,
    world_size: usize,
    pool_size: usize,
    pool_id: usize,
    pool_rank: usize,
    started: Instant,
    backend: Backend,
}

impl ProcessGroup {
    /// A single-process group: every scope has size one.
    pub fn serial() -> Self {
        Self::from_parts(0, 1, 1, Backend::Serial)
    }

    /// Splits the cooperating processes into pools of `pool_size`.
    ///
    /// Without a distributed runtime the world holds a single process, so
    /// any `pool_size` other than one is rejected. With `mpi-support` this
    /// initializes MPI and performs the communicator splits.
    pub fn new(pool_size: usize) -> Result<Self, ConfigError> {
        #[cfg(feature = "mpi-support")]
        {
            if let Some(comms) = mpi::MpiComms::initialize(pool_size)? {
                return Ok(comms);
            }
        }
        if pool_size != 1 {
            return Err(ConfigError::PoolSize {
                pool_size,
                world_size: 1,
            });
        }
        Ok(Self::serial())
    }

    fn from_parts(
        world_rank: usize,
        world_size: usize,
        pool_size: usize,
        backend: Backend,
    ) -> Self {
        Self {
            world_rank,
            world_size,
            pool_size,
            pool_id: world_rank / pool_size,
            pool_rank: world_rank % pool_size,
            started: Instant::now(),
            backend,
        }
    }

    /// This process's rank within `scope`
    pub fn rank(&self, scope: Scope) -> usize {
        match scope {
            Scope::World => self.world_rank,
            Scope::IntraPool => self.pool_rank,
            Scope::InterPool => self.pool_id,
        }
    }

    /// The number of processes in `scope`
    pub fn size(&self, scope: Scope) -> usize {
        match scope {
            Scope::World => self.world_size,
            Scope::IntraPool => self.pool_size,
            Scope::InterPool => self.world_size / self.pool_size,
        }
    }

    /// The number of pools
    pub fn num_pools(&self) -> usize {
        self.world_size / self.pool_size
    }

    /// Whether this process is the world head (rank zero)
    pub fn is_head(&self) -> bool {
        self.world_rank == 0
    }

    /// Wall time since the group was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Blocks until every process in the world has arrived
    pub fn barrier(&self) {
        match &self.backend {
            Backend::Serial => {}
            #[cfg(feature = "mpi-support")]
            Backend::Mpi(comms) => comms.barrier(),
        }
    }

    /// The contiguous index partition assigned to this process over `0..n`.
    ///
    /// Partitions over a scope are disjoint, cover the range exactly, and
    /// differ in size by at most one element. The same formula slices loop
    /// iterations and distributed tensor storage, so the two always agree.
    pub fn divide_range(&self, n: usize, scope: Scope) -> Range<usize> {
        partition(n, self.rank(scope), self.size(scope))
    }

    /// The indices of `divide_range(n, scope)`, materialized
    pub fn divide_work(&self, n: usize, scope: Scope) -> Vec<usize> {
        self.divide_range(n, scope).collect()
    }

    /// Per-rank element counts and offsets for the partition of `0..n`.
    ///
    /// Counts are computed as tail minus head of each rank's range so they
    /// stay exact when the division has a remainder.
    pub fn partition_counts(&self, n: usize, scope: Scope) -> (Vec<usize>, Vec<usize>) {
        let size = self.size(scope);
        let mut counts = Vec::with_capacity(size);
        let mut offsets = Vec::with_capacity(size);
        for rank in 0..size {
            let range = partition(n, rank, size);
            offsets.push(range.start);
            counts.push(range.end - range.start);
        }
        (counts, offsets)
    }

    /// Broadcasts `buffer` from rank `root` of `scope` to every process in it
    pub fn broadcast<T: CommElem>(
        &self,
        buffer: &mut [T],
        root: usize,
        scope: Scope,
    ) -> Result<(), CommError> {
        match &self.backend {
            Backend::Serial => {
                let _ = (buffer, root, scope);
                Ok(())
            }
            #[cfg(feature = "mpi-support")]
            Backend::Mpi(comms) => comms.broadcast(buffer, root, scope),
        }
    }

    /// Sums `buffer` elementwise across `scope`, leaving the result everywhere
    pub fn all_reduce_sum<T: CommElem>(
        &self,
        buffer: &mut [T],
        scope: Scope,
    ) -> Result<(), CommError> {
        match &self.backend {
            Backend::Serial => {
                let _ = (buffer, scope);
                Ok(())
            }
            #[cfg(feature = "mpi-support")]
            Backend::Mpi(comms) => comms.all_reduce(buffer, ReduceOp::Sum, scope),
        }
    }

    /// Sums `buffer` elementwise across `scope` onto the scope head
    pub fn reduce_sum<T: CommElem>(
        &self,
        buffer: &mut [T],
        scope: Scope,
    ) -> Result<(), CommError> {
        match &self.backend {
            Backend::Serial => {
                let _ = (buffer, scope);
                Ok(())
            }
            #[cfg(feature = "mpi-support")]
            Backend::Mpi(comms) => comms.reduce(buffer, ReduceOp::Sum, scope),
        }
    }

    /// Elementwise maximum across `scope` onto the scope head
    pub fn reduce_max(&self, buffer: &mut [f64], scope: Scope) -> Result<(), CommError> {
        match &self.backend {
            Backend::Serial => {
                let _ = (buffer, scope);
                Ok(())
            }
            #[cfg(feature = "mpi-support")]
            Backend::Mpi(comms) => comms.reduce(buffer, ReduceOp::Max, scope),
        }
    }

    /// Elementwise minimum across `scope` onto the scope head
    pub fn reduce_min(&self, buffer: &mut [f64], scope: Scope) -> Result<(), CommError> {
        match &self.backend {
            Backend::Serial => {
                let _ = (buffer, scope);
                Ok(())
            }
            #[cfg(feature = "mpi-support")]
            Backend::Mpi(comms) => comms.reduce(buffer, ReduceOp::Min, scope),
        }
    }

    /// Gathers variable-length contributions onto the scope head.
    ///
    /// `counts` and `offsets` describe every rank's contribution, normally
    /// obtained from [`ProcessGroup::partition_counts`]. The head receives
    /// the assembled buffer; other ranks receive an empty vector.
    pub fn gather_variable<T: CommElem + Default>(
        &self,
        send: &[T],
        counts: &[usize],
        offsets: &[usize],
        scope: Scope,
    ) -> Result<Vec<T>, CommError> {
        self.check_partition(send.len(), counts, offsets, scope)?;
        match &self.backend {
            Backend::Serial => Ok(send.to_vec()),
            #[cfg(feature = "mpi-support")]
            Backend::Mpi(comms) => comms.gather_variable(send, counts, offsets, scope),
        }
    }

    /// Gathers variable-length contributions into `out` on every rank.
    ///
    /// Payloads larger than a single collective call is guaranteed to move
    /// atomically are handled internally: the transfer is chunked into
    /// bounded pieces, one collective per piece, and reassembled byte-exact.
    /// Callers see a single blocking operation.
    pub fn big_all_gather<T: CommElem>(
        &self,
        send: &[T],
        counts: &[usize],
        offsets: &[usize],
        out: &mut [T],
        scope: Scope,
    ) -> Result<(), CommError> {
        self.check_partition(send.len(), counts, offsets, scope)?;
        let total: usize = counts.iter().sum();
        if out.len() != total {
            return Err(CommError::BufferMismatch {
                rank: self.world_rank,
                expected: total,
                found: out.len(),
            });
        }
        match &self.backend {
            Backend::Serial => {
                out[offsets[0]..offsets[0] + counts[0]].copy_from_slice(send);
                Ok(())
            }
            #[cfg(feature = "mpi-support")]
            Backend::Mpi(comms) => comms.big_all_gather(send, counts, offsets, out, scope),
        }
    }

    /// Reports a fatal fault with this process's rank and terminates the
    /// entire process group. No partial results survive.
    pub fn abort(&self, message: &str) -> ! {
        tracing::error!(rank = self.world_rank, "{message}");
        match &self.backend {
            Backend::Serial => std::process::exit(1),
            #[cfg(feature = "mpi-support")]
            Backend::Mpi(comms) => comms.abort(),
        }
    }

    fn check_partition(
        &self,
        send_len: usize,
        counts: &[usize],
        offsets: &[usize],
        scope: Scope,
    ) -> Result<(), CommError> {
        let rank = self.rank(scope);
        let size = self.size(scope);
        if counts.len() != size || offsets.len() != size || counts[rank] != send_len {
            return Err(CommError::BufferMismatch {
                rank: self.world_rank,
                expected: counts.get(rank).copied().unwrap_or(0),
                found: send_len,
            });
        }
        Ok(())
    }
}

/// The contiguous share of `0..n` owned by `rank` out of `size`.
///
/// `start = n * rank / size`, `stop = n * (rank + 1) / size`; the products
/// are formed in 128-bit arithmetic so huge meshes cannot overflow.
pub fn partition(n: usize, rank: usize, size: usize) -> Range<usize> {
    debug_assert!(rank < size);
    let start = (n as u128 * rank as u128 / size as u128) as usize;
    let stop = (n as u128 * (rank + 1) as u128 / size as u128) as usize;
    start..stop
}

#[cfg(test)]
mod test {
    use super::{partition, ProcessGroup, Scope};
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn split_reductions_match_the_serial_sum() {
        // summing each rank's partition and reducing the partial sums is
        // the distributed reduceSum; any factorization must agree with the
        // single-process result up to floating-point summation order
        let values: Vec<f64> = (0..1000).map(|i| (i as f64 * 0.37).sin()).collect();
        let serial: f64 = values.iter().sum();
        for size in [1, 2, 3, 5, 8, 13] {
            let split: f64 = (0..size)
                .map(|rank| values[partition(values.len(), rank, size)].iter().sum::<f64>())
                .sum();
            assert_relative_eq!(serial, split, max_relative = 1e-12);
        }
    }

    #[test]
    fn serial_group_has_unit_scopes() {
        let group = ProcessGroup::serial();
        for scope in [Scope::World, Scope::IntraPool, Scope::InterPool] {
            assert_eq!(group.size(scope), 1);
            assert_eq!(group.rank(scope), 0);
        }
        assert!(group.is_head());
        assert_eq!(group.num_pools(), 1);
    }

    #[test]
    fn serial_pool_size_above_one_is_rejected() {
        assert!(ProcessGroup::new(2).is_err());
        assert!(ProcessGroup::new(1).is_ok());
    }

    #[test]
    fn serial_collectives_are_identity_copies() {
        let group = ProcessGroup::serial();
        let mut buffer = vec![1.0, 2.0, 3.0];
        group.broadcast(&mut buffer, 0, Scope::World).unwrap();
        group.all_reduce_sum(&mut buffer, Scope::IntraPool).unwrap();
        assert_eq!(buffer, vec![1.0, 2.0, 3.0]);

        let gathered = group
            .gather_variable(&buffer, &[3], &[0], Scope::World)
            .unwrap();
        assert_eq!(gathered, buffer);

        let mut out = vec![0.0; 3];
        group
            .big_all_gather(&buffer, &[3], &[0], &mut out, Scope::World)
            .unwrap();
        assert_eq!(out, buffer);
    }

    #[test]
    fn gather_rejects_missized_buffers() {
        let group = ProcessGroup::serial();
        let buffer = vec![1.0, 2.0];
        assert!(group
            .gather_variable(&buffer, &[3], &[0], Scope::World)
            .is_err());
        let mut out = vec![0.0; 1];
        assert!(group
            .big_all_gather(&buffer, &[2], &[0], &mut out, Scope::World)
            .is_err());
    }

    #[test]
    fn partition_counts_match_ranges() {
        let group = ProcessGroup::serial();
        let (counts, offsets) = group.partition_counts(17, Scope::World);
        assert_eq!(counts, vec![17]);
        assert_eq!(offsets, vec![0]);
        assert_eq!(group.divide_range(17, Scope::World), 0..17);
        assert_eq!(group.divide_work(5, Scope::IntraPool), vec![0, 1, 2, 3, 4]);
    }

    proptest! {
        /// Partitions are contiguous, disjoint, cover [0, n) exactly, and
        /// every rank's share is within one element of any other's.
        #[test]
        fn partition_covers_range_exactly(n in 0usize..10_000, size in 1usize..64) {
            let mut expected_start = 0;
            let base = n / size;
            for rank in 0..size {
                let range = partition(n, rank, size);
                prop_assert_eq!(range.start, expected_start);
                let share = range.end - range.start;
                prop_assert!(share == base || share == base + 1);
                expected_start = range.end;
            }
            prop_assert_eq!(expected_start, n);
        }

        /// Storage partitions and loop partitions agree with the per-rank
        /// counts used by the variable-length collectives.
        #[test]
        fn counts_and_offsets_tile_the_range(n in 0usize..5_000, size in 1usize..32) {
            let mut offset = 0;
            for rank in 0..size {
                let range = partition(n, rank, size);
                prop_assert_eq!(range.start, offset);
                offset += range.end - range.start;
            }
            prop_assert_eq!(offset, n);
        }
    }
}
