//! MPI-backed collectives for the process group.
//!
//! Complex buffers travel as consecutive (re, im) double pairs; every
//! payload is reinterpreted as a flat buffer of 8-byte words before it
//! touches the wire. Payloads above [`MAX_CHUNK_WORDS`] words per collective
//! call are moved in bounded pieces and reassembled on the receiver.

use super::{Backend, CommElem, ElemKind, ProcessGroup, ReduceOp, Scope};
use crate::error::{CommError, ConfigError};
use mpi::collective::SystemOperation;
use mpi::datatype::PartitionMut;
use mpi::environment::Universe;
use mpi::topology::{Color, SystemCommunicator, UserCommunicator};
use mpi::traits::*;
use mpi::Count;

/// Upper bound, in 8-byte words, on the payload of one collective call
const MAX_CHUNK_WORDS: usize = 1 << 27;

pub(super) struct MpiComms {
    // dropped last; finalizes MPI when the group is torn down
    _universe: Universe,
    world: SystemCommunicator,
    intra_pool: UserCommunicator,
    inter_pool: UserCommunicator,
    world_rank: usize,
}

macro_rules! on_scope {
    ($comms:expr, $scope:expr, |$comm:ident| $body:expr) => {
        match $scope {
            Scope::World => {
                let $comm = &$comms.world;
                $body
            }
            Scope::IntraPool => {
                let $comm = &$comms.intra_pool;
                $body
            }
            Scope::InterPool => {
                let $comm = &$comms.inter_pool;
                $body
            }
        }
    };
}

impl MpiComms {
    /// Initializes MPI and splits the world into pools.
    ///
    /// Returns `Ok(None)` when no MPI runtime is available, in which case
    /// the caller falls back to the single-process backend.
    pub(super) fn initialize(pool_size: usize) -> Result<Option<ProcessGroup>, ConfigError> {
        let universe = match mpi::initialize() {
            Some(universe) => universe,
            None => return Ok(None),
        };
        let world = universe.world();
        let world_size = world.size() as usize;
        let world_rank = world.rank() as usize;
        if pool_size == 0 || world_size % pool_size != 0 {
            return Err(ConfigError::PoolSize {
                pool_size,
                world_size,
            });
        }

        let pool_id = world_rank / pool_size;
        let pool_rank = world_rank % pool_size;
        let intra_pool = world
            .split_by_color(Color::with_value(pool_id as i32))
            .expect("every rank participates in the intra-pool split");
        let inter_pool = world
            .split_by_color(Color::with_value(pool_rank as i32))
            .expect("every rank participates in the inter-pool split");

        let comms = MpiComms {
            _universe: universe,
            world,
            intra_pool,
            inter_pool,
            world_rank,
        };
        tracing::info!(world_size, pool_size, "process pools initialized");
        Ok(Some(ProcessGroup::from_parts(
            world_rank,
            world_size,
            pool_size,
            Backend::Mpi(comms),
        )))
    }

    pub(super) fn barrier(&self) {
        self.world.barrier();
    }

    pub(super) fn abort(&self) -> ! {
        self.world.abort(1)
    }

    pub(super) fn broadcast<T: CommElem>(
        &self,
        buffer: &mut [T],
        root: usize,
        scope: Scope,
    ) -> Result<(), CommError> {
        on_scope!(self, scope, |comm| {
            if comm.size() == 1 {
                return Ok(());
            }
            let root = comm.process_at_rank(root as i32);
            match T::KIND {
                ElemKind::U64 => {
                    for chunk in as_u64_mut(buffer).chunks_mut(MAX_CHUNK_WORDS) {
                        root.broadcast_into(chunk);
                    }
                }
                _ => {
                    for chunk in as_f64_mut(buffer).chunks_mut(MAX_CHUNK_WORDS) {
                        root.broadcast_into(chunk);
                    }
                }
            }
            Ok(())
        })
    }

    pub(super) fn all_reduce<T: CommElem>(
        &self,
        buffer: &mut [T],
        op: ReduceOp,
        scope: Scope,
    ) -> Result<(), CommError> {
        if T::KIND == ElemKind::C64 && op != ReduceOp::Sum {
            return Err(self.collective_error("ordering reduction over complex data"));
        }
        on_scope!(self, scope, |comm| {
            if comm.size() == 1 {
                return Ok(());
            }
            match T::KIND {
                ElemKind::U64 => all_reduce_words(comm, as_u64_mut(buffer), op),
                _ => all_reduce_words(comm, as_f64_mut(buffer), op),
            }
            Ok(())
        })
    }

    pub(super) fn reduce<T: CommElem>(
        &self,
        buffer: &mut [T],
        op: ReduceOp,
        scope: Scope,
    ) -> Result<(), CommError> {
        if T::KIND == ElemKind::C64 && op != ReduceOp::Sum {
            return Err(self.collective_error("ordering reduction over complex data"));
        }
        on_scope!(self, scope, |comm| {
            if comm.size() == 1 {
                return Ok(());
            }
            match T::KIND {
                ElemKind::U64 => reduce_words(comm, as_u64_mut(buffer), op),
                _ => reduce_words(comm, as_f64_mut(buffer), op),
            }
            Ok(())
        })
    }

    pub(super) fn gather_variable<T: CommElem + Default>(
        &self,
        send: &[T],
        counts: &[usize],
        offsets: &[usize],
        scope: Scope,
    ) -> Result<Vec<T>, CommError> {
        let words = words_per_elem::<T>();
        let total: usize = counts.iter().sum();
        on_scope!(self, scope, |comm| {
            if comm.size() == 1 {
                return Ok(send.to_vec());
            }
            let root = comm.process_at_rank(0);
            let send_words = as_f64(send);
            if comm.rank() == 0 {
                let mut assembled = vec![T::default(); total];
                {
                    let recv_words = as_f64_mut(&mut assembled);
                    let counts: Vec<Count> =
                        counts.iter().map(|&c| (c * words) as Count).collect();
                    let displs: Vec<Count> =
                        offsets.iter().map(|&o| (o * words) as Count).collect();
                    let mut partition = PartitionMut::new(recv_words, counts, displs);
                    root.gather_varcount_into_root(send_words, &mut partition);
                }
                Ok(assembled)
            } else {
                root.gather_varcount_into(send_words);
                Ok(Vec::new())
            }
        })
    }

    /// Chunked allgather: each rank's region is broadcast from its owner in
    /// bounded pieces, so no single collective carries an oversized payload.
    pub(super) fn big_all_gather<T: CommElem>(
        &self,
        send: &[T],
        counts: &[usize],
        offsets: &[usize],
        out: &mut [T],
        scope: Scope,
    ) -> Result<(), CommError> {
        let words = words_per_elem::<T>();
        on_scope!(self, scope, |comm| {
            let my_rank = comm.rank() as usize;
            let out_words = as_f64_mut(out);
            let send_words = as_f64(send);
            for rank in 0..comm.size() as usize {
                let start = offsets[rank] * words;
                let len = counts[rank] * words;
                let region = &mut out_words[start..start + len];
                if rank == my_rank {
                    region.copy_from_slice(send_words);
                }
                let owner = comm.process_at_rank(rank as i32);
                for chunk in region.chunks_mut(MAX_CHUNK_WORDS) {
                    owner.broadcast_into(chunk);
                }
            }
            Ok(())
        })
    }

    fn collective_error(&self, description: &str) -> CommError {
        CommError::Collective {
            rank: self.world_rank,
            description: description.to_string(),
        }
    }
}

fn all_reduce_words<C, B>(comm: &C, words: &mut [B], op: ReduceOp)
where
    C: Communicator,
    B: Equivalence + Copy + Default,
{
    let mut out = vec![B::default(); words.len().min(MAX_CHUNK_WORDS)];
    for send in words.chunks_mut(MAX_CHUNK_WORDS) {
        let recv = &mut out[..send.len()];
        match op {
            ReduceOp::Sum => comm.all_reduce_into(&send[..], recv, SystemOperation::sum()),
            ReduceOp::Max => comm.all_reduce_into(&send[..], recv, SystemOperation::max()),
            ReduceOp::Min => comm.all_reduce_into(&send[..], recv, SystemOperation::min()),
        }
        send.copy_from_slice(recv);
    }
}

fn reduce_words<C, B>(comm: &C, words: &mut [B], op: ReduceOp)
where
    C: Communicator,
    B: Equivalence + Copy + Default,
{
    let is_root = comm.rank() == 0;
    let mut out = vec![B::default(); words.len().min(MAX_CHUNK_WORDS)];
    for send in words.chunks_mut(MAX_CHUNK_WORDS) {
        let root = comm.process_at_rank(0);
        if is_root {
            let recv = &mut out[..send.len()];
            match op {
                ReduceOp::Sum => root.reduce_into_root(&send[..], recv, SystemOperation::sum()),
                ReduceOp::Max => root.reduce_into_root(&send[..], recv, SystemOperation::max()),
                ReduceOp::Min => root.reduce_into_root(&send[..], recv, SystemOperation::min()),
            }
            send.copy_from_slice(recv);
        } else {
            match op {
                ReduceOp::Sum => root.reduce_into(&send[..], SystemOperation::sum()),
                ReduceOp::Max => root.reduce_into(&send[..], SystemOperation::max()),
                ReduceOp::Min => root.reduce_into(&send[..], SystemOperation::min()),
            }
        }
    }
}

fn words_per_elem<T: CommElem>() -> usize {
    match T::KIND {
        ElemKind::C64 => 2,
        _ => 1,
    }
}

// Complex<f64> is repr(C) over [f64; 2], so a buffer of any CommElem type is
// exactly a buffer of 8-byte words.
fn as_f64<T: CommElem>(buffer: &[T]) -> &[f64] {
    let words = buffer.len() * words_per_elem::<T>();
    unsafe { std::slice::from_raw_parts(buffer.as_ptr() as *const f64, words) }
}

fn as_f64_mut<T: CommElem>(buffer: &mut [T]) -> &mut [f64] {
    let words = buffer.len() * words_per_elem::<T>();
    unsafe { std::slice::from_raw_parts_mut(buffer.as_mut_ptr() as *mut f64, words) }
}

fn as_u64_mut<T: CommElem>(buffer: &mut [T]) -> &mut [u64] {
    debug_assert_eq!(T::KIND, ElemKind::U64);
    unsafe { std::slice::from_raw_parts_mut(buffer.as_mut_ptr() as *mut u64, buffer.len()) }
}
