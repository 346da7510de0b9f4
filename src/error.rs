//! Fault taxonomy for the scattering core.
//!
//! Three families exist: configuration faults detected before any iteration
//! begins, resource-exhaustion faults raised at estimation time, and
//! communication faults raised by a failing collective. All three are fatal
//! for the whole calculation; there is no retry path. Numerical edge cases
//! (vanishing energies, non-positive dielectric denominators) are skipped
//! term by term inside the kernels and deliberately have no error type.

use miette::Diagnostic;

#[derive(thiserror::Error, Debug, Diagnostic)]
/// A malformed configuration, detected before computation starts
pub enum ConfigError {
    /// The pool size does not evenly divide the number of processes
    #[error("pool size {pool_size} does not divide the {world_size} cooperating processes")]
    PoolSize {
        /// Requested processes per pool
        pool_size: usize,
        /// Total cooperating processes
        world_size: usize,
    },
    /// Tensor or eigenvector extents disagree
    #[error("dimension mismatch for {name}: expected {expected}, got {found}")]
    Dimension {
        /// Which input is missized
        name: &'static str,
        /// The extent required by the rest of the inputs
        expected: usize,
        /// The extent actually supplied
        found: usize,
    },
    /// An invalid combination of requested outputs or band structures
    #[error("{0}")]
    Request(String),
}

#[derive(thiserror::Error, Debug, Diagnostic)]
/// The memory budget cannot accommodate the calculation
pub enum ResourceError {
    /// The fixed working set alone exceeds the budget
    #[error(
        "memory budget of {budget} B is below the {fixed} B resident cost; \
         rerun with a larger budget or a smaller problem"
    )]
    BudgetBelowFixedCost {
        /// Configured budget in bytes
        budget: u64,
        /// Bytes resident for the whole calculation
        fixed: u64,
    },
    /// Not even one destination point fits in the remaining budget
    #[error(
        "a single destination point needs {per_point} B of transient memory \
         but only {available} B remain under the budget"
    )]
    SinglePointTooLarge {
        /// Transient bytes for one destination point
        per_point: u64,
        /// Bytes left after the fixed cost
        available: u64,
    },
}

#[derive(thiserror::Error, Debug, Diagnostic)]
/// A collective communication failure; the process group must abort
pub enum CommError {
    /// The underlying transport reported an error
    #[error("rank {rank}: {description}")]
    Collective {
        /// World rank of the reporting process
        rank: usize,
        /// Native error description
        description: String,
    },
    /// Buffer lengths disagree with the partition counts
    #[error("rank {rank}: gather buffer holds {found} elements, partition expects {expected}")]
    BufferMismatch {
        /// World rank of the reporting process
        rank: usize,
        /// Elements expected from the partition counts
        expected: usize,
        /// Elements actually supplied
        found: usize,
    },
}

#[derive(thiserror::Error, Debug, Diagnostic)]
/// Any fault that terminates a scattering calculation
pub enum ScatteringError {
    /// Configuration fault
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
    /// Memory-budget fault
    #[error(transparent)]
    #[diagnostic(transparent)]
    Resource(#[from] ResourceError),
    /// Communication fault
    #[error(transparent)]
    #[diagnostic(transparent)]
    Comm(#[from] CommError),
}
