//! Assembly and solution of complementarity problems arising in non-smooth
//! contact dynamics.
//!
//! Each simulation step, the set of active contacts forms an interaction
//! graph. The [`assembly`] module walks this graph and builds a block-sparse
//! global operator from per-contact blocks, caching them across steps where
//! the problem allows. The [`lcp`] module wraps the assembled operator and
//! right-hand side into a complementarity problem and solves it by pivoting
//! or block iteration.

pub mod assembly;
pub mod graph;
pub mod io;
pub mod law;
pub mod lcp;
pub mod sbm;

pub use assembly::{AssemblyStats, BlockAssembler, BlockSource};
pub use graph::{Interaction, InteractionGraph, SharedBlock};
pub use law::NonSmoothLaw;
pub use lcp::{Problem, Solution, SolveResult, SolverId, SolverOptions, Status};
pub use sbm::{Block, BlockSparseMatrix, Operator, StorageKind};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Size mismatch error")]
    SizeMismatch,
    #[error("Mismatched block partitions: {lhs:?} vs. {rhs:?}")]
    BlockPartitionMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    #[error("Unsupported operand storage for {op}: {a:?} * {b:?} -> {c:?}")]
    UnsupportedOperands {
        op: &'static str,
        a: StorageKind,
        b: StorageKind,
        c: StorageKind,
    },
    #[error("Unknown operator storage tag: {0}")]
    UnknownStorageTag(i32),
    #[error("Unknown solver id: {0}")]
    UnknownSolverId(i32),
    #[error("Unknown local solver variant: {0}")]
    UnknownLocalSolver(usize),
    #[error("Solver {solver:?} does not accept {kind:?} operator storage")]
    UnsupportedStorage { solver: SolverId, kind: StorageKind },
    #[error("Edge {edge} references missing vertex {vertex}")]
    DanglingEdge { edge: usize, vertex: usize },
    #[error("Missing cached block for vertex {vertex}; run the block update first")]
    MissingDiagonalBlock { vertex: usize },
    #[error("File I/O error")]
    FileIOError {
        #[from]
        source: std::io::Error,
    },
    #[error("Malformed matrix dump: {0}")]
    MatrixParse(String),
}

/// Infinity norm of an iterator of values.
pub(crate) fn inf_norm<I>(iter: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    iter.into_iter()
        .map(|x| x.abs())
        .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Less))
        .unwrap_or(0.0)
}
