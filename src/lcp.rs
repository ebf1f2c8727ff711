//! Complementarity problem driver and solver algorithms.
//!
//! The driver checks for the trivial solution, dispatches to a numeric
//! algorithm according to the options and the operator storage, and
//! validates the result with an authoritative residual check.

pub mod lemke;
pub mod nsgs;

pub use lemke::lemke_dense;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::law::NonSmoothLaw;
use crate::sbm::Operator;
use crate::Error as CrateError;

/// Solver algorithm selector.
///
/// Numeric tags are stable; configuration records and dumps refer to them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverId {
    /// Lemke-type complementary pivoting with lexicographic tie breaking.
    Lemke,
    /// Block nonsmooth Gauss-Seidel over a block-sparse operator.
    NsgsSbm,
}

impl SolverId {
    pub fn tag(self) -> i32 {
        match self {
            SolverId::Lemke => 0,
            SolverId::NsgsSbm => 1,
        }
    }
}

impl TryFrom<i32> for SolverId {
    type Error = CrateError;
    fn try_from(tag: i32) -> Result<Self, CrateError> {
        match tag {
            0 => Ok(SolverId::Lemke),
            1 => Ok(SolverId::NsgsSbm),
            t => Err(CrateError::UnknownSolverId(t)),
        }
    }
}

/// Solver configuration record with fixed-position parameter arrays.
///
/// Slot semantics are a stable surface shared with external tooling:
///
/// | slot        | meaning                         | direction |
/// |-------------|---------------------------------|-----------|
/// | `iparam[0]` | maximum iterations              | in        |
/// | `iparam[1]` | iterations used                 | out       |
/// | `iparam[4]` | local solver variant (NSGS)     | in        |
/// | `dparam[0]` | global tolerance                | in        |
/// | `dparam[1]` | final error                     | out       |
/// | `dparam[2]` | local tolerance (NSGS)          | in        |
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    pub solver: SolverId,
    pub iparam: [usize; 5],
    pub dparam: [f64; 5],
    /// Run the post-solve residual check. Its verdict overrides the
    /// algorithm's own.
    pub filter: bool,
}

impl SolverOptions {
    pub const MAX_ITER: usize = 0;
    pub const ITER_DONE: usize = 1;
    pub const LOCAL_SOLVER: usize = 4;
    pub const TOLERANCE: usize = 0;
    pub const ERROR: usize = 1;
    pub const LOCAL_TOLERANCE: usize = 2;

    /// Defaults for the Lemke pivoting solver.
    pub fn lemke(max_iter: usize) -> Self {
        let mut iparam = [0; 5];
        iparam[Self::MAX_ITER] = max_iter;
        let mut dparam = [0.0; 5];
        dparam[Self::TOLERANCE] = 1e-12;
        SolverOptions {
            solver: SolverId::Lemke,
            iparam,
            dparam,
            filter: true,
        }
    }

    /// Defaults for the block Gauss-Seidel solver.
    pub fn nsgs(max_iter: usize, tolerance: f64) -> Self {
        let mut iparam = [0; 5];
        iparam[Self::MAX_ITER] = max_iter;
        let mut dparam = [0.0; 5];
        dparam[Self::TOLERANCE] = tolerance;
        dparam[Self::LOCAL_TOLERANCE] = tolerance * 1e-2;
        SolverOptions {
            solver: SolverId::NsgsSbm,
            iparam,
            dparam,
            filter: true,
        }
    }

    pub fn max_iterations(&self) -> usize {
        self.iparam[Self::MAX_ITER]
    }

    pub fn tolerance(&self) -> f64 {
        self.dparam[Self::TOLERANCE]
    }
}

/// Outcome classification of one driver call.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum Status {
    #[error("Success")]
    Success,
    #[error("Maximum number of iterations exceeded")]
    MaximumIterationsExceeded,
    #[error("Pivoting terminated on a secondary ray")]
    RayTermination,
    #[error("Singular local problem encountered")]
    SingularLocalProblem,
    #[error("Residual check failed after an apparently successful solve")]
    ResidualCheckFailed,
}

impl Status {
    /// Integer `info` code: 0 means success, each failure class is distinct
    /// so callers can choose different retry policies.
    pub fn code(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::RayTermination => 1,
            Status::MaximumIterationsExceeded => 2,
            Status::SingularLocalProblem => 3,
            Status::ResidualCheckFailed => 4,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

/// Result of one driver call.
///
/// On any non-success status, `z` and `w` hold the last iterate: defined but
/// unvalidated, never to be mistaken for a converged solution.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SolveResult {
    pub iterations: usize,
    pub error: f64,
    pub status: Status,
}

impl std::fmt::Display for SolveResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} after {} iterations, error {:.3e}",
            self.status, self.iterations, self.error
        )
    }
}

/// A complementarity problem: find `z >= 0`, `w >= 0` with `w = M z + q`
/// and `z . w = 0`, subject to each block's local nonsmooth law.
#[derive(Clone, Debug, PartialEq)]
pub struct Problem {
    pub m: Operator,
    pub q: Vec<f64>,
    /// Per-block-row friction coefficients, present when any block carries a
    /// frictional law.
    pub mu: Option<Vec<f64>>,
    /// Per-constraint local offsets, when distinct from `q`.
    pub b: Option<Vec<f64>>,
}

impl Problem {
    pub fn new(m: Operator, q: Vec<f64>) -> Result<Self, CrateError> {
        if !m.is_square() || m.num_rows() != q.len() {
            return Err(CrateError::SizeMismatch);
        }
        Ok(Problem {
            m,
            q,
            mu: None,
            b: None,
        })
    }

    pub fn size(&self) -> usize {
        self.q.len()
    }
}

/// Reaction, velocity and optional unconstrained-DOF velocity of a solved
/// problem.
#[derive(Clone, Debug, PartialEq)]
pub struct Solution {
    pub z: Vec<f64>,
    pub w: Vec<f64>,
    pub global_velocity: Option<Vec<f64>>,
}

/// Solves the problem, writing the reaction into `z` and the velocity into
/// `w`.
///
/// The trivial-solution fast path runs before anything touches `M`: when
/// every component of `q` is non-negative, `z = 0, w = q` satisfies
/// complementarity outright. Otherwise the algorithm selected by the options
/// runs, followed (when `options.filter` is set) by the authoritative
/// residual check.
pub fn solve(
    problem: &Problem,
    z: &mut [f64],
    w: &mut [f64],
    options: &mut SolverOptions,
) -> Result<SolveResult, CrateError> {
    let n = problem.size();
    if z.len() != n || w.len() != n {
        return Err(CrateError::SizeMismatch);
    }

    // 1. Trivial solution. Scan components in order and bail out on the
    // first negative one.
    if problem.q.iter().all(|&qi| qi >= 0.0) {
        z.fill(0.0);
        w.copy_from_slice(&problem.q);
        options.iparam[SolverOptions::ITER_DONE] = 0;
        options.dparam[SolverOptions::ERROR] = 0.0;
        log::debug!("Trivial solution: q >= 0, so z = 0 and w = q");
        return Ok(SolveResult {
            iterations: 0,
            error: 0.0,
            status: Status::Success,
        });
    }

    // 2. Dispatch on operator storage and solver id.
    let mut result = match (&problem.m, options.solver) {
        (Operator::Dense(_), SolverId::Lemke) => lemke::solve(problem, z, w, options)?,
        (Operator::BlockSparse(_), SolverId::NsgsSbm) => nsgs::solve(problem, z, w, options)?,
        (m, solver) => {
            return Err(CrateError::UnsupportedStorage {
                solver,
                kind: m.kind(),
            })
        }
    };

    // 3. Residual check; its verdict wins over the algorithm's.
    if options.filter {
        let error = compute_error(problem, z, w)?;
        result.error = error;
        if error > options.tolerance() && result.status.is_success() {
            log::warn!(
                "Residual check failed: error {:.3e} exceeds tolerance {:.3e}",
                error,
                options.tolerance()
            );
            result.status = Status::ResidualCheckFailed;
        }
    }

    options.iparam[SolverOptions::ITER_DONE] = result.iterations;
    options.dparam[SolverOptions::ERROR] = result.error;
    Ok(result)
}

/// Convenience wrapper allocating the solution vectors.
pub fn solve_problem(
    problem: &Problem,
    options: &mut SolverOptions,
) -> Result<(Solution, SolveResult), CrateError> {
    let n = problem.size();
    let mut z = vec![0.0; n];
    let mut w = vec![0.0; n];
    let result = solve(problem, &mut z, &mut w, options)?;
    Ok((
        Solution {
            z,
            w,
            global_velocity: None,
        },
        result,
    ))
}

/// Recomputes `w = M z + q` and returns the normalized residual
/// `|| z - proj(z - w) || / (1 + ||q||)`, where `proj` is the feasible-set
/// projection of each block row's nonsmooth law.
///
/// For plain complementarity the projection residual reduces to the familiar
/// componentwise `min(z, w)`. When the problem carries friction coefficients
/// the frictional rows use the cone projection instead, so a valid negative
/// tangential reaction does not count as residual.
pub fn compute_error(problem: &Problem, z: &[f64], w: &mut [f64]) -> Result<f64, CrateError> {
    problem.m.mul_vector(z, w)?;
    for (wi, qi) in w.iter_mut().zip(problem.q.iter()) {
        *wi += qi;
    }
    let residual = match &problem.mu {
        Some(mu) => law_residual(problem, mu, z, w)?,
        None => z
            .iter()
            .zip(w.iter())
            .map(|(&zi, &wi)| {
                let phi = zi.min(wi);
                phi * phi
            })
            .sum::<f64>()
            .sqrt(),
    };
    let q_norm: f64 = problem.q.iter().map(|&qi| qi * qi).sum::<f64>().sqrt();
    Ok(residual / (1.0 + q_norm))
}

/// The nonsmooth law of block row `i`: a three-dimensional block with a
/// friction coefficient is a Coulomb contact, anything else is plain
/// complementarity of the block's size.
pub(crate) fn row_law(mu: Option<&[f64]>, i: usize, d: usize) -> NonSmoothLaw {
    if d == 3 {
        if let Some(mu) = mu {
            return NonSmoothLaw::CoulombFriction { mu: mu[i] };
        }
    }
    NonSmoothLaw::Complementarity { size: d }
}

/// Law projection residual `|| z - proj(z - w) ||` accumulated over block
/// rows. Dense operators carry no partition, so friction implies contiguous
/// size-3 contact blocks there.
fn law_residual(problem: &Problem, mu: &[f64], z: &[f64], w: &[f64]) -> Result<f64, CrateError> {
    let offsets: Vec<usize> = match &problem.m {
        Operator::BlockSparse(m) => m.row_offsets().to_vec(),
        _ => {
            if problem.size() % 3 != 0 {
                return Err(CrateError::SizeMismatch);
            }
            (0..=problem.size() / 3).map(|i| 3 * i).collect()
        }
    };
    let nb = offsets.len() - 1;
    if mu.len() != nb {
        return Err(CrateError::SizeMismatch);
    }
    let mut acc = 0.0;
    for i in 0..nb {
        let (lo, hi) = (offsets[i], offsets[i + 1]);
        let law = row_law(Some(mu), i, hi - lo);
        let mut proj: Vec<f64> = z[lo..hi]
            .iter()
            .zip(w[lo..hi].iter())
            .map(|(zi, wi)| zi - wi)
            .collect();
        law.project(&mut proj);
        for (zi, pi) in z[lo..hi].iter().zip(proj.iter()) {
            let r = zi - pi;
            acc += r * r;
        }
    }
    Ok(acc.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solver_tags_are_stable() {
        assert_eq!(SolverId::try_from(0).unwrap(), SolverId::Lemke);
        assert_eq!(SolverId::try_from(1).unwrap(), SolverId::NsgsSbm);
        assert!(matches!(
            SolverId::try_from(99),
            Err(crate::Error::UnknownSolverId(99))
        ));
    }

    #[test]
    fn residual_respects_the_friction_cone() {
        // A converged frictional iterate has a valid negative tangential
        // reaction; the law-aware residual must score it zero where the
        // pure-LCP measure would not.
        let sbm = crate::sbm::BlockSparseMatrix::from_dense(
            &na::DMatrix::identity(3, 3),
            &[3],
            &[3],
        )
        .unwrap();
        let mut problem =
            Problem::new(Operator::BlockSparse(sbm), vec![-1.0, 0.3, 0.0]).unwrap();
        problem.mu = Some(vec![0.5]);

        let z = [1.0, -0.3, 0.0];
        let mut w = [0.0; 3];
        let error = compute_error(&problem, &z, &mut w).unwrap();
        assert!(error < 1e-14, "error {:.3e}", error);
        assert!(w.iter().all(|&wi| wi.abs() < 1e-14));
    }

    #[test]
    fn frictional_residual_still_flags_violations() {
        // A reaction outside the cone scores a nonzero residual.
        let sbm = crate::sbm::BlockSparseMatrix::from_dense(
            &na::DMatrix::identity(3, 3),
            &[3],
            &[3],
        )
        .unwrap();
        let mut problem =
            Problem::new(Operator::BlockSparse(sbm), vec![-1.0, 0.3, 0.0]).unwrap();
        problem.mu = Some(vec![0.5]);

        let z = [1.0, -2.0, 0.0];
        let mut w = [0.0; 3];
        let error = compute_error(&problem, &z, &mut w).unwrap();
        assert!(error > 1e-3, "error {:.3e}", error);
    }

    #[test]
    fn parameter_slots() {
        let mut opts = SolverOptions::nsgs(100, 1e-8);
        assert_eq!(opts.iparam[SolverOptions::MAX_ITER], 100);
        assert_eq!(opts.dparam[SolverOptions::TOLERANCE], 1e-8);
        opts.iparam[SolverOptions::LOCAL_SOLVER] = 1;
        assert_eq!(opts.iparam[4], 1);
    }
}
