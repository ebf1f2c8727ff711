//! Block nonsmooth Gauss-Seidel over a block-sparse operator.
//!
//! Sweeps iterate over block rows. For each block row the reactions of all
//! other blocks are held fixed, the accumulated off-diagonal contribution is
//! folded into a local right-hand side, and the reduced local problem is
//! solved with the projection operator of that interaction's nonsmooth law.
//! Sweeps repeat until the global residual drops below tolerance or the
//! iteration cap is hit.

use crate::law::NonSmoothLaw;
use crate::lcp::{compute_error, Problem, SolveResult, SolverOptions, Status};
use crate::sbm::{Block, Operator};
use crate::Error;

/// Fallback iteration caps for the inner local solves.
const LOCAL_DIRECT_MAX_ITER: usize = 50;
const LOCAL_PROJECTED_MAX_ITER: usize = 10;

pub(crate) fn solve(
    problem: &Problem,
    z: &mut [f64],
    w: &mut [f64],
    options: &SolverOptions,
) -> Result<SolveResult, Error> {
    let Operator::BlockSparse(m) = &problem.m else {
        return Err(Error::UnsupportedStorage {
            solver: options.solver,
            kind: problem.m.kind(),
        });
    };
    if !m.is_square_partition() {
        return Err(Error::BlockPartitionMismatch {
            lhs: m.row_offsets().to_vec(),
            rhs: m.col_offsets().to_vec(),
        });
    }

    let nb = m.num_block_rows();
    if let Some(mu) = &problem.mu {
        if mu.len() != nb {
            return Err(Error::SizeMismatch);
        }
    }
    if let Some(b) = &problem.b {
        if b.len() != problem.size() {
            return Err(Error::SizeMismatch);
        }
    }
    let max_iter = if options.max_iterations() > 0 {
        options.max_iterations()
    } else {
        1000
    };
    let tol = options.tolerance();
    let local_tol = if options.dparam[SolverOptions::LOCAL_TOLERANCE] > 0.0 {
        options.dparam[SolverOptions::LOCAL_TOLERANCE]
    } else {
        1e-14
    };
    let variant = options.iparam[SolverOptions::LOCAL_SOLVER];
    if variant > 1 {
        return Err(Error::UnknownLocalSolver(variant));
    }

    let max_dim = (0..nb).map(|i| m.block_row_dim(i)).max().unwrap_or(0);
    let mut qloc = vec![0.0; max_dim];

    for sweep in 1..=max_iter {
        for i in 0..nb {
            let off = m.row_offsets()[i];
            let d = m.block_row_dim(i);
            qloc[..d].copy_from_slice(&problem.q[off..off + d]);
            m.row_offdiag_mul(i, z, &mut qloc[..d])?;

            let wii = m
                .block(i, i)
                .ok_or(Error::MissingDiagonalBlock { vertex: i })?;
            let law = crate::lcp::row_law(problem.mu.as_deref(), i, d);
            let zi = &mut z[off..off + d];

            let outcome = match variant {
                0 => local_direct(wii, &qloc[..d], &law, zi, local_tol),
                _ => {
                    local_projected(wii, &qloc[..d], &law, zi, local_tol);
                    Ok(())
                }
            };
            if let Err(status) = outcome {
                let error = compute_error(problem, z, w)?;
                log::warn!("NSGS: local solve failed on block row {}: {}", i, status);
                return Ok(SolveResult {
                    iterations: sweep,
                    error,
                    status,
                });
            }
        }

        let error = compute_error(problem, z, w)?;
        log::trace!("NSGS sweep {}: error {:.3e}", sweep, error);
        if error < tol {
            return Ok(SolveResult {
                iterations: sweep,
                error,
                status: Status::Success,
            });
        }
    }

    let error = compute_error(problem, z, w)?;
    Ok(SolveResult {
        iterations: max_iter,
        error,
        status: Status::MaximumIterationsExceeded,
    })
}

fn local_direct(
    wii: &Block,
    qloc: &[f64],
    law: &NonSmoothLaw,
    zi: &mut [f64],
    local_tol: f64,
) -> Result<(), Status> {
    match law {
        NonSmoothLaw::Complementarity { size: 1 } => {
            let mii = wii[(0, 0)];
            if mii <= f64::EPSILON {
                return Err(Status::SingularLocalProblem);
            }
            zi[0] = (-qloc[0] / mii).max(0.0);
            Ok(())
        }
        NonSmoothLaw::Complementarity { size } => {
            let mut wloc = vec![0.0; *size];
            let max_iter = LOCAL_DIRECT_MAX_ITER * size;
            match crate::lcp::lemke_dense(wii, qloc, zi, &mut wloc, max_iter).1 {
                Status::Success => Ok(()),
                _ => Err(Status::SingularLocalProblem),
            }
        }
        NonSmoothLaw::CoulombFriction { .. } => local_friction(wii, qloc, law, zi, local_tol),
    }
}

/// One-contact friction solve: alternate the closed-form normal update with
/// a 2x2 tangent solve and project onto the cone until the iterate settles.
fn local_friction(
    wii: &Block,
    qloc: &[f64],
    law: &NonSmoothLaw,
    zi: &mut [f64],
    local_tol: f64,
) -> Result<(), Status> {
    let w00 = wii[(0, 0)];
    if w00 <= f64::EPSILON {
        return Err(Status::SingularLocalProblem);
    }
    let det = wii[(1, 1)] * wii[(2, 2)] - wii[(1, 2)] * wii[(2, 1)];
    if det.abs() <= f64::EPSILON {
        return Err(Status::SingularLocalProblem);
    }

    let mut prev = [zi[0], zi[1], zi[2]];
    for _ in 0..LOCAL_DIRECT_MAX_ITER {
        let zn = ((-qloc[0] - wii[(0, 1)] * zi[1] - wii[(0, 2)] * zi[2]) / w00).max(0.0);
        zi[0] = zn;

        let rhs1 = -qloc[1] - wii[(1, 0)] * zn;
        let rhs2 = -qloc[2] - wii[(2, 0)] * zn;
        zi[1] = (wii[(2, 2)] * rhs1 - wii[(1, 2)] * rhs2) / det;
        zi[2] = (wii[(1, 1)] * rhs2 - wii[(2, 1)] * rhs1) / det;

        law.project(zi);

        let change = crate::inf_norm(zi.iter().zip(prev.iter()).map(|(a, b)| a - b));
        if change <= local_tol {
            break;
        }
        prev = [zi[0], zi[1], zi[2]];
    }
    Ok(())
}

/// Projected relaxation on the local block: a cheap alternative local solver
/// selected with `iparam[4] = 1`.
fn local_projected(wii: &Block, qloc: &[f64], law: &NonSmoothLaw, zi: &mut [f64], local_tol: f64) {
    let d = zi.len();
    let mut prev = zi.to_vec();
    for _ in 0..LOCAL_PROJECTED_MAX_ITER {
        for r in 0..d {
            let diag = wii[(r, r)];
            if diag.abs() <= f64::EPSILON {
                continue;
            }
            let mut s = qloc[r];
            for c in 0..d {
                s += wii[(r, c)] * zi[c];
            }
            zi[r] -= s / diag;
        }
        law.project(zi);

        let change = crate::inf_norm(zi.iter().zip(prev.iter()).map(|(a, b)| a - b));
        if change <= local_tol {
            break;
        }
        prev.copy_from_slice(zi);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lcp::lemke_dense;
    use crate::sbm::BlockSparseMatrix;
    use approx::assert_relative_eq;

    fn sbm_problem(m: &na::DMatrix<f64>, dims: &[usize], q: &[f64]) -> Problem {
        let sbm = BlockSparseMatrix::from_dense(m, dims, dims).unwrap();
        Problem::new(Operator::BlockSparse(sbm), q.to_vec()).unwrap()
    }

    #[test]
    fn matches_lemke_on_dense_equivalent() {
        let m = na::DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]);
        let q = [-5.0, -6.0];
        let problem = sbm_problem(&m, &[1, 1], &q);

        let mut z = [0.0; 2];
        let mut w = [0.0; 2];
        let options = SolverOptions::nsgs(500, 1e-12);
        let result = solve(&problem, &mut z, &mut w, &options).unwrap();
        assert_eq!(result.status, Status::Success);

        let mut z_ref = [0.0; 2];
        let mut w_ref = [0.0; 2];
        let (_, status) = lemke_dense(&m, &q, &mut z_ref, &mut w_ref, 100);
        assert_eq!(status, Status::Success);

        assert_relative_eq!(z[0], z_ref[0], max_relative = 1e-8);
        assert_relative_eq!(z[1], z_ref[1], max_relative = 1e-8);
    }

    #[test]
    fn projected_variant_agrees() {
        let m = na::DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]);
        let q = [-5.0, -6.0];
        let problem = sbm_problem(&m, &[1, 1], &q);

        let mut z = [0.0; 2];
        let mut w = [0.0; 2];
        let mut options = SolverOptions::nsgs(500, 1e-10);
        options.iparam[SolverOptions::LOCAL_SOLVER] = 1;
        let result = solve(&problem, &mut z, &mut w, &options).unwrap();
        assert_eq!(result.status, Status::Success);
        assert_relative_eq!(z[0], 4.0 / 3.0, max_relative = 1e-6);
        assert_relative_eq!(z[1], 7.0 / 3.0, max_relative = 1e-6);
    }

    #[test]
    fn singular_diagonal_is_reported() {
        // The zero diagonal block must be stored explicitly; an absent block
        // is a different failure (missing diagonal).
        let mut sbm = BlockSparseMatrix::square(&[1, 1]);
        sbm.set_block(0, 0, Block::zeros(1, 1)).unwrap();
        sbm.set_block(1, 1, Block::identity(1, 1)).unwrap();
        let problem =
            Problem::new(Operator::BlockSparse(sbm), vec![-1.0, -1.0]).unwrap();

        let mut z = [0.0; 2];
        let mut w = [0.0; 2];
        let options = SolverOptions::nsgs(10, 1e-10);
        let result = solve(&problem, &mut z, &mut w, &options).unwrap();
        assert_eq!(result.status, Status::SingularLocalProblem);
    }

    #[test]
    fn one_frictional_contact() {
        // Identity Delassus operator, sticking contact: the tangential
        // reaction stays inside the cone.
        let m = na::DMatrix::identity(3, 3);
        let q = [-1.0, 0.3, 0.0];
        let mut problem = sbm_problem(&m, &[3], &q);
        problem.mu = Some(vec![0.5]);

        let mut z = [0.0; 3];
        let mut w = [0.0; 3];
        let options = SolverOptions::nsgs(100, 1e-12);
        let result = solve(&problem, &mut z, &mut w, &options).unwrap();
        assert_eq!(result.status, Status::Success);
        assert_relative_eq!(z[0], 1.0, max_relative = 1e-10);
        assert_relative_eq!(z[1], -0.3, max_relative = 1e-10);
        assert!(z[1].hypot(z[2]) <= 0.5 * z[0] + 1e-12);
    }

    #[test]
    fn short_mu_vector_rejected() {
        // One coefficient for two block rows must fail fast, not panic
        // mid-sweep.
        let m = na::DMatrix::identity(6, 6);
        let mut problem = sbm_problem(&m, &[3, 3], &[-1.0; 6]);
        problem.mu = Some(vec![0.5]);

        let mut z = [0.0; 6];
        let mut w = [0.0; 6];
        let options = SolverOptions::nsgs(10, 1e-10);
        let err = solve(&problem, &mut z, &mut w, &options).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch));
    }

    #[test]
    fn unknown_local_variant_rejected() {
        let m = na::DMatrix::identity(1, 1);
        let problem = sbm_problem(&m, &[1], &[-1.0]);
        let mut z = [0.0];
        let mut w = [0.0];
        let mut options = SolverOptions::nsgs(10, 1e-10);
        options.iparam[SolverOptions::LOCAL_SOLVER] = 3;
        let err = solve(&problem, &mut z, &mut w, &options).unwrap_err();
        assert!(matches!(err, Error::UnknownLocalSolver(3)));
    }
}
