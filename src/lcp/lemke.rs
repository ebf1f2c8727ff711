//! Lemke-type complementary pivoting with lexicographic tie breaking.
//!
//! The problem is embedded in an augmented tableau with one artificial
//! covering variable `z0`. Pivot steps maintain complementary basic
//! feasibility; the method terminates either with `z0` leaving the basis (a
//! complementary basic feasible solution) or with a secondary ray, in which
//! case no solution was found by this method. The ratio test breaks ties
//! lexicographically against the inverse-basis columns, which guarantees
//! termination and makes pivot sequences reproducible.

use crate::lcp::{Problem, SolveResult, SolverOptions, Status};
use crate::sbm::Operator;
use crate::Error;

/// Pivot candidates must exceed this threshold; smaller entries are treated
/// as non-positive to avoid exploding pivots.
const PIVOT_EPS: f64 = 1e-12;

pub(crate) fn solve(
    problem: &Problem,
    z: &mut [f64],
    w: &mut [f64],
    options: &SolverOptions,
) -> Result<SolveResult, Error> {
    let Operator::Dense(m) = &problem.m else {
        return Err(Error::UnsupportedStorage {
            solver: options.solver,
            kind: problem.m.kind(),
        });
    };
    let n = problem.size();
    let max_iter = if options.max_iterations() > 0 {
        options.max_iterations()
    } else {
        100 * n.max(10)
    };
    let (iterations, status) = lemke_dense(m, &problem.q, z, w, max_iter);
    Ok(SolveResult {
        iterations,
        error: 0.0,
        status,
    })
}

/// Runs Lemke pivoting on a dense problem, writing the reaction into `z` and
/// the velocity into `w`. Returns the pivot count and termination status.
pub fn lemke_dense(
    m: &na::DMatrix<f64>,
    q: &[f64],
    z: &mut [f64],
    w: &mut [f64],
    max_iter: usize,
) -> (usize, Status) {
    let n = q.len();
    assert_eq!(m.nrows(), n);
    assert_eq!(m.ncols(), n);

    z.fill(0.0);
    if q.iter().all(|&qi| qi >= 0.0) {
        w.copy_from_slice(q);
        return (0, Status::Success);
    }

    // Tableau for `w - M z - e z0 = q`, one row per constraint:
    // columns [0, n) hold the w part (initially the identity, afterwards the
    // inverse basis used for lexicographic comparisons), [n, 2n) the z part
    // (-M), column 2n the covering vector (-e) and column 2n+1 the
    // right-hand side.
    let ncols = 2 * n + 2;
    let rhs_col = 2 * n + 1;
    let z0_col = 2 * n;
    let mut t = na::DMatrix::zeros(n, ncols);
    for i in 0..n {
        t[(i, i)] = 1.0;
        for j in 0..n {
            t[(i, n + j)] = -m[(i, j)];
        }
        t[(i, z0_col)] = -1.0;
        t[(i, rhs_col)] = q[i];
    }

    // Variable numbering: w_i = i, z_i = n + i, z0 = 2n.
    let mut basis: Vec<usize> = (0..n).collect();

    // Drive z0 in at the row of the most negative q; ties go to the lowest
    // row index.
    let mut pivot_row = 0;
    for i in 1..n {
        if t[(i, rhs_col)] < t[(pivot_row, rhs_col)] {
            pivot_row = i;
        }
    }
    pivot(&mut t, pivot_row, z0_col);
    let mut leaving = basis[pivot_row];
    basis[pivot_row] = 2 * n;
    // The complement of the leaving variable enters next.
    let mut entering = complement(leaving, n);

    let mut iterations = 1;
    loop {
        if iterations >= max_iter {
            extract(&t, &basis, rhs_col, n, z, w);
            return (iterations, Status::MaximumIterationsExceeded);
        }

        let col = entering;
        let Some(row) = lexico_ratio_test(&t, col, rhs_col, n) else {
            // No positive entry in the entering column: secondary ray. The
            // problem may still have a solution, just not one this method
            // detects.
            extract(&t, &basis, rhs_col, n, z, w);
            log::debug!("Lemke: secondary ray after {} pivots", iterations);
            return (iterations, Status::RayTermination);
        };

        pivot(&mut t, row, col);
        leaving = basis[row];
        basis[row] = entering;
        iterations += 1;

        if leaving == 2 * n {
            extract(&t, &basis, rhs_col, n, z, w);
            return (iterations, Status::Success);
        }
        entering = complement(leaving, n);
    }
}

fn complement(var: usize, n: usize) -> usize {
    if var < n {
        var + n
    } else {
        var - n
    }
}

fn pivot(t: &mut na::DMatrix<f64>, row: usize, col: usize) {
    let piv = t[(row, col)];
    debug_assert!(piv.abs() > 0.0);
    let ncols = t.ncols();
    for j in 0..ncols {
        t[(row, j)] /= piv;
    }
    for i in 0..t.nrows() {
        if i == row {
            continue;
        }
        let factor = t[(i, col)];
        if factor == 0.0 {
            continue;
        }
        for j in 0..ncols {
            t[(i, j)] -= factor * t[(row, j)];
        }
    }
}

/// Minimum-ratio test over rows with a positive entry in `col`, breaking
/// ties lexicographically against the inverse-basis columns `[0, n)`.
fn lexico_ratio_test(
    t: &na::DMatrix<f64>,
    col: usize,
    rhs_col: usize,
    n: usize,
) -> Option<usize> {
    let mut best: Option<usize> = None;
    for i in 0..t.nrows() {
        let ti = t[(i, col)];
        if ti <= PIVOT_EPS {
            continue;
        }
        let Some(b) = best else {
            best = Some(i);
            continue;
        };
        let tb = t[(b, col)];
        let ratio_i = t[(i, rhs_col)] / ti;
        let ratio_b = t[(b, rhs_col)] / tb;
        if ratio_i < ratio_b {
            best = Some(i);
        } else if ratio_i == ratio_b {
            // Lexicographic comparison of the scaled inverse-basis rows.
            for j in 0..n {
                let li = t[(i, j)] / ti;
                let lb = t[(b, j)] / tb;
                if li < lb {
                    best = Some(i);
                    break;
                }
                if li > lb {
                    break;
                }
            }
        }
    }
    best
}

fn extract(
    t: &na::DMatrix<f64>,
    basis: &[usize],
    rhs_col: usize,
    n: usize,
    z: &mut [f64],
    w: &mut [f64],
) {
    z.fill(0.0);
    w.fill(0.0);
    for (row, &var) in basis.iter().enumerate() {
        let val = t[(row, rhs_col)];
        if var < n {
            w[var] = val;
        } else if var < 2 * n {
            z[var - n] = val;
        }
        // A basic z0 only happens on non-success exits; its value is simply
        // dropped from the reported iterate.
    }
}
