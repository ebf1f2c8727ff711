//! Graph assembly scenarios: coupling through shared bodies, twin edges,
//! caching across passes and the end-to-end assemble-then-solve path.

use approx::assert_relative_eq;

use bumpy::assembly::{assemble_operator, assemble_rhs, friction_coefficients};
use bumpy::lcp::{lemke_dense, solve_problem};
use bumpy::{
    Block, BlockAssembler, BlockSource, Error, Interaction, InteractionGraph, NonSmoothLaw,
    Operator, Problem, SolverOptions, Status,
};

/// Simplest possible source: identity diagonals, a constant 0.5 coupling and
/// a unit pull on every constraint.
struct UnitSource;

impl BlockSource for UnitSource {
    fn diagonal_block(&self, inter: &Interaction, block: &mut Block) {
        block.fill(0.0);
        for k in 0..inter.size() {
            block[(k, k)] = 1.0;
        }
    }

    fn coupling_block(&self, src: &Interaction, tgt: &Interaction, _body: usize, block: &mut Block) {
        for r in 0..src.size() {
            for c in 0..tgt.size() {
                block[(r, c)] += 0.5;
            }
        }
    }

    fn offset(&self, _inter: &Interaction, b: &mut [f64]) {
        b.fill(-1.0);
    }
}

/// A source with structured, orientation-consistent couplings: the block
/// from `src` to `tgt` is the exact transpose of its reverse, entry by entry,
/// so the symmetric and non-symmetric walks must agree bit for bit.
struct SpringSource;

fn mode(id: usize, k: usize) -> f64 {
    1.0 + 0.5 * id as f64 + 0.25 * k as f64
}

impl BlockSource for SpringSource {
    fn diagonal_block(&self, inter: &Interaction, block: &mut Block) {
        let d = inter.size();
        block.fill(0.0);
        for k in 0..d {
            block[(k, k)] = 4.0 + inter.id as f64;
        }
    }

    fn coupling_block(&self, src: &Interaction, tgt: &Interaction, body: usize, block: &mut Block) {
        let scale = 0.1 * (body as f64 + 1.0);
        for r in 0..src.size() {
            for c in 0..tgt.size() {
                block[(r, c)] += scale * mode(src.id, r) * mode(tgt.id, c);
            }
        }
    }

    fn offset(&self, inter: &Interaction, b: &mut [f64]) {
        for (k, bk) in b.iter_mut().enumerate() {
            *bk = -1.0 - inter.id as f64 - 0.25 * k as f64;
        }
    }
}

fn lcp_law(size: usize) -> NonSmoothLaw {
    NonSmoothLaw::Complementarity { size }
}

/// Three interactions of mixed sizes; the middle pair shares two bodies.
fn mixed_graph(symmetric: bool) -> InteractionGraph {
    let mut g = InteractionGraph::new(symmetric);
    let a = g.add_interaction(Interaction::new(0, lcp_law(1)));
    let b = g.add_interaction(Interaction::new(1, lcp_law(3)));
    let c = g.add_interaction(Interaction::new(2, lcp_law(2)));
    g.add_edge(a, b, 0);
    g.add_edge(b, c, 1);
    g.add_edge(c, b, 2);
    g.add_edge(a, c, 3);
    g
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn two_contacts_sharing_a_body() {
    init_logger();
    let mut g = InteractionGraph::new(true);
    let a = g.add_interaction(Interaction::new(0, lcp_law(1)));
    let b = g.add_interaction(Interaction::new(1, lcp_law(1)));
    g.add_edge(a, b, 0);

    let mut assembler = BlockAssembler::new(true);
    let (m, q) = assembler.assemble(&mut g, &UnitSource).unwrap();

    let expected = na::DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 1.0]);
    assert_eq!(m.to_dense(), expected);
    assert_eq!(q, vec![-1.0, -1.0]);
}

#[test]
fn symmetric_and_nonsymmetric_walks_agree() {
    let mut sym = mixed_graph(true);
    let mut nonsym = mixed_graph(false);

    let mut assembler = BlockAssembler::new(false);
    let (m_sym, q_sym) = assembler.assemble(&mut sym, &SpringSource).unwrap();
    let (m_nonsym, q_nonsym) = assembler.assemble(&mut nonsym, &SpringSource).unwrap();

    assert_relative_eq!(m_sym.to_dense(), m_nonsym.to_dense(), max_relative = 1e-14);
    assert_eq!(q_sym, q_nonsym);
}

#[test]
fn twin_edges_accumulate_into_one_block() {
    // Interactions 1 and 2 share bodies 1 and 2; both contributions land in
    // the same physical block.
    let mut g = mixed_graph(true);
    let mut assembler = BlockAssembler::new(true);
    let (m, _) = assembler.assemble(&mut g, &SpringSource).unwrap();

    let block = m.block(1, 2).expect("coupling block present");
    let expected = |r: usize, c: usize| {
        (0.1 * 2.0 + 0.1 * 3.0) * mode(1, r) * mode(2, c)
    };
    for r in 0..3 {
        for c in 0..2 {
            assert_relative_eq!(block[(r, c)], expected(r, c), max_relative = 1e-14);
        }
    }

    // The opposite orientation is the transpose.
    let lower = m.block(2, 1).expect("mirrored block present");
    assert_eq!(*lower, block.transpose());
}

#[test]
fn linear_epoch_reuses_cached_blocks() {
    let mut g = mixed_graph(true);
    let mut assembler = BlockAssembler::new(true);

    let (m1, q1) = assembler.assemble(&mut g, &SpringSource).unwrap();
    assert!(assembler.has_been_updated());

    let stats = assembler.update_blocks(&mut g, &SpringSource).unwrap();
    assert_eq!(stats.total(), 0);

    let (m2, q2) = assembler.assemble(&mut g, &SpringSource).unwrap();
    assert_eq!(m1.to_dense(), m2.to_dense());
    assert_eq!(q1, q2);
}

#[test]
fn invalidation_forces_a_recompute() {
    let mut g = mixed_graph(true);
    let mut assembler = BlockAssembler::new(true);
    assembler.assemble(&mut g, &SpringSource).unwrap();

    assembler.invalidate();
    let stats = assembler.update_blocks(&mut g, &SpringSource).unwrap();
    assert!(stats.diagonal_blocks_computed > 0);
    assert!(stats.coupling_blocks_computed > 0);
}

#[test]
fn nonlinear_problems_recompute_every_pass() {
    let mut g = mixed_graph(true);
    let mut assembler = BlockAssembler::new(false);
    assembler.assemble(&mut g, &SpringSource).unwrap();

    let stats = assembler.update_blocks(&mut g, &SpringSource).unwrap();
    assert!(stats.total() > 0);
}

#[test]
fn dangling_edge_aborts_assembly() {
    let mut g = InteractionGraph::new(true);
    g.add_interaction(Interaction::new(0, lcp_law(1)));
    g.add_edge(0, 5, 0);

    let mut assembler = BlockAssembler::new(true);
    let err = assembler.assemble(&mut g, &UnitSource).unwrap_err();
    assert!(matches!(err, Error::DanglingEdge { edge: 0, vertex: 5 }));
}

#[test]
fn friction_coefficients_follow_the_laws() {
    let mut g = InteractionGraph::new(true);
    g.add_interaction(Interaction::new(0, NonSmoothLaw::CoulombFriction { mu: 0.3 }));
    g.add_interaction(Interaction::new(1, lcp_law(1)));
    assert_eq!(friction_coefficients(&g), Some(vec![0.3, 0.0]));

    let mut frictionless = InteractionGraph::new(true);
    frictionless.add_interaction(Interaction::new(0, lcp_law(2)));
    assert_eq!(friction_coefficients(&frictionless), None);
}

#[test]
fn assembled_problem_matches_dense_reference() {
    let mut g = mixed_graph(true);
    let mut assembler = BlockAssembler::new(true);
    let (m, q) = assembler.assemble(&mut g, &SpringSource).unwrap();

    let dense = m.to_dense();
    let n = q.len();
    let mut z_ref = vec![0.0; n];
    let mut w_ref = vec![0.0; n];
    let (_, status) = lemke_dense(&dense, &q, &mut z_ref, &mut w_ref, 1000);
    assert_eq!(status, Status::Success);

    let problem = Problem::new(Operator::BlockSparse(m), q).unwrap();
    let mut options = SolverOptions::nsgs(500, 1e-12);
    let (solution, result) = solve_problem(&problem, &mut options).unwrap();
    assert_eq!(result.status, Status::Success);

    for (zi, zr) in solution.z.iter().zip(z_ref.iter()) {
        assert_relative_eq!(*zi, *zr, epsilon = 1e-9, max_relative = 1e-7);
    }
}

#[test]
fn operator_extraction_requires_an_update() {
    let mut g = mixed_graph(true);
    let err = assemble_operator(&g).unwrap_err();
    assert!(matches!(err, Error::MissingDiagonalBlock { vertex: 0 }));

    let mut assembler = BlockAssembler::new(true);
    assembler.update_blocks(&mut g, &SpringSource).unwrap();
    let m = assemble_operator(&g).unwrap();
    let q = assemble_rhs(&g, &SpringSource);
    assert_eq!(m.num_rows(), q.len());
}
