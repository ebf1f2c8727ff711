//! One-per-step assembly of the global operator from per-interaction blocks.
//!
//! The assembler walks the interaction graph, decides which cached blocks
//! must be (re)computed, and extracts the block-sparse global operator and
//! right-hand side. Under a linear problem, blocks are computed at most once
//! per update epoch: once [`BlockAssembler::assemble`] has run, subsequent
//! passes reuse every cached block until the epoch is invalidated by a
//! topology change or an explicit reset.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;

use crate::graph::{Interaction, InteractionGraph, SharedBlock};
use crate::sbm::{Block, BlockSparseMatrix};
use crate::Error;

/// Supplier of per-interaction operator data.
///
/// This is the seam to the time-integration and contact-kinematics
/// collaborators: they own the iteration matrices and Jacobians, the
/// assembler only asks for the resulting blocks.
pub trait BlockSource {
    /// Fills the `d x d` diagonal block of `inter`, overwriting `block`.
    fn diagonal_block(&self, inter: &Interaction, block: &mut Block);

    /// Accumulates into `block` the coupling contribution between `src` and
    /// `tgt` through the shared `body`.
    ///
    /// Accumulation matters: a pair of interactions sharing two bodies is
    /// joined by two edges, and both contributions land in one physical
    /// block. The assembler zeroes each physical block exactly once per pass
    /// before any accumulation.
    fn coupling_block(&self, src: &Interaction, tgt: &Interaction, body: usize, block: &mut Block);

    /// Fills the local offset vector `b` of `inter` (length `d`).
    fn offset(&self, inter: &Interaction, b: &mut [f64]);

    /// Friction coefficient for `inter`, if its law carries one.
    fn friction_coefficient(&self, inter: &Interaction) -> Option<f64> {
        inter.law.friction_coefficient()
    }
}

/// Counts of blocks actually computed during one update pass.
///
/// Cache hits do not count, which makes these counters the instrument for
/// verifying that an unchanged linear problem recomputes nothing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AssemblyStats {
    pub diagonal_blocks_computed: usize,
    pub coupling_blocks_computed: usize,
}

impl AssemblyStats {
    pub fn total(&self) -> usize {
        self.diagonal_blocks_computed + self.coupling_blocks_computed
    }
}

/// Per-step block assembler with a linear-problem caching epoch.
pub struct BlockAssembler {
    /// Whether the underlying problem is linear, making cached blocks valid
    /// across solves within an epoch.
    pub linear: bool,
    has_been_updated: bool,
}

impl BlockAssembler {
    pub fn new(linear: bool) -> Self {
        BlockAssembler {
            linear,
            has_been_updated: false,
        }
    }

    /// Whether a previous assembly already updated the blocks this epoch.
    pub fn has_been_updated(&self) -> bool {
        self.has_been_updated
    }

    /// Invalidates the caching epoch. Must be called whenever the topology
    /// or the underlying operators change.
    pub fn invalidate(&mut self) {
        self.has_been_updated = false;
    }

    /// Walks the graph once and (re)computes exactly the blocks that the
    /// current epoch requires.
    pub fn update_blocks<S: BlockSource>(
        &mut self,
        graph: &mut InteractionGraph,
        source: &S,
    ) -> Result<AssemblyStats, Error> {
        graph.validate()?;
        let skip = self.linear && self.has_been_updated;
        let stats = if graph.symmetric {
            update_symmetric(graph, source, skip)
        } else {
            update_nonsymmetric(graph, source, skip)
        };
        log::debug!(
            "Block update: {} diagonal, {} coupling blocks computed",
            stats.diagonal_blocks_computed,
            stats.coupling_blocks_computed
        );
        Ok(stats)
    }

    /// Updates the blocks and extracts the global operator and right-hand
    /// side, then marks the epoch as updated.
    pub fn assemble<S: BlockSource>(
        &mut self,
        graph: &mut InteractionGraph,
        source: &S,
    ) -> Result<(BlockSparseMatrix, Vec<f64>), Error> {
        self.update_blocks(graph, source)?;
        let m = assemble_operator(graph)?;
        let q = assemble_rhs(graph, source);
        self.has_been_updated = true;
        Ok((m, q))
    }
}

fn fresh_block(rows: usize, cols: usize) -> SharedBlock {
    Rc::new(RefCell::new(Block::zeros(rows, cols)))
}

fn ensure_diagonal<S: BlockSource>(
    graph: &mut InteractionGraph,
    source: &S,
    v: usize,
    skip: bool,
    stats: &mut AssemblyStats,
) {
    let d = graph.vertex(v).interaction.size();
    if graph.vertex(v).block.is_none() {
        graph.vertex_mut(v).block = Some(fresh_block(d, d));
    }
    if !skip {
        let handle = Rc::clone(graph.vertex(v).block.as_ref().expect("just ensured"));
        source.diagonal_block(&graph.vertex(v).interaction, &mut *handle.borrow_mut());
        stats.diagonal_blocks_computed += 1;
    }
}

fn block_slot(edge: &mut crate::graph::Edge, upper: bool) -> &mut Option<SharedBlock> {
    if upper {
        &mut edge.upper
    } else {
        &mut edge.lower
    }
}

/// Gets (allocating if needed) the physical block of edge `ed1` for the
/// given orientation and shares the handle onto the twin `ed2`.
///
/// Returns the handle and whether the block was freshly allocated.
fn ensure_coupling(
    graph: &mut InteractionGraph,
    ed1: usize,
    ed2: Option<usize>,
    upper: bool,
    rows: usize,
    cols: usize,
) -> (SharedBlock, bool) {
    let mut fresh = false;
    if block_slot(graph.edge_mut(ed1), upper).is_none() {
        *block_slot(graph.edge_mut(ed1), upper) = Some(fresh_block(rows, cols));
        fresh = true;
    }
    let handle = Rc::clone(
        block_slot(graph.edge_mut(ed1), upper)
            .as_ref()
            .expect("just ensured"),
    );
    if let Some(ed2) = ed2 {
        *block_slot(graph.edge_mut(ed2), upper) = Some(Rc::clone(&handle));
    }
    (handle, fresh)
}

fn update_symmetric<S: BlockSource>(
    graph: &mut InteractionGraph,
    source: &S,
    skip: bool,
) -> AssemblyStats {
    let mut stats = AssemblyStats::default();

    // Diagonal information lives on vertices; self loops are not represented.
    for v in 0..graph.num_vertices() {
        ensure_diagonal(graph, source, v, skip, &mut stats);
    }

    // Each physical block must be zeroed exactly once per pass, keyed by the
    // authoritative lower-index twin.
    let mut initialized = vec![false; graph.num_edges()];

    for e in 0..graph.num_edges() {
        let (isrc, itar) = (graph.edge(e).source, graph.edge(e).target);
        if isrc == itar {
            // Self loops carry no coupling; diagonal data lives on the vertex.
            continue;
        }
        let body = graph.edge(e).body;
        let (ed1, ed2) = graph.twin_edges(e);
        debug_assert!(e == ed1 || Some(e) == ed2);

        let d_src = graph.vertex(isrc).interaction.size();
        let d_tgt = graph.vertex(itar).interaction.size();
        let upper = itar > isrc;
        let (handle, _) = ensure_coupling(graph, ed1, ed2, upper, d_src, d_tgt);

        if !skip {
            // Zero each physical block once per pass before accumulating. On
            // a cache-hit pass nothing accumulates, so cached values survive.
            if !initialized[ed1] {
                initialized[ed1] = true;
                handle.borrow_mut().fill(0.0);
            }
            {
                let src_inter = graph.vertex(isrc).interaction.clone();
                let tgt_inter = graph.vertex(itar).interaction.clone();
                source.coupling_block(&src_inter, &tgt_inter, body, &mut *handle.borrow_mut());
                stats.coupling_blocks_computed += 1;
            }
            // The opposite orientation is derived by transposition and shared
            // onto the twin, never recomputed.
            let (mirror, _) = ensure_coupling(graph, ed1, ed2, !upper, d_tgt, d_src);
            let transposed = handle.borrow().transpose();
            *mirror.borrow_mut() = transposed;
        }
    }
    stats
}

fn update_nonsymmetric<S: BlockSource>(
    graph: &mut InteractionGraph,
    source: &S,
    skip: bool,
) -> AssemblyStats {
    let mut stats = AssemblyStats::default();

    for v in 0..graph.num_vertices() {
        ensure_diagonal(graph, source, v, skip, &mut stats);

        let incident: Vec<usize> = graph.out_edges(v).to_vec();

        // An edge seen from this vertex is not necessarily seen, in the same
        // pass, from its other endpoint, so the zeroed-once bookkeeping is
        // keyed by physical block identity rather than by edge.
        let mut initialized: AHashMap<*const RefCell<Block>, bool> = AHashMap::new();
        for &e in &incident {
            let (ed1, _) = graph.twin_edges(e);
            if let Some(h) = &graph.edge(ed1).upper {
                initialized.insert(Rc::as_ptr(h), false);
            }
            if let Some(h) = &graph.edge(ed1).lower {
                initialized.insert(Rc::as_ptr(h), false);
            }
        }

        for &e in &incident {
            let (isrc, itar) = graph.oriented(e, v);
            if isrc == itar {
                continue;
            }
            let body = graph.edge(e).body;
            let (ed1, ed2) = graph.twin_edges(e);

            let d_src = graph.vertex(isrc).interaction.size();
            let d_tgt = graph.vertex(itar).interaction.size();
            let upper = itar > isrc;
            let (handle, fresh) = ensure_coupling(graph, ed1, ed2, upper, d_src, d_tgt);
            if fresh {
                initialized.insert(Rc::as_ptr(&handle), false);
            }

            if !skip {
                let flag = initialized.entry(Rc::as_ptr(&handle)).or_insert(false);
                if !*flag {
                    *flag = true;
                    handle.borrow_mut().fill(0.0);
                }

                let src_inter = graph.vertex(isrc).interaction.clone();
                let tgt_inter = graph.vertex(itar).interaction.clone();
                source.coupling_block(&src_inter, &tgt_inter, body, &mut *handle.borrow_mut());
                stats.coupling_blocks_computed += 1;
            }
        }
    }
    stats
}

/// Extracts the block-sparse global operator from the cached blocks.
///
/// Fails if a diagonal block is missing, which means the block update pass
/// has not run for the current graph.
pub fn assemble_operator(graph: &InteractionGraph) -> Result<BlockSparseMatrix, Error> {
    graph.validate()?;
    let dims = graph.law_sizes();
    let mut m = BlockSparseMatrix::square(&dims);

    for v in 0..graph.num_vertices() {
        let block = graph
            .vertex(v)
            .block
            .as_ref()
            .ok_or(Error::MissingDiagonalBlock { vertex: v })?;
        m.set_block(v, v, block.borrow().clone())?;
    }

    for e in 0..graph.num_edges() {
        let (ed1, _) = graph.twin_edges(e);
        if e != ed1 {
            // The twin shares the same physical blocks.
            continue;
        }
        let edge = graph.edge(ed1);
        let (lo, hi) = (edge.source.min(edge.target), edge.source.max(edge.target));
        if let Some(upper) = &edge.upper {
            m.set_block(lo, hi, upper.borrow().clone())?;
        }
        if let Some(lower) = &edge.lower {
            m.set_block(hi, lo, lower.borrow().clone())?;
        }
    }
    Ok(m)
}

/// Gathers the global right-hand side from per-interaction offsets.
pub fn assemble_rhs<S: BlockSource>(graph: &InteractionGraph, source: &S) -> Vec<f64> {
    let mut q = vec![0.0; graph.num_constraints()];
    let mut offset = 0;
    for v in 0..graph.num_vertices() {
        let inter = &graph.vertex(v).interaction;
        let d = inter.size();
        source.offset(inter, &mut q[offset..offset + d]);
        offset += d;
    }
    q
}

/// Per-block-row friction coefficients for the assembled problem, if any
/// interaction carries a frictional law.
pub fn friction_coefficients(graph: &InteractionGraph) -> Option<Vec<f64>> {
    let any = (0..graph.num_vertices())
        .any(|v| graph.vertex(v).interaction.law.friction_coefficient().is_some());
    if !any {
        return None;
    }
    Some(
        (0..graph.num_vertices())
            .map(|v| {
                graph
                    .vertex(v)
                    .interaction
                    .law
                    .friction_coefficient()
                    .unwrap_or(0.0)
            })
            .collect(),
    )
}
