//! Topology graph of active interactions.
//!
//! Vertices are active interactions; an edge connects two interactions for
//! every body they share, so a pair of interactions sharing two bodies is
//! joined by two parallel edges. The graph caches the per-vertex diagonal
//! block and the per-edge upper/lower coupling blocks between assembly
//! passes. Parallel edges between the same vertex pair share their physical
//! blocks by handle, never by copy.
//!
//! The graph is rebuilt whenever the active interaction set changes; there is
//! no vertex removal. Cached blocks can be dropped wholesale with
//! [`InteractionGraph::reset_blocks`].

use std::cell::RefCell;
use std::rc::Rc;

use crate::law::NonSmoothLaw;
use crate::sbm::Block;
use crate::Error;

/// Reference-counted handle to a cached block.
///
/// Twin half-edges of the same vertex pair store clones of one handle, so a
/// mutation through either is visible through the other.
pub type SharedBlock = Rc<RefCell<Block>>;

/// A potential contact constraint between one or two bodies.
#[derive(Clone, Debug, PartialEq)]
pub struct Interaction {
    /// Identifier assigned by the owning simulation.
    pub id: usize,
    pub law: NonSmoothLaw,
}

impl Interaction {
    pub fn new(id: usize, law: NonSmoothLaw) -> Self {
        Interaction { id, law }
    }

    /// Nonsmooth law dimension of this interaction.
    pub fn size(&self) -> usize {
        self.law.size()
    }
}

pub struct Vertex {
    pub interaction: Interaction,
    /// Cached diagonal block, `d x d`.
    pub block: Option<SharedBlock>,
}

pub struct Edge {
    pub source: usize,
    pub target: usize,
    /// The shared body this edge represents.
    pub body: usize,
    /// Cached coupling block oriented from the lower to the higher vertex index.
    pub upper: Option<SharedBlock>,
    /// Cached coupling block of the opposite orientation.
    pub lower: Option<SharedBlock>,
}

pub struct InteractionGraph {
    /// Selects the symmetric assembly walk; otherwise the per-vertex
    /// out-edge walk is used.
    pub symmetric: bool,
    vertices: Vec<Vertex>,
    edges: Vec<Edge>,
    /// Incident edge ids per vertex, in insertion order.
    adjacency: Vec<Vec<usize>>,
}

impl InteractionGraph {
    pub fn new(symmetric: bool) -> Self {
        InteractionGraph {
            symmetric,
            vertices: Vec::new(),
            edges: Vec::new(),
            adjacency: Vec::new(),
        }
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn vertex(&self, v: usize) -> &Vertex {
        &self.vertices[v]
    }

    pub fn vertex_mut(&mut self, v: usize) -> &mut Vertex {
        &mut self.vertices[v]
    }

    pub fn edge(&self, e: usize) -> &Edge {
        &self.edges[e]
    }

    pub fn edge_mut(&mut self, e: usize) -> &mut Edge {
        &mut self.edges[e]
    }

    /// Adds an interaction vertex and returns its index.
    ///
    /// The vertex index is also the interaction's position in the global
    /// block ordering.
    pub fn add_interaction(&mut self, interaction: Interaction) -> usize {
        self.vertices.push(Vertex {
            interaction,
            block: None,
        });
        self.adjacency.push(Vec::new());
        self.vertices.len() - 1
    }

    /// Adds an edge between interactions `u` and `v` sharing `body`.
    ///
    /// Endpoint indices are not validated here; a dangling endpoint is caught
    /// by [`validate`](Self::validate) at the start of the assembly pass.
    pub fn add_edge(&mut self, u: usize, v: usize, body: usize) -> usize {
        let e = self.edges.len();
        self.edges.push(Edge {
            source: u,
            target: v,
            body,
            upper: None,
            lower: None,
        });
        if u < self.adjacency.len() {
            self.adjacency[u].push(e);
        }
        if v < self.adjacency.len() && v != u {
            self.adjacency[v].push(e);
        }
        e
    }

    /// Incident edges of `v`.
    pub fn out_edges(&self, v: usize) -> &[usize] {
        &self.adjacency[v]
    }

    /// The endpoints of edge `e` oriented so that the source is `v`.
    pub fn oriented(&self, e: usize, v: usize) -> (usize, usize) {
        let edge = &self.edges[e];
        if edge.source == v {
            (edge.source, edge.target)
        } else {
            (edge.target, edge.source)
        }
    }

    /// The (at most two) parallel edges joining the endpoints of `e`, the
    /// lower-index edge first.
    ///
    /// The lower-index edge is authoritative for block ownership; its twin
    /// mirrors the shared handles.
    pub fn twin_edges(&self, e: usize) -> (usize, Option<usize>) {
        let Edge { source, target, .. } = self.edges[e];
        let mut found: (Option<usize>, Option<usize>) = (None, None);
        for &cand in &self.adjacency[source.min(target)] {
            let edge = &self.edges[cand];
            let joins = (edge.source == source && edge.target == target)
                || (edge.source == target && edge.target == source);
            if joins {
                match found {
                    (None, _) => found.0 = Some(cand),
                    (Some(_), None) => found.1 = Some(cand),
                    _ => debug_assert!(false, "more than two parallel edges between a pair"),
                }
            }
        }
        let first = found.0.expect("edge not present in its own adjacency");
        debug_assert!(found.1.map_or(true, |second| first < second));
        (first, found.1)
    }

    /// Law sizes of all interactions in vertex order; the global block
    /// partition of the assembled operator.
    pub fn law_sizes(&self) -> Vec<usize> {
        self.vertices
            .iter()
            .map(|vtx| vtx.interaction.size())
            .collect()
    }

    /// Total number of scalar constraints.
    pub fn num_constraints(&self) -> usize {
        self.vertices.iter().map(|vtx| vtx.interaction.size()).sum()
    }

    /// Checks internal consistency: every edge endpoint must reference an
    /// existing vertex.
    pub fn validate(&self) -> Result<(), Error> {
        for (e, edge) in self.edges.iter().enumerate() {
            for &v in &[edge.source, edge.target] {
                if v >= self.vertices.len() {
                    return Err(Error::DanglingEdge { edge: e, vertex: v });
                }
            }
        }
        Ok(())
    }

    /// Drops every cached block. Call after a topology change so that the
    /// next assembly pass recomputes from scratch.
    pub fn reset_blocks(&mut self) {
        for vtx in &mut self.vertices {
            vtx.block = None;
        }
        for edge in &mut self.edges {
            edge.upper = None;
            edge.lower = None;
        }
    }
}
