// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-memory topology: the vertex list plus an undirected, latency-weighted
//! adjacency. This is what the valley-free core pass and the writers
//! consume; it is never persisted to the store.

use std::cmp::Reverse;
use std::collections::HashMap;

use ahash::RandomState;
use priority_queue::PriorityQueue;
use tracing::debug;

use crate::util::OrdF64;
use crate::vertex::{EdgeLink, Latency, Vertex, VertexList};

#[derive(Clone, Debug, Default)]
pub struct TopoGraph {
    vertices: VertexList,
    adj: HashMap<String, HashMap<String, Latency, RandomState>, RandomState>,
}

impl TopoGraph {
    /// Assemble from vertices and edges. Edges naming a missing vertex are
    /// dropped with a log line rather than inventing half-specified nodes.
    #[must_use]
    pub fn new(vertices: VertexList, edges: Vec<EdgeLink>) -> Self {
        let mut graph = Self {
            vertices,
            adj: HashMap::default(),
        };
        for edge in edges {
            if !graph.vertices.contains(&edge.a) || !graph.vertices.contains(&edge.b) {
                debug!("dropping edge {} -- {}: missing endpoint", edge.a, edge.b);
                continue;
            }
            graph.add_edge(&edge.a, &edge.b, edge.latency);
        }
        graph
    }

    #[must_use]
    pub fn vertices(&self) -> &VertexList {
        &self.vertices
    }

    #[must_use]
    pub fn vertex(&self, id: &str) -> Option<&Vertex> {
        self.vertices.get(id)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.vertices.len()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.adj.values().map(HashMap::len).sum::<usize>() / 2
    }

    #[must_use]
    pub fn degree(&self, id: &str) -> usize {
        self.adj.get(id).map_or(0, HashMap::len)
    }

    pub fn neighbors(&self, id: &str) -> impl Iterator<Item = (&str, &Latency)> {
        self.adj
            .get(id)
            .into_iter()
            .flat_map(|ns| ns.iter().map(|(n, l)| (n.as_str(), l)))
    }

    #[must_use]
    pub fn edge(&self, a: &str, b: &str) -> Option<&Latency> {
        self.adj.get(a)?.get(b)
    }

    /// Every undirected edge once, endpoints in lexicographic order.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str, &Latency)> {
        self.adj.iter().flat_map(|(a, ns)| {
            ns.iter()
                .filter(move |(b, _)| a.as_str() < b.as_str())
                .map(move |(b, l)| (a.as_str(), b.as_str(), l))
        })
    }

    pub fn add_edge(&mut self, a: &str, b: &str, latency: Latency) {
        self.adj
            .entry(a.to_owned())
            .or_default()
            .insert(b.to_owned(), latency.clone());
        self.adj
            .entry(b.to_owned())
            .or_default()
            .insert(a.to_owned(), latency);
    }

    pub fn remove_edge(&mut self, a: &str, b: &str) {
        if let Some(ns) = self.adj.get_mut(a) {
            ns.remove(b);
        }
        if let Some(ns) = self.adj.get_mut(b) {
            ns.remove(a);
        }
    }

    /// Remove a vertex and all its edges.
    pub fn remove_node(&mut self, id: &str) {
        if let Some(ns) = self.adj.remove(id) {
            for neighbor in ns.keys() {
                if let Some(back) = self.adj.get_mut(neighbor) {
                    back.remove(id);
                }
            }
        }
        self.vertices.remove(id);
    }

    /// Induced subgraph on `nodes`.
    #[must_use]
    pub fn subgraph(&self, nodes: &std::collections::HashSet<String, RandomState>) -> Self {
        let mut vertices = VertexList::new();
        for v in self.vertices.iter() {
            if nodes.contains(&v.id) {
                // ids are unique in the source list
                let _ = vertices.add(v.clone());
            }
        }
        let mut edges = Vec::new();
        for (a, b, latency) in self.edges() {
            if nodes.contains(a) && nodes.contains(b) {
                edges.push(EdgeLink::new(a, b, latency.clone()));
            }
        }
        Self::new(vertices, edges)
    }

    /// Shortest paths from `source` to every reachable vertex, weighted by
    /// the representative latency of each edge. Returns full vertex paths,
    /// source first.
    #[must_use]
    pub fn shortest_paths(&self, source: &str) -> HashMap<String, Vec<String>, RandomState> {
        let mut dist: HashMap<String, f64, RandomState> = HashMap::default();
        let mut prev: HashMap<String, String, RandomState> = HashMap::default();
        let mut queue: PriorityQueue<String, Reverse<OrdF64>, RandomState> =
            PriorityQueue::with_default_hasher();

        dist.insert(source.to_owned(), 0.0);
        queue.push(source.to_owned(), Reverse(OrdF64(0.0)));

        while let Some((node, Reverse(OrdF64(d)))) = queue.pop() {
            for (neighbor, latency) in self.neighbors(&node) {
                let candidate = d + latency.representative();
                let better = dist.get(neighbor).is_none_or(|&known| candidate < known);
                if better {
                    dist.insert(neighbor.to_owned(), candidate);
                    prev.insert(neighbor.to_owned(), node.clone());
                    queue.push_increase(neighbor.to_owned(), Reverse(OrdF64(candidate)));
                }
            }
        }

        let mut paths: HashMap<String, Vec<String>, RandomState> = HashMap::default();
        for target in dist.keys() {
            let mut path = vec![target.clone()];
            let mut cursor = target;
            while let Some(p) = prev.get(cursor) {
                path.push(p.clone());
                cursor = p;
            }
            path.reverse();
            paths.insert(target.clone(), path);
        }
        paths
    }
}
