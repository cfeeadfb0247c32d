// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Core reduction: keep only the edges lying on shortest valley-free paths
//! between overlay endpoints.
//!
//! Workers coordinate through the store: a shared set of pending sources
//! (drained with an atomic pop) and two output sets for used nodes and
//! used hops. Both outputs are idempotent set unions, so worker ordering
//! is irrelevant and an interrupted run loses nothing already written.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::RandomState;
use priority_queue::PriorityQueue;
use rand::Rng;
use store::{Batch, Store, StoreError, keys};
use tracing::{debug, info, warn};

use crate::peering::PeeringDb;
use crate::topo::TopoGraph;
use crate::util::OrdF64;
use crate::vertex::{Latency, NodeKind};
use crate::GraphError;

/// A (source, target) pair admits no valley-free path at all.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no valley-free path")]
pub struct ValleyFreeError;

#[derive(Clone, Copy, Debug, Default)]
pub struct CoreOptions {
    pub workers: usize,
}

impl CoreOptions {
    #[must_use]
    pub fn with_workers(workers: usize) -> Self {
        Self { workers }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoreStats {
    /// Sources drained from the shared work set.
    pub sources: usize,
    /// Paths that had to be rebuilt valley-free.
    pub rebuilt_paths: usize,
    /// (source, target) pairs dropped for lack of any valley-free path.
    pub dropped_pairs: usize,
    /// Hops whose AS relationship was unknown on both sides.
    pub missing_relationships: usize,
}

impl CoreStats {
    fn absorb(&mut self, other: CoreStats) {
        self.sources += other.sources;
        self.rebuilt_paths += other.rebuilt_paths;
        self.dropped_pairs += other.dropped_pairs;
        self.missing_relationships += other.missing_relationships;
    }
}

/// Run-scoped scratch keys so concurrent runs against one store cannot
/// collide.
struct ScratchKeys {
    sp: String,
    types: String,
    used_nodes: String,
    used_hops: String,
}

impl ScratchKeys {
    fn fresh() -> Self {
        let tag: u32 = rand::rng().random_range(0..10_000);
        Self {
            sp: format!("core:sp_to_process:{tag}"),
            types: format!("core:types:{tag}"),
            used_nodes: format!("core:core_nodes:{tag}"),
            used_hops: format!("core:core_paths:{tag}"),
        }
    }

    fn cleanup(&self, store: &dyn Store) -> Result<(), StoreError> {
        let mut batch = Batch::new();
        batch
            .del(&self.sp)
            .del(&self.types)
            .del(&self.used_nodes)
            .del(&self.used_hops);
        store.apply(batch)
    }
}

/// Validate a path's ASN projection. `Ok(Some((missing, hops)))` when the
/// path is valley-free, `Ok(None)` when a customer transition follows a
/// provider transition. Hops with an unknown relationship on both sides
/// count as `missing` but do not invalidate the path.
pub fn check_valley_free(
    peering: &PeeringDb,
    graph: &TopoGraph,
    path: &[String],
) -> Result<Option<(u32, u32)>, GraphError> {
    if path.is_empty() || !peering.loaded()? {
        return Ok(Some((0, 1)));
    }
    let asn_path: Vec<&str> = path
        .iter()
        .filter_map(|hop| graph.vertex(hop).and_then(|v| v.asn.as_deref()))
        .filter(|asn| *asn != "N/A")
        .collect();

    let mut went_down = false;
    let mut missing = 0u32;
    let mut hops = 0u32;
    for pair in asn_path.windows(2) {
        hops += 1;
        if pair[0] == pair[1] {
            continue;
        }
        match peering.relationship(pair[0], pair[1])? {
            None => missing += 1,
            Some(1) => went_down = true,
            Some(-1) => {
                if went_down {
                    return Ok(None);
                }
            }
            Some(_) => {} // peers do not change direction
        }
    }
    Ok(Some((missing, hops)))
}

/// Shortest valley-free path search: a priority-queue expansion over
/// candidate paths, each carrying its own AS state machine. A candidate
/// that would go up after having gone down is cut. Returns the path and
/// its count of unknown-relationship hops.
pub fn valley_free_path(
    peering: &PeeringDb,
    graph: &TopoGraph,
    start: &str,
    target: &str,
) -> Result<Result<(Vec<String>, u32), ValleyFreeError>, GraphError> {
    #[derive(Clone)]
    struct Candidate {
        path: Vec<String>,
        entered_valley: bool,
        errct: u32,
        complete: bool,
    }

    let mut candidates = vec![Candidate {
        path: vec![start.to_owned()],
        entered_valley: false,
        errct: 0,
        complete: start == target,
    }];
    let mut queue: PriorityQueue<usize, Reverse<OrdF64>, RandomState> =
        PriorityQueue::with_default_hasher();
    queue.push(0, Reverse(OrdF64(0.0)));

    while let Some((idx, Reverse(OrdF64(dist)))) = queue.pop() {
        let cand = candidates[idx].clone();
        if cand.complete {
            // minimum-cost pop of a completed candidate is the answer
            return Ok(Ok((cand.path, cand.errct)));
        }
        let Some(last) = cand.path.last().cloned() else {
            continue;
        };
        for (neighbor, latency) in graph.neighbors(&last) {
            if cand.path.iter().any(|n| n == neighbor) {
                continue; // no cycles
            }
            let mut next = cand.clone();
            let as1 = graph.vertex(&last).and_then(|v| v.asn.as_deref());
            let as2 = graph.vertex(neighbor).and_then(|v| v.asn.as_deref());
            if let (Some(as1), Some(as2)) = (as1, as2) {
                if as1 != as2 && as1 != "N/A" && as2 != "N/A" {
                    match peering.relationship(as1, as2)? {
                        Some(1) => next.entered_valley = true,
                        Some(-1) if next.entered_valley => continue,
                        Some(_) => {}
                        None => next.errct += 1,
                    }
                }
            }
            next.path.push(neighbor.to_owned());
            next.complete = neighbor == target;
            let cost = dist + latency.representative();
            candidates.push(next);
            queue.push(candidates.len() - 1, Reverse(OrdF64(cost)));
        }
    }
    Ok(Err(ValleyFreeError))
}

fn worker_loop(
    store: &dyn Store,
    graph: &TopoGraph,
    scratch: &ScratchKeys,
    worker: usize,
    interrupt: Option<&AtomicBool>,
) -> Result<CoreStats, GraphError> {
    let peering = PeeringDb::new(store);
    let mut stats = CoreStats::default();

    while !interrupt.is_some_and(|f| f.load(Ordering::Relaxed)) {
        let Some(source) = store.spop(&scratch.sp)? else {
            break;
        };
        stats.sources += 1;
        debug!("worker {worker}: shortest paths from {source}");
        let paths = graph.shortest_paths(&source);

        let mut used_nodes: BTreeSet<String> = BTreeSet::new();
        let mut used_hops: BTreeSet<String> = BTreeSet::new();
        for (target, path) in &paths {
            if store.hget(&scratch.types, target)?.is_none() {
                continue; // only overlay endpoints matter as targets
            }
            let kept: Vec<String> = match check_valley_free(&peering, graph, path)? {
                Some((missing, _)) => {
                    stats.missing_relationships += missing as usize;
                    path.clone()
                }
                None => {
                    debug!("path {source} -> {target} not valley-free, rebuilding");
                    match valley_free_path(&peering, graph, &source, target)? {
                        Ok((rebuilt, errct)) => {
                            stats.rebuilt_paths += 1;
                            stats.missing_relationships += errct as usize;
                            rebuilt
                        }
                        Err(ValleyFreeError) => {
                            warn!("no valley-free path from {source} to {target}, dropping pair");
                            stats.dropped_pairs += 1;
                            continue;
                        }
                    }
                }
            };
            used_nodes.extend(kept.iter().cloned());
            for hop in kept.windows(2) {
                used_hops.insert(keys::pair_member(&hop[0], &hop[1]));
            }
        }

        // one batched write per source; unions are idempotent
        let mut batch = Batch::new();
        batch
            .sadd_all(&scratch.used_nodes, used_nodes)
            .sadd_all(&scratch.used_hops, used_hops);
        store.apply(batch)?;
    }
    Ok(stats)
}

/// Compute the core subgraph: induced on the nodes of all kept paths, with
/// every edge not on a kept path removed, then collapsed once more in
/// memory.
pub fn compute_core(
    store: &dyn Store,
    graph: &TopoGraph,
    opts: &CoreOptions,
    interrupt: Option<&AtomicBool>,
) -> Result<(TopoGraph, CoreStats), GraphError> {
    let scratch = ScratchKeys::fresh();

    let mut batch = Batch::new();
    let mut sources = 0usize;
    for vertex in graph.vertices().iter() {
        if vertex.kind.is_overlay() {
            batch
                .sadd(&scratch.sp, &vertex.id)
                .hset(&scratch.types, &vertex.id, vertex.kind.as_str());
            sources += 1;
        }
    }
    store.apply(batch)?;

    let workers = opts.workers.max(1);
    info!("processing shortest paths for {sources} overlay sources on {workers} workers");

    let results: Vec<Result<CoreStats, GraphError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let scratch = &scratch;
                scope.spawn(move || worker_loop(store, graph, scratch, worker, interrupt))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(GraphError::Store(StoreError::Backend(
                        "core worker panicked".to_owned(),
                    )))
                })
            })
            .collect()
    });
    let mut stats = CoreStats::default();
    for result in results {
        stats.absorb(result?);
    }

    let used_nodes: HashSet<String, RandomState> = store
        .smembers(&scratch.used_nodes)?
        .into_iter()
        .collect();
    if used_nodes.is_empty() {
        scratch.cleanup(store)?;
        return Err(GraphError::EmptyCore);
    }
    let used_hops: HashSet<String, RandomState> = store
        .smembers(&scratch.used_hops)?
        .into_iter()
        .collect();

    let mut core = graph.subgraph(&used_nodes);
    let extraneous: Vec<(String, String)> = core
        .edges()
        .filter(|(a, b, _)| !used_hops.contains(&keys::pair_member(a, b)))
        .map(|(a, b, _)| (a.to_owned(), b.to_owned()))
        .collect();
    info!(
        "kept {} vertices, removing {} extraneous edges",
        used_nodes.len(),
        extraneous.len()
    );
    for (a, b) in &extraneous {
        core.remove_edge(a, b);
    }

    collapse_same_asn(&mut core);

    scratch.cleanup(store)?;
    Ok((core, stats))
}

/// Final in-memory pass: collapse degree-2 pops whose ASN matches either
/// neighbor's, summing the two representative latencies.
fn collapse_same_asn(graph: &mut TopoGraph) {
    let mut pass = 0usize;
    loop {
        pass += 1;
        let mut exempt: HashSet<String, RandomState> = HashSet::default();
        let mut to_collapse: Vec<String> = Vec::new();
        for vertex in graph.vertices().iter() {
            if vertex.kind != NodeKind::Pop {
                continue;
            }
            let neighbors: Vec<&str> = graph.neighbors(&vertex.id).map(|(n, _)| n).collect();
            if neighbors.len() != 2 {
                continue;
            }
            let asn = vertex.asn.as_deref();
            if asn.is_none() {
                continue;
            }
            let matches = neighbors.iter().any(|n| {
                graph.vertex(n).and_then(|v| v.asn.as_deref()) == asn
            });
            if !matches {
                continue;
            }
            if exempt.contains(&vertex.id) || neighbors.iter().any(|n| exempt.contains(*n)) {
                continue;
            }
            exempt.insert(vertex.id.clone());
            exempt.extend(neighbors.iter().map(|n| (*n).to_owned()));
            to_collapse.push(vertex.id.clone());
        }
        if to_collapse.is_empty() {
            break;
        }
        debug!("collapse pass {pass}: {} nodes", to_collapse.len());
        for node in to_collapse {
            let neighbors: Vec<(String, f64)> = graph
                .neighbors(&node)
                .map(|(n, l)| (n.to_owned(), l.representative()))
                .collect();
            if let [(n1, l1), (n2, l2)] = neighbors.as_slice() {
                graph.add_edge(n1, n2, Latency::Scalar(l1 + l2));
                graph.remove_node(&node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vertex::{EdgeLink, Vertex, VertexList};
    use pretty_assertions::assert_eq;
    use store::MemStore;

    fn overlay_vertex(id: &str, kind: NodeKind, asn: &str) -> Vertex {
        Vertex::new(id, kind).with_asn(asn)
    }

    /// a(100) - b(200) - c(300) chain plus a detour a - d(400) - c.
    fn valley_graph() -> TopoGraph {
        let mut vertices = VertexList::new();
        vertices.add(overlay_vertex("a", NodeKind::Client, "100")).unwrap();
        vertices.add(overlay_vertex("b", NodeKind::Pop, "200")).unwrap();
        vertices.add(overlay_vertex("c", NodeKind::Dest, "300")).unwrap();
        vertices.add(overlay_vertex("d", NodeKind::Pop, "400")).unwrap();
        TopoGraph::new(
            vertices,
            vec![
                EdgeLink::new("a", "b", Latency::Scalar(1.0)),
                EdgeLink::new("b", "c", Latency::Scalar(1.0)),
                EdgeLink::new("a", "d", Latency::Scalar(5.0)),
                EdgeLink::new("d", "c", Latency::Scalar(5.0)),
            ],
        )
    }

    fn load_peering(s: &MemStore, rels: &[(&str, &str, i32)]) {
        for (a, b, rel) in rels {
            s.hset(&keys::peering(a), b, &rel.to_string()).unwrap();
        }
        s.set(keys::PEERING_LOADED, "true").unwrap();
    }

    #[test]
    fn up_after_down_is_rejected() {
        // S6: 100 is provider of 200 (down), 200 is customer of 300 (up)
        let s = MemStore::new();
        load_peering(&s, &[("100", "200", 1), ("200", "300", -1)]);
        let g = valley_graph();
        let peering = PeeringDb::new(&s);
        let path = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(check_valley_free(&peering, &g, &path).unwrap(), None);
    }

    #[test]
    fn down_only_paths_pass() {
        let s = MemStore::new();
        load_peering(&s, &[("100", "200", 1), ("200", "300", 1)]);
        let g = valley_graph();
        let peering = PeeringDb::new(&s);
        let path = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(
            check_valley_free(&peering, &g, &path).unwrap(),
            Some((0, 2))
        );
    }

    #[test]
    fn missing_relationships_count_but_do_not_invalidate() {
        let s = MemStore::new();
        load_peering(&s, &[("100", "200", 1)]);
        let g = valley_graph();
        let peering = PeeringDb::new(&s);
        let path = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(
            check_valley_free(&peering, &g, &path).unwrap(),
            Some((1, 2))
        );
    }

    #[test]
    fn without_peering_data_everything_passes() {
        let s = MemStore::new();
        let g = valley_graph();
        let peering = PeeringDb::new(&s);
        let path = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(
            check_valley_free(&peering, &g, &path).unwrap(),
            Some((0, 1))
        );
    }

    #[test]
    fn rebuild_takes_the_valley_free_detour() {
        // S6: the direct a-b-c path goes up after down; a-d-c is peer-peer
        let s = MemStore::new();
        load_peering(
            &s,
            &[
                ("100", "200", 1),
                ("200", "300", -1),
                ("100", "400", 2),
                ("400", "300", 2),
            ],
        );
        let g = valley_graph();
        let peering = PeeringDb::new(&s);
        let (path, errct) = valley_free_path(&peering, &g, "a", "c")
            .unwrap()
            .unwrap();
        assert_eq!(path, vec!["a", "d", "c"]);
        assert_eq!(errct, 0);
    }

    #[test]
    fn rebuild_fails_when_no_detour_exists() {
        let s = MemStore::new();
        load_peering(
            &s,
            &[
                ("100", "200", 1),
                ("200", "300", -1),
                ("100", "400", 1),
                ("400", "300", -1),
            ],
        );
        let g = valley_graph();
        let peering = PeeringDb::new(&s);
        assert_eq!(
            valley_free_path(&peering, &g, "a", "c").unwrap(),
            Err(ValleyFreeError)
        );
    }

    #[test]
    fn compute_core_keeps_shortest_path_edges_only() {
        let s = MemStore::new();
        // no peering data: plain shortest paths
        let g = valley_graph();
        let (core, stats) = compute_core(&s, &g, &CoreOptions::with_workers(2), None).unwrap();
        assert_eq!(stats.sources, 2); // client a and dest c
        // the cheap a-b-c path is kept; the d detour is trimmed away
        assert!(core.vertex("b").is_some());
        assert!(core.vertex("d").is_none());
        assert!(core.edge("a", "b").is_some());
        assert!(core.edge("b", "c").is_some());
        // scratch keys are cleaned up
        assert!(s.keys_with_prefix("core:").unwrap().is_empty());
    }

    #[test]
    fn compute_core_reroutes_valley_violations() {
        let s = MemStore::new();
        load_peering(
            &s,
            &[
                ("100", "200", 1),
                ("200", "300", -1),
                ("100", "400", 2),
                ("400", "300", 2),
            ],
        );
        let g = valley_graph();
        let (core, stats) = compute_core(&s, &g, &CoreOptions::with_workers(1), None).unwrap();
        assert!(stats.rebuilt_paths >= 1);
        // the rebuilt a-d-c path keeps d in the core
        assert!(core.vertex("d").is_some());
        assert!(core.edge("a", "d").is_some());
        assert!(core.edge("d", "c").is_some());
    }

    #[test]
    fn empty_overlay_set_is_an_error() {
        let s = MemStore::new();
        let mut vertices = VertexList::new();
        vertices.add(Vertex::new("x", NodeKind::Pop)).unwrap();
        let g = TopoGraph::new(vertices, Vec::new());
        assert!(matches!(
            compute_core(&s, &g, &CoreOptions::default(), None),
            Err(GraphError::EmptyCore)
        ));
    }

    #[test]
    fn same_asn_chain_collapses_with_summed_latency() {
        let mut vertices = VertexList::new();
        vertices.add(overlay_vertex("r", NodeKind::Relay, "100")).unwrap();
        vertices.add(overlay_vertex("p1", NodeKind::Pop, "100")).unwrap();
        vertices.add(overlay_vertex("p2", NodeKind::Pop, "100")).unwrap();
        vertices.add(overlay_vertex("q", NodeKind::Dest, "300")).unwrap();
        let mut g = TopoGraph::new(
            vertices,
            vec![
                EdgeLink::new("r", "p1", Latency::Scalar(1.0)),
                EdgeLink::new("p1", "p2", Latency::Scalar(2.0)),
                EdgeLink::new("p2", "q", Latency::Scalar(3.0)),
            ],
        );
        collapse_same_asn(&mut g);
        // p1 and p2 collapse away one at a time
        assert!(g.vertex("p1").is_none());
        assert!(g.vertex("p2").is_none());
        let latency = g.edge("r", "q").expect("collapsed edge");
        assert_eq!(latency.representative(), 6.0);
    }
}
