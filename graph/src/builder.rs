// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Assembles the full overlay-attached topology from the store: link
//! dictionary, trim, collapse, overlay attachment, PoP vertices, and the
//! PoP-to-PoP edges with their latency distributions.

use std::path::PathBuf;

use store::{Store, keys};
use tracing::{debug, info, warn};

use crate::GraphError;
use crate::attach::{AttachStats, DEFAULT_DESTINATIONS, Overlay, RelayDescriptor, relay_pops};
use crate::linkdict::{LinkDict, link_delays};
use crate::topo::TopoGraph;
use crate::util::decile_transform;
use crate::vertex::{EdgeLink, Latency, NodeKind, Vertex};

#[derive(Clone, Debug)]
pub struct BuildOptions {
    pub num_clients: Option<usize>,
    pub client_data: Option<PathBuf>,
    pub client_data_delimiter: u8,
    pub num_dests: Option<usize>,
    /// Override for the embedded destination list.
    pub destinations: Option<String>,
    pub relays: Vec<RelayDescriptor>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            num_clients: None,
            client_data: None,
            client_data_delimiter: b'|',
            num_dests: None,
            destinations: None,
            relays: Vec::new(),
        }
    }
}

/// Build the trimmed, collapsed, overlay-attached topology.
pub fn load_topology(
    store: &dyn Store,
    opts: &BuildOptions,
) -> Result<(TopoGraph, AttachStats), GraphError> {
    let mut linkdict = LinkDict::load(store)?;

    let mut overlay = Overlay::new();
    if let (Some(count), Some(path)) = (opts.num_clients, &opts.client_data) {
        info!("attaching clients from {}", path.display());
        let file = std::fs::File::open(path)?;
        overlay.attach_clients(store, file, opts.client_data_delimiter, count)?;
    }
    if let Some(count) = opts.num_dests {
        info!("attaching destinations");
        let list = opts.destinations.as_deref().unwrap_or(DEFAULT_DESTINATIONS);
        overlay.attach_destinations(store, list, count)?;
    }

    let mut protected = overlay.protected.clone();
    protected.extend(relay_pops(&opts.relays));

    linkdict.trim_leaves(&protected);
    linkdict.collapse_degree_two(store, &protected)?;
    if let Some(hub) = linkdict.max_degree_pop() {
        debug!("highest-degree pop after reduction: {hub}");
    }

    // the surviving pops become vertices
    let mut pops_added = 0usize;
    for pop in linkdict.pops().collect::<Vec<_>>() {
        let id = pop.to_string();
        if overlay.vertices.contains(&id) {
            continue;
        }
        let mut vertex = Vertex::new(id, NodeKind::Pop);
        if let Some(asn) = store.get(&keys::pop::asn(pop))? {
            vertex.asn = Some(asn);
        }
        vertex.countries = store
            .smembers(&keys::pop::countries(pop))?
            .into_iter()
            .collect();
        overlay.vertices.add(vertex)?;
        pops_added += 1;
    }
    info!("added {pops_added} pops");

    overlay.attach_relays(store, &opts.relays)?;

    // pop-to-pop edges: decile summary of live samples, stored collapsed
    // deciles as fallback
    let mut links = 0usize;
    for (a, b) in linkdict.edges().collect::<Vec<_>>() {
        let bag_key = keys::interlink(a, b);
        let delays = link_delays(store, &bag_key)?;
        let latency = match decile_transform(&delays) {
            Ok(deciles) => Latency::Deciles(deciles),
            Err(_) => {
                match store
                    .get(&keys::collapsed(&bag_key))?
                    .and_then(|raw| Latency::parse(&raw))
                {
                    Some(latency) => latency,
                    None => {
                        warn!("no latency data for {bag_key}, dropping edge");
                        continue;
                    }
                }
            }
        };
        overlay
            .edges
            .push(EdgeLink::new(a.to_string(), b.to_string(), latency));
        links += 1;
    }
    info!("processed {links} pop links");

    let stats = overlay.stats;
    let graph = TopoGraph::new(overlay.vertices, overlay.edges);
    info!(
        "topology has {} vertices and {} edges",
        graph.node_count(),
        graph.edge_count()
    );
    Ok((graph, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use store::MemStore;

    /// Store state equivalent to a small assigned corpus:
    ///
    /// ```text
    ///   1 -- 2 -- 3        pops, ASN 100, 2 collapsible
    ///   1 -- 4              pop 4 is a dangling leaf, ASN 200
    /// ```
    fn seed(s: &MemStore) {
        for (id, asn) in [(1, "100"), (2, "100"), (3, "100"), (4, "200")] {
            s.sadd(keys::POPLIST, &id.to_string()).unwrap();
            s.set(&keys::pop::asn(id), asn).unwrap();
            s.sadd(&keys::asn_pops(asn), &id.to_string()).unwrap();
            s.sadd(&keys::pop::countries(id), "US").unwrap();
        }
        let mut link = |a: u64, b: u64, ips: (&str, &str), d: f64| {
            s.sadd(&keys::interlink(a, b), &keys::pair_member(ips.0, ips.1))
                .unwrap();
            s.sadd(&keys::pop::neighbors(a), &b.to_string()).unwrap();
            s.sadd(&keys::pop::neighbors(b), &a.to_string()).unwrap();
            s.sadd(&keys::pair(ips.0, ips.1), &d.to_string()).unwrap();
        };
        link(1, 2, ("9.0.0.1", "9.0.1.1"), 1.0);
        link(2, 3, ("9.0.2.1", "9.0.3.1"), 2.0);
        link(1, 4, ("9.0.0.1", "8.0.0.1"), 3.0);
        // members so find_pop_for_asn and destinations work
        for (pop, ip) in [(1, "9.0.0.1"), (2, "9.0.2.1"), (3, "9.0.3.1"), (4, "8.0.0.1")] {
            s.sadd(&keys::pop::members(pop), ip).unwrap();
            s.hset(&keys::ip(ip), "pop", &pop.to_string()).unwrap();
        }
        // intralink samples for pop 3 so its attachments get real deciles
        s.sadd(&keys::intralink(3), &keys::pair_member("9.0.3.1", "9.0.3.2"))
            .unwrap();
        s.sadd(&keys::pair("9.0.3.1", "9.0.3.2"), "0.5").unwrap();
    }

    #[test]
    fn bare_topology_trims_to_nothing() {
        let s = MemStore::new();
        seed(&s);
        // no overlay: the whole line graph is degree-1 chains
        let (graph, _) = load_topology(&s, &BuildOptions::default()).unwrap();
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn protected_endpoints_survive_and_chains_collapse() {
        let s = MemStore::new();
        seed(&s);
        let opts = BuildOptions {
            num_dests: Some(2),
            destinations: Some("one.example 9.0.0.1\nthree.example 9.0.3.1\n".to_string()),
            ..BuildOptions::default()
        };
        let (graph, stats) = load_topology(&s, &opts).unwrap();
        assert_eq!(stats.dests_attached, 2);
        // pop 4 trims away; pop 2 collapses between 1 and 3
        assert!(graph.vertex("4").is_none());
        assert!(graph.vertex("2").is_none());
        assert!(graph.vertex("1").is_some());
        assert!(graph.vertex("3").is_some());
        // the collapsed edge carries the summed decile distribution
        let latency = graph.edge("1", "3").expect("collapsed edge");
        assert_eq!(latency.representative(), 3.0);
        // destination vertices hang off their pops
        assert!(graph.edge("dest_9_0_0_1", "1").is_some());
        assert!(graph.edge("dest_9_0_3_1", "3").is_some());
    }

    #[test]
    fn relays_ride_on_live_pops() {
        let s = MemStore::new();
        seed(&s);
        let relays = vec![
            RelayDescriptor {
                relay_ip: "5.5.5.5".to_string(),
                pop: 3,
                asn: "100".to_string(),
                extra: Default::default(),
            },
            RelayDescriptor {
                relay_ip: "6.6.6.6".to_string(),
                pop: 99,
                asn: "100".to_string(),
                extra: Default::default(),
            },
        ];
        let opts = BuildOptions {
            num_dests: Some(1),
            destinations: Some("one.example 9.0.0.1\n".to_string()),
            relays,
            ..BuildOptions::default()
        };
        let (graph, stats) = load_topology(&s, &opts).unwrap();
        assert_eq!(stats.relays_attached, 1);
        assert_eq!(stats.unattachable_relays, 1);
        assert!(graph.vertex("5.5.5.5").is_some());
        assert!(graph.edge("5.5.5.5", "3").is_some());
    }
}
