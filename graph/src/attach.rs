// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Overlay attachment: clients weighted by ASN, destinations from the
//! embedded list, relays from a JSON descriptor file.
//!
//! Every attachment point becomes a protected PoP so the trim passes never
//! disconnect an overlay endpoint.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Read;

use ahash::RandomState;
use serde::Deserialize;
use store::{Store, keys};
use tracing::{debug, info, warn};

use crate::GraphError;
use crate::linkdict::link_delays;
use crate::util::decile_transform;
use crate::vertex::{EdgeLink, Latency, NodeKind, Vertex, VertexList};

/// Built-in `(url, ip)` destination list.
pub const DEFAULT_DESTINATIONS: &str = include_str!("../resources/top_dests.txt");

/// Latency attached when a PoP has no intralink samples.
const DEFAULT_INTRALINK_MS: f64 = 5.0;

/// One relay from the JSON relay list. Unknown fields become vertex
/// attributes in the output graph.
#[derive(Clone, Debug, Deserialize)]
pub struct RelayDescriptor {
    pub relay_ip: String,
    pub pop: u64,
    pub asn: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Parse a JSON array of relay descriptors.
pub fn load_relays(reader: impl Read) -> Result<Vec<RelayDescriptor>, GraphError> {
    serde_json::from_reader(reader).map_err(|e| GraphError::BadRelays(e.to_string()))
}

/// The attachment PoPs a relay list will need, known before any attachment
/// happens so trimming can protect them.
pub fn relay_pops(relays: &[RelayDescriptor]) -> impl Iterator<Item = u64> + '_ {
    relays.iter().map(|relay| relay.pop)
}

/// The representative PoP for an ASN: the one with the most members.
pub fn find_pop_for_asn(store: &dyn Store, asn: &str) -> Result<u64, GraphError> {
    let pops: Vec<u64> = store
        .smembers(&keys::asn_pops(asn))?
        .iter()
        .filter_map(|p| p.parse().ok())
        .collect();
    let mut best: Option<(usize, u64)> = None;
    for pop in pops {
        let size = store.scard(&keys::pop::members(pop))?;
        if best.is_none_or(|b| (size, pop) > b) {
            best = Some((size, pop));
        }
    }
    best.map(|(_, pop)| pop)
        .ok_or_else(|| GraphError::AsnNotKnown(asn.to_owned()))
}

/// Decile latency of a PoP's intralinks; `[5, 5, ...]` when it has none.
/// The second value reports whether the default was used.
fn intralink_latency(store: &dyn Store, pop: u64) -> Result<(Latency, bool), GraphError> {
    let delays = link_delays(store, &keys::intralink(pop))?;
    match decile_transform(&delays) {
        Ok(deciles) => Ok((Latency::Deciles(deciles), false)),
        Err(_) => Ok((Latency::Deciles([DEFAULT_INTRALINK_MS; 10]), true)),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttachStats {
    pub clients_attached: usize,
    pub client_attach_points: usize,
    pub dests_attached: usize,
    pub dest_attach_points: usize,
    pub relays_attached: usize,
    pub unattachable_relays: usize,
    pub relay_latency_defaulted: usize,
}

/// Accumulates overlay vertices and their attachment edges.
#[derive(Debug, Default)]
pub struct Overlay {
    pub vertices: VertexList,
    pub edges: Vec<EdgeLink>,
    /// PoPs hosting an overlay endpoint; exempt from trimming.
    pub protected: HashSet<u64, RandomState>,
    pub stats: AttachStats,
}

impl Overlay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `count` client vertices, split across ASNs proportionally to
    /// the `Number` column of the delimited `data` (which must also carry
    /// an `ASN` column). Each ASN's clients connect to its representative
    /// PoP.
    pub fn attach_clients(
        &mut self,
        store: &dyn Store,
        data: impl Read,
        delimiter: u8,
        count: usize,
    ) -> Result<(), GraphError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .trim(csv::Trim::All)
            .from_reader(data);
        let headers = reader.headers()?.clone();
        let asn_col = headers
            .iter()
            .position(|h| h == "ASN")
            .ok_or(GraphError::MissingColumn("ASN"))?;
        let number_col = headers
            .iter()
            .position(|h| h == "Number")
            .ok_or(GraphError::MissingColumn("Number"))?;

        // first row per ASN wins, input order preserved
        let mut weights: Vec<(String, f64)> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for record in reader.records() {
            let record = record?;
            let (Some(asn), Some(number)) = (record.get(asn_col), record.get(number_col)) else {
                continue;
            };
            let Ok(number) = number.parse::<f64>() else {
                warn!("unparsable Number for ASN {asn}, skipping row");
                continue;
            };
            if seen.insert(asn.to_owned()) {
                weights.push((asn.to_owned(), number));
            }
        }

        let mut attach: Vec<(String, u64, f64)> = Vec::new();
        for (asn, number) in weights {
            match find_pop_for_asn(store, &asn) {
                Ok(pop) => attach.push((asn, pop, number)),
                Err(GraphError::AsnNotKnown(_)) => {
                    debug!("no pops for client ASN {asn}");
                }
                Err(e) => return Err(e),
            }
        }
        if attach.is_empty() {
            warn!("no clients could be attached");
            return Ok(());
        }

        let total: f64 = attach.iter().map(|(_, _, n)| n).sum();
        for (asn, pop, number) in &attach {
            let share = (count as f64 * number / total).round() as usize;
            let (latency, _) = intralink_latency(store, *pop)?;
            for unique in 0..share {
                let id = format!("client_{asn}_{unique}");
                self.vertices
                    .add(Vertex::new(&id, NodeKind::Client).with_asn(asn.clone()))?;
                self.edges
                    .push(EdgeLink::new(id, pop.to_string(), latency.clone()));
                self.stats.clients_attached += 1;
            }
            self.protected.insert(*pop);
        }
        self.stats.client_attach_points = attach.len();
        info!(
            "attached {} clients to {} attachment points",
            self.stats.clients_attached, self.stats.client_attach_points
        );
        Ok(())
    }

    /// Attach up to `count` destination vertices from a `(url, ip)` list,
    /// one line each. IPs without an assigned PoP are skipped.
    pub fn attach_destinations(
        &mut self,
        store: &dyn Store,
        list: &str,
        count: usize,
    ) -> Result<(), GraphError> {
        let mut pops: BTreeSet<u64> = BTreeSet::new();
        for line in list.lines() {
            if self.stats.dests_attached >= count {
                break;
            }
            let mut fields = line.split_whitespace();
            let (Some(url), Some(ip)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Some(pop) = store
                .hget(&keys::ip(ip), "pop")?
                .and_then(|p| p.parse::<u64>().ok())
            else {
                warn!("couldn't attach {url} with ip {ip}: no matching IP");
                continue;
            };
            let id = format!("dest_{}", ip.replace('.', "_"));
            if self.vertices.contains(&id) {
                continue; // same destination twice
            }
            let (latency, _) = intralink_latency(store, pop)?;
            self.vertices
                .add(Vertex::new(&id, NodeKind::Dest).with_url(url))?;
            self.edges
                .push(EdgeLink::new(id, pop.to_string(), latency));
            self.protected.insert(pop);
            pops.insert(pop);
            self.stats.dests_attached += 1;
        }
        self.stats.dest_attach_points = pops.len();
        info!(
            "attached {} dests to {} attachment points",
            self.stats.dests_attached, self.stats.dest_attach_points
        );
        Ok(())
    }

    /// Attach relays to their declared PoPs. Call after the PoP vertices
    /// exist; a relay whose PoP is not a live vertex is counted and
    /// skipped.
    pub fn attach_relays(
        &mut self,
        store: &dyn Store,
        relays: &[RelayDescriptor],
    ) -> Result<(), GraphError> {
        for relay in relays {
            let pop_id = relay.pop.to_string();
            if !self.vertices.contains(&pop_id) {
                warn!(
                    "relay {} attaches to {} which is not in the graph",
                    relay.relay_ip, relay.pop
                );
                self.stats.unattachable_relays += 1;
                continue;
            }
            let (latency, defaulted) = intralink_latency(store, relay.pop)?;
            if defaulted {
                self.stats.relay_latency_defaulted += 1;
            }
            let mut vertex =
                Vertex::new(&relay.relay_ip, NodeKind::Relay).with_asn(relay.asn.clone());
            for (name, value) in &relay.extra {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                vertex.extra.insert(name.clone(), rendered);
            }
            self.vertices.add(vertex)?;
            self.edges
                .push(EdgeLink::new(relay.relay_ip.clone(), pop_id, latency));
            self.stats.relays_attached += 1;
        }
        info!(
            "attached {} relays ({} unattachable, {} defaulted to {DEFAULT_INTRALINK_MS} ms)",
            self.stats.relays_attached,
            self.stats.unattachable_relays,
            self.stats.relay_latency_defaulted
        );
        Ok(())
    }
}
