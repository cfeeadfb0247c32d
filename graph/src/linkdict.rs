// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-memory PoP adjacency with degree-1 trimming and latency-aware
//! degree-2 collapsing.
//!
//! The adjacency is built by walking every interlink key through a rotating
//! list in the store ([`store::Store::rotate_live`]), so a crashed build
//! resumes where it stopped instead of rescanning.

use std::collections::{BTreeSet, HashMap, HashSet};

use ahash::RandomState;
use store::{Batch, Store, keys};
use tracing::{debug, info, warn};

use crate::GraphError;
use crate::util::decile_transform;

/// Read every delay sample behind a link bag: each bag member is a
/// canonical `"<lo>|<hi>"` IP pair whose samples live under the pair key.
pub(crate) fn link_delays(store: &dyn Store, bag_key: &str) -> Result<Vec<f64>, GraphError> {
    let mut delays = Vec::new();
    for member in store.smembers(bag_key)? {
        let Some((ip1, ip2)) = keys::split_pair_member(&member) else {
            warn!("malformed link member '{member}' in {bag_key}");
            continue;
        };
        for sample in store.smembers(&keys::pair(ip1, ip2))? {
            if let Ok(delay) = sample.parse::<f64>() {
                delays.push(delay);
            }
        }
    }
    Ok(delays)
}

/// Decile summary of one side of a potential collapse: live samples first,
/// previously collapsed deciles as fallback.
fn side_deciles(store: &dyn Store, a: u64, b: u64) -> Result<Option<[f64; 10]>, GraphError> {
    let bag_key = keys::interlink(a, b);
    let delays = link_delays(store, &bag_key)?;
    if let Ok(deciles) = decile_transform(&delays) {
        return Ok(Some(deciles));
    }
    let stored = store.get(&keys::collapsed(&bag_key))?;
    Ok(stored.as_deref().and_then(parse_deciles))
}

fn parse_deciles(s: &str) -> Option<[f64; 10]> {
    let values: Vec<f64> = s
        .split(',')
        .map(|v| v.trim().parse().ok())
        .collect::<Option<_>>()?;
    if values.len() != 10 {
        return None;
    }
    let mut d = [0.0; 10];
    d.copy_from_slice(&values);
    Some(d)
}

fn join_deciles(d: &[f64; 10]) -> String {
    d.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// PoP-level adjacency map.
#[derive(Clone, Debug, Default)]
pub struct LinkDict {
    adj: HashMap<u64, BTreeSet<u64>, RandomState>,
}

impl LinkDict {
    /// Build the adjacency from the store's interlink keys.
    ///
    /// Endpoints whose PoP has the literal ASN `"None"` are left out of the
    /// graph entirely.
    pub fn load(store: &dyn Store) -> Result<Self, GraphError> {
        if !store.exists(keys::INTERLINK_KEYS)? {
            info!("building interlink meta key");
            let links = store.keys_with_prefix(keys::INTERLINK_PREFIX)?;
            let mut batch = Batch::new();
            for (i, link) in links.iter().enumerate() {
                batch.lpush(keys::INTERLINK_KEYS, link);
                if (i + 1) % 100 == 0 {
                    store.apply(std::mem::take(&mut batch))?;
                    debug!("pushed {}/{} links to meta key", i + 1, links.len());
                }
            }
            store.apply(batch)?;
        }

        let mut dict = LinkDict::default();
        let total = store.llen(keys::INTERLINK_KEYS)?;
        for i in 0..total {
            let Some(link) = store.rotate_live(keys::INTERLINK_KEYS)? else {
                continue;
            };
            if i % 1000 == 0 {
                debug!("loaded {i}/{total} links");
            }
            let Some((pop1, pop2)) = keys::interlink_pops(&link) else {
                warn!("skipping malformed interlink key '{link}'");
                continue;
            };
            if store.get(&keys::pop::asn(pop1))?.as_deref() == Some("None")
                || store.get(&keys::pop::asn(pop2))?.as_deref() == Some("None")
            {
                continue;
            }
            dict.insert_edge(pop1, pop2);
        }
        info!("link dictionary holds {} pops", dict.len());
        Ok(dict)
    }

    fn insert_edge(&mut self, a: u64, b: u64) {
        self.adj.entry(a).or_default().insert(b);
        self.adj.entry(b).or_default().insert(a);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adj.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adj.is_empty()
    }

    #[must_use]
    pub fn contains(&self, pop: u64) -> bool {
        self.adj.contains_key(&pop)
    }

    #[must_use]
    pub fn degree(&self, pop: u64) -> usize {
        self.adj.get(&pop).map_or(0, BTreeSet::len)
    }

    pub fn pops(&self) -> impl Iterator<Item = u64> + '_ {
        self.adj.keys().copied()
    }

    #[must_use]
    pub fn neighbors(&self, pop: u64) -> Option<&BTreeSet<u64>> {
        self.adj.get(&pop)
    }

    /// Every unordered edge once, smaller id first.
    pub fn edges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.adj
            .iter()
            .flat_map(|(&a, ns)| ns.iter().filter(move |&&b| a < b).map(move |&b| (a, b)))
    }

    /// The pop with the highest degree, if any.
    #[must_use]
    pub fn max_degree_pop(&self) -> Option<u64> {
        self.adj
            .iter()
            .max_by_key(|(pop, ns)| (ns.len(), std::cmp::Reverse(**pop)))
            .map(|(pop, _)| *pop)
    }

    /// Remove every non-protected pop with fewer than two neighbors, and
    /// cascade to neighbors that become isolated, until a full pass removes
    /// nothing. Returns the number of pops removed.
    pub fn trim_leaves(&mut self, protected: &HashSet<u64, RandomState>) -> usize {
        let mut removed_total = 0usize;
        let mut pass = 0usize;
        loop {
            pass += 1;
            let mut removed_this_pass = 0usize;
            let pops: Vec<u64> = self.adj.keys().copied().collect();
            for pop in pops {
                if !self.adj.contains_key(&pop) {
                    continue; // cascaded away earlier in this pass
                }
                if self.degree(pop) >= 2 || protected.contains(&pop) {
                    continue;
                }
                let neighbors = self.adj.remove(&pop).unwrap_or_default();
                removed_this_pass += 1;
                for n in neighbors {
                    if let Some(ns) = self.adj.get_mut(&n) {
                        ns.remove(&pop);
                        if ns.is_empty() && !protected.contains(&n) {
                            self.adj.remove(&n);
                            removed_this_pass += 1;
                        }
                    }
                }
            }
            removed_total += removed_this_pass;
            debug!("trim pass {pass}: removed {removed_this_pass}");
            if removed_this_pass == 0 {
                break;
            }
        }
        info!("trimmed {removed_total} degree-1 pops");
        removed_total
    }

    /// Collapse degree-2 chains `A - N - B` where all three pops share an
    /// ASN and `N`'s countries are covered by both sides. The replacement
    /// edge's latency distribution is the decile summary of the
    /// cartesian-sum of the two sides, persisted under `graph:collapsed:`.
    /// Returns the number of collapses.
    pub fn collapse_degree_two(
        &mut self,
        store: &dyn Store,
        protected: &HashSet<u64, RandomState>,
    ) -> Result<usize, GraphError> {
        // stale deciles from an earlier run would shadow live data
        let mut batch = Batch::new();
        for key in store.keys_with_prefix(keys::COLLAPSED_PREFIX)? {
            batch.del(&key);
        }
        store.apply(batch)?;

        let mut collapsed_total = 0usize;
        let mut pass = 0usize;
        loop {
            pass += 1;
            let candidates: Vec<u64> = self
                .adj
                .iter()
                .filter(|(pop, ns)| ns.len() == 2 && !protected.contains(*pop))
                .map(|(pop, _)| *pop)
                .collect();

            let mut collapsed_this_pass: HashSet<u64, RandomState> = HashSet::default();
            let mut count_this_pass = 0usize;

            for node in candidates {
                // adjacency may have changed under us within this pass
                let Some(ns) = self.adj.get(&node) else {
                    continue;
                };
                if ns.len() != 2 {
                    continue;
                }
                let mut it = ns.iter();
                let (side1, side2) = (*it.next().unwrap_or(&0), *it.next().unwrap_or(&0));
                if collapsed_this_pass.contains(&node)
                    || collapsed_this_pass.contains(&side1)
                    || collapsed_this_pass.contains(&side2)
                {
                    continue;
                }

                if !self.collapsible(store, node, side1, side2)? {
                    continue;
                }

                let Some(d1) = side_deciles(store, node, side1)? else {
                    warn!("no delay data for {node} <-> {side1}, not collapsing");
                    continue;
                };
                let Some(d2) = side_deciles(store, node, side2)? else {
                    warn!("no delay data for {node} <-> {side2}, not collapsing");
                    continue;
                };
                let combined: Vec<f64> = d1
                    .iter()
                    .flat_map(|s1| d2.iter().map(move |s2| s1 + s2))
                    .collect();
                let deciles = decile_transform(&combined)
                    .unwrap_or_else(|_| unreachable!("cartesian sum of deciles is non-empty"));
                store.set(
                    &keys::collapsed(&keys::interlink(side1, side2)),
                    &join_deciles(&deciles),
                )?;

                debug!("collapsed {side1} <-> {node} <-> {side2}");
                self.adj.remove(&node);
                if let Some(s) = self.adj.get_mut(&side1) {
                    s.remove(&node);
                    s.insert(side2);
                }
                if let Some(s) = self.adj.get_mut(&side2) {
                    s.remove(&node);
                    s.insert(side1);
                }
                collapsed_this_pass.extend([node, side1, side2]);
                count_this_pass += 1;
            }

            collapsed_total += count_this_pass;
            debug!("collapse pass {pass}: {count_this_pass} collapsed");
            if count_this_pass == 0 {
                break;
            }
        }
        info!("collapsed {collapsed_total} degree-2 pops");
        Ok(collapsed_total)
    }

    /// `A - N - B` collapses when all three share one ASN and
    /// `countries(A) ⊇ countries(N) ⊆ countries(B)`.
    fn collapsible(
        &self,
        store: &dyn Store,
        node: u64,
        side1: u64,
        side2: u64,
    ) -> Result<bool, GraphError> {
        let asn_n = store.get(&keys::pop::asn(node))?;
        let asn_1 = store.get(&keys::pop::asn(side1))?;
        let asn_2 = store.get(&keys::pop::asn(side2))?;
        let same_asn = match (&asn_n, &asn_1, &asn_2) {
            (Some(n), Some(a), Some(b)) => n == a && n == b,
            _ => false,
        };
        if !same_asn {
            return Ok(false);
        }
        let cc_n: BTreeSet<String> = store.smembers(&keys::pop::countries(node))?.into_iter().collect();
        let cc_1: BTreeSet<String> = store.smembers(&keys::pop::countries(side1))?.into_iter().collect();
        let cc_2: BTreeSet<String> = store.smembers(&keys::pop::countries(side2))?.into_iter().collect();
        Ok(cc_n.is_subset(&cc_1) && cc_n.is_subset(&cc_2))
    }
}
