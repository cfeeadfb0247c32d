// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Drains the unassigned-link queue and grows PoPs.
//!
//! Each link is handled under a watch over both IP records, so any number
//! of assigner processes can run against one store: a conflicting write
//! forces a re-read and retry of that link only. Links whose backend
//! operations fail land on a failures queue replayed with
//! `--process_failed`, which runs under the popjoin mutex so no joiner can
//! interleave.

use std::sync::atomic::{AtomicBool, Ordering};

use store::{Batch, Store, StoreError, StoreMutex, keys};
use tracing::{debug, info, warn};

use trace::AsnLookup;

use crate::POPJOIN_MUTEX;

/// Median link delay above which two IPs cannot share a PoP.
pub const CROSS_POP_DELAY_MS: f64 = 2.5;
/// Watch-conflict retries per link before it goes to the failures queue.
const WATCH_RETRY_BUDGET: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum AssignError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// An IP record is missing the mandatory `asn` attribute.
    #[error("IP '{0}' has no ASN")]
    MissingAsn(String),
    #[error("malformed pair key '{0}'")]
    BadPairKey(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AssignStats {
    pub assigned: usize,
    pub dropped: usize,
    pub joins_queued: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub pops_created: usize,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AssignOptions {
    /// Drain the failures queue instead of the main queue, holding the
    /// popjoin mutex for the duration.
    pub process_failed: bool,
    /// Clear all PoP state and re-enqueue every known link first.
    pub reset: bool,
}

/// Numeric median: sort ascending, take index `floor(n/2)`.
#[must_use]
pub fn median(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Some(sorted[sorted.len() / 2])
}

enum LinkOutcome {
    Assigned { pops_created: usize },
    JoinQueued,
    Dropped,
}

pub struct PopAssigner<'a> {
    store: &'a dyn Store,
    lookup: &'a dyn AsnLookup,
    interrupt: Option<&'a AtomicBool>,
}

impl<'a> PopAssigner<'a> {
    #[must_use]
    pub fn new(store: &'a dyn Store, lookup: &'a dyn AsnLookup) -> Self {
        Self {
            store,
            lookup,
            interrupt: None,
        }
    }

    /// Abort between links once `flag` becomes true.
    #[must_use]
    pub fn with_interrupt(mut self, flag: &'a AtomicBool) -> Self {
        self.interrupt = Some(flag);
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt.is_some_and(|f| f.load(Ordering::Relaxed))
    }

    pub fn run(&self, opts: &AssignOptions) -> Result<AssignStats, AssignError> {
        if opts.reset {
            info!("resetting PoP assignments");
            crate::cleanup::reset_assignments(self.store)?;
        }

        let (queue, fail_target) = if opts.process_failed {
            (keys::UNASSIGNED_FAILS, keys::UNASSIGNED_FAILS2)
        } else {
            (keys::UNASSIGNED, keys::UNASSIGNED_FAILS)
        };

        let mutex = StoreMutex::new(self.store, POPJOIN_MUTEX);
        // Replays of failed links must not interleave with a joiner.
        let _guard = if opts.process_failed {
            Some(mutex.acquire()?)
        } else {
            None
        };

        let mut stats = AssignStats::default();
        let mut since_wait = 0usize;
        while !self.interrupted() {
            if !opts.process_failed {
                // coarse-grained courtesy to the joiner
                since_wait += 1;
                if since_wait % 64 == 1 && mutex.is_locked()? {
                    debug!("waiting for popjoin lock");
                    mutex.wait()?;
                }
            }
            let Some(link) = self.store.rpop(queue)? else {
                break;
            };
            self.process_link(&link, fail_target, &mut stats)?;
        }
        info!(
            "assigned {} links ({} dropped, {} joins queued, {} failed, {} pops)",
            stats.assigned, stats.dropped, stats.joins_queued, stats.failed, stats.pops_created
        );
        Ok(stats)
    }

    fn process_link(
        &self,
        link: &str,
        fail_target: &str,
        stats: &mut AssignStats,
    ) -> Result<(), AssignError> {
        let Some((ip1, ip2)) = keys::pair_ips(link) else {
            warn!("dropping malformed pair key '{link}'");
            stats.dropped += 1;
            return Ok(());
        };

        for _attempt in 0..WATCH_RETRY_BUDGET {
            match self.try_link(link, ip1, ip2) {
                Ok(LinkOutcome::Assigned { pops_created }) => {
                    stats.assigned += 1;
                    stats.pops_created += pops_created;
                    self.store.rpush(keys::PROCESSED, link)?;
                    return Ok(());
                }
                Ok(LinkOutcome::JoinQueued) => {
                    stats.joins_queued += 1;
                    self.store.rpush(keys::PROCESSED, link)?;
                    return Ok(());
                }
                Ok(LinkOutcome::Dropped) => {
                    stats.dropped += 1;
                    return Ok(());
                }
                Err(AssignError::Store(StoreError::WatchConflict(key))) => {
                    debug!("watch conflict on {key}, retrying {link}");
                    stats.conflicts += 1;
                }
                Err(AssignError::Store(e)) => {
                    warn!("backend error on {link}: {e}; queued for replay");
                    self.store.rpush(fail_target, link)?;
                    stats.failed += 1;
                    return Ok(());
                }
                Err(e @ (AssignError::MissingAsn(_) | AssignError::BadPairKey(_))) => {
                    warn!("dropping {link}: {e}");
                    stats.dropped += 1;
                    return Ok(());
                }
            }
        }
        warn!("retry budget exhausted for {link}; queued for replay");
        self.store.rpush(fail_target, link)?;
        stats.failed += 1;
        Ok(())
    }

    /// One optimistic attempt at classifying and recording a link.
    fn try_link(&self, link: &str, ip1: &str, ip2: &str) -> Result<LinkOutcome, AssignError> {
        let key1 = keys::ip(ip1);
        let key2 = keys::ip(ip2);
        let token = self.store.watch(&[key1.as_str(), key2.as_str()])?;

        let asn1 = self.store.hget(&key1, "asn")?;
        let asn2 = self.store.hget(&key2, "asn")?;
        let (Some(asn1), Some(asn2)) = (asn1, asn2) else {
            return Err(AssignError::MissingAsn(
                if self.store.hget(&key1, "asn")?.is_none() { ip1 } else { ip2 }.to_owned(),
            ));
        };
        if asn1 == "N/A" || asn2 == "N/A" {
            debug!("dropping {link}: ASN unknown on at least one side");
            return Ok(LinkOutcome::Dropped);
        }

        let pop1 = parse_opt_pop(self.store.hget(&key1, "pop")?.as_deref());
        let pop2 = parse_opt_pop(self.store.hget(&key2, "pop")?.as_deref());

        let samples: Vec<f64> = self
            .store
            .smembers(link)?
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        let Some(median_delay) = median(&samples) else {
            warn!("dropping {link}: no delay samples");
            return Ok(LinkOutcome::Dropped);
        };

        let diff_as = asn1 != asn2;
        let diff_24 = different_24(ip1, ip2);

        let mut batch = Batch::new();
        let outcome = if median_delay > CROSS_POP_DELAY_MS || diff_as || diff_24 {
            self.cross_pop(&mut batch, ip1, ip2, &asn1, &asn2, pop1, pop2)?
        } else {
            self.same_pop(&mut batch, ip1, ip2, &asn1, pop1, pop2)?
        };

        self.store.exec(&token, batch)?;
        Ok(outcome)
    }

    /// The link crosses PoPs: make sure both sides have one, then record the
    /// underlying pair in the interlink bag and the neighbor sets.
    fn cross_pop(
        &self,
        batch: &mut Batch,
        ip1: &str,
        ip2: &str,
        asn1: &str,
        asn2: &str,
        pop1: Option<u64>,
        pop2: Option<u64>,
    ) -> Result<LinkOutcome, AssignError> {
        let mut created = 0usize;
        let pop1 = match pop1 {
            Some(p) => p,
            None => {
                created += 1;
                self.alloc_pop(batch, ip1, asn1)?
            }
        };
        let pop2 = match pop2 {
            Some(p) => p,
            None => {
                created += 1;
                self.alloc_pop(batch, ip2, asn2)?
            }
        };

        let member = keys::pair_member(ip1, ip2);
        if pop1 == pop2 {
            batch.sadd(&keys::intralink(pop1), &member);
        } else {
            batch
                .sadd(&keys::interlink(pop1, pop2), &member)
                .sadd(&keys::pop::neighbors(pop1), &pop2.to_string())
                .sadd(&keys::pop::neighbors(pop2), &pop1.to_string());
        }
        Ok(LinkOutcome::Assigned {
            pops_created: created,
        })
    }

    /// The link stays inside one PoP: assign membership, or defer a merge
    /// when both sides already belong to different PoPs.
    fn same_pop(
        &self,
        batch: &mut Batch,
        ip1: &str,
        ip2: &str,
        asn: &str,
        pop1: Option<u64>,
        pop2: Option<u64>,
    ) -> Result<LinkOutcome, AssignError> {
        let member = keys::pair_member(ip1, ip2);
        match (pop1, pop2) {
            (None, None) => {
                let pop = self.alloc_pop(batch, ip1, asn)?;
                batch
                    .sadd(&keys::pop::members(pop), ip2)
                    .hset(&keys::ip(ip2), "pop", &pop.to_string())
                    .sadd(&keys::intralink(pop), &member);
                Ok(LinkOutcome::Assigned { pops_created: 1 })
            }
            (Some(pop), None) => {
                batch
                    .sadd(&keys::pop::members(pop), ip2)
                    .hset(&keys::ip(ip2), "pop", &pop.to_string())
                    .sadd(&keys::intralink(pop), &member);
                Ok(LinkOutcome::Assigned { pops_created: 0 })
            }
            (None, Some(pop)) => {
                batch
                    .sadd(&keys::pop::members(pop), ip1)
                    .hset(&keys::ip(ip1), "pop", &pop.to_string())
                    .sadd(&keys::intralink(pop), &member);
                Ok(LinkOutcome::Assigned { pops_created: 0 })
            }
            (Some(p), Some(q)) if p == q => {
                batch.sadd(&keys::intralink(p), &member);
                Ok(LinkOutcome::Assigned { pops_created: 0 })
            }
            (Some(p), Some(q)) => {
                let entry = format!("{p}|{q}");
                if self.store.sismember(keys::POPJOINS_KNOWN, &entry)? {
                    debug!("join ({p}, {q}) already queued");
                    return Ok(LinkOutcome::Assigned { pops_created: 0 });
                }
                batch
                    .rpush(keys::POPJOINS, &entry)
                    .sadd(keys::POPJOINS_KNOWN, &entry);
                Ok(LinkOutcome::JoinQueued)
            }
        }
    }

    /// Allocate a fresh PoP seeded with `ip`. The id comes from the atomic
    /// counter; everything else rides in the caller's watched batch.
    fn alloc_pop(&self, batch: &mut Batch, ip: &str, asn: &str) -> Result<u64, AssignError> {
        if asn.is_empty() {
            return Err(AssignError::MissingAsn(ip.to_owned()));
        }
        let id = u64::try_from(self.store.incr(keys::POP_COUNTER)?)
            .map_err(|_| StoreError::Backend("pop counter underflow".to_owned()))?;
        let ids = id.to_string();
        batch
            .sadd(keys::POPLIST, &ids)
            .sadd(&keys::pop::members(id), ip)
            .hset(&keys::ip(ip), "pop", &ids)
            .set(&keys::pop::asn(id), asn)
            .sadd(&keys::asn_pops(asn), &ids);
        if let Some(cc) = self.lookup.country_code_by_addr(ip) {
            batch.sadd(&keys::pop::countries(id), &cc);
        } else {
            debug!("no country code for {ip}");
        }
        Ok(id)
    }
}

fn parse_opt_pop(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.parse().ok())
}

/// The original heuristic compares the fourth octet only.
fn different_24(ip1: &str, ip2: &str) -> bool {
    ip1.split('.').nth(3) != ip2.split('.').nth(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use store::MemStore;
    use trace::{LinkIngest, TableAsnLookup};

    fn lookup_with(entries: &[(&str, &str, &str)]) -> TableAsnLookup {
        let mut lookup = TableAsnLookup::new();
        for (ip, asn, cc) in entries {
            lookup.insert(ip, asn, Some(cc));
        }
        lookup
    }

    fn ingest(store: &MemStore, lookup: &TableAsnLookup, pairs: &[(&str, &str, f64)]) {
        let ingest = LinkIngest::new(store, lookup);
        let pairs: Vec<trace::LinkPair> = pairs
            .iter()
            .map(|(a, b, d)| trace::LinkPair {
                prev: (*a).to_string(),
                next: (*b).to_string(),
                delay_ms: *d,
            })
            .collect();
        ingest.ingest(&pairs).unwrap();
    }

    fn run(store: &MemStore, lookup: &TableAsnLookup) -> AssignStats {
        PopAssigner::new(store, lookup)
            .run(&AssignOptions::default())
            .unwrap()
    }

    #[test]
    fn median_is_floor_half() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(3.0));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn same_pop_link_creates_one_pop() {
        // S1: same ASN, matching last octets, 0.5 ms
        let s = MemStore::new();
        let lookup = lookup_with(&[("9.0.0.1", "100", "US"), ("9.0.1.1", "100", "US")]);
        ingest(&s, &lookup, &[("9.0.0.1", "9.0.1.1", 0.5)]);
        let stats = run(&s, &lookup);
        assert_eq!(stats.assigned, 1);
        assert_eq!(stats.pops_created, 1);

        assert_eq!(s.smembers(keys::POPLIST).unwrap(), vec!["1"]);
        assert_eq!(
            s.smembers(&keys::pop::members(1)).unwrap(),
            vec!["9.0.0.1", "9.0.1.1"]
        );
        assert_eq!(s.get(&keys::pop::asn(1)).unwrap(), Some("100".to_string()));
        assert!(s.smembers(&keys::pop::neighbors(1)).unwrap().is_empty());
        assert_eq!(
            s.smembers(&keys::intralink(1)).unwrap(),
            vec!["9.0.0.1|9.0.1.1"]
        );
        assert_eq!(s.llen(keys::UNASSIGNED).unwrap(), 0);
        assert_eq!(s.llen(keys::POPJOINS).unwrap(), 0);
        // invariant: every member's record points back at the pop
        for ip in s.smembers(&keys::pop::members(1)).unwrap() {
            assert_eq!(s.hget(&keys::ip(&ip), "pop").unwrap(), Some("1".to_string()));
        }
    }

    #[test]
    fn cross_as_link_creates_two_pops() {
        // S2: different ASNs at 3.0 ms
        let s = MemStore::new();
        let lookup = lookup_with(&[("9.0.0.1", "100", "US"), ("8.0.0.1", "200", "DE")]);
        ingest(&s, &lookup, &[("9.0.0.1", "8.0.0.1", 3.0)]);
        let stats = run(&s, &lookup);
        assert_eq!(stats.pops_created, 2);

        assert_eq!(s.smembers(keys::POPLIST).unwrap(), vec!["1", "2"]);
        assert_eq!(s.smembers(&keys::pop::neighbors(1)).unwrap(), vec!["2"]);
        assert_eq!(s.smembers(&keys::pop::neighbors(2)).unwrap(), vec!["1"]);
        assert_eq!(
            s.smembers(&keys::interlink(1, 2)).unwrap(),
            vec!["8.0.0.1|9.0.0.1"]
        );
    }

    #[test]
    fn high_delay_same_as_is_cross_pop() {
        // fourth octets match, ASNs match: only the 9 ms median separates them
        let s = MemStore::new();
        let lookup = lookup_with(&[("9.0.0.1", "100", "US"), ("9.0.1.1", "100", "US")]);
        ingest(&s, &lookup, &[("9.0.0.1", "9.0.1.1", 9.0)]);
        let stats = run(&s, &lookup);
        assert_eq!(stats.pops_created, 2);
        assert_eq!(s.scard(&keys::interlink(1, 2)).unwrap(), 1);
    }

    #[test]
    fn different_24_same_as_is_cross_pop() {
        let s = MemStore::new();
        let lookup = lookup_with(&[("9.0.0.1", "100", "US"), ("9.0.1.2", "100", "US")]);
        ingest(&s, &lookup, &[("9.0.0.1", "9.0.1.2", 0.5)]);
        let stats = run(&s, &lookup);
        // fourth octets differ (1 vs 2), so this is cross-PoP
        assert_eq!(stats.pops_created, 2);
    }

    #[test]
    fn unknown_asn_drops_link() {
        let s = MemStore::new();
        let lookup = lookup_with(&[("9.0.0.1", "100", "US")]);
        ingest(&s, &lookup, &[("9.0.0.1", "9.0.0.2", 0.5)]);
        let stats = run(&s, &lookup);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.assigned, 0);
        assert!(s.smembers(keys::POPLIST).unwrap().is_empty());
    }

    #[test]
    fn conflicting_memberships_queue_a_join() {
        // deferred join: A and C end up in different PoPs before a
        // same-PoP link between them is processed
        let s = MemStore::new();
        let lookup = lookup_with(&[
            ("9.0.0.5", "100", "US"),
            ("9.0.1.5", "100", "US"),
            ("9.0.2.5", "100", "US"),
        ]);
        // (A,B) joins A and B into pop 1
        ingest(&s, &lookup, &[("9.0.0.5", "9.0.1.5", 1.0)]);
        run(&s, &lookup);
        // C gets its own pop via a cross-AS link
        let lookup2 = lookup_with(&[("9.0.2.5", "100", "US"), ("8.0.0.1", "200", "DE")]);
        ingest(&s, &lookup2, &[("9.0.2.5", "8.0.0.1", 3.0)]);
        run(&s, &lookup2);
        // now (A,C) is same-PoP but A is in pop 1 and C in pop 3
        // (the cross link allocated pop 2 for 8.0.0.1 and pop 3 for C)
        ingest(&s, &lookup, &[("9.0.0.5", "9.0.2.5", 0.2)]);
        let stats = run(&s, &lookup);
        assert_eq!(stats.joins_queued, 1);
        assert_eq!(s.lrange(keys::POPJOINS, 0, -1).unwrap(), vec!["1|3"]);
        assert!(s.sismember(keys::POPJOINS_KNOWN, "1|3").unwrap());
        // a requeued link does not enqueue the same join twice
        s.lpush(keys::UNASSIGNED, &keys::pair("9.0.0.5", "9.0.2.5"))
            .unwrap();
        let stats = run(&s, &lookup);
        assert_eq!(stats.joins_queued, 0);
        assert_eq!(s.llen(keys::POPJOINS).unwrap(), 1);
    }

    #[test]
    fn rerun_with_empty_queue_is_a_noop() {
        let s = MemStore::new();
        let lookup = lookup_with(&[("9.0.0.1", "100", "US"), ("9.0.0.2", "100", "US")]);
        ingest(&s, &lookup, &[("9.0.0.1", "9.0.0.2", 0.5)]);
        run(&s, &lookup);
        let before = s.smembers(keys::POPLIST).unwrap();
        let stats = run(&s, &lookup);
        assert_eq!(stats.assigned, 0);
        assert_eq!(stats.pops_created, 0);
        assert_eq!(s.smembers(keys::POPLIST).unwrap(), before);
    }

    #[test]
    fn countries_come_from_the_lookup() {
        let s = MemStore::new();
        let lookup = lookup_with(&[("9.0.0.1", "100", "US"), ("8.0.0.1", "200", "DE")]);
        ingest(&s, &lookup, &[("9.0.0.1", "8.0.0.1", 3.0)]);
        run(&s, &lookup);
        // the pair key orders 8.0.0.1 first, so it seeds pop 1
        assert_eq!(s.smembers(&keys::pop::countries(1)).unwrap(), vec!["DE"]);
        assert_eq!(s.smembers(&keys::pop::countries(2)).unwrap(), vec!["US"]);
    }
}
