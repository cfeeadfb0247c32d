// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Consolidates deferred PoP joins.
//!
//! The joiner is the single writer for PoP membership: it holds the
//! `popjoin` mutex for its whole run. Queued joins are first reduced
//! (chains `A -> B -> C` become `A -> C`, duplicates dropped), then each
//! reduced join merges the source PoP into the target in one pipelined
//! batch, preserving the neighbor/interlink invariants.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::RandomState;
use store::{Batch, Store, StoreError, StoreMutex, keys};
use tracing::{debug, info, warn};

use crate::POPJOIN_MUTEX;

/// Backend-error retries per join before it is parked back on the queue.
const JOIN_RETRY_BUDGET: usize = 3;

#[derive(thiserror::Error, Debug)]
pub enum JoinError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The terminal of a join chain is not a live PoP. Invariant violation.
    #[error("pop {0} is not in the poplist")]
    NoSuchPop(u64),
    /// A neighbor entry without a backing interlink bag. Invariant violation.
    #[error("interlink '{0}' is empty")]
    EmptyInterlink(String),
    #[error("unassigned link failures pending; run assign_pops --process_failed first")]
    FailuresPending,
    #[error("malformed pop id '{0}'")]
    BadPopId(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JoinStats {
    pub requested: usize,
    pub reduced: usize,
    pub joined: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Transitive reduction of the raw join list.
///
/// Joins are `(to, from)`. A map of already-decided merges is threaded
/// through so `(B, A)` followed by `(C, B)` re-emits as `(C, A)`:
/// each source PoP is physically merged at most once, directly into its
/// final target. First-seen order is preserved and duplicates are dropped.
#[must_use]
pub fn reduce_joins(raw: &[(u64, u64)]) -> Vec<(u64, u64)> {
    fn follow(jm: &mut HashMap<u64, u64, RandomState>, node: u64) -> u64 {
        let mut target = node;
        let mut seen = Vec::new();
        while let Some(&next) = jm.get(&target) {
            seen.push(target);
            target = next;
        }
        // path compression
        for n in seen {
            jm.insert(n, target);
        }
        target
    }

    let mut jm: HashMap<u64, u64, RandomState> = HashMap::default();
    for &(to, from) in raw {
        let from_root = follow(&mut jm, from);
        let to_root = follow(&mut jm, to);
        if from_root != to_root {
            jm.insert(from_root, to_root);
        }
    }

    let mut seen = std::collections::HashSet::with_hasher(RandomState::default());
    let mut reduced = Vec::new();
    for &(to, from) in raw {
        let join = (follow(&mut jm, to), from);
        if seen.insert(join) {
            reduced.push(join);
        }
    }
    reduced
}

pub struct PopJoiner<'a> {
    store: &'a dyn Store,
    interrupt: Option<&'a AtomicBool>,
}

impl<'a> PopJoiner<'a> {
    #[must_use]
    pub fn new(store: &'a dyn Store) -> Self {
        Self {
            store,
            interrupt: None,
        }
    }

    /// Abort between joins once `flag` becomes true.
    #[must_use]
    pub fn with_interrupt(mut self, flag: &'a AtomicBool) -> Self {
        self.interrupt = Some(flag);
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt.is_some_and(|f| f.load(Ordering::Relaxed))
    }

    /// Drain the join queue. Refuses to start while link failures are
    /// pending, since those could still produce joins.
    pub fn run(&self) -> Result<JoinStats, JoinError> {
        if self.store.llen(keys::UNASSIGNED_FAILS)? > 0 {
            return Err(JoinError::FailuresPending);
        }

        let mutex = StoreMutex::new(self.store, POPJOIN_MUTEX);
        let guard = mutex.acquire()?;

        let raw: Vec<(u64, u64)> = self
            .store
            .lrange(keys::POPJOINS, 0, -1)?
            .iter()
            .filter_map(|entry| {
                let parsed = entry
                    .split_once('|')
                    .and_then(|(to, from)| Some((to.parse().ok()?, from.parse().ok()?)));
                if parsed.is_none() {
                    warn!("dropping malformed join entry '{entry}'");
                }
                parsed
            })
            .collect();

        let reduced = reduce_joins(&raw);
        let mut stats = JoinStats {
            requested: raw.len(),
            reduced: reduced.len(),
            ..JoinStats::default()
        };
        info!("joining {} pop pairs ({} requested)", reduced.len(), raw.len());

        let mut work: std::collections::VecDeque<(u64, u64, usize)> =
            reduced.into_iter().map(|(to, from)| (to, from, 0)).collect();
        let mut parked: Vec<(u64, u64)> = Vec::new();

        while let Some((to, from, attempts)) = work.pop_front() {
            if self.interrupted() {
                parked.push((to, from));
                parked.extend(work.iter().map(|&(t, f, _)| (t, f)));
                break;
            }
            self.store
                .sadd(keys::POPJOINS_INPROCESS, &format!("{to}|{from}"))?;
            match self.join_pops(to, from) {
                Ok(Some((target, source))) => {
                    debug!("joined {source} into {target}");
                    stats.joined += 1;
                }
                Ok(None) => {
                    debug!("skipped join ({to}, {from})");
                    stats.skipped += 1;
                }
                Err(JoinError::Store(StoreError::Backend(e))) => {
                    warn!("backend error joining ({to}, {from}): {e}");
                    stats.errors += 1;
                    if attempts + 1 < JOIN_RETRY_BUDGET {
                        work.push_back((to, from, attempts + 1));
                    } else {
                        parked.push((to, from));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // The queue and the transient join-chain keys have served their
        // purpose; anything parked goes back for a later run.
        self.store.del(keys::POPJOINS)?;
        self.store.del(keys::POPJOINS_INPROCESS)?;
        for (to, from) in &parked {
            self.store.rpush(keys::POPJOINS, &format!("{to}|{from}"))?;
        }
        for key in self.store.keys_with_prefix("pop:")? {
            if key.ends_with(keys::pop::JOINED_SUFFIX) {
                self.store.del(&key)?;
            }
        }

        guard.release()?;
        info!(
            "joined {} pops ({} skipped, {} errors)",
            stats.joined, stats.skipped, stats.errors
        );
        Ok(stats)
    }

    /// Merge `old` into `new`. Returns the `(target, source)` actually
    /// merged, or `None` when nothing needed doing.
    fn join_pops(&self, new: u64, old: u64) -> Result<Option<(u64, u64)>, JoinError> {
        if new == old {
            return Ok(None);
        }
        // A previous join may have merged the target away; follow the chain.
        let new = if self.store.sismember(keys::POPLIST, &new.to_string())? {
            new
        } else {
            self.descend_target_chain(new)?
        };
        if new == old {
            return Ok(None);
        }
        if self.store.exists(&keys::pop::joined(old))?
            || !self.store.sismember(keys::POPLIST, &old.to_string())?
        {
            return Ok(None);
        }

        let members = self.store.smembers(&keys::pop::members(old))?;
        let old_asn = self.store.get(&keys::pop::asn(old))?;
        let neighbors: Vec<u64> = self
            .store
            .smembers(&keys::pop::neighbors(old))?
            .iter()
            .map(|n| parse_pop(n))
            .collect::<Result<_, _>>()?;

        let mut batch = Batch::new();
        for x in neighbors {
            let bag_key = keys::interlink(x, old);
            let bag = self.store.smembers(&bag_key)?;
            if x == new {
                // an inter link between the two merging pops becomes intra
                batch.sadd_all(&keys::intralink(new), bag);
            } else {
                if bag.is_empty() {
                    return Err(JoinError::EmptyInterlink(bag_key));
                }
                batch
                    .sadd_all(&keys::interlink(x, new), bag)
                    .sadd(&keys::pop::neighbors(x), &new.to_string())
                    .sadd(&keys::pop::neighbors(new), &x.to_string());
            }
            batch
                .del(&bag_key)
                .srem(&keys::pop::neighbors(x), &old.to_string());
        }

        batch.sadd_all(
            &keys::intralink(new),
            self.store.smembers(&keys::intralink(old))?,
        );
        batch.sadd_all(
            &keys::pop::countries(new),
            self.store.smembers(&keys::pop::countries(old))?,
        );

        let new_str = new.to_string();
        for member in &members {
            batch
                .hset(&keys::ip(member), "pop", &new_str)
                .smove(&keys::pop::members(old), &keys::pop::members(new), member);
        }

        batch
            .del(&keys::pop::members(old))
            .del(&keys::pop::countries(old))
            .del(&keys::pop::neighbors(old))
            .del(&keys::intralink(old));
        if let Some(asn) = &old_asn {
            batch.srem(&keys::asn_pops(asn), &old.to_string());
        }
        batch
            .srem(keys::POPLIST, &old.to_string())
            .del(&keys::pop::asn(old));

        batch
            .set(&keys::pop::joined(old), &new_str)
            .rpush(keys::JOIN_HISTORY, &format!("{old} => {new}"));

        self.store.apply(batch)?;
        Ok(Some((new, old)))
    }

    /// Union-find `find` with path compression over the materialized
    /// `joined` pointers. Fails if the terminal is not a live PoP.
    fn descend_target_chain(&self, target: u64) -> Result<u64, JoinError> {
        let mut bottom = target;
        let mut visited = Vec::new();
        while let Some(next) = self.store.get(&keys::pop::joined(bottom))? {
            visited.push(bottom);
            bottom = parse_pop(&next)?;
        }
        if !self.store.sismember(keys::POPLIST, &bottom.to_string())? {
            return Err(JoinError::NoSuchPop(bottom));
        }
        let mut batch = Batch::new();
        for node in visited {
            if node != bottom {
                batch.set(&keys::pop::joined(node), &bottom.to_string());
            }
        }
        if !batch.is_empty() {
            self.store.apply(batch)?;
        }
        Ok(bottom)
    }
}

fn parse_pop(s: &str) -> Result<u64, JoinError> {
    s.parse().map_err(|_| JoinError::BadPopId(s.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use store::MemStore;
    use trace::{LinkIngest, TableAsnLookup};

    use crate::{AssignOptions, PopAssigner};

    #[test]
    fn reduce_collapses_chains() {
        // A <- B, then B <- C must become A <- B, A <- C
        let raw = vec![(1, 2), (2, 3)];
        assert_eq!(reduce_joins(&raw), vec![(1, 2), (1, 3)]);
    }

    #[test]
    fn reduce_drops_duplicates_and_collapses_cycles() {
        // duplicates disappear; a reversed join degenerates to a self-join,
        // which the joiner skips
        let raw = vec![(1, 2), (1, 2), (2, 1), (3, 4), (4, 3)];
        assert_eq!(reduce_joins(&raw), vec![(1, 2), (1, 1), (3, 4), (3, 3)]);
    }

    #[test]
    fn reduce_preserves_first_seen_order() {
        let raw = vec![(5, 6), (1, 2), (2, 3), (5, 7)];
        assert_eq!(reduce_joins(&raw), vec![(5, 6), (1, 2), (1, 3), (5, 7)]);
    }

    fn seed_two_pops(s: &MemStore) {
        // pop 1 = {9.0.0.5, 9.0.1.5}, pop 2 = {9.0.2.5}, pop 3 = {8.0.0.1},
        // with 2 -- 3 connected, and a queued join (1, 2)
        let mut lookup = TableAsnLookup::new();
        lookup.insert("9.0.0.5", "100", Some("US"));
        lookup.insert("9.0.1.5", "100", Some("US"));
        lookup.insert("9.0.2.5", "100", Some("DE"));
        lookup.insert("8.0.0.1", "200", Some("FR"));
        let ingest = LinkIngest::new(s, &lookup);
        let mk = |a: &str, b: &str, d: f64| trace::LinkPair {
            prev: a.to_string(),
            next: b.to_string(),
            delay_ms: d,
        };
        let assigner = PopAssigner::new(s, &lookup);
        ingest.ingest(&[mk("9.0.0.5", "9.0.1.5", 1.0)]).unwrap();
        assigner.run(&AssignOptions::default()).unwrap();
        ingest.ingest(&[mk("9.0.2.5", "8.0.0.1", 3.0)]).unwrap();
        assigner.run(&AssignOptions::default()).unwrap();
        ingest.ingest(&[mk("9.0.0.5", "9.0.2.5", 0.2)]).unwrap();
        assigner.run(&AssignOptions::default()).unwrap();
    }

    #[test]
    fn join_merges_members_links_and_countries() {
        let s = MemStore::new();
        seed_two_pops(&s);
        // the cross link gave 8.0.0.1 pop 2 and 9.0.2.5 pop 3; the queued
        // join is (1, 3)
        assert_eq!(s.lrange(keys::POPJOINS, 0, -1).unwrap(), vec!["1|3"]);

        let stats = PopJoiner::new(&s).run().unwrap();
        assert_eq!(stats.joined, 1);

        // single live pop 1 plus the cross-AS pop 2
        assert_eq!(s.smembers(keys::POPLIST).unwrap(), vec!["1", "2"]);
        assert_eq!(
            s.smembers(&keys::pop::members(1)).unwrap(),
            vec!["9.0.0.5", "9.0.1.5", "9.0.2.5"]
        );
        // every member record points at pop 1 (invariant 2)
        for ip in s.smembers(&keys::pop::members(1)).unwrap() {
            assert_eq!(s.hget(&keys::ip(&ip), "pop").unwrap(), Some("1".to_string()));
        }
        // pop 3's neighbor relation moved to pop 1 symmetrically (invariant 3)
        assert_eq!(s.smembers(&keys::pop::neighbors(1)).unwrap(), vec!["2"]);
        assert_eq!(s.smembers(&keys::pop::neighbors(2)).unwrap(), vec!["1"]);
        assert_eq!(s.scard(&keys::interlink(1, 2)).unwrap(), 1);
        assert!(!s.exists(&keys::interlink(2, 3)).unwrap());
        // countries were unioned
        assert_eq!(
            s.smembers(&keys::pop::countries(1)).unwrap(),
            vec!["DE", "US"]
        );
        // old pop is gone: no members, neighbors, asn, not in any set
        assert!(!s.exists(&keys::pop::members(3)).unwrap());
        assert!(!s.exists(&keys::pop::neighbors(3)).unwrap());
        assert!(!s.exists(&keys::pop::asn(3)).unwrap());
        assert!(!s.sismember(&keys::asn_pops("100"), "3").unwrap());
        // joined pointers are cleared after the drain (union-find keys are
        // transient), but history remains
        assert!(!s.exists(&keys::pop::joined(3)).unwrap());
        assert_eq!(s.lrange(keys::JOIN_HISTORY, 0, -1).unwrap(), vec!["3 => 1"]);
        // queue is gone
        assert_eq!(s.llen(keys::POPJOINS).unwrap(), 0);
    }

    #[test]
    fn empty_queue_is_a_noop() {
        let s = MemStore::new();
        seed_two_pops(&s);
        PopJoiner::new(&s).run().unwrap();
        let before = s.smembers(keys::POPLIST).unwrap();
        let stats = PopJoiner::new(&s).run().unwrap();
        assert_eq!(stats.requested, 0);
        assert_eq!(stats.joined, 0);
        assert_eq!(s.smembers(keys::POPLIST).unwrap(), before);
    }

    #[test]
    fn pending_failures_block_joining() {
        let s = MemStore::new();
        s.rpush(keys::UNASSIGNED_FAILS, "ip:links:1.1.1.1:2.2.2.2")
            .unwrap();
        assert!(matches!(
            PopJoiner::new(&s).run(),
            Err(JoinError::FailuresPending)
        ));
    }

    #[test]
    fn chained_targets_are_descended() {
        let s = MemStore::new();
        // live pop 1; pop 2 was merged into 1; a join (2, 3) arrives where
        // pop 3 is still live
        s.sadd(keys::POPLIST, "1").unwrap();
        s.sadd(keys::POPLIST, "3").unwrap();
        s.set(&keys::pop::joined(2), "1").unwrap();
        s.sadd(&keys::pop::members(3), "9.0.0.9").unwrap();
        s.hset(&keys::ip("9.0.0.9"), "pop", "3").unwrap();
        s.set(&keys::pop::asn(3), "100").unwrap();
        s.sadd(&keys::asn_pops("100"), "3").unwrap();
        s.rpush(keys::POPJOINS, "2|3").unwrap();

        let stats = PopJoiner::new(&s).run().unwrap();
        assert_eq!(stats.joined, 1);
        assert_eq!(s.smembers(keys::POPLIST).unwrap(), vec!["1"]);
        assert_eq!(s.smembers(&keys::pop::members(1)).unwrap(), vec!["9.0.0.9"]);
        assert_eq!(s.hget(&keys::ip("9.0.0.9"), "pop").unwrap(), Some("1".to_string()));
    }
}
