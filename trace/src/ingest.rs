// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Feeds parsed link observations into the store: one sample set per
//! unordered IP pair, a queue entry the first time a pair is seen, and an
//! ASN on every IP record.

use store::{Store, StoreError, keys};
use tracing::debug;

use crate::asn::AsnLookup;
use crate::parser::LinkPair;

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Observations recorded.
    pub samples: usize,
    /// Pairs enqueued for assignment for the first time.
    pub new_links: usize,
}

/// Writes link observations into the store.
pub struct LinkIngest<'a> {
    store: &'a dyn Store,
    lookup: &'a dyn AsnLookup,
}

impl<'a> LinkIngest<'a> {
    #[must_use]
    pub fn new(store: &'a dyn Store, lookup: &'a dyn AsnLookup) -> Self {
        Self { store, lookup }
    }

    /// Record every pair of one parsed trace.
    ///
    /// Guarantees afterwards: each pair key in the unassigned queue exists
    /// as a non-empty sample set, both endpoints are in `iplist`, and both
    /// IP records carry an `asn` (`"N/A"` when the lookup has nothing).
    pub fn ingest(&self, pairs: &[LinkPair]) -> Result<IngestStats, IngestError> {
        let mut stats = IngestStats::default();
        for pair in pairs {
            if pair.prev == pair.next {
                debug!("self link on {} dropped", pair.prev);
                continue;
            }
            let key = keys::pair(&pair.prev, &pair.next);
            if self
                .store
                .push_link_sample(&key, keys::UNASSIGNED, pair.delay_ms)?
            {
                stats.new_links += 1;
            }
            stats.samples += 1;
            self.note_ip(&pair.prev)?;
            self.note_ip(&pair.next)?;
        }
        Ok(stats)
    }

    fn note_ip(&self, ip: &str) -> Result<(), IngestError> {
        self.store.sadd(keys::IPLIST, ip)?;
        let ip_key = keys::ip(ip);
        if self.store.hget(&ip_key, "asn")?.is_none() {
            let asn = self
                .lookup
                .org_by_addr(ip)
                .unwrap_or_else(|| "N/A".to_string());
            self.store.hset(&ip_key, "asn", &asn)?;
        }
        Ok(())
    }
}
