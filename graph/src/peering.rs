// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! AS peering relationship lookups.
//!
//! Relationships live in the store as `as:<asn>:peering` hashes mapping a
//! peer ASN to `1` (provider of), `-1` (customer of), or `2`/`-2` (peer).
//! Loading that data is outside this crate; the sentinel key says whether
//! anyone did.

use store::{Store, StoreResult, keys};

pub struct PeeringDb<'a> {
    store: &'a dyn Store,
}

impl<'a> PeeringDb<'a> {
    #[must_use]
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// Whether peering data has been loaded at all. When false, valley-free
    /// checking is vacuous.
    pub fn loaded(&self) -> StoreResult<bool> {
        Ok(self.store.get(keys::PEERING_LOADED)?.as_deref() == Some("true"))
    }

    /// Relationship of `a` towards `b`. Falls back to the negated reverse
    /// entry; `None` means neither side knows the other.
    pub fn relationship(&self, a: &str, b: &str) -> StoreResult<Option<i32>> {
        if let Some(rel) = self.store.hget(&keys::peering(a), b)? {
            return Ok(rel.parse().ok());
        }
        if let Some(rel) = self.store.hget(&keys::peering(b), a)? {
            // opposite perspective: swap -1 and 1 (negating a peer
            // relationship is harmless)
            return Ok(rel.parse::<i32>().ok().map(|r| -r));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::MemStore;

    #[test]
    fn relationship_falls_back_to_reverse() {
        let s = MemStore::new();
        s.hset(&keys::peering("100"), "200", "1").unwrap();
        let db = PeeringDb::new(&s);
        assert_eq!(db.relationship("100", "200").unwrap(), Some(1));
        assert_eq!(db.relationship("200", "100").unwrap(), Some(-1));
        assert_eq!(db.relationship("100", "300").unwrap(), None);
    }

    #[test]
    fn loaded_sentinel() {
        let s = MemStore::new();
        let db = PeeringDb::new(&s);
        assert!(!db.loaded().unwrap());
        s.set(keys::PEERING_LOADED, "true").unwrap();
        assert!(db.loaded().unwrap());
    }
}
