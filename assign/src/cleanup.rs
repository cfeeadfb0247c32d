// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Removal of PoP-related state from the store. IP attribute data survives
//! unless `ip_links` is requested.

use store::{Batch, Store, StoreError, keys};
use tracing::info;

fn delete_prefix(store: &dyn Store, prefix: &str) -> Result<usize, StoreError> {
    let matched = store.keys_with_prefix(prefix)?;
    let mut batch = Batch::new();
    for key in &matched {
        batch.del(key);
    }
    store.apply(batch)?;
    Ok(matched.len())
}

/// `process cleanup`: drop all PoP and link state; with `ip_links` also
/// drop the raw per-pair sample sets and the work queues.
pub fn cleanup_process(store: &dyn Store, ip_links: bool) -> Result<(), StoreError> {
    info!("removing IP pop data");
    let ips = store.smembers(keys::IPLIST)?;
    let mut batch = Batch::new();
    for ip in &ips {
        batch.hdel(&keys::ip(ip), "pop");
    }
    store.apply(batch)?;

    info!("removing PoP link data");
    let links = delete_prefix(store, "links:")?;
    info!("removed {links} link keys");

    info!("removing pop keys");
    let pops = delete_prefix(store, "pop:")?;
    info!("removed {pops} pop keys");

    info!("removing asn keys");
    let asns = delete_prefix(store, "asn:")?;
    info!("removed {asns} asn keys");

    if ip_links {
        info!("removing ip links");
        let mut batch = Batch::new();
        batch
            .del(keys::UNASSIGNED)
            .del(keys::UNASSIGNED_FAILS)
            .del(keys::UNASSIGNED_FAILS2)
            .del(keys::PROCESSED);
        store.apply(batch)?;
        delete_prefix(store, "ip:links:")?;
    }

    let mut batch = Batch::new();
    batch
        .del(keys::POPLIST)
        .del(keys::JOIN_HISTORY)
        .del(keys::POPJOINS)
        .del(keys::POPJOINS_KNOWN)
        .del(keys::POPJOINS_INPROCESS)
        .del(keys::POP_COUNTER)
        .del("mutex:popjoin:init");
    store.apply(batch)?;
    Ok(())
}

/// `graph cleanup`: drop the graph-stage scratch keys.
pub fn cleanup_graph(store: &dyn Store) -> Result<(), StoreError> {
    let collapsed = delete_prefix(store, keys::COLLAPSED_PREFIX)?;
    store.del(keys::INTERLINK_KEYS)?;
    let scratch = delete_prefix(store, "core:")?;
    info!("removed {collapsed} collapsed keys and {scratch} core scratch keys");
    Ok(())
}

/// `assign_pops --reset`: clear PoP state and re-enqueue every known link
/// for a fresh assignment pass.
pub fn reset_assignments(store: &dyn Store) -> Result<(), StoreError> {
    cleanup_process(store, false)?;
    store.del(keys::UNASSIGNED)?;
    store.del(keys::UNASSIGNED_FAILS)?;
    store.del(keys::UNASSIGNED_FAILS2)?;
    store.del(keys::PROCESSED)?;
    let mut batch = Batch::new();
    let mut requeued = 0usize;
    for key in store.keys_with_prefix("ip:links:")? {
        batch.lpush(keys::UNASSIGNED, &key);
        requeued += 1;
    }
    store.apply(batch)?;
    info!("requeued {requeued} links");
    Ok(())
}
