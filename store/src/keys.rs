// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The structured key scheme shared by every pipeline stage.
//!
//! These strings are part of the external contract when one store is shared
//! across runs, so the builders here are the only place they are spelled out.

/// Set of every IP seen in any trace.
pub const IPLIST: &str = "iplist";
/// Queue of pair keys awaiting PoP assignment.
pub const UNASSIGNED: &str = "delayed_job:unassigned_links";
/// Pair keys whose assignment hit a backend error.
pub const UNASSIGNED_FAILS: &str = "delayed_job:unassigned_link_fails";
/// Pair keys that failed again during `--process_failed`.
pub const UNASSIGNED_FAILS2: &str = "delayed_job:unassigned_link_fails2";
/// Mirror of pair keys that have been assigned.
pub const PROCESSED: &str = "delayed_job:processed_links";
/// Queue of deferred PoP joins, entries `"<to>|<from>"`.
pub const POPJOINS: &str = "delayed_job:popjoins";
/// Memo set suppressing duplicate join enqueues.
pub const POPJOINS_KNOWN: &str = "delayed_job:popjoins:known";
/// Joins taken off the queue by a running joiner.
pub const POPJOINS_INPROCESS: &str = "delayed_job:popjoins:inprocess";
/// Monotonic PoP id counter.
pub const POP_COUNTER: &str = "popincr";
/// Set of live PoP ids.
pub const POPLIST: &str = "poplist";
/// Append-only `"<old> => <new>"` merge log.
pub const JOIN_HISTORY: &str = "join:history";
/// Sentinel set to `"true"` once AS peering data has been loaded.
pub const PEERING_LOADED: &str = "as:meta:peering_data_loaded";
/// Rotating list of interlink keys driving the resumable LinkDict build.
pub const INTERLINK_KEYS: &str = "graph:interlink_keys";
/// Prefix shared by all interlink keys.
pub const INTERLINK_PREFIX: &str = "links:inter:";
/// Prefix for persisted collapsed-edge decile vectors.
pub const COLLAPSED_PREFIX: &str = "graph:collapsed:";

/// Hash of attributes (`asn`, `pop`, ...) for one IP.
#[must_use]
pub fn ip(ip: &str) -> String {
    format!("ip:{ip}")
}

/// Delay-sample set for an unordered IP pair, lower address first.
#[must_use]
pub fn pair(ip1: &str, ip2: &str) -> String {
    let (lo, hi) = if ip1 < ip2 { (ip1, ip2) } else { (ip2, ip1) };
    format!("ip:links:{lo}:{hi}")
}

/// Canonical `"<lo>|<hi>"` member string for an unordered IP pair.
#[must_use]
pub fn pair_member(ip1: &str, ip2: &str) -> String {
    let (lo, hi) = if ip1 < ip2 { (ip1, ip2) } else { (ip2, ip1) };
    format!("{lo}|{hi}")
}

/// Split a `"<lo>|<hi>"` member string back into its endpoints.
#[must_use]
pub fn split_pair_member(member: &str) -> Option<(&str, &str)> {
    member.split_once('|')
}

/// Recover the two IPs from an `ip:links:<lo>:<hi>` key.
#[must_use]
pub fn pair_ips(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix("ip:links:")?;
    rest.split_once(':')
}

/// Keys holding the state of one PoP.
pub mod pop {
    /// Set of member IPs.
    #[must_use]
    pub fn members(id: u64) -> String {
        format!("pop:{id}:members")
    }

    /// Set of neighboring PoP ids.
    #[must_use]
    pub fn neighbors(id: u64) -> String {
        format!("pop:{id}:neighbors")
    }

    /// The PoP's single ASN.
    #[must_use]
    pub fn asn(id: u64) -> String {
        format!("pop:{id}:asn")
    }

    /// Set of ISO country codes.
    #[must_use]
    pub fn countries(id: u64) -> String {
        format!("pop:{id}:cc")
    }

    /// Forwarding pointer set when this PoP was merged away.
    #[must_use]
    pub fn joined(id: u64) -> String {
        format!("pop:{id}:joined")
    }

    /// Prefix matching every `joined` pointer.
    pub const JOINED_SUFFIX: &str = ":joined";
}

/// Set of PoP ids belonging to an ASN.
#[must_use]
pub fn asn_pops(asn: &str) -> String {
    format!("asn:{asn}:pops")
}

/// Hash of peer ASN to relationship for one ASN.
#[must_use]
pub fn peering(asn: &str) -> String {
    format!("as:{asn}:peering")
}

/// Interlink bag between two distinct PoPs, smaller id first.
#[must_use]
pub fn interlink(a: u64, b: u64) -> String {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    format!("links:inter:{lo}:{hi}")
}

/// Intralink bag of one PoP.
#[must_use]
pub fn intralink(p: u64) -> String {
    format!("links:intra:{p}")
}

/// Recover the two PoP ids from a `links:inter:<lo>:<hi>` key.
#[must_use]
pub fn interlink_pops(key: &str) -> Option<(u64, u64)> {
    let rest = key.strip_prefix(INTERLINK_PREFIX)?;
    let (a, b) = rest.split_once(':')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

/// Persisted decile vector for a collapsed edge, keyed by its interlink key.
#[must_use]
pub fn collapsed(link_key: &str) -> String {
    format!("{COLLAPSED_PREFIX}{link_key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_keys_are_canonical() {
        assert_eq!(pair("10.1.1.2", "10.1.1.1"), "ip:links:10.1.1.1:10.1.1.2");
        assert_eq!(pair("10.1.1.1", "10.1.1.2"), "ip:links:10.1.1.1:10.1.1.2");
        assert_eq!(pair_member("b", "a"), "a|b");
        assert_eq!(split_pair_member("a|b"), Some(("a", "b")));
        assert_eq!(pair_ips("ip:links:1.2.3.4:5.6.7.8"), Some(("1.2.3.4", "5.6.7.8")));
    }

    #[test]
    fn interlink_orders_numerically() {
        // string ordering would put 10 before 9
        assert_eq!(interlink(10, 9), "links:inter:9:10");
        assert_eq!(interlink_pops("links:inter:9:10"), Some((9, 10)));
        assert_eq!(interlink_pops("links:intra:9"), None);
    }
}
