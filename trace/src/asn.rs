// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! ASN / country lookup boundary.
//!
//! The pipeline never talks to a GeoIP database directly; it sees this
//! trait. [`TableAsnLookup`] is the bundled implementation, fed from a
//! whitespace table of `<ip> <asn> [country]` rows.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use ahash::RandomState;
use tracing::debug;

/// Resolves an address to the organisation (ASN) announcing it and the
/// country it is registered in.
pub trait AsnLookup: Send + Sync {
    fn org_by_addr(&self, ip: &str) -> Option<String>;
    fn country_code_by_addr(&self, ip: &str) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
struct IpMeta {
    asn: Option<String>,
    country: Option<String>,
}

/// Exact-match lookup table.
#[derive(Clone, Debug, Default)]
pub struct TableAsnLookup {
    by_ip: HashMap<String, IpMeta, RandomState>,
}

impl TableAsnLookup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a file of `<ip> <asn> [country]` rows. Lines starting with
    /// `#` and blank lines are ignored.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let mut table = Self::new();
        let reader = BufReader::new(File::open(path.as_ref())?);
        for line in reader.lines() {
            let line = line?;
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [] => {}
                [first, ..] if first.starts_with('#') => {}
                [ip, asn] => table.insert(ip, asn, None),
                [ip, asn, country, ..] => table.insert(ip, asn, Some(country)),
                [ip] => debug!("no attributes for {ip}, skipping"),
            }
        }
        Ok(table)
    }

    pub fn insert(&mut self, ip: &str, asn: &str, country: Option<&str>) {
        self.by_ip.insert(
            ip.to_owned(),
            IpMeta {
                asn: Some(asn.to_owned()),
                country: country.map(str::to_owned),
            },
        );
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_ip.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_ip.is_empty()
    }
}

impl AsnLookup for TableAsnLookup {
    fn org_by_addr(&self, ip: &str) -> Option<String> {
        self.by_ip.get(ip).and_then(|meta| meta.asn.clone())
    }

    fn country_code_by_addr(&self, ip: &str) -> Option<String> {
        self.by_ip.get(ip).and_then(|meta| meta.country.clone())
    }
}
