// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Loader for IP attribute files.
//!
//! Two layouts are accepted:
//!
//! ```text
//! <ip> <key> <value> <key2> <value2> ...
//! ```
//!
//! or a leading header row naming the columns:
//!
//! ```text
//! # <key> <key2> ...
//! <ip> <value> <value2> ...
//! ```
//!
//! The `pop` attribute is reserved for the assigner and is never loaded
//! from a file.

use std::io::BufRead;

use store::{Store, StoreError, keys};
use tracing::{info, warn};

#[derive(thiserror::Error, Debug)]
pub enum AttrError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Load IP attributes from `reader` into the store. Returns the number of
/// IP records written.
pub fn load_ip_attributes(store: &dyn Store, reader: impl BufRead) -> Result<usize, AttrError> {
    let mut header: Option<Vec<String>> = None;
    let mut loaded = 0usize;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if lineno == 0 && fields[0] == "#" {
            header = Some(fields[1..].iter().map(|s| (*s).to_string()).collect());
            continue;
        }

        let ip = fields[0];
        let values = &fields[1..];
        let pairs: Vec<(&str, &str)> = match &header {
            Some(columns) => {
                if values.len() != columns.len() {
                    warn!("line {}: {} values for {} columns, skipping", lineno + 1, values.len(), columns.len());
                    continue;
                }
                columns
                    .iter()
                    .map(String::as_str)
                    .zip(values.iter().copied())
                    .collect()
            }
            None => {
                if values.len() % 2 != 0 {
                    warn!("line {}: odd key/value count, skipping", lineno + 1);
                    continue;
                }
                values
                    .chunks_exact(2)
                    .map(|chunk| (chunk[0], chunk[1]))
                    .collect()
            }
        };

        let ip_key = keys::ip(ip);
        for (attr, value) in pairs {
            if attr == "pop" {
                continue;
            }
            store.hset(&ip_key, attr, value)?;
        }
        store.sadd(keys::IPLIST, ip)?;
        loaded += 1;
        if loaded % 10_000 == 0 {
            info!("set attributes for {loaded} IPs");
        }
    }
    Ok(loaded)
}
