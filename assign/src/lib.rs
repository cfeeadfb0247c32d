// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! PoP construction: classify observed links into same-PoP and cross-PoP,
//! grow the PoP multigraph under optimistic concurrency, and consolidate
//! deferred PoP merges under the join mutex.

#![deny(clippy::all)]

mod assigner;
mod cleanup;
mod joiner;

pub use assigner::{AssignError, AssignOptions, AssignStats, PopAssigner, median};
pub use cleanup::{cleanup_graph, cleanup_process, reset_assignments};
pub use joiner::{JoinError, JoinStats, PopJoiner, reduce_joins};

/// Name of the distributed mutex serializing PoP joins.
pub const POPJOIN_MUTEX: &str = "popjoin";
