// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Backend-agnostic coordination store for the popmap pipeline.
//!
//! Every stage of the pipeline communicates through a key/value/set/list
//! store addressed by the structured key scheme in [`keys`]. The [`Store`]
//! trait is the contract: plain reads and writes, batched writes via
//! [`Batch`], optimistic transactions via [`Store::watch`]/[`Store::exec`],
//! an atomic counter, and the two scripted read-modify-write operations the
//! pipeline needs ([`Store::push_link_sample`] and [`Store::rotate_live`]).
//!
//! [`MemStore`] is the bundled backend: an in-process map with per-key
//! versioning, optionally snapshotted to a JSON file so consecutive CLI
//! invocations share state. A networked backend only needs to implement
//! [`Store`]; callers never see anything else.

#![deny(clippy::all)]

pub mod keys;
mod memory;
mod mutex;

pub use memory::MemStore;
pub use mutex::{MutexGuard, StoreMutex};

/// Error type for store operations.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// A watched key changed between `watch` and `exec`. Retryable.
    #[error("watched key '{0}' changed since watch")]
    WatchConflict(String),
    /// The backend failed to serve the request (I/O, connection, protocol).
    #[error("backend error: {0}")]
    Backend(String),
    /// The key exists but holds a different kind of value.
    #[error("key '{key}' does not hold a {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A single queued write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Set { key: String, value: String },
    SetNx { key: String, value: String },
    Del { key: String },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
    SAdd { key: String, members: Vec<String> },
    SRem { key: String, member: String },
    SMove { src: String, dst: String, member: String },
    LPush { key: String, value: String },
    RPush { key: String, value: String },
}

/// An ordered batch of writes.
///
/// Applied with [`Store::apply`] (throughput batching, no atomicity claim)
/// or [`Store::exec`] (all-or-nothing under a watch token).
#[derive(Clone, Debug, Default)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Consume the batch. Backends use this to apply the queued writes.
    #[must_use]
    pub fn into_ops(self) -> Vec<Op> {
        self.ops
    }

    pub fn set(&mut self, key: &str, value: &str) -> &mut Self {
        self.ops.push(Op::Set {
            key: key.to_owned(),
            value: value.to_owned(),
        });
        self
    }

    pub fn set_nx(&mut self, key: &str, value: &str) -> &mut Self {
        self.ops.push(Op::SetNx {
            key: key.to_owned(),
            value: value.to_owned(),
        });
        self
    }

    pub fn del(&mut self, key: &str) -> &mut Self {
        self.ops.push(Op::Del {
            key: key.to_owned(),
        });
        self
    }

    pub fn hset(&mut self, key: &str, field: &str, value: &str) -> &mut Self {
        self.ops.push(Op::HSet {
            key: key.to_owned(),
            field: field.to_owned(),
            value: value.to_owned(),
        });
        self
    }

    pub fn hdel(&mut self, key: &str, field: &str) -> &mut Self {
        self.ops.push(Op::HDel {
            key: key.to_owned(),
            field: field.to_owned(),
        });
        self
    }

    pub fn sadd(&mut self, key: &str, member: &str) -> &mut Self {
        self.ops.push(Op::SAdd {
            key: key.to_owned(),
            members: vec![member.to_owned()],
        });
        self
    }

    /// Add several members to a set in one op. A no-op when `members` is empty.
    pub fn sadd_all<I, T>(&mut self, key: &str, members: I) -> &mut Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let members: Vec<String> = members.into_iter().map(Into::into).collect();
        if !members.is_empty() {
            self.ops.push(Op::SAdd {
                key: key.to_owned(),
                members,
            });
        }
        self
    }

    pub fn srem(&mut self, key: &str, member: &str) -> &mut Self {
        self.ops.push(Op::SRem {
            key: key.to_owned(),
            member: member.to_owned(),
        });
        self
    }

    pub fn smove(&mut self, src: &str, dst: &str, member: &str) -> &mut Self {
        self.ops.push(Op::SMove {
            src: src.to_owned(),
            dst: dst.to_owned(),
            member: member.to_owned(),
        });
        self
    }

    pub fn lpush(&mut self, key: &str, value: &str) -> &mut Self {
        self.ops.push(Op::LPush {
            key: key.to_owned(),
            value: value.to_owned(),
        });
        self
    }

    pub fn rpush(&mut self, key: &str, value: &str) -> &mut Self {
        self.ops.push(Op::RPush {
            key: key.to_owned(),
            value: value.to_owned(),
        });
        self
    }
}

/// Snapshot of watched-key versions, captured by [`Store::watch`] and
/// validated by [`Store::exec`].
#[derive(Clone, Debug)]
pub struct WatchToken {
    pub(crate) versions: Vec<(String, u64)>,
}

/// The pipeline's coordination fabric.
///
/// All operations take `&self`; implementations are internally synchronized
/// and safe to share across worker threads.
pub trait Store: Send + Sync {
    // plain values
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    /// Set `key` only if absent. Returns whether the write happened.
    fn set_nx(&self, key: &str, value: &str) -> StoreResult<bool>;
    fn del(&self, key: &str) -> StoreResult<bool>;
    fn exists(&self, key: &str) -> StoreResult<bool>;
    /// All keys starting with `prefix`, in unspecified order.
    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
    /// Atomically increment the integer at `key` (missing counts as 0).
    fn incr(&self, key: &str) -> StoreResult<i64>;

    // hashes
    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;
    fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;

    // sets
    fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;
    fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;
    fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;
    fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;
    fn scard(&self, key: &str) -> StoreResult<usize>;
    /// Remove and return one member, or `None` when the set is empty.
    fn spop(&self, key: &str) -> StoreResult<Option<String>>;

    // lists
    fn lpush(&self, key: &str, value: &str) -> StoreResult<()>;
    fn rpush(&self, key: &str, value: &str) -> StoreResult<()>;
    fn rpop(&self, key: &str) -> StoreResult<Option<String>>;
    /// Redis-style range: `start`/`stop` are inclusive, negatives count from
    /// the tail, `lrange(k, 0, -1)` is the whole list.
    fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;
    fn llen(&self, key: &str) -> StoreResult<usize>;

    // batches and optimistic transactions
    /// Apply a batch of writes. Batched for throughput only; no atomicity
    /// guarantee without a watch token.
    fn apply(&self, batch: Batch) -> StoreResult<()>;
    /// Capture the current versions of `watched` for a later [`Store::exec`].
    fn watch(&self, watched: &[&str]) -> StoreResult<WatchToken>;
    /// Apply `batch` atomically iff none of the watched keys changed since
    /// the token was captured. Fails with [`StoreError::WatchConflict`] and
    /// leaves the store untouched otherwise.
    fn exec(&self, token: &WatchToken, batch: Batch) -> StoreResult<()>;

    // scripted operations
    /// Atomic push-if-absent used by link ingest: if `pair_key` does not
    /// exist yet, append it to the `queue` list; then add `sample` to the
    /// set at `pair_key`. Returns whether the key was newly enqueued.
    fn push_link_sample(&self, pair_key: &str, queue: &str, sample: f64) -> StoreResult<bool>;
    /// Rotate the tail of the list at `list_key` to its head and return it,
    /// provided the tail names a key that still exists; a tail naming a dead
    /// key is dropped from the list and `None` is returned.
    fn rotate_live(&self, list_key: &str) -> StoreResult<Option<String>>;

    /// Persist a snapshot if this backend has somewhere to persist to.
    fn flush(&self) -> StoreResult<()>;
}
