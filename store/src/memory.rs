// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-process [`Store`] backend with per-key versioning and an optional
//! JSON snapshot file.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use ahash::RandomState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Batch, Op, Store, StoreError, StoreResult, WatchToken};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum Value {
    Str(String),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
    List(VecDeque<String>),
}

fn wrong_type(key: &str, expected: &'static str) -> StoreError {
    StoreError::WrongType {
        key: key.to_owned(),
        expected,
    }
}

#[derive(Default)]
struct Inner {
    data: HashMap<String, Value, RandomState>,
    versions: HashMap<String, u64, RandomState>,
}

impl Inner {
    fn bump(&mut self, key: &str) {
        *self.versions.entry(key.to_owned()).or_insert(0) += 1;
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn hash_mut(&mut self, key: &str) -> StoreResult<&mut BTreeMap<String, String>> {
        match self
            .data
            .entry(key.to_owned())
            .or_insert_with(|| Value::Hash(BTreeMap::new()))
        {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type(key, "hash")),
        }
    }

    fn set_mut(&mut self, key: &str) -> StoreResult<&mut BTreeSet<String>> {
        match self
            .data
            .entry(key.to_owned())
            .or_insert_with(|| Value::Set(BTreeSet::new()))
        {
            Value::Set(s) => Ok(s),
            _ => Err(wrong_type(key, "set")),
        }
    }

    fn list_mut(&mut self, key: &str) -> StoreResult<&mut VecDeque<String>> {
        match self
            .data
            .entry(key.to_owned())
            .or_insert_with(|| Value::List(VecDeque::new()))
        {
            Value::List(l) => Ok(l),
            _ => Err(wrong_type(key, "list")),
        }
    }

    /// Drop a collection entry once its last element is gone, so `exists`
    /// keeps meaning "has content" the way the pipeline expects.
    fn prune(&mut self, key: &str) {
        let empty = match self.data.get(key) {
            Some(Value::Hash(h)) => h.is_empty(),
            Some(Value::Set(s)) => s.is_empty(),
            Some(Value::List(l)) => l.is_empty(),
            _ => false,
        };
        if empty {
            self.data.remove(key);
        }
    }

    fn apply_op(&mut self, op: Op) -> StoreResult<()> {
        match op {
            Op::Set { key, value } => {
                self.data.insert(key.clone(), Value::Str(value));
                self.bump(&key);
            }
            Op::SetNx { key, value } => {
                if !self.data.contains_key(&key) {
                    self.data.insert(key.clone(), Value::Str(value));
                    self.bump(&key);
                }
            }
            Op::Del { key } => {
                if self.data.remove(&key).is_some() {
                    self.bump(&key);
                }
            }
            Op::HSet { key, field, value } => {
                self.hash_mut(&key)?.insert(field, value);
                self.bump(&key);
            }
            Op::HDel { key, field } => {
                let removed = match self.data.get_mut(&key) {
                    Some(Value::Hash(h)) => h.remove(&field).is_some(),
                    _ => false,
                };
                if removed {
                    self.bump(&key);
                    self.prune(&key);
                }
            }
            Op::SAdd { key, members } => {
                let set = self.set_mut(&key)?;
                let mut changed = false;
                for m in members {
                    changed |= set.insert(m);
                }
                if changed {
                    self.bump(&key);
                }
            }
            Op::SRem { key, member } => {
                let removed = match self.data.get_mut(&key) {
                    Some(Value::Set(s)) => s.remove(&member),
                    _ => false,
                };
                if removed {
                    self.bump(&key);
                    self.prune(&key);
                }
            }
            Op::SMove { src, dst, member } => {
                let moved = match self.data.get_mut(&src) {
                    Some(Value::Set(s)) => s.remove(&member),
                    Some(_) => return Err(wrong_type(&src, "set")),
                    None => false,
                };
                if moved {
                    self.bump(&src);
                    self.prune(&src);
                    self.set_mut(&dst)?.insert(member);
                    self.bump(&dst);
                }
            }
            Op::LPush { key, value } => {
                self.list_mut(&key)?.push_front(value);
                self.bump(&key);
            }
            Op::RPush { key, value } => {
                self.list_mut(&key)?.push_back(value);
                self.bump(&key);
            }
        }
        Ok(())
    }
}

/// In-memory [`Store`] with optional file-snapshot persistence.
pub struct MemStore {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// A purely in-memory store, used by tests and one-shot runs.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            path: None,
        }
    }

    /// A store backed by a JSON snapshot at `path`. A missing file starts
    /// empty; [`Store::flush`] writes the snapshot back.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut inner = Inner::default();
        match fs::read_to_string(&path) {
            Ok(raw) => {
                let image: BTreeMap<String, Value> = serde_json::from_str(&raw).map_err(|e| {
                    StoreError::Backend(format!("bad snapshot {}: {e}", path.display()))
                })?;
                debug!("loaded {} keys from {}", image.len(), path.display());
                inner.data.extend(image);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no snapshot at {}, starting empty", path.display());
            }
            Err(e) => return Err(StoreError::Backend(e.to_string())),
        }
        Ok(Self {
            inner: Mutex::new(inner),
            path: Some(path),
        })
    }
}

impl Store for MemStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match self.inner.lock().data.get(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key, "string")),
        }
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.inner.lock().apply_op(Op::Set {
            key: key.to_owned(),
            value: value.to_owned(),
        })
    }

    fn set_nx(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        if inner.data.contains_key(key) {
            return Ok(false);
        }
        inner.apply_op(Op::Set {
            key: key.to_owned(),
            value: value.to_owned(),
        })?;
        Ok(true)
    }

    fn del(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let existed = inner.data.remove(key).is_some();
        if existed {
            inner.bump(key);
        }
        Ok(existed)
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.inner.lock().data.contains_key(key))
    }

    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut inner = self.inner.lock();
        let current: i64 = match inner.data.get(key) {
            None => 0,
            Some(Value::Str(s)) => s
                .parse()
                .map_err(|_| wrong_type(key, "integer string"))?,
            Some(_) => return Err(wrong_type(key, "integer string")),
        };
        let next = current + 1;
        inner.data.insert(key.to_owned(), Value::Str(next.to_string()));
        inner.bump(key);
        Ok(next)
    }

    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        match self.inner.lock().data.get(key) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(h.get(field).cloned()),
            Some(_) => Err(wrong_type(key, "hash")),
        }
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.inner.lock().apply_op(Op::HSet {
            key: key.to_owned(),
            field: field.to_owned(),
            value: value.to_owned(),
        })
    }

    fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let removed = match inner.data.get_mut(key) {
            None => return Ok(false),
            Some(Value::Hash(h)) => h.remove(field).is_some(),
            Some(_) => return Err(wrong_type(key, "hash")),
        };
        if removed {
            inner.bump(key);
            inner.prune(key);
        }
        Ok(removed)
    }

    fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let added = inner.set_mut(key)?.insert(member.to_owned());
        if added {
            inner.bump(key);
        }
        Ok(added)
    }

    fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let removed = match inner.data.get_mut(key) {
            None => return Ok(false),
            Some(Value::Set(s)) => s.remove(member),
            Some(_) => return Err(wrong_type(key, "set")),
        };
        if removed {
            inner.bump(key);
            inner.prune(key);
        }
        Ok(removed)
    }

    fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        match self.inner.lock().data.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Set(s)) => Ok(s.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key, "set")),
        }
    }

    fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        match self.inner.lock().data.get(key) {
            None => Ok(false),
            Some(Value::Set(s)) => Ok(s.contains(member)),
            Some(_) => Err(wrong_type(key, "set")),
        }
    }

    fn scard(&self, key: &str) -> StoreResult<usize> {
        match self.inner.lock().data.get(key) {
            None => Ok(0),
            Some(Value::Set(s)) => Ok(s.len()),
            Some(_) => Err(wrong_type(key, "set")),
        }
    }

    fn spop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.inner.lock();
        let popped = match inner.data.get_mut(key) {
            None => return Ok(None),
            Some(Value::Set(s)) => s.pop_first(),
            Some(_) => return Err(wrong_type(key, "set")),
        };
        if popped.is_some() {
            inner.bump(key);
            inner.prune(key);
        }
        Ok(popped)
    }

    fn lpush(&self, key: &str, value: &str) -> StoreResult<()> {
        self.inner.lock().apply_op(Op::LPush {
            key: key.to_owned(),
            value: value.to_owned(),
        })
    }

    fn rpush(&self, key: &str, value: &str) -> StoreResult<()> {
        self.inner.lock().apply_op(Op::RPush {
            key: key.to_owned(),
            value: value.to_owned(),
        })
    }

    fn rpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.inner.lock();
        let popped = match inner.data.get_mut(key) {
            None => return Ok(None),
            Some(Value::List(l)) => l.pop_back(),
            Some(_) => return Err(wrong_type(key, "list")),
        };
        if popped.is_some() {
            inner.bump(key);
            inner.prune(key);
        }
        Ok(popped)
    }

    fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock();
        let list = match inner.data.get(key) {
            None => return Ok(Vec::new()),
            Some(Value::List(l)) => l,
            Some(_) => return Err(wrong_type(key, "list")),
        };
        let len = list.len() as isize;
        let mut lo = if start < 0 { len + start } else { start };
        let mut hi = if stop < 0 { len + stop } else { stop };
        if lo < 0 {
            lo = 0;
        }
        if hi >= len {
            hi = len - 1;
        }
        if hi < 0 || lo > hi || lo >= len {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(lo as usize)
            .take((hi - lo + 1) as usize)
            .cloned()
            .collect())
    }

    fn llen(&self, key: &str) -> StoreResult<usize> {
        match self.inner.lock().data.get(key) {
            None => Ok(0),
            Some(Value::List(l)) => Ok(l.len()),
            Some(_) => Err(wrong_type(key, "list")),
        }
    }

    fn apply(&self, batch: Batch) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        for op in batch.into_ops() {
            inner.apply_op(op)?;
        }
        Ok(())
    }

    fn watch(&self, watched: &[&str]) -> StoreResult<WatchToken> {
        let inner = self.inner.lock();
        Ok(WatchToken {
            versions: watched
                .iter()
                .map(|k| ((*k).to_owned(), inner.version(k)))
                .collect(),
        })
    }

    fn exec(&self, token: &WatchToken, batch: Batch) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        for (key, version) in &token.versions {
            if inner.version(key) != *version {
                return Err(StoreError::WatchConflict(key.clone()));
            }
        }
        // Snapshot the touched keys so a mid-batch type error rolls back and
        // exec stays all-or-nothing.
        let ops = batch.into_ops();
        let mut touched: HashMap<String, Option<Value>, RandomState> = HashMap::default();
        for op in &ops {
            for key in op_keys(op) {
                if !touched.contains_key(key) {
                    touched.insert(key.to_owned(), inner.data.get(key).cloned());
                }
            }
        }
        for op in ops {
            if let Err(e) = inner.apply_op(op) {
                for (key, old) in touched {
                    match old {
                        Some(v) => {
                            inner.data.insert(key, v);
                        }
                        None => {
                            inner.data.remove(&key);
                        }
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn push_link_sample(&self, pair_key: &str, queue: &str, sample: f64) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let enqueued = if inner.data.contains_key(pair_key) {
            false
        } else {
            inner.apply_op(Op::LPush {
                key: queue.to_owned(),
                value: pair_key.to_owned(),
            })?;
            true
        };
        inner.apply_op(Op::SAdd {
            key: pair_key.to_owned(),
            members: vec![sample.to_string()],
        })?;
        Ok(enqueued)
    }

    fn rotate_live(&self, list_key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.inner.lock();
        let tail = match inner.data.get_mut(list_key) {
            None => return Ok(None),
            Some(Value::List(l)) => match l.pop_back() {
                None => return Ok(None),
                Some(t) => t,
            },
            Some(_) => return Err(wrong_type(list_key, "list")),
        };
        inner.bump(list_key);
        if inner.data.contains_key(&tail) {
            inner.list_mut(list_key)?.push_front(tail.clone());
            Ok(Some(tail))
        } else {
            inner.prune(list_key);
            Ok(None)
        }
    }

    fn flush(&self) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let inner = self.inner.lock();
        let image: BTreeMap<&String, &Value> = inner.data.iter().collect();
        let raw = serde_json::to_string(&image).map_err(|e| StoreError::Backend(e.to_string()))?;
        fs::write(path, raw).map_err(|e| StoreError::Backend(e.to_string()))?;
        debug!("flushed {} keys to {}", image.len(), path.display());
        Ok(())
    }
}

fn op_keys(op: &Op) -> impl Iterator<Item = &str> {
    let (a, b): (&str, Option<&str>) = match op {
        Op::Set { key, .. }
        | Op::SetNx { key, .. }
        | Op::Del { key }
        | Op::HSet { key, .. }
        | Op::HDel { key, .. }
        | Op::SAdd { key, .. }
        | Op::SRem { key, .. }
        | Op::LPush { key, .. }
        | Op::RPush { key, .. } => (key.as_str(), None),
        Op::SMove { src, dst, .. } => (src.as_str(), Some(dst.as_str())),
    };
    std::iter::once(a).chain(b)
}
