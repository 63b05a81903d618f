// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! An in-memory implementation of the store traits with real conflict
//! checking, used throughout the test suite.
//!
//! Commits are serialized under one mutex. Every committed write records a
//! per-key write version; a committing transaction conflicts if any key in
//! its read set carries a write version newer than the transaction's
//! snapshot. Watches are driven by a commit-version channel.

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use granules_core::{Key, KeyRange};
use tokio::sync::watch;

use super::{KvError, KvStore, KvTransaction, KvWatch, RangeResult, SplitEstimator};

#[derive(Debug, Default)]
struct StoreState {
    data: BTreeMap<Key, Bytes>,
    // Last write version per key, kept for cleared keys too.
    write_versions: BTreeMap<Key, u64>,
    version: u64,
}

/// In-memory transactional store.
#[derive(Clone)]
pub struct MemoryKv {
    state: Arc<Mutex<StoreState>>,
    commits: watch::Sender<u64>,
    split_target_bytes: u64,
}

impl MemoryKv {
    /// Creates an empty store whose size estimator chops ranges at
    /// `split_target_bytes` of key+value payload.
    pub fn new(split_target_bytes: u64) -> Self {
        let (commits, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            commits,
            split_target_bytes,
        }
    }

    /// Returns the current commit version.
    pub fn version(&self) -> u64 {
        self.state.lock().expect("store mutex not poisoned").version
    }

    /// Test hook: returns the committed value of `key`.
    pub fn value_of(&self, key: &Key) -> Option<Bytes> {
        self.state
            .lock()
            .expect("store mutex not poisoned")
            .data
            .get(key)
            .cloned()
    }
}

impl KvStore for MemoryKv {
    fn transaction(&self) -> Box<dyn KvTransaction> {
        let snapshot_version = self.version();
        Box::new(MemoryTransaction {
            store: self.clone(),
            snapshot_version,
            ops: Vec::new(),
            read_set: Vec::new(),
            committed: false,
        })
    }
}

#[async_trait]
impl SplitEstimator for MemoryKv {
    async fn split_points(
        &self,
        range: &KeyRange,
        _write_hot: bool,
    ) -> Result<Vec<Key>, KvError> {
        let state = self.state.lock().expect("store mutex not poisoned");
        let mut boundaries = vec![range.begin.clone()];
        let mut chunk_bytes = 0u64;
        for (key, value) in state.data.range(range.begin.clone()..range.end.clone()) {
            if chunk_bytes >= self.split_target_bytes {
                boundaries.push(key.clone());
                chunk_bytes = 0;
            }
            chunk_bytes += (key.len() + value.len()) as u64;
        }
        boundaries.push(range.end.clone());
        Ok(boundaries)
    }
}

#[derive(Debug, Clone)]
enum Op {
    Set(Key, Bytes),
    Clear(Key),
    ClearRange(KeyRange),
}

struct MemoryTransaction {
    store: MemoryKv,
    snapshot_version: u64,
    ops: Vec<Op>,
    read_set: Vec<KeyRange>,
    committed: bool,
}

impl MemoryTransaction {
    // The committed value of `key` with this transaction's writes applied in
    // order.
    fn effective_value(state: &StoreState, ops: &[Op], key: &Key) -> Option<Bytes> {
        let mut value = state.data.get(key).cloned();
        for op in ops {
            match op {
                Op::Set(k, v) if k == key => value = Some(v.clone()),
                Op::Clear(k) if k == key => value = None,
                Op::ClearRange(r) if r.contains(key) => value = None,
                _ => {}
            }
        }
        value
    }

    fn effective_range(state: &StoreState, ops: &[Op], range: &KeyRange) -> BTreeMap<Key, Bytes> {
        let mut view: BTreeMap<Key, Bytes> = state
            .data
            .range(range.begin.clone()..range.end.clone())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for op in ops {
            match op {
                Op::Set(k, v) if range.contains(k) => {
                    view.insert(k.clone(), v.clone());
                }
                Op::Clear(k) => {
                    view.remove(k);
                }
                Op::ClearRange(r) => {
                    let cleared: Vec<Key> = view
                        .range((Bound::Included(&r.begin), Bound::Excluded(&r.end)))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in cleared {
                        view.remove(&key);
                    }
                }
                _ => {}
            }
        }
        view
    }
}

#[async_trait]
impl KvTransaction for MemoryTransaction {
    async fn get(&mut self, key: &Key) -> Result<Option<Bytes>, KvError> {
        self.read_set
            .push(KeyRange::new(key.clone(), key.next()));
        let state = self.store.state.lock().expect("store mutex not poisoned");
        Ok(Self::effective_value(&state, &self.ops, key))
    }

    async fn get_range(
        &mut self,
        range: &KeyRange,
        limit: usize,
        reverse: bool,
    ) -> Result<RangeResult, KvError> {
        self.read_set.push(range.clone());
        let state = self.store.state.lock().expect("store mutex not poisoned");
        let view = Self::effective_range(&state, &self.ops, range);
        let total = view.len();
        let kvs: Vec<(Key, Bytes)> = if reverse {
            view.into_iter().rev().take(limit).collect()
        } else {
            view.into_iter().take(limit).collect()
        };
        Ok(RangeResult {
            more: total > kvs.len(),
            kvs,
        })
    }

    fn set(&mut self, key: &Key, value: Bytes) {
        self.ops.push(Op::Set(key.clone(), value));
    }

    fn clear(&mut self, key: &Key) {
        self.ops.push(Op::Clear(key.clone()));
    }

    fn clear_range(&mut self, range: &KeyRange) {
        self.ops.push(Op::ClearRange(range.clone()));
    }

    fn add_read_conflict(&mut self, range: &KeyRange) {
        self.read_set.push(range.clone());
    }

    fn watch(&mut self, key: &Key) -> KvWatch {
        let store = self.store.clone();
        let key = key.clone();
        let observed = {
            let state = store.state.lock().expect("store mutex not poisoned");
            Self::effective_value(&state, &self.ops, &key)
        };
        let mut commits = store.commits.subscribe();
        async move {
            loop {
                {
                    let state = store.state.lock().expect("store mutex not poisoned");
                    if state.data.get(&key).cloned() != observed {
                        return;
                    }
                }
                if commits.changed().await.is_err() {
                    // Store dropped; the watch can never fire again.
                    std::future::pending::<()>().await;
                }
            }
        }
        .boxed()
    }

    async fn commit(&mut self) -> Result<(), KvError> {
        assert!(!self.committed, "transactions commit at most once");
        let mut state = self.store.state.lock().expect("store mutex not poisoned");

        for range in &self.read_set {
            let conflicting = state
                .write_versions
                .range(range.begin.clone()..range.end.clone())
                .any(|(_, &version)| version > self.snapshot_version);
            if conflicting {
                return Err(KvError::Conflict);
            }
        }

        state.version += 1;
        let commit_version = state.version;
        for op in &self.ops {
            match op {
                Op::Set(key, value) => {
                    state.data.insert(key.clone(), value.clone());
                    state.write_versions.insert(key.clone(), commit_version);
                }
                Op::Clear(key) => {
                    state.data.remove(key);
                    state.write_versions.insert(key.clone(), commit_version);
                }
                Op::ClearRange(range) => {
                    let cleared: Vec<Key> = state
                        .data
                        .range(range.begin.clone()..range.end.clone())
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in cleared {
                        state.data.remove(&key);
                        state.write_versions.insert(key, commit_version);
                    }
                }
            }
        }
        self.committed = true;
        drop(state);

        let _ = self.store.commits.send_replace(commit_version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use granules_test_utils::Result as TestResult;

    use super::*;

    fn key(s: &str) -> Key {
        Key::from(s)
    }

    fn value(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn reads_see_own_writes() -> TestResult {
        let store = MemoryKv::new(1 << 20);
        let mut txn = store.transaction();
        txn.set(&key("a"), value("1"));
        assert_eq!(txn.get(&key("a")).await?, Some(value("1")));
        txn.clear(&key("a"));
        assert_eq!(txn.get(&key("a")).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn conflicting_read_fails_commit() -> TestResult {
        let store = MemoryKv::new(1 << 20);

        let mut reader = store.transaction();
        assert_eq!(reader.get(&key("a")).await?, None);

        let mut writer = store.transaction();
        writer.set(&key("a"), value("1"));
        writer.commit().await?;

        reader.set(&key("b"), value("2"));
        assert!(matches!(reader.commit().await, Err(KvError::Conflict)));

        // A fresh attempt sees the committed value and succeeds.
        let mut retry = store.transaction();
        assert_eq!(retry.get(&key("a")).await?, Some(value("1")));
        retry.set(&key("b"), value("2"));
        retry.commit().await?;
        Ok(())
    }

    #[tokio::test]
    async fn disjoint_writes_do_not_conflict() -> TestResult {
        let store = MemoryKv::new(1 << 20);

        let mut first = store.transaction();
        first.get(&key("a")).await?;
        first.set(&key("a"), value("1"));

        let mut second = store.transaction();
        second.get(&key("b")).await?;
        second.set(&key("b"), value("2"));

        second.commit().await?;
        first.commit().await?;
        Ok(())
    }

    #[tokio::test]
    async fn range_clear_invalidates_range_readers() -> TestResult {
        let store = MemoryKv::new(1 << 20);
        let mut setup = store.transaction();
        setup.set(&key("b"), value("1"));
        setup.commit().await?;

        let mut reader = store.transaction();
        reader.get_range(&KeyRange::new("a", "c"), 100, false).await?;

        let mut clearer = store.transaction();
        clearer.clear_range(&KeyRange::new("a", "c"));
        clearer.commit().await?;

        reader.set(&key("x"), value("2"));
        assert!(matches!(reader.commit().await, Err(KvError::Conflict)));
        Ok(())
    }

    #[tokio::test]
    async fn get_range_respects_limit_and_reverse() -> TestResult {
        let store = MemoryKv::new(1 << 20);
        let mut setup = store.transaction();
        for name in ["a", "b", "c", "d"] {
            setup.set(&key(name), value(name));
        }
        setup.commit().await?;

        let mut txn = store.transaction();
        let page = txn.get_range(&KeyRange::new("a", "e"), 2, false).await?;
        assert_eq!(page.kvs.len(), 2);
        assert!(page.more);
        assert_eq!(page.kvs[0].0, key("a"));

        let page = txn.get_range(&KeyRange::new("a", "e"), 2, true).await?;
        assert_eq!(page.kvs[0].0, key("d"));
        assert_eq!(page.kvs[1].0, key("c"));
        Ok(())
    }

    #[tokio::test]
    async fn watch_fires_on_change() -> TestResult {
        let store = MemoryKv::new(1 << 20);

        let mut txn = store.transaction();
        let watch = txn.watch(&key("w"));
        txn.commit().await?;

        let fired = tokio::spawn(watch);
        // An unrelated commit must not wake the watch.
        let mut unrelated = store.transaction();
        unrelated.set(&key("other"), value("1"));
        unrelated.commit().await?;
        assert!(!fired.is_finished());

        let mut writer = store.transaction();
        writer.set(&key("w"), value("1"));
        writer.commit().await?;
        fired.await?;
        Ok(())
    }

    #[tokio::test]
    async fn split_points_chop_at_target() -> TestResult {
        let store = MemoryKv::new(4);
        let mut setup = store.transaction();
        for name in ["a", "b", "c", "d", "e"] {
            setup.set(&key(name), value("xyz"));
        }
        setup.commit().await?;

        let points = store
            .split_points(&KeyRange::new("a", "z"), false)
            .await?;
        assert_eq!(points.first(), Some(&key("a")));
        assert_eq!(points.last(), Some(&key("z")));
        assert!(points.len() > 2, "five 4-byte pairs exceed one 4-byte chunk");
        Ok(())
    }
}
