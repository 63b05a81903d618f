// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! The transactional key-value store the manager persists its metadata in.
//!
//! The store is an external service; the manager only depends on the small
//! transaction surface below. Transactions are optimistic: reads are
//! validated at commit time and a failed validation surfaces as
//! [`KvError::Conflict`], which callers handle with an explicit retry loop.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use granules_core::{Key, KeyRange};

pub mod memory;

pub use memory::MemoryKv;

/// Errors surfaced by the key-value store.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The transaction's reads were invalidated by a concurrent commit.
    #[error("transaction conflict")]
    Conflict,
    /// The commit may or may not have applied; the caller must retry
    /// idempotently.
    #[error("commit result unknown")]
    CommitUnknownResult,
    /// The store was temporarily unreachable.
    #[error("store unavailable")]
    Unavailable,
    /// Persisted data failed to decode.
    #[error("corrupt metadata: {0}")]
    Corrupt(String),
}

impl KvError {
    /// Returns true iff the transaction should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KvError::Conflict | KvError::CommitUnknownResult | KvError::Unavailable
        )
    }
}

impl From<granules_core::keys::CodecError> for KvError {
    fn from(error: granules_core::keys::CodecError) -> Self {
        KvError::Corrupt(error.to_string())
    }
}

/// One page of a range read.
#[derive(Debug, Clone, Default)]
pub struct RangeResult {
    /// The key-value pairs, in key order (reversed for reverse reads).
    pub kvs: Vec<(Key, Bytes)>,
    /// True iff the read was cut short by the row limit.
    pub more: bool,
}

/// A future resolving once a watched key's value has changed from the value
/// observed when the watch was created.
pub type KvWatch = BoxFuture<'static, ()>;

/// A single optimistic transaction.
#[async_trait]
pub trait KvTransaction: Send {
    /// Reads a key, observing the transaction's own writes.
    async fn get(&mut self, key: &Key) -> Result<Option<Bytes>, KvError>;

    /// Reads up to `limit` pairs from `range`, observing the transaction's
    /// own writes. With `reverse`, reads the last `limit` pairs in reverse
    /// key order.
    async fn get_range(
        &mut self,
        range: &KeyRange,
        limit: usize,
        reverse: bool,
    ) -> Result<RangeResult, KvError>;

    /// Buffers a write.
    fn set(&mut self, key: &Key, value: Bytes);

    /// Buffers a single-key clear.
    fn clear(&mut self, key: &Key);

    /// Buffers a range clear.
    fn clear_range(&mut self, range: &KeyRange);

    /// Adds a read-conflict range without reading it.
    fn add_read_conflict(&mut self, range: &KeyRange);

    /// Registers a watch on `key`, capturing its current value; the returned
    /// future resolves once the persisted value differs. Only meaningful if
    /// the transaction subsequently commits.
    fn watch(&mut self, key: &Key) -> KvWatch;

    /// Commits the buffered writes, validating the read set.
    async fn commit(&mut self) -> Result<(), KvError>;
}

/// Handle to the transactional store.
pub trait KvStore: Send + Sync + 'static {
    /// Starts a new transaction.
    fn transaction(&self) -> Box<dyn KvTransaction>;
}

/// The store-side size estimator used to chop ranges into granule-sized
/// chunks.
///
/// Returns chunk boundaries including both endpoints; a range smaller than
/// the target yields exactly `[begin, end]`.
#[async_trait]
pub trait SplitEstimator: Send + Sync + 'static {
    /// Computes chunk boundaries for `range`. `write_hot` asks for a finer
    /// split driven by write rate rather than size alone.
    async fn split_points(
        &self,
        range: &KeyRange,
        write_hot: bool,
    ) -> Result<Vec<Key>, KvError>;
}
