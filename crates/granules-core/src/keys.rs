// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Keys, key ranges, and the persisted metadata key families.
//!
//! All manager metadata lives under the system prefix `\xff\x02/granules/`.
//! Within a family, composite keys are built from order-preserving encodings:
//! ids are fixed-width big-endian, versions are big-endian `u64`, and
//! variable-length keys are null-escaped so that concatenation preserves
//! lexicographic order.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{AssignmentSeq, GranuleId, Version, WorkerId};

/// An opaque byte-string key, ordered lexicographically.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Key(Bytes);

impl Key {
    /// The empty key, smaller than every other key.
    pub const EMPTY: Key = Key(Bytes::new());

    /// Creates a key from a static byte string.
    pub const fn from_static(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }

    /// Returns the key's bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Returns true iff the key is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the length of the key in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns the smallest key strictly greater than `self`.
    pub fn next(&self) -> Key {
        let mut bytes = BytesMut::with_capacity(self.0.len() + 1);
        bytes.put_slice(&self.0);
        bytes.put_u8(0x00);
        Key(bytes.freeze())
    }

    /// Returns true iff the key starts with `prefix`.
    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }

    /// Returns the key with `prefix` removed.
    ///
    /// Panics if the key does not start with `prefix`.
    pub fn strip_prefix(&self, prefix: &[u8]) -> Key {
        assert!(self.starts_with(prefix), "key must start with prefix");
        Key(self.0.slice(prefix.len()..))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            if byte.is_ascii_graphic() {
                write!(f, "{}", *byte as char)?;
            } else {
                write!(f, "\\x{byte:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<Bytes> for Key {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

/// A half-open key range `[begin, end)`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive start of the range.
    pub begin: Key,
    /// Exclusive end of the range.
    pub end: Key,
}

/// Exclusive upper bound of the user key space; keys at or above this are
/// system keys.
pub const NORMAL_KEYS_END: Key = Key::from_static(b"\xff");

impl KeyRange {
    /// Creates a new range; `begin` must not exceed `end`.
    pub fn new(begin: impl Into<Key>, end: impl Into<Key>) -> Self {
        let (begin, end) = (begin.into(), end.into());
        debug_assert!(begin <= end, "range begin must not exceed end");
        Self { begin, end }
    }

    /// The user key space `["", "\xff")`.
    pub fn normal() -> Self {
        Self::new(Key::EMPTY, NORMAL_KEYS_END)
    }

    /// Returns true iff the range contains no keys.
    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    /// Returns true iff `key` lies inside the range.
    pub fn contains(&self, key: &Key) -> bool {
        *key >= self.begin && *key < self.end
    }

    /// Returns true iff the two ranges share at least one key.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// Returns the overlap of the two ranges, or `None` if disjoint.
    pub fn intersection(&self, other: &KeyRange) -> Option<KeyRange> {
        let begin = self.begin.clone().max(other.begin.clone());
        let end = self.end.clone().min(other.end.clone());
        (begin < end).then(|| KeyRange { begin, end })
    }

    /// Returns true iff `other` lies entirely inside `self`.
    pub fn contains_range(&self, other: &KeyRange) -> bool {
        other.begin >= self.begin && other.end <= self.end
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} - {})", self.begin, self.end)
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyRange({self})")
    }
}

/// Error decoding a persisted key or value.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A composite key did not have the expected layout.
    #[error("malformed key in family {0}")]
    MalformedKey(&'static str),
    /// A bcs value failed to decode.
    #[error("malformed value: {0}")]
    MalformedValue(#[from] bcs::Error),
}

// Order-preserving encoding of a variable-length key element: 0x00 bytes are
// escaped as 0x00 0xff and the element is terminated with 0x00 0x00.
fn put_escaped(out: &mut BytesMut, data: &[u8]) {
    for &byte in data {
        out.put_u8(byte);
        if byte == 0x00 {
            out.put_u8(0xff);
        }
    }
    out.put_u8(0x00);
    out.put_u8(0x00);
}

fn take_escaped(data: &[u8], family: &'static str) -> Result<(Bytes, usize), CodecError> {
    let mut element = Vec::new();
    let mut i = 0;
    while i < data.len() {
        if data[i] == 0x00 {
            let escape = *data.get(i + 1).ok_or(CodecError::MalformedKey(family))?;
            if escape == 0x00 {
                return Ok((Bytes::from(element), i + 2));
            }
            element.push(0x00);
            i += 2;
        } else {
            element.push(data[i]);
            i += 1;
        }
    }
    Err(CodecError::MalformedKey(family))
}

fn put_id(out: &mut BytesMut, id: u128) {
    out.put_u128(id);
}

fn key_with(prefix: &[u8], build: impl FnOnce(&mut BytesMut)) -> Key {
    let mut out = BytesMut::with_capacity(prefix.len() + 32);
    out.put_slice(prefix);
    build(&mut out);
    Key(out.freeze())
}

fn family_range(prefix: &'static [u8]) -> KeyRange {
    let mut end = prefix.to_vec();
    *end.last_mut().expect("family prefixes are not empty") += 1;
    KeyRange::new(Key::from_static(prefix), Key::from(end))
}

/// Key under which the current manager epoch is persisted.
pub fn manager_epoch_key() -> Key {
    Key::from_static(b"\xff\x02/granules/managerEpoch")
}

const CLIENT_RANGES_PREFIX: &[u8] = b"\xff\x02/granules/clientRanges/";
const MAPPING_PREFIX: &[u8] = b"\xff\x02/granules/mapping/";
const LOCK_PREFIX: &[u8] = b"\xff\x02/granules/lock/";
const SPLIT_BOUNDARY_PREFIX: &[u8] = b"\xff\x02/granules/boundary/";
const SPLIT_STATE_PREFIX: &[u8] = b"\xff\x02/granules/split/";
const HISTORY_PREFIX: &[u8] = b"\xff\x02/granules/history/";
const FILE_PREFIX: &[u8] = b"\xff\x02/granules/file/";
const PRUNE_PREFIX: &[u8] = b"\xff\x02/granules/prune/";
const WORKER_LIST_PREFIX: &[u8] = b"\xff\x02/granules/worker/";

/// Special boundary key holding the `(epoch, seqno)` of a split instead of a
/// child boundary. Chosen so that it can never collide with a real boundary
/// in the user key space.
pub const SPLIT_BOUNDARY_MARKER: Key = Key::from_static(b"\xff\xff\xff");

/// Sparse boundary key of the user-declared blob range map.
pub fn client_range_key(user_key: &Key) -> Key {
    key_with(CLIENT_RANGES_PREFIX, |out| out.put_slice(user_key.as_slice()))
}

/// The whole client-range boundary family.
pub fn client_ranges_range() -> KeyRange {
    family_range(CLIENT_RANGES_PREFIX)
}

/// Strips the family prefix off a client-range boundary key.
pub fn decode_client_range_key(key: &Key) -> Result<Key, CodecError> {
    if !key.starts_with(CLIENT_RANGES_PREFIX) {
        return Err(CodecError::MalformedKey("clientRanges"));
    }
    Ok(key.strip_prefix(CLIENT_RANGES_PREFIX))
}

/// Watch target bumped on every client-range change.
pub fn client_range_change_key() -> Key {
    Key::from_static(b"\xff\x02/granules/clientRangesChange")
}

/// Sparse boundary key of the durable granule-to-worker mapping.
pub fn mapping_key(user_key: &Key) -> Key {
    key_with(MAPPING_PREFIX, |out| out.put_slice(user_key.as_slice()))
}

/// The whole granule-mapping family.
pub fn mapping_range() -> KeyRange {
    family_range(MAPPING_PREFIX)
}

/// Strips the family prefix off a granule-mapping boundary key.
pub fn decode_mapping_key(key: &Key) -> Result<Key, CodecError> {
    if !key.starts_with(MAPPING_PREFIX) {
        return Err(CodecError::MalformedKey("mapping"));
    }
    Ok(key.strip_prefix(MAPPING_PREFIX))
}

/// Per-granule lock key, addressed by the granule's current range.
pub fn granule_lock_key(range: &KeyRange) -> Key {
    key_with(LOCK_PREFIX, |out| {
        put_escaped(out, range.begin.as_slice());
        put_escaped(out, range.end.as_slice());
    })
}

/// Boundary key of an in-progress split of `parent`.
pub fn split_boundary_key(parent: GranuleId, boundary: &Key) -> Key {
    key_with(SPLIT_BOUNDARY_PREFIX, |out| {
        put_id(out, parent.0);
        out.put_slice(boundary.as_slice());
    })
}

/// The whole split-boundary family, over all parents.
pub fn split_boundaries_range() -> KeyRange {
    family_range(SPLIT_BOUNDARY_PREFIX)
}

/// Decodes a split-boundary key into `(parent, boundary)`.
pub fn decode_split_boundary_key(key: &Key) -> Result<(GranuleId, Key), CodecError> {
    const FAMILY: &str = "boundary";
    if !key.starts_with(SPLIT_BOUNDARY_PREFIX) {
        return Err(CodecError::MalformedKey(FAMILY));
    }
    let rest = key.strip_prefix(SPLIT_BOUNDARY_PREFIX);
    if rest.len() < 16 {
        return Err(CodecError::MalformedKey(FAMILY));
    }
    let id = u128::from_be_bytes(
        rest.as_slice()[..16]
            .try_into()
            .expect("slice is exactly 16 bytes"),
    );
    Ok((GranuleId(id), Key(rest.0.slice(16..))))
}

/// Split-progression key for one `(parent, child)` pair.
pub fn split_state_key(parent: GranuleId, child: GranuleId) -> Key {
    key_with(SPLIT_STATE_PREFIX, |out| {
        put_id(out, parent.0);
        put_id(out, child.0);
    })
}

/// All split-progression keys of `parent`.
pub fn split_states_for(parent: GranuleId) -> KeyRange {
    let begin = key_with(SPLIT_STATE_PREFIX, |out| put_id(out, parent.0));
    KeyRange::new(begin.clone(), begin.next_id_sibling())
}

impl Key {
    // End key for a range of composite keys sharing a fixed-width id prefix.
    fn next_id_sibling(&self) -> Key {
        let mut bytes = self.0.to_vec();
        for byte in bytes.iter_mut().rev() {
            if *byte < 0xff {
                *byte += 1;
                return Key::from(bytes);
            }
            *byte = 0x00;
        }
        unreachable!("id prefixes never consist solely of 0xff bytes")
    }
}

/// History key of the granule that covered `range` starting at `version`.
pub fn history_key(range: &KeyRange, version: Version) -> Key {
    key_with(HISTORY_PREFIX, |out| {
        put_escaped(out, range.begin.as_slice());
        put_escaped(out, range.end.as_slice());
        out.put_u64(version);
    })
}

/// All history versions recorded for exactly `range`, in version order.
pub fn history_range_for(range: &KeyRange) -> KeyRange {
    let begin = key_with(HISTORY_PREFIX, |out| {
        put_escaped(out, range.begin.as_slice());
        put_escaped(out, range.end.as_slice());
    });
    let end = key_with(HISTORY_PREFIX, |out| {
        put_escaped(out, range.begin.as_slice());
        put_escaped(out, range.end.as_slice());
        out.put_u64(u64::MAX);
        out.put_u8(0x00);
    });
    KeyRange::new(begin, end)
}

/// Decodes a history key into `(range, version)`.
pub fn decode_history_key(key: &Key) -> Result<(KeyRange, Version), CodecError> {
    const FAMILY: &str = "history";
    if !key.starts_with(HISTORY_PREFIX) {
        return Err(CodecError::MalformedKey(FAMILY));
    }
    let rest = key.strip_prefix(HISTORY_PREFIX);
    let (begin, used) = take_escaped(rest.as_slice(), FAMILY)?;
    let (end, used_end) = take_escaped(&rest.as_slice()[used..], FAMILY)?;
    let version_bytes = &rest.as_slice()[used + used_end..];
    if version_bytes.len() != 8 {
        return Err(CodecError::MalformedKey(FAMILY));
    }
    let version = u64::from_be_bytes(version_bytes.try_into().expect("checked length"));
    Ok((KeyRange::new(Key(begin), Key(end)), version))
}

/// Whether a granule file is a snapshot or a delta file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    /// A full snapshot of the granule at its version.
    Snapshot,
    /// A delta file of mutations up to its version.
    Delta,
}

impl FileKind {
    fn tag(self) -> u8 {
        match self {
            // 'D' sorts before 'S'; within a granule deltas and snapshots are
            // separate runs, each in version order.
            FileKind::Delta => b'D',
            FileKind::Snapshot => b'S',
        }
    }
}

/// Key of one granule file record.
pub fn granule_file_key(granule_id: GranuleId, kind: FileKind, version: Version) -> Key {
    key_with(FILE_PREFIX, |out| {
        put_id(out, granule_id.0);
        out.put_u8(kind.tag());
        out.put_u64(version);
    })
}

/// All file records of `granule_id`.
pub fn granule_files_range(granule_id: GranuleId) -> KeyRange {
    let begin = key_with(FILE_PREFIX, |out| put_id(out, granule_id.0));
    KeyRange::new(begin.clone(), begin.next_id_sibling())
}

/// Decodes a granule file key into `(kind, version)`.
pub fn decode_granule_file_key(key: &Key) -> Result<(FileKind, Version), CodecError> {
    const FAMILY: &str = "file";
    if !key.starts_with(FILE_PREFIX) {
        return Err(CodecError::MalformedKey(FAMILY));
    }
    let rest = key.strip_prefix(FILE_PREFIX);
    if rest.len() != 16 + 1 + 8 {
        return Err(CodecError::MalformedKey(FAMILY));
    }
    let kind = match rest.as_slice()[16] {
        b'S' => FileKind::Snapshot,
        b'D' => FileKind::Delta,
        _ => return Err(CodecError::MalformedKey(FAMILY)),
    };
    let version = u64::from_be_bytes(rest.as_slice()[17..].try_into().expect("checked length"));
    Ok((kind, version))
}

/// Sparse boundary key of the prune-intent map.
pub fn prune_intent_key(user_key: &Key) -> Key {
    key_with(PRUNE_PREFIX, |out| out.put_slice(user_key.as_slice()))
}

/// The whole prune-intent family.
pub fn prune_intents_range() -> KeyRange {
    family_range(PRUNE_PREFIX)
}

/// Strips the family prefix off a prune-intent boundary key.
pub fn decode_prune_intent_key(key: &Key) -> Result<Key, CodecError> {
    if !key.starts_with(PRUNE_PREFIX) {
        return Err(CodecError::MalformedKey("prune"));
    }
    Ok(key.strip_prefix(PRUNE_PREFIX))
}

/// Watch target bumped on every new prune intent.
pub fn prune_change_key() -> Key {
    Key::from_static(b"\xff\x02/granules/pruneChange")
}

/// Registration key of one worker.
pub fn worker_list_key(worker_id: WorkerId) -> Key {
    key_with(WORKER_LIST_PREFIX, |out| put_id(out, worker_id.0))
}

/// The whole worker-list family.
pub fn worker_list_range() -> KeyRange {
    family_range(WORKER_LIST_PREFIX)
}

/// Value of a granule lock: the fencing `(epoch, seqno)` plus the durable
/// granule id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockValue {
    /// Assignment sequence of the holder.
    pub seq: AssignmentSeq,
    /// Durable id of the locked granule.
    pub granule_id: GranuleId,
}

/// Value of the split-boundary marker key: the sequence that generated the
/// split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitBoundaryValue {
    /// Sequence assigned to the split as a whole.
    pub seq: AssignmentSeq,
}

/// Progression of one split child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitState {
    /// The split transaction committed; the child has not been picked up.
    Initialized,
    /// The child has been assigned to a worker.
    Assigned,
    /// The child wrote its first snapshot; the parent is no longer needed.
    Done,
}

/// Value of a history entry: the granule's id plus its parents' ranges and
/// start versions. Parents form a DAG addressed by range + version; there are
/// no in-memory back-pointers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryValue {
    /// Durable id of the granule this entry describes.
    pub granule_id: GranuleId,
    /// `(range, start_version)` of each parent granule.
    pub parents: Vec<(KeyRange, Version)>,
}

/// Value of a prune intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneIntent {
    /// Delete file data at versions `<=` this version.
    pub prune_version: Version,
    /// Delete everything regardless of version.
    pub force: bool,
}

/// Value of a granule file record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Object-store path of the file.
    pub path: String,
    /// File length in bytes.
    pub len: u64,
}

/// Encodes a persisted value with bcs.
pub fn encode_value<T: Serialize>(value: &T) -> Bytes {
    Bytes::from(bcs::to_bytes(value).expect("metadata values are bcs-serializable"))
}

/// Decodes a persisted value with bcs.
pub fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(bcs::from_bytes(bytes)?)
}

#[cfg(test)]
mod tests {
    use granules_test_utils::param_test;

    use super::*;

    fn range(begin: &str, end: &str) -> KeyRange {
        KeyRange::new(begin, end)
    }

    #[test]
    fn key_ordering_is_lexicographic() {
        assert!(Key::from("a") < Key::from("b"));
        assert!(Key::from("a") < Key::from("aa"));
        assert!(Key::EMPTY < Key::from("\x00"));
        assert_eq!(Key::from("a").next(), Key::from("a\x00"));
    }

    param_test! {
        range_intersection: [
            disjoint: ("a", "b", "c", "d", None),
            touching: ("a", "b", "b", "c", None),
            overlap: ("a", "c", "b", "d", Some(("b", "c"))),
            nested: ("a", "d", "b", "c", Some(("b", "c"))),
        ]
    }
    fn range_intersection(
        begin: &str,
        end: &str,
        other_begin: &str,
        other_end: &str,
        expected: Option<(&str, &str)>,
    ) {
        let result = range(begin, end).intersection(&range(other_begin, other_end));
        assert_eq!(result, expected.map(|(b, e)| range(b, e)));
    }

    #[test]
    fn lock_keys_are_distinct_per_range() {
        // The escaped encoding must not let ("a", "bc") and ("ab", "c")
        // collide.
        assert_ne!(
            granule_lock_key(&range("a", "bc")),
            granule_lock_key(&range("ab", "c"))
        );
    }

    #[test]
    fn split_boundary_key_roundtrip() {
        let parent = GranuleId(0x0011_2233_4455_6677_8899_aabb_ccdd_eeff);
        let boundary = Key::from("user-key\x00with-null");
        let encoded = split_boundary_key(parent, &boundary);
        let (decoded_parent, decoded_boundary) = decode_split_boundary_key(&encoded).unwrap();
        assert_eq!(decoded_parent, parent);
        assert_eq!(decoded_boundary, boundary);
        assert!(split_boundaries_range().contains(&encoded));
    }

    #[test]
    fn marker_sorts_after_user_boundaries() {
        let parent = GranuleId(42);
        let marker = split_boundary_key(parent, &SPLIT_BOUNDARY_MARKER);
        let user = split_boundary_key(parent, &Key::from("zzz"));
        assert!(user < marker);
        assert!(split_states_for(parent).contains(&split_state_key(parent, GranuleId(7))));
    }

    #[test]
    fn history_key_roundtrip() {
        let granule_range = range("m\x00id", "n");
        let encoded = history_key(&granule_range, 1234);
        let (decoded_range, version) = decode_history_key(&encoded).unwrap();
        assert_eq!(decoded_range, granule_range);
        assert_eq!(version, 1234);
        assert!(history_range_for(&granule_range).contains(&encoded));
    }

    #[test]
    fn history_versions_sort_numerically() {
        let granule_range = range("a", "b");
        assert!(history_key(&granule_range, 9) < history_key(&granule_range, 10));
        assert!(history_key(&granule_range, 255) < history_key(&granule_range, 256));
    }

    #[test]
    fn granule_file_key_roundtrip() {
        let id = GranuleId(7);
        let key = granule_file_key(id, FileKind::Snapshot, 99);
        assert_eq!(
            decode_granule_file_key(&key).unwrap(),
            (FileKind::Snapshot, 99)
        );
        assert!(granule_files_range(id).contains(&key));
        assert!(!granule_files_range(GranuleId(8)).contains(&key));
    }

    #[test]
    fn values_roundtrip_through_bcs() {
        let lock = LockValue {
            seq: AssignmentSeq::new(3, 17),
            granule_id: GranuleId(9),
        };
        let decoded: LockValue = decode_value(&encode_value(&lock)).unwrap();
        assert_eq!(decoded, lock);

        let history = HistoryValue {
            granule_id: GranuleId(11),
            parents: vec![(range("a", "m"), 7)],
        };
        let decoded: HistoryValue = decode_value(&encode_value(&history)).unwrap();
        assert_eq!(decoded, history);
    }
}
