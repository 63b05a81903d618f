// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Request and reply types exchanged between the granule manager and the
//! granule workers, plus the worker registration record.

use serde::{Deserialize, Serialize};

use crate::{AssignmentSeq, Epoch, GranuleId, KeyRange, Version, WorkerId};

/// How an assignment is to be taken up by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignKind {
    /// A new assignment; the worker opens the granule.
    Normal,
    /// The worker already owns the range and should keep it, re-snapshotting
    /// in place. Issued when a split evaluation decided not to split.
    Continue,
}

/// Assigns a range to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignRangeRequest {
    /// The granule's range.
    pub range: KeyRange,
    /// Fencing sequence of this assignment.
    pub seq: AssignmentSeq,
    /// Kind of assignment.
    pub kind: AssignKind,
}

/// Revokes a range from a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeRangeRequest {
    /// The granule's range.
    pub range: KeyRange,
    /// Fencing sequence of this revocation.
    pub seq: AssignmentSeq,
    /// Whether the worker should also dispose of granule state, because the
    /// range left the active blob set.
    pub dispose: bool,
}

/// Asks a worker for a snapshot of its current assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetGranuleAssignmentsRequest {
    /// Epoch of the requesting manager; the worker rejects later requests
    /// from older epochs.
    pub manager_epoch: Epoch,
}

/// One assignment held by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GranuleAssignment {
    /// The granule's range.
    pub range: KeyRange,
    /// Sequence under which the worker accepted the assignment.
    pub seq: AssignmentSeq,
}

/// Reply to [`GetGranuleAssignmentsRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetGranuleAssignmentsReply {
    /// Every assignment the worker currently holds.
    pub assignments: Vec<GranuleAssignment>,
}

/// Tells a worker to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltWorkerRequest {
    /// Epoch of the halting manager.
    pub manager_epoch: Epoch,
}

/// Opens the granule status stream of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GranuleStatusRequest {
    /// Epoch of the subscribing manager.
    pub manager_epoch: Epoch,
}

/// One granule status report from a worker.
///
/// Today workers only report when they want a granule split; the manager
/// still validates the report against its own assignment map before acting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GranuleStatusReply {
    /// The granule's range as the worker sees it.
    pub range: KeyRange,
    /// Sequence under which the worker holds the granule.
    pub seq: AssignmentSeq,
    /// Durable id of the granule.
    pub granule_id: GranuleId,
    /// Version at which the granule's history starts.
    pub start_version: Version,
    /// Latest version the worker has durably written.
    pub latest_version: Version,
    /// The worker asks for the granule to be split.
    pub do_split: bool,
    /// The granule is write-hot; split on write rate, not just size.
    pub write_hot: bool,
}

/// Durable registration record of a worker, persisted under its worker-list
/// key for discovery across manager generations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    /// The worker's id.
    pub worker_id: WorkerId,
    /// The worker's RPC address.
    pub address: String,
    /// Datacenter label of the worker's process, if any.
    pub dc: Option<String>,
}
