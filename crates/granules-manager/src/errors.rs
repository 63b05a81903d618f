// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types of the manager surfaces.

use crate::kv::KvError;

/// Errors returned by worker RPCs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerRpcError {
    /// The worker observed a manager with a higher epoch; this manager must
    /// stand down.
    #[error("the granule manager has been replaced")]
    ManagerReplaced,
    /// The worker rejected an assignment because another manager holds the
    /// granule lock.
    #[error("granule assignment conflict")]
    AssignmentConflict,
    /// The targeted worker is no longer known to the manager.
    #[error("no live worker to deliver the request to")]
    NoMoreServers,
    /// The connection to the worker failed.
    #[error("connection to worker failed")]
    ConnectionFailed,
    /// The request may or may not have been delivered.
    #[error("request delivery unknown")]
    MaybeDelivered,
    /// The worker closed its status stream.
    #[error("worker status stream closed")]
    StreamClosed,
}

impl WorkerRpcError {
    /// True iff re-sending the same logical request is safe and useful.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WorkerRpcError::ConnectionFailed | WorkerRpcError::MaybeDelivered
        )
    }
}

/// Errors returned by the cluster-controller recruitment endpoint.
#[derive(Debug, thiserror::Error)]
pub enum RecruitError {
    /// The candidate process declined or failed to start a worker.
    #[error("worker recruitment failed")]
    RecruitmentFailed,
    /// The initialization request may or may not have been delivered.
    #[error("recruitment request delivery unknown")]
    MaybeDelivered,
    /// Any other recruitment failure; propagated.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RecruitError {
    /// True iff recruitment should be retried after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RecruitError::RecruitmentFailed | RecruitError::MaybeDelivered
        )
    }
}

/// Errors of metadata-store operations.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// The persisted manager epoch has moved past this manager's.
    #[error("the granule manager has been replaced")]
    Replaced,
    /// The underlying store failed.
    #[error(transparent)]
    Kv(#[from] KvError),
}

impl From<granules_core::keys::CodecError> for MetadataError {
    fn from(error: granules_core::keys::CodecError) -> Self {
        MetadataError::Kv(KvError::from(error))
    }
}

/// Top-level error of a manager component task.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// The manager lost its epoch lock; unwind without retrying.
    #[error("the granule manager has been replaced")]
    Replaced,
    /// The store failed non-retryably.
    #[error(transparent)]
    Kv(#[from] KvError),
    /// Recruitment failed non-retryably.
    #[error(transparent)]
    Recruit(#[from] RecruitError),
    /// Any other unexpected failure; kills the manager.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<MetadataError> for ManagerError {
    fn from(error: MetadataError) -> Self {
        match error {
            MetadataError::Replaced => ManagerError::Replaced,
            MetadataError::Kv(error) => ManagerError::Kv(error),
        }
    }
}
