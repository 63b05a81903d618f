// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! The RPC seams towards granule workers and the cluster controller.
//!
//! Workers are small value records carrying their RPC endpoint; worker
//! failure surfaces as an error or a closed stream, never as a panic.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use granules_core::{
    messages::{
        AssignRangeRequest, GetGranuleAssignmentsReply, GetGranuleAssignmentsRequest,
        GranuleStatusReply, GranuleStatusRequest, HaltWorkerRequest, RevokeRangeRequest,
        WorkerRegistration,
    },
    WorkerId,
};

use crate::errors::{RecruitError, WorkerRpcError};

/// The manager-facing RPC surface of one granule worker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkerApi: Send + Sync {
    /// Assigns a range to the worker.
    async fn assign_range(&self, request: AssignRangeRequest) -> Result<(), WorkerRpcError>;

    /// Revokes a range from the worker.
    async fn revoke_range(&self, request: RevokeRangeRequest) -> Result<(), WorkerRpcError>;

    /// Fetches a snapshot of the worker's current assignments.
    async fn get_granule_assignments(
        &self,
        request: GetGranuleAssignmentsRequest,
    ) -> Result<GetGranuleAssignmentsReply, WorkerRpcError>;

    /// Tells the worker to shut down.
    async fn halt(&self, request: HaltWorkerRequest) -> Result<(), WorkerRpcError>;

    /// Opens the long-lived granule status stream.
    async fn granule_status_stream(
        &self,
        request: GranuleStatusRequest,
    ) -> Result<BoxStream<'static, Result<GranuleStatusReply, WorkerRpcError>>, WorkerRpcError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), WorkerRpcError>;
}

/// A live worker: identity, address, and its RPC endpoint.
#[derive(Clone)]
pub struct WorkerHandle {
    /// The worker's id.
    pub worker_id: WorkerId,
    /// The worker's stable RPC address.
    pub address: String,
    /// Datacenter label of the worker's process, if any.
    pub dc: Option<String>,
    /// The worker's RPC endpoint.
    pub api: Arc<dyn WorkerApi>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", &self.worker_id)
            .field("address", &self.address)
            .field("dc", &self.dc)
            .finish_non_exhaustive()
    }
}

/// A process the cluster controller proposed for hosting a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateProcess {
    /// The process address.
    pub address: String,
    /// Datacenter label of the process, if any.
    pub dc: Option<String>,
}

/// The cluster-controller side of worker recruitment, plus reconnection to
/// already-registered workers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecruitmentApi: Send + Sync {
    /// Asks the cluster controller for a candidate process, excluding the
    /// given addresses. Pends until a candidate is available.
    async fn recruit_worker(
        &self,
        exclude_addresses: Vec<String>,
    ) -> Result<CandidateProcess, RecruitError>;

    /// Starts a worker with the given interface id on `candidate`.
    async fn initialize_worker(
        &self,
        candidate: &CandidateProcess,
        interface_id: WorkerId,
    ) -> Result<WorkerHandle, RecruitError>;

    /// Builds an RPC endpoint for a worker found in the persisted worker
    /// list.
    async fn connect_worker(
        &self,
        registration: &WorkerRegistration,
    ) -> Result<WorkerHandle, RecruitError>;
}
