// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Configuration of the granule manager.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};

/// Configuration of a granule manager instance.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Datacenter this manager recruits and supervises workers in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc: Option<String>,
    /// Target size of one granule snapshot; ranges are chopped into chunks of
    /// roughly this many bytes.
    #[serde(default = "defaults::snapshot_target_bytes")]
    pub snapshot_target_bytes: u64,
    /// Maximum number of children one split may produce.
    #[serde(default = "defaults::max_split_fanout")]
    pub max_split_fanout: usize,
    /// Boundaries persisted per transaction when writing an initial granule
    /// mapping.
    #[serde(default = "defaults::mapping_chunk_size")]
    pub mapping_chunk_size: usize,
    /// Row limit of metadata range scans.
    #[serde(default = "defaults::scan_row_limit")]
    pub scan_row_limit: usize,
    /// Soft cap on the assignment queue; producers that tolerate
    /// backpressure wait below it.
    #[serde(default = "defaults::assignment_queue_soft_cap")]
    pub assignment_queue_soft_cap: usize,
    /// A worker that fails its liveness probe for this long is dead.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(
        rename = "worker_timeout_secs",
        default = "defaults::worker_timeout"
    )]
    pub worker_timeout: Duration,
    /// Interval between worker liveness probes.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(
        rename = "worker_ping_interval_ms",
        default = "defaults::worker_ping_interval"
    )]
    pub worker_ping_interval: Duration,
    /// Interval between reads of the persisted worker list.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(
        rename = "worker_list_fetch_interval_secs",
        default = "defaults::worker_list_fetch_interval"
    )]
    pub worker_list_fetch_interval: Duration,
    /// Backoff after a failed recruitment attempt.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(
        rename = "recruitment_delay_ms",
        default = "defaults::recruitment_delay"
    )]
    pub recruitment_delay: Duration,
    /// Fallback interval for the retention pass when the prune watch does
    /// not fire.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "prune_timeout_secs", default = "defaults::prune_timeout")]
    pub prune_timeout: Duration,
    /// Debounce of the epoch-lock watchdog.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(
        rename = "lock_check_debounce_ms",
        default = "defaults::lock_check_debounce"
    )]
    pub lock_check_debounce: Duration,
    /// Enables the chaos range mover, which periodically moves one random
    /// granule to exercise reassignment. Test clusters only.
    #[serde(default)]
    pub chaos_range_mover: bool,
    /// Interval of the chaos range mover.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(
        rename = "chaos_interval_secs",
        default = "defaults::chaos_interval"
    )]
    pub chaos_interval: Duration,
    /// Seed of the manager's random state; derived from entropy when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            dc: None,
            snapshot_target_bytes: defaults::snapshot_target_bytes(),
            max_split_fanout: defaults::max_split_fanout(),
            mapping_chunk_size: defaults::mapping_chunk_size(),
            scan_row_limit: defaults::scan_row_limit(),
            assignment_queue_soft_cap: defaults::assignment_queue_soft_cap(),
            worker_timeout: defaults::worker_timeout(),
            worker_ping_interval: defaults::worker_ping_interval(),
            worker_list_fetch_interval: defaults::worker_list_fetch_interval(),
            recruitment_delay: defaults::recruitment_delay(),
            prune_timeout: defaults::prune_timeout(),
            lock_check_debounce: defaults::lock_check_debounce(),
            chaos_range_mover: false,
            chaos_interval: defaults::chaos_interval(),
            seed: None,
        }
    }
}

pub(crate) mod defaults {
    use std::time::Duration;

    pub fn snapshot_target_bytes() -> u64 {
        10 * 1024 * 1024
    }

    pub fn max_split_fanout() -> usize {
        10
    }

    pub fn mapping_chunk_size() -> usize {
        1000
    }

    pub fn scan_row_limit() -> usize {
        10_000
    }

    pub fn assignment_queue_soft_cap() -> usize {
        4096
    }

    pub fn worker_timeout() -> Duration {
        Duration::from_secs(10)
    }

    pub fn worker_ping_interval() -> Duration {
        Duration::from_millis(2500)
    }

    pub fn worker_list_fetch_interval() -> Duration {
        Duration::from_secs(1)
    }

    pub fn recruitment_delay() -> Duration {
        Duration::from_millis(500)
    }

    pub fn prune_timeout() -> Duration {
        Duration::from_secs(60)
    }

    pub fn lock_check_debounce() -> Duration {
        Duration::from_millis(500)
    }

    pub fn chaos_interval() -> Duration {
        Duration::from_secs(30)
    }
}
