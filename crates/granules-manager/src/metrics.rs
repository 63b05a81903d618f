// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metrics of the granule manager.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

const NAMESPACE: &str = "granules";

fn int_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
        .expect("metrics defined at compile time must be valid");
    registry
        .register(Box::new(counter.clone()))
        .expect("metrics defined at compile time must be valid");
    counter
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))
        .expect("metrics defined at compile time must be valid");
    registry
        .register(Box::new(gauge.clone()))
        .expect("metrics defined at compile time must be valid");
    gauge
}

/// The metric set of one manager instance.
#[derive(Debug, Clone)]
pub struct ManagerMetricSet {
    /// Epoch of this manager.
    pub epoch: IntGauge,
    /// Number of live workers.
    pub live_workers: IntGauge,
    /// Number of granules in the in-memory assignment map.
    pub granules: IntGauge,
    /// Assign requests dispatched to workers.
    pub assignments_sent: IntCounter,
    /// Revoke requests dispatched to workers.
    pub revokes_sent: IntCounter,
    /// Splits persisted.
    pub splits_committed: IntCounter,
    /// Workers killed after failure detection.
    pub workers_killed: IntCounter,
    /// Prune intents fully processed.
    pub prunes_processed: IntCounter,
    /// Granule files deleted from the object store.
    pub files_deleted: IntCounter,
}

impl ManagerMetricSet {
    /// Creates and registers the metric set.
    pub fn new(registry: &Registry) -> Self {
        Self {
            epoch: int_gauge(registry, "manager_epoch", "Epoch of this manager"),
            live_workers: int_gauge(registry, "live_workers", "Number of live workers"),
            granules: int_gauge(
                registry,
                "granules",
                "Number of granules in the in-memory assignment map",
            ),
            assignments_sent: int_counter(
                registry,
                "assignments_sent_total",
                "Assign requests dispatched to workers",
            ),
            revokes_sent: int_counter(
                registry,
                "revokes_sent_total",
                "Revoke requests dispatched to workers",
            ),
            splits_committed: int_counter(registry, "splits_committed_total", "Splits persisted"),
            workers_killed: int_counter(
                registry,
                "workers_killed_total",
                "Workers killed after failure detection",
            ),
            prunes_processed: int_counter(
                registry,
                "prunes_processed_total",
                "Prune intents fully processed",
            ),
            files_deleted: int_counter(
                registry,
                "files_deleted_total",
                "Granule files deleted from the object store",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_set_registers_once() {
        let registry = Registry::new();
        let metrics = ManagerMetricSet::new(&registry);
        metrics.assignments_sent.inc();
        metrics.epoch.set(3);
        assert!(!registry.gather().is_empty());
    }
}
