// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! The chaos range mover: a test-cluster aid that periodically moves one
//! random owned granule to exercise revoke/assign handover.

use std::{collections::HashSet, sync::Arc};

use granules_core::{messages::AssignKind, KeyRange, WorkerId};

use super::{assignment::RangeAssignment, ManagerInner};
use crate::errors::ManagerError;

const MOVE_ATTEMPTS: usize = 10;

/// Moves one random granule per interval, each granule at most once.
#[tracing::instrument(skip_all, fields(epoch = inner.epoch))]
pub(crate) async fn chaos_range_mover(inner: Arc<ManagerInner>) -> Result<(), ManagerError> {
    let mut already_moved: HashSet<KeyRange> = HashSet::new();

    loop {
        tokio::time::sleep(inner.config.chaos_interval).await;

        let picked = {
            let state = inner.state.lock().expect("state mutex not poisoned");
            if state.workers.len() < 2 {
                tracing::debug!("not enough workers to move ranges");
                continue;
            }
            let mut picked = None;
            for _ in 0..MOVE_ATTEMPTS {
                let (range, owner) = inner.with_rng(|rng| {
                    let (range, owner) = state.assignments.random_range(rng);
                    (range, *owner)
                });
                if owner != WorkerId::ZERO && !already_moved.contains(&range) {
                    picked = Some(range);
                    break;
                }
            }
            picked
        };

        let Some(range) = picked else {
            tracing::debug!("no candidate range to move");
            continue;
        };

        tracing::info!(%range, "chaos mover reassigning range");
        already_moved.insert(range.clone());
        inner.queue.send(RangeAssignment::Revoke {
            range: range.clone(),
            worker: None,
            dispose: false,
        });
        inner.queue.send(RangeAssignment::Assign {
            range,
            worker: None,
            kind: AssignKind::Normal,
        });
    }
}
