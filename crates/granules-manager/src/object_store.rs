// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Deletion of granule files from the backing object store.
//!
//! The retention pass may retry deletions after a crash, so deleting a path
//! that no longer exists must succeed.

use std::sync::Arc;

use async_trait::async_trait;
use object_store::{path::Path, ObjectStore};

/// The slice of the object store the manager needs: idempotent deletion.
#[async_trait]
pub trait FileStore: Send + Sync + 'static {
    /// Deletes `path`; deleting a missing file is success.
    async fn delete(&self, path: &str) -> anyhow::Result<()>;
}

/// [`FileStore`] backed by any [`object_store::ObjectStore`].
pub struct GranuleFileStore {
    store: Arc<dyn ObjectStore>,
}

impl GranuleFileStore {
    /// Wraps an object store.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl FileStore for GranuleFileStore {
    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        match self.store.delete(&Path::from(path)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                tracing::debug!(path, "file already deleted");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}
