//! Shared handle to the active policy bundle.
//!
//! The sync client publishes a complete replacement bundle; request-path
//! readers take a cheap snapshot. The critical section is a single pointer
//! swap, so in-flight evaluations never observe a half-updated bundle.

use std::sync::{Arc, RwLock};

use crate::models::{PolicyBundle, UNSYNCED_BUNDLE_VERSION};

#[derive(Default)]
pub struct BundleHandle {
    active: RwLock<Option<Arc<PolicyBundle>>>,
}

impl BundleHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the active bundle, if one has been synchronized.
    pub fn load(&self) -> Option<Arc<PolicyBundle>> {
        self.active
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Atomically replace the active bundle.
    pub fn store(&self, bundle: Arc<PolicyBundle>) {
        let mut guard = self
            .active
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(bundle);
    }

    /// Version tag used in decision fingerprints. Before the first sync this
    /// is a stable placeholder, so caching still works and flips over
    /// automatically once a real bundle lands.
    pub fn version(&self) -> String {
        self.load()
            .map_or_else(|| UNSYNCED_BUNDLE_VERSION.to_string(), |b| b.version.clone())
    }
}
