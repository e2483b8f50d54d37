//! Operation id to status bookkeeping.

use crate::Error;
use std::collections::HashMap;
use std::sync::RwLock;

/// Progress of one tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationState {
    /// Created but not yet running.
    #[default]
    NotStarted,
    /// Running, possibly between retries.
    InProgress,
    /// Finished; `last_error` holds the outcome.
    Completed,
}

/// Status of one tracked operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OperationStatus {
    /// Operation id.
    pub id: String,
    /// Current progress.
    pub state: OperationState,
    /// Most recent error, if any.
    pub last_error: Option<Error>,
    /// Counted failures; monotonic while `InProgress`.
    pub failure_count: u32,
    /// Internal (uncounted) failures, kept for diagnostics.
    pub internal_failure_count: u32,
}

impl OperationStatus {
    /// A fresh status for an operation id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// Concurrent map from operation id to [`OperationStatus`].
#[derive(Default)]
pub struct OperationStatusMap {
    map: RwLock<HashMap<String, OperationStatus>>,
}

impl OperationStatusMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh status for `id`, replacing any existing entry.
    pub fn initialize(&self, id: &str) {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        map.insert(id.to_string(), OperationStatus::new(id));
    }

    /// Insert a fresh status for `id` only if absent; returns the status
    /// now stored and whether this call inserted it.
    pub fn try_initialize(&self, id: &str) -> (OperationStatus, bool) {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = map.get(id) {
            return (existing.clone(), false);
        }
        let status = OperationStatus::new(id);
        map.insert(id.to_string(), status.clone());
        (status, true)
    }

    /// Current status for `id`.
    pub fn get(&self, id: &str) -> Option<OperationStatus> {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        map.get(id).cloned()
    }

    /// Overwrite the whole status for `id`; no-op when absent.
    pub fn set(&self, status: OperationStatus) {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get_mut(&status.id) {
            *entry = status;
        }
    }

    /// Set only the state for `id`.
    pub fn set_state(&self, id: &str, state: OperationState) {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get_mut(id) {
            entry.state = state;
        }
    }

    /// Set only the failure count for `id`.
    pub fn set_failure_count(&self, id: &str, failure_count: u32) {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get_mut(id) {
            entry.failure_count = failure_count;
        }
    }

    /// Set only the last error for `id`.
    pub fn set_error(&self, id: &str, error: Error) {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get_mut(id) {
            entry.last_error = Some(error);
        }
    }

    /// Remove and return the status for `id`.
    pub fn try_remove(&self, id: &str) -> Option<OperationStatus> {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        map.remove(id)
    }

    /// Snapshot of all tracked statuses.
    pub fn snapshot(&self) -> Vec<OperationStatus> {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        map.values().cloned().collect()
    }
}
