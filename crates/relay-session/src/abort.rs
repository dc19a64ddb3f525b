//! Per-run cancellation bookkeeping.
//!
//! Cancellation is cooperative: aborting a run flips a flag that chunk
//! producers poll and cancels the run's token, but nothing here can stop
//! the engine's computation.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct RunEntry {
    session_key: String,
    aborted: bool,
    snapshot: String,
    cancel: Option<CancellationToken>,
}

impl RunEntry {
    fn mark_aborted(&mut self) {
        self.aborted = true;
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }
}

/// Tracks every in-progress run by run id.
#[derive(Debug, Default)]
pub struct AbortRegistry {
    runs: Mutex<HashMap<String, RunEntry>>,
}

impl AbortRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RunEntry>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a run.
    ///
    /// Returns `false` and leaves the existing entry untouched if the run id
    /// is already tracked.
    pub fn register(
        &self,
        run_id: impl Into<String>,
        session_key: impl Into<String>,
        cancel: Option<CancellationToken>,
    ) -> bool {
        let run_id = run_id.into();
        let mut runs = self.lock();
        if runs.contains_key(&run_id) {
            tracing::warn!(run_id = %run_id, "Run id already tracked");
            return false;
        }
        runs.insert(
            run_id,
            RunEntry {
                session_key: session_key.into(),
                aborted: false,
                snapshot: String::new(),
                cancel,
            },
        );
        true
    }

    /// Register a run whose bookkeeping is released when the returned
    /// guard drops. Returns `None` if the run id is already tracked.
    #[must_use]
    pub fn track(
        self: &Arc<Self>,
        run_id: impl Into<String>,
        session_key: impl Into<String>,
        cancel: Option<CancellationToken>,
    ) -> Option<RunGuard> {
        let run_id = run_id.into();
        self.register(run_id.clone(), session_key, cancel)
            .then(|| RunGuard {
                registry: Arc::clone(self),
                run_id,
            })
    }

    /// Whether the run has been aborted. Unknown runs are not aborted.
    #[must_use]
    pub fn is_aborted(&self, run_id: &str) -> bool {
        self.lock().get(run_id).is_some_and(|r| r.aborted)
    }

    /// Store the latest cumulative output for the run.
    pub fn record_snapshot(&self, run_id: &str, buffer: &str) {
        if let Some(entry) = self.lock().get_mut(run_id) {
            buffer.clone_into(&mut entry.snapshot);
        }
    }

    /// Abort one run, returning its last recorded output.
    ///
    /// Returns `None` without side effects if the run is unknown.
    pub fn abort(&self, run_id: &str) -> Option<String> {
        let mut runs = self.lock();
        let entry = runs.get_mut(run_id)?;
        entry.mark_aborted();
        tracing::info!(run_id = %run_id, "Run aborted");
        Some(entry.snapshot.clone())
    }

    /// Abort every not-yet-aborted run of a session.
    ///
    /// Returns the ids of the runs this call aborted.
    pub fn abort_by_session(&self, session_key: &str) -> Vec<String> {
        let mut runs = self.lock();
        let mut aborted: Vec<String> = runs
            .iter_mut()
            .filter(|(_, r)| r.session_key == session_key && !r.aborted)
            .map(|(run_id, r)| {
                r.mark_aborted();
                run_id.clone()
            })
            .collect();
        aborted.sort();
        if !aborted.is_empty() {
            tracing::info!(session_key, count = aborted.len(), "Session runs aborted");
        }
        aborted
    }

    /// Session key a run belongs to.
    #[must_use]
    pub fn session_key(&self, run_id: &str) -> Option<String> {
        self.lock().get(run_id).map(|r| r.session_key.clone())
    }

    /// Drop a run's bookkeeping once its terminal event is delivered.
    pub fn release(&self, run_id: &str) {
        self.lock().remove(run_id);
    }

    /// Number of tracked runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no runs are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Releases a run's bookkeeping when dropped.
#[derive(Debug)]
pub struct RunGuard {
    registry: Arc<AbortRegistry>,
    run_id: String,
}

impl RunGuard {
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.release(&self.run_id);
    }
}
