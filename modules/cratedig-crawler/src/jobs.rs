//! Registry of active crawl jobs, at most one per fan id.
//!
//! A second request for a user whose crawl is already running attaches to
//! the existing job; duplicate jobs would double-fetch and corrupt the
//! progress counters. Jobs are cooperative: nobody cancels them, and their
//! results are shared cache for future requests.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::fetcher::Fetcher;
use crate::orchestrator::Orchestrator;

/// What `start_or_attach` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStart {
    Started,
    Attached,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl JobRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a crawl job for `fan_id`, or attach to the one already running.
    pub async fn start_or_attach<F: Fetcher + 'static>(
        self: &Arc<Self>,
        orchestrator: Orchestrator<F>,
        fan_id: i64,
    ) -> JobStart {
        let mut jobs = self.jobs.lock().await;
        if let Some(handle) = jobs.get(&fan_id) {
            if !handle.is_finished() {
                return JobStart::Attached;
            }
        }

        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(err) = orchestrator.run_job(fan_id).await {
                warn!(fan_id, error = %err, "Crawl job failed; restartable on next request");
            }
            registry.jobs.lock().await.remove(&fan_id);
        });
        jobs.insert(fan_id, handle);
        JobStart::Started
    }

    /// Whether a job is currently running for this fan.
    pub async fn is_active(&self, fan_id: i64) -> bool {
        self.jobs
            .lock()
            .await
            .get(&fan_id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Wait for the job keyed by `fan_id` (if any) to finish.
    pub async fn wait_for(&self, fan_id: i64) {
        let handle = self.jobs.lock().await.remove(&fan_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
