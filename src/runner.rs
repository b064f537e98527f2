use std::{
    path::PathBuf,
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result};

use crate::{
    config::Settings,
    executor::{RequestExecutor, RetryPolicy},
    git::GitSource,
    orchestrator::{RunOutcome, UploadOrchestrator},
    transport::Transport,
};

const WORKER_THREAD_NAME: &str = "civis-git-upload";

struct Worker {
    handle: JoinHandle<()>,
    done: mpsc::Receiver<RunOutcome>,
}

/// Runs the upload pipeline on a dedicated OS thread.
///
/// At most one run is tracked at a time. `shutdown` waits for it (bounded
/// by an optional timeout) and forgets it, so the next `start` launches a
/// fresh run.
pub struct BackgroundRunner {
    settings: Settings,
    transport: Arc<dyn Transport>,
    git: Arc<dyn GitSource>,
    retry_policy: RetryPolicy,
    worker: Option<Worker>,
}

impl BackgroundRunner {
    pub fn new(settings: Settings, transport: Arc<dyn Transport>, git: Arc<dyn GitSource>) -> Self {
        Self {
            settings,
            transport,
            git,
            retry_policy: RetryPolicy::default(),
            worker: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Whether a run has been started and not yet shut down
    pub fn is_tracking(&self) -> bool {
        self.worker.is_some()
    }

    /// Launch one upload run in the background.
    ///
    /// Returns `false` without doing anything if a run is already tracked.
    pub fn start(&mut self, cwd: Option<PathBuf>) -> Result<bool> {
        if self.worker.is_some() {
            tracing::debug!("git metadata upload already running, not starting another");
            return Ok(false);
        }

        let executor = RequestExecutor::new(
            self.settings.mode,
            self.settings.base_url(),
            self.settings.credentials(),
            Arc::clone(&self.transport),
        )
        .with_retry_policy(self.retry_policy);
        let orchestrator = UploadOrchestrator::new(
            executor,
            Arc::clone(&self.git),
            self.settings.repository_url.clone(),
        );

        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let outcome = orchestrator.run(cwd.as_deref());
                // The runner may have stopped waiting already
                let _ = tx.send(outcome);
            })
            .context("Failed to spawn git upload thread")?;

        tracing::debug!("Started git metadata upload thread");
        self.worker = Some(Worker { handle, done: rx });
        Ok(true)
    }

    /// Wait for the tracked run, up to `timeout` (forever when `None`).
    ///
    /// Returns the run's outcome if it finished in time. A run still going
    /// when the timeout elapses is detached and left to finish on its own.
    pub fn shutdown(&mut self, timeout: Option<Duration>) -> Option<RunOutcome> {
        let worker = self.worker.take()?;

        let outcome = match timeout {
            Some(timeout) => worker.done.recv_timeout(timeout).ok(),
            None => worker.done.recv().ok(),
        };

        if outcome.is_some() || worker.handle.is_finished() {
            if worker.handle.join().is_err() {
                tracing::error!("git metadata upload thread panicked");
            }
        } else {
            tracing::warn!(
                "git metadata upload still running after {:?}, detaching",
                timeout
            );
        }

        outcome
    }
}
