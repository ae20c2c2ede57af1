//! Dispatcher: the single control loop that moves queued jobs into runners.
//!
//! One loop owns all dispatch decisions, so the concurrency bound and the
//! oldest-first ordering need no cross-task coordination. Runners execute in
//! a `JoinSet`; a semaphore permit held for the lifetime of each runner task
//! caps concurrent processing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::database::store::JobStore;
use crate::engine::recovery::RecoverySweeper;
use crate::engine::runner::JobRunner;
use crate::services::metadata::MetadataFetcher;
use crate::services::summary::SummaryGenerator;
use crate::{Error, Result};

/// Dispatcher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatcherState {
    Idle,
    Running,
    Stopping,
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    runner: Arc<JobRunner>,
    sweeper: Arc<RecoverySweeper>,
    config: EngineConfig,
    state: Mutex<DispatcherState>,
    cancel_token: CancellationToken,
    semaphore: Arc<Semaphore>,
    /// Jobs handed to a runner task that has not finished yet. Guards
    /// against re-dispatching a job the runner has not claimed yet.
    inflight: Arc<dashmap::DashMap<String, ()>>,
    tasks: Mutex<JoinSet<()>>,
    loop_handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        fetcher: Arc<dyn MetadataFetcher>,
        generator: Arc<dyn SummaryGenerator>,
        config: EngineConfig,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&store),
            fetcher,
            generator,
            config.clone(),
            cancel_token.child_token(),
        ));
        let sweeper = Arc::new(RecoverySweeper::new(
            Arc::clone(&store),
            Duration::from_secs(config.staleness_threshold_secs),
        ));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));

        Self {
            store,
            runner,
            sweeper,
            config,
            state: Mutex::new(DispatcherState::Idle),
            cancel_token,
            semaphore,
            inflight: Arc::new(dashmap::DashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            loop_handle: Mutex::new(None),
        }
    }

    /// Start the control loop and background tasks.
    ///
    /// Runs one recovery sweep before dispatching anything; a failure there
    /// is fatal because the queue view cannot be trusted.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != DispatcherState::Idle {
                return Err(Error::Other("dispatcher already started".to_string()));
            }
            *state = DispatcherState::Running;
        }

        let recovered = match self.sweeper.sweep().await {
            Ok(recovered) => recovered,
            Err(e) => {
                // Nothing was spawned yet; leave the dispatcher restartable.
                *self.state.lock() = DispatcherState::Idle;
                return Err(e);
            }
        };
        info!(
            recovered,
            max_concurrent = self.config.max_concurrent,
            poll_interval_ms = self.config.poll_interval_ms,
            "Dispatcher starting"
        );

        if self.config.sweep_interval_secs > 0 {
            let sweeper = Arc::clone(&self.sweeper);
            let interval = Duration::from_secs(self.config.sweep_interval_secs);
            let token = self.cancel_token.child_token();
            tokio::spawn(async move {
                sweeper.run_periodic(interval, token).await;
            });
        }

        if self.config.purge_retention_days > 0 {
            let store = Arc::clone(&self.store);
            let retention_days = self.config.purge_retention_days;
            let token = self.cancel_token.child_token();
            tokio::spawn(async move {
                let interval = Duration::from_secs(24 * 60 * 60);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            if let Err(e) = store.purge_terminal(retention_days).await {
                                warn!(error = %e, "Terminal job purge failed");
                            }
                        }
                    }
                }
            });
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.control_loop().await });
        *self.loop_handle.lock() = Some(handle);

        Ok(())
    }

    async fn control_loop(&self) -> Result<()> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if self.cancel_token.is_cancelled() {
                break;
            }

            // A bookkeeping failure here means the loop cannot make sound
            // decisions; surface it for process-level restart.
            if let Err(e) = self.dispatch_ready().await {
                error!(error = %e, "Dispatcher bookkeeping failed, stopping loop");
                return Err(e);
            }

            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        debug!("Dispatcher control loop exited");
        Ok(())
    }

    /// Dispatch queued jobs into free slots, oldest first.
    async fn dispatch_ready(&self) -> Result<()> {
        // Busy jobs are the union of processing rows and in-flight runner
        // tasks: a crash-leftover row has no runner, and a freshly
        // dispatched job has no row yet.
        let mut busy_ids: HashSet<String> = self
            .store
            .list_processing()
            .await?
            .into_iter()
            .map(|j| j.id)
            .collect();
        for entry in self.inflight.iter() {
            busy_ids.insert(entry.key().clone());
        }
        let busy = busy_ids.len();
        if busy >= self.config.max_concurrent {
            return Ok(());
        }

        let queued = self.store.list_queued().await?;
        if queued.is_empty() {
            return Ok(());
        }

        let mut slots = self.config.max_concurrent - busy;
        for job in queued {
            if slots == 0 {
                break;
            }
            if self.inflight.contains_key(&job.id) {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };

            self.inflight.insert(job.id.clone(), ());
            slots -= 1;

            let runner = Arc::clone(&self.runner);
            let inflight = Arc::clone(&self.inflight);
            let id = job.id;
            debug!(job_id = %id, "Dispatching job");

            self.tasks.lock().spawn(async move {
                if let Err(e) = runner.run(&id).await {
                    // Per-job failures never take the loop down.
                    warn!(job_id = %id, error = %e, "Runner aborted");
                }
                inflight.remove(&id);
                drop(permit);
            });
        }

        Ok(())
    }

    /// Cooperative shutdown: stop the loop, then wait for in-flight runners.
    ///
    /// Surfaces a bookkeeping error if the control loop died on one.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != DispatcherState::Running {
                return Ok(());
            }
            *state = DispatcherState::Stopping;
        }

        info!("Dispatcher stopping");
        self.cancel_token.cancel();

        let handle = self.loop_handle.lock().take();
        let loop_result = match handle {
            Some(h) => h
                .await
                .map_err(|e| Error::Other(format!("control loop panicked: {e}")))?,
            None => Ok(()),
        };

        let mut tasks = {
            let mut guard = self.tasks.lock();
            std::mem::take(&mut *guard)
        };
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Runner task panicked");
            }
        }

        *self.state.lock() = DispatcherState::Idle;
        info!("Dispatcher stopped");
        loop_result
    }
}
