//! Recovery sweeper: requeues processing jobs abandoned by a crashed or
//! restarted process.
//!
//! A processing job whose `started_at` is older than the staleness threshold
//! is treated as stalled and moved back to the queue with its attempt
//! counter intact. Jobs that moved on between enumeration and requeue are
//! skipped, which makes back-to-back sweeps idempotent.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database::store::JobStore;
use crate::{Error, Result};

pub struct RecoverySweeper {
    store: Arc<dyn JobStore>,
    staleness_threshold: Duration,
}

impl RecoverySweeper {
    pub fn new(store: Arc<dyn JobStore>, staleness_threshold: Duration) -> Self {
        Self {
            store,
            staleness_threshold,
        }
    }

    /// Run one sweep. Returns the number of jobs requeued.
    ///
    /// Enumeration failure is propagated; per-job requeue failures are
    /// logged and skipped so one bad row cannot block recovery of the rest.
    pub async fn sweep(&self) -> Result<usize> {
        let processing = self.store.list_processing().await?;
        let now = Utc::now();
        let mut recovered = 0;

        for job in processing {
            let started_at = match &job.started_at {
                Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                    Ok(ts) => ts.with_timezone(&Utc),
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "Unparseable started_at, skipping");
                        continue;
                    }
                },
                None => {
                    warn!(job_id = %job.id, "Processing job without started_at, skipping");
                    continue;
                }
            };

            let age = now.signed_duration_since(started_at);
            if age.to_std().unwrap_or(Duration::ZERO) <= self.staleness_threshold {
                continue;
            }

            warn!(
                job_id = %job.id,
                started_at = %started_at,
                age_secs = age.num_seconds(),
                "Stalled job detected"
            );

            match self.store.requeue(&job.id).await {
                Ok(()) => {
                    info!(
                        job_id = %job.id,
                        attempt = job.attempt_count,
                        "Stalled job requeued"
                    );
                    recovered += 1;
                }
                // The job moved on since we listed it; nothing to recover.
                Err(Error::NotFound { .. } | Error::InvalidTransition { .. }) => {
                    debug!(job_id = %job.id, "Job no longer stalled, skipping");
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Failed to requeue stalled job");
                }
            }
        }

        if recovered > 0 {
            info!(count = recovered, "Recovery sweep requeued stalled jobs");
        }
        Ok(recovered)
    }

    /// Run periodic sweeps until cancelled.
    pub async fn run_periodic(&self, interval: Duration, cancel_token: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Recovery sweeper shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "Recovery sweep failed");
                    }
                }
            }
        }
    }
}
