use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::runtime::dispatcher::ShutdownToken;
use crate::store::JobStore;

/// Fixed-cadence sweep that returns jobs stranded in `processing` by a dead
/// worker to `waiting`. It cannot tell a crashed process from an overrunning
/// job, which is why the threshold must exceed the job timeout.
pub(crate) struct Recoverer {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) job_type: String,
    pub(crate) interval: Duration,
    pub(crate) threshold: Duration,
    pub(crate) shutdown: ShutdownToken,
}

impl Recoverer {
    pub(crate) async fn run(self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(job_type = %self.job_type, "recoverer shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    match self.store.recover_stuck(&self.job_type, self.threshold).await {
                        Ok(0) => {}
                        Ok(moved) => {
                            warn!(job_type = %self.job_type, moved, "returned stuck jobs to waiting");
                        }
                        Err(err) => {
                            warn!(job_type = %self.job_type, "stuck-job sweep failed: {err}");
                        }
                    }
                }
            }
        }
    }
}
