//! Polling a remote long-running operation to completion.
//!
//! The waiter checks elapsed time before every sleep, so a wait gives up at
//! most one poll interval after the deadline. Status-check failures are
//! tolerated up to [`WaiterSettings::transient_failures`] in a row.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::WaitError;
use crate::remote::{RemoteOperation, RemoteStore};

#[derive(Debug, Clone, Copy)]
pub struct WaiterSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Consecutive failed status checks tolerated before giving up.
    pub transient_failures: u32,
}

impl Default for WaiterSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
            transient_failures: 2,
        }
    }
}

pub struct OperationWaiter {
    remote: Arc<dyn RemoteStore>,
    settings: WaiterSettings,
}

impl OperationWaiter {
    pub fn new(remote: Arc<dyn RemoteStore>, settings: WaiterSettings) -> Self {
        Self { remote, settings }
    }

    pub fn settings(&self) -> WaiterSettings {
        self.settings
    }

    /// Waits for `operation` to finish.
    ///
    /// Returns `Ok(None)` when the handle has no name, since there is
    /// nothing to track. Otherwise returns the final operation state.
    pub async fn wait(
        &self,
        operation: RemoteOperation,
    ) -> Result<Option<RemoteOperation>, WaitError> {
        let Some(name) = operation.name.clone() else {
            return Ok(None);
        };

        let started = Instant::now();
        let mut current = operation;
        let mut polls: u32 = 0;
        let mut consecutive_failures: u32 = 0;

        while !current.done {
            let elapsed = started.elapsed();
            if elapsed > self.settings.timeout {
                warn!(operation = %name, polls, "Operation timed out");
                return Err(WaitError::Timeout {
                    elapsed_secs: elapsed.as_secs(),
                    polls,
                });
            }

            tokio::time::sleep(self.settings.poll_interval).await;
            polls += 1;

            match self.remote.get_operation(&name).await {
                Ok(status) => {
                    consecutive_failures = 0;
                    current = status;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures > self.settings.transient_failures {
                        return Err(WaitError::Failed(format!(
                            "Failed to get operation status: {}",
                            e
                        )));
                    }
                    warn!(
                        operation = %name,
                        attempt = consecutive_failures,
                        error = %e,
                        "Operation status check failed, will retry"
                    );
                }
            }
        }

        if let Some(error) = &current.error {
            let message = if error.message.is_empty() {
                "remote operation reported an error".to_string()
            } else {
                error.message.clone()
            };
            return Err(WaitError::Failed(message));
        }

        info!(operation = %name, polls, "Operation completed");
        Ok(Some(current))
    }
}
