//! Poll loop over a content-transport fetch handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{ContentTransport, FetchRequest, TransportHandle};
use crate::errors::TransportError;

/// An in-flight snapshot fetch.
///
/// The handle is released when [`FetchTask::wait`] finishes either way, or
/// when the task is dropped before completing (for example because the
/// future awaiting it was cancelled).
pub struct FetchTask {
    transport: Arc<dyn ContentTransport>,
    handle: Option<TransportHandle>,
    interval: Duration,
    last_step: String,
}

impl FetchTask {
    pub async fn start(
        transport: Arc<dyn ContentTransport>,
        request: FetchRequest,
        interval: Duration,
    ) -> Result<Self, TransportError> {
        let version = request.version_index.clone();
        let handle = transport.start_fetch(request).await?;
        debug!(handle, version = %version, "started snapshot fetch");
        Ok(Self {
            transport,
            handle: Some(handle),
            interval,
            last_step: "started".into(),
        })
    }

    /// Last step reported by the transport.
    pub fn last_step(&self) -> &str {
        &self.last_step
    }

    /// Poll until the transport reports completion. Returns the final step
    /// name on success.
    pub async fn wait(mut self) -> Result<String, TransportError> {
        let result = self.poll_until_complete().await;
        self.release();
        result
    }

    async fn poll_until_complete(&mut self) -> Result<String, TransportError> {
        let handle = self.handle.ok_or(TransportError::UnknownHandle(0))?;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let progress = self.transport.poll(handle).await?;
            if progress.error != 0 {
                return Err(TransportError::Failed {
                    step: progress.current_step,
                    code: progress.error,
                });
            }
            if progress.current_step != self.last_step {
                debug!(handle, step = %progress.current_step, "fetch progress");
                self.last_step = progress.current_step;
            }
            if progress.completed {
                return Ok(self.last_step.clone());
            }
        }
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.transport.release(handle);
            debug!(handle, "released fetch handle");
        }
    }
}

impl Drop for FetchTask {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!(step = %self.last_step, "fetch dropped before completion, releasing handle");
            self.release();
        }
    }
}
