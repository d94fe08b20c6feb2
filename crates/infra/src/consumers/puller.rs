//! Polling reader over the log's global order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info, instrument};

use eventline_core::{DEFAULT_PARTITION, GlobalPosition, StartFrom};

use super::{ConsumerError, MessageBatchHandler, MessageHandlerResult};
use crate::event_store::EventStore;

/// Longest idle sleep between empty polls.
pub const MAX_IDLE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullerOptions {
    pub batch_size: usize,
    /// Sleep between polls while messages keep arriving.
    pub pull_frequency: Duration,
    /// Exit once a read returns fewer than `batch_size` messages.
    pub stop_when_no_messages_left: bool,
    pub partition: String,
}

impl Default for PullerOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            pull_frequency: Duration::from_millis(50),
            stop_when_no_messages_left: false,
            partition: DEFAULT_PARTITION.to_string(),
        }
    }
}

/// Reads batches with `global_position > cursor` and hands them to a
/// [`MessageBatchHandler`] until stopped.
pub struct MessageBatchPuller {
    store: Arc<dyn EventStore>,
    options: PullerOptions,
    stop_signal: watch::Sender<bool>,
    /// Held for the whole of `start`; `stop` waits on it.
    running: Mutex<()>,
}

impl MessageBatchPuller {
    pub fn new(store: Arc<dyn EventStore>, options: PullerOptions) -> Self {
        let (stop_signal, _) = watch::channel(false);
        Self {
            store,
            options,
            stop_signal,
            running: Mutex::new(()),
        }
    }

    pub fn options(&self) -> &PullerOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Poll until the handler returns `Stop`, the log is drained (when
    /// `stop_when_no_messages_left`), `stop` is called, or an error occurs.
    pub async fn start(
        &self,
        start_from: StartFrom,
        handler: &dyn MessageBatchHandler,
    ) -> Result<(), ConsumerError> {
        self.start_until(start_from, handler, None).await
    }

    /// [`MessageBatchPuller::start`], also ending once `until` turns `true`.
    ///
    /// `until` belongs to the caller and is never reset here, so a stop
    /// requested before the loop begins is honored.
    #[instrument(skip(self, handler, until), fields(partition = %self.options.partition), err)]
    pub async fn start_until(
        &self,
        start_from: StartFrom,
        handler: &dyn MessageBatchHandler,
        mut until: Option<watch::Receiver<bool>>,
    ) -> Result<(), ConsumerError> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| ConsumerError::AlreadyRunning)?;

        // Only a run in flight can be stopped through `stop`.
        self.stop_signal.send_replace(false);
        let mut stop = self.stop_signal.subscribe();

        let tail = match start_from {
            StartFrom::End => {
                self.store
                    .read_last_global_position(&self.options.partition)
                    .await?
            }
            _ => None,
        };
        let mut cursor: GlobalPosition = start_from.resolve(tail);
        let mut wait = self.options.pull_frequency;

        info!(start_after = %cursor, batch_size = self.options.batch_size, "puller started");

        loop {
            let external_stop = until.as_mut().is_some_and(|rx| *rx.borrow_and_update());
            if *stop.borrow_and_update() || external_stop {
                debug!("stop requested");
                break;
            }

            let batch = self
                .store
                .read_messages_batch(cursor, self.options.batch_size, &self.options.partition)
                .await?;
            let read = batch.len();

            if let Some(last) = batch.last_position {
                let result = handler.handle(&batch).await?;
                cursor = last;
                if result == MessageHandlerResult::Stop {
                    debug!(cursor = %cursor, "batch handler requested stop");
                    break;
                }
            }

            if self.options.stop_when_no_messages_left && read < self.options.batch_size {
                debug!(cursor = %cursor, "no messages left");
                break;
            }

            wait = if read == 0 {
                (wait * 2).min(MAX_IDLE_BACKOFF)
            } else {
                self.options.pull_frequency
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.changed() => {}
                _ = changed(until.as_mut()) => {}
            }
        }

        info!(cursor = %cursor, "puller stopped");
        Ok(())
    }

    /// Signal the polling loop to exit and wait for an in-flight `start` to
    /// return. Idempotent.
    pub async fn stop(&self) {
        self.stop_signal.send_replace(true);
        let _ = self.running.lock().await;
    }
}

/// Resolves when `signal` changes; never, when there is none or its sender is gone.
async fn changed(signal: Option<&mut watch::Receiver<bool>>) {
    if let Some(rx) = signal {
        if rx.changed().await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

impl std::fmt::Debug for MessageBatchPuller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBatchPuller")
            .field("options", &self.options)
            .field("running", &self.is_running())
            .finish()
    }
}
