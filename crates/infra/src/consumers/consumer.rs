//! One puller, many processors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{error, info, instrument};

use eventline_core::{DEFAULT_PARTITION, RecordedMessage, StartFrom};

use super::processor::{Processor, ProcessorHandle, ProcessorOptions};
use super::puller::{MessageBatchPuller, PullerOptions};
use super::{ConsumerError, MessageBatchHandler, MessageHandler, MessageHandlerResult};
use crate::event_store::{EventLog, EventStore, MessageBatch};
use crate::projections::ProjectionDefinition;
use crate::sql::SqlExecutor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub partition: String,
    pub batch_size: usize,
    pub pull_frequency: Duration,
    pub stop_when_no_messages_left: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        let puller = PullerOptions::default();
        Self {
            partition: DEFAULT_PARTITION.to_string(),
            batch_size: puller.batch_size,
            pull_frequency: puller.pull_frequency,
            stop_when_no_messages_left: puller.stop_when_no_messages_left,
        }
    }
}

impl ConsumerOptions {
    pub fn partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn pull_frequency(mut self, pull_frequency: Duration) -> Self {
        self.pull_frequency = pull_frequency;
        self
    }

    pub fn stop_when_no_messages_left(mut self, stop: bool) -> Self {
        self.stop_when_no_messages_left = stop;
        self
    }

    fn puller_options(&self) -> PullerOptions {
        PullerOptions {
            batch_size: self.batch_size.max(1),
            pull_frequency: self.pull_frequency,
            stop_when_no_messages_left: self.stop_when_no_messages_left,
            partition: self.partition.clone(),
        }
    }
}

#[derive(Clone)]
struct Registered {
    handle: ProcessorHandle,
    processor: Arc<Mutex<Processor>>,
}

/// Drives registered processors from a shared puller.
///
/// Processors inherit the consumer's partition on registration.
pub struct Consumer {
    store: Arc<dyn EventStore>,
    executor: Arc<dyn SqlExecutor>,
    options: ConsumerOptions,
    processors: StdMutex<Vec<Registered>>,
    puller: MessageBatchPuller,
    stop_signal: watch::Sender<bool>,
    /// Held for the whole of `start`, processor starts included.
    running: Mutex<()>,
    closed: AtomicBool,
}

impl Consumer {
    pub fn new(
        store: Arc<dyn EventStore>,
        executor: Arc<dyn SqlExecutor>,
        options: ConsumerOptions,
    ) -> Self {
        let puller = MessageBatchPuller::new(store.clone(), options.puller_options());
        let (stop_signal, _) = watch::channel(false);
        Self {
            store,
            executor,
            options,
            processors: StdMutex::new(Vec::new()),
            puller,
            stop_signal,
            running: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Consumer over an [`EventLog`] and the executor it writes through.
    pub fn for_log(log: &EventLog, options: ConsumerOptions) -> Self {
        Self::new(Arc::new(log.clone()), log.executor().clone(), options)
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    pub fn register(&self, mut processor: Processor) -> ProcessorHandle {
        processor.set_partition(&self.options.partition);
        let handle = processor.handle();
        info!(processor_id = handle.id(), "processor registered");
        self.registered().push(Registered {
            handle: handle.clone(),
            processor: Arc::new(Mutex::new(processor)),
        });
        handle
    }

    pub fn reactor(&self, options: ProcessorOptions, handler: Arc<dyn MessageHandler>) -> ProcessorHandle {
        self.register(Processor::reactor(options, handler))
    }

    pub fn projector(&self, definition: Arc<dyn ProjectionDefinition>) -> ProcessorHandle {
        self.register(Processor::projector(definition))
    }

    pub fn handles(&self) -> Vec<ProcessorHandle> {
        self.registered().iter().map(|r| r.handle.clone()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    fn registered(&self) -> std::sync::MutexGuard<'_, Vec<Registered>> {
        self.processors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start every processor and pull until the puller stops.
    ///
    /// Resolves when the puller exits; the first processor failure of a batch
    /// is returned here after its siblings finished that batch. A second call
    /// while running fails with `AlreadyRunning` and leaves processors alone.
    #[instrument(skip(self), fields(partition = %self.options.partition), err)]
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| ConsumerError::AlreadyRunning)?;
        self.stop_signal.send_replace(false);
        let stop = self.stop_signal.subscribe();

        let processors = self.registered().clone();
        if processors.is_empty() {
            return Err(ConsumerError::Configuration(
                "cannot start a consumer without processors".to_string(),
            ));
        }

        let mut start: Option<StartFrom> = None;
        for registered in &processors {
            let resolved = registered
                .processor
                .lock()
                .await
                .start(self.store.as_ref(), self.executor.as_ref())
                .await?;
            start = Some(match start {
                Some(current) => current.most_conservative(resolved),
                None => resolved,
            });
        }
        let start = start.unwrap_or(StartFrom::Beginning);

        if *stop.borrow() {
            info!("consumer stopped before pulling");
            return Ok(());
        }
        info!(processors = processors.len(), ?start, "consumer started");

        let dispatcher = Dispatcher {
            processors,
            executor: self.executor.clone(),
        };
        self.puller.start_until(start, &dispatcher, Some(stop)).await
    }

    /// Stop pulling and wait for an in-flight `start` to return, including
    /// one still starting its processors. Idempotent.
    pub async fn stop(&self) {
        self.stop_signal.send_replace(true);
        let _ = self.running.lock().await;
    }

    /// Stop and release the executor's connections. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop().await;
        self.executor.close().await;
        info!("consumer closed");
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("options", &self.options)
            .field("processors", &self.handles())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// Fans one batch out to every active processor, one task each.
struct Dispatcher {
    processors: Vec<Registered>,
    executor: Arc<dyn SqlExecutor>,
}

#[async_trait]
impl MessageBatchHandler for Dispatcher {
    async fn handle(&self, batch: &MessageBatch) -> Result<MessageHandlerResult, ConsumerError> {
        let active: Vec<&Registered> = self
            .processors
            .iter()
            .filter(|r| r.handle.is_active())
            .collect();
        if active.is_empty() {
            return Ok(MessageHandlerResult::Stop);
        }

        let messages: Arc<[RecordedMessage]> = batch.messages.clone().into();
        let mut tasks = JoinSet::new();
        for registered in active {
            let processor = registered.processor.clone();
            let executor = self.executor.clone();
            let messages = messages.clone();
            tasks.spawn(async move {
                let mut processor = processor.lock().await;
                processor.handle_batch(&messages, executor.as_ref()).await
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok(Ok(_)) => continue,
                Ok(Err(err)) => err,
                Err(join_err) => ConsumerError::ProcessorTask(join_err.to_string()),
            };
            error!(error = %err, "processor failed batch");
            first_error.get_or_insert(err);
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        if self.processors.iter().any(|r| r.handle.is_active()) {
            Ok(MessageHandlerResult::Ack)
        } else {
            Ok(MessageHandlerResult::Stop)
        }
    }
}
