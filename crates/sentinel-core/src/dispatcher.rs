//! Fan-out of decoded events to consumers.
//!
//! A drain task pulls batches of raw records from a [`RecordSource`], decodes
//! them and hands every event to the subscribers whose capabilities satisfy
//! the requirements of its event type. Each subscriber owns a bounded queue
//! and a delivery task: a full queue drops the event for that subscriber only,
//! the drain task never waits on consumers.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bpf_common::{RawEventRecord, RecordError, RecordSource};
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::{JoinError, JoinHandle},
};

use crate::{
    capability::{CapabilityModel, CapabilitySet},
    decoder::{DecoderRegistry, MalformedRecord},
    event::DecodedEvent,
    hook_point::HookPointRegistry,
    shutdown::{ShutdownSender, ShutdownSignal},
};

/// Receives the events a subscriber is entitled to, in emission order.
pub trait EventHandler: Send + 'static {
    fn handle(&mut self, event: Arc<DecodedEvent>);
}

impl<F> EventHandler for F
where
    F: FnMut(Arc<DecodedEvent>) + Send + 'static,
{
    fn handle(&mut self, event: Arc<DecodedEvent>) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionHandle(u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Capacity of every subscriber queue.
    pub queue_size: usize,
    /// Maximum number of records taken from the source at once.
    pub batch_size: usize,
    /// Longest wait for records before checking for shutdown again.
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            batch_size: 64,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DrainState {
    Idle,
    Draining,
    Stopped,
}

/// Why a drain task stopped.
#[derive(Debug)]
pub enum DrainExit {
    Shutdown,
    SourceClosed,
    /// Reading the source failed. Its records are no longer dispatched.
    SourceFailed(RecordError),
    /// The task panicked or was cancelled.
    Aborted(JoinError),
}

impl DrainExit {
    /// Stopped on request or at the end of the source.
    pub fn is_clean(&self) -> bool {
        matches!(self, DrainExit::Shutdown | DrainExit::SourceClosed)
    }
}

impl fmt::Display for DrainExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainExit::Shutdown => write!(f, "shutdown"),
            DrainExit::SourceClosed => write!(f, "source closed"),
            DrainExit::SourceFailed(err) => write!(f, "source failed: {err}"),
            DrainExit::Aborted(err) => write!(f, "aborted: {err}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchCounters {
    pub dispatched: u64,
    pub decode_errors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub handle: SubscriptionHandle,
    pub capabilities: CapabilitySet,
    pub delivered: u64,
    pub dropped: u64,
}

struct Subscriber {
    handle: SubscriptionHandle,
    capabilities: CapabilitySet,
    tx: mpsc::Sender<Arc<DecodedEvent>>,
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

struct Shared {
    registry: Arc<HookPointRegistry>,
    model: Arc<CapabilityModel>,
    decoders: DecoderRegistry,
    config: DispatcherConfig,
    subscribers: RwLock<Vec<Subscriber>>,
    next_handle: AtomicU64,
    dispatched: AtomicU64,
    decode_errors: AtomicU64,
}

/// Cheaply cloneable entry point for subscribers and drain tasks.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<HookPointRegistry>,
        model: Arc<CapabilityModel>,
        decoders: DecoderRegistry,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                model,
                decoders,
                config,
                subscribers: RwLock::new(Vec::new()),
                next_handle: AtomicU64::new(1),
                dispatched: AtomicU64::new(0),
                decode_errors: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    /// Register a consumer. Its handler runs on a dedicated task, which must
    /// be spawned from within a tokio runtime.
    ///
    /// An event whose handler panics counts as dropped for that consumer,
    /// which keeps receiving the following ones.
    pub fn subscribe(
        &self,
        capabilities: CapabilitySet,
        mut handler: impl EventHandler,
    ) -> SubscriptionHandle {
        if let Err(unknown) = self.shared.model.validate(&capabilities) {
            log::warn!("subscriber holds undeclared capability {unknown}");
        }

        let handle = SubscriptionHandle(self.shared.next_handle.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::channel::<Arc<DecodedEvent>>(self.shared.config.queue_size.max(1));
        let delivered = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));

        let task_delivered = delivered.clone();
        let task_dropped = dropped.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let event_type = event.event_type;
                match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
                    Ok(()) => task_delivered.fetch_add(1, Ordering::Relaxed),
                    Err(_) => {
                        log::error!("subscriber {handle} panicked handling {event_type} event");
                        task_dropped.fetch_add(1, Ordering::Relaxed)
                    }
                };
            }
            log::debug!("subscriber {handle} stopped");
        });

        self.write_subscribers().push(Subscriber {
            handle,
            capabilities,
            tx,
            delivered,
            dropped,
        });
        log::debug!("subscriber {handle} registered");
        handle
    }

    /// Remove a consumer. Events already queued are still delivered.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self.write_subscribers();
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.handle != handle);
        before != subscribers.len()
    }

    /// Decode a record and deliver it. Returns the number of subscribers it
    /// was queued for.
    ///
    /// Malformed records are counted and dropped, never propagated further.
    pub fn dispatch(
        &self,
        record: Result<RawEventRecord, RecordError>,
    ) -> Result<usize, MalformedRecord> {
        let (event, required) = match self.decode(record) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.shared.decode_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("dropping malformed record: {err}");
                return Err(err);
            }
        };

        let event = Arc::new(event);
        let mut queued = 0;
        for subscriber in self.read_subscribers().iter() {
            if !CapabilityModel::consumer_satisfies(&subscriber.capabilities, &required) {
                continue;
            }
            let reason = match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {
                    queued += 1;
                    continue;
                }
                Err(mpsc::error::TrySendError::Full(_)) => "queue full",
                Err(mpsc::error::TrySendError::Closed(_)) => "delivery task gone",
            };
            subscriber.dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                target: event.hook_point.as_str(),
                "subscriber {} {reason}, dropping {} event",
                subscriber.handle,
                event.event_type
            );
        }
        self.shared.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(queued)
    }

    fn decode(
        &self,
        record: Result<RawEventRecord, RecordError>,
    ) -> Result<(DecodedEvent, CapabilitySet), MalformedRecord> {
        let record = record.map_err(|err| MalformedRecord::Unreadable(err.to_string()))?;
        let hook_point = self
            .shared
            .registry
            .by_id(record.tag.hook_point)
            .ok_or(MalformedRecord::UnknownHookPoint(record.tag.hook_point))?;
        let decoder = self
            .shared
            .decoders
            .get(record.tag.event_code)
            .ok_or(MalformedRecord::UnknownEventCode(record.tag.event_code))?;
        let event = decoder.decode(hook_point.name(), &record)?;
        let required = self
            .shared
            .model
            .required_capabilities(hook_point.event_types(), event.event_type)
            .ok_or_else(|| MalformedRecord::UndeclaredEventType {
                hook_point: hook_point.name().to_string(),
                event_type: event.event_type,
            })?;
        Ok((event, required))
    }

    pub fn counters(&self) -> DispatchCounters {
        DispatchCounters {
            dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            decode_errors: self.shared.decode_errors.load(Ordering::Relaxed),
        }
    }

    pub fn consumer_stats(&self) -> Vec<ConsumerStats> {
        self.read_subscribers()
            .iter()
            .map(|subscriber| ConsumerStats {
                handle: subscriber.handle,
                capabilities: subscriber.capabilities.clone(),
                delivered: subscriber.delivered.load(Ordering::Relaxed),
                dropped: subscriber.dropped.load(Ordering::Relaxed),
            })
            .collect()
    }

    fn dispatch_batch(
        &self,
        state: &watch::Sender<DrainState>,
        batch: &mut Vec<Result<RawEventRecord, RecordError>>,
    ) {
        if batch.is_empty() {
            return;
        }
        state.send_replace(DrainState::Draining);
        for record in batch.drain(..) {
            let _ = self.dispatch(record);
        }
        state.send_replace(DrainState::Idle);
    }

    /// Start a task draining `source` until shutdown or until the source closes.
    ///
    /// On shutdown, records the source already holds are dispatched before
    /// the task stops.
    pub fn spawn_drain(&self, mut source: Box<dyn RecordSource>) -> DrainHandle {
        let (shutdown_tx, mut shutdown) = ShutdownSignal::new();
        let (state_tx, state_rx) = watch::channel(DrainState::Idle);
        let dispatcher = self.clone();
        let DispatcherConfig {
            batch_size,
            poll_interval,
            ..
        } = self.shared.config;
        let batch_size = batch_size.max(1);

        let task = tokio::spawn(async move {
            let mut batch = Vec::with_capacity(batch_size);
            let exit = loop {
                let filled = tokio::select! {
                    biased;
                    _ = shutdown.recv() => {
                        // last batch: only what is ready without waiting
                        let _ = tokio::time::timeout(
                            Duration::ZERO,
                            source.fill_batch(&mut batch, batch_size),
                        )
                        .await;
                        dispatcher.dispatch_batch(&state_tx, &mut batch);
                        break DrainExit::Shutdown;
                    }
                    filled = tokio::time::timeout(
                        poll_interval,
                        source.fill_batch(&mut batch, batch_size),
                    ) => filled,
                };
                match filled {
                    // nothing arrived within the poll interval
                    Err(_elapsed) => continue,
                    Ok(Err(RecordError::Closed)) => {
                        log::info!("record source {} closed", source.name());
                        break DrainExit::SourceClosed;
                    }
                    Ok(Err(err)) => {
                        log::error!("reading record source {}: {err}", source.name());
                        break DrainExit::SourceFailed(err);
                    }
                    Ok(Ok(())) => dispatcher.dispatch_batch(&state_tx, &mut batch),
                }
            };
            state_tx.send_replace(DrainState::Stopped);
            exit
        });

        DrainHandle {
            shutdown: Some(shutdown_tx),
            state: state_rx,
            task,
        }
    }

    fn read_subscribers(&self) -> std::sync::RwLockReadGuard<'_, Vec<Subscriber>> {
        self.shared
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_subscribers(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Subscriber>> {
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Controls a running drain task. Dropping the handle stops the task.
pub struct DrainHandle {
    shutdown: Option<ShutdownSender>,
    state: watch::Receiver<DrainState>,
    task: JoinHandle<DrainExit>,
}

impl DrainHandle {
    pub fn state(&self) -> DrainState {
        *self.state.borrow()
    }

    /// A receiver following every state transition.
    pub fn watch_state(&self) -> watch::Receiver<DrainState> {
        self.state.clone()
    }

    /// Ask the task to stop once its current batch is dispatched and wait for it.
    ///
    /// A task that already stopped on its own reports why.
    pub async fn stop(mut self) -> DrainExit {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send_signal();
        }
        match (&mut self.task).await {
            Ok(exit) => exit,
            Err(err) => {
                log::error!("drain task failed: {err}");
                DrainExit::Aborted(err)
            }
        }
    }
}

impl Drop for DrainHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send_signal();
        }
    }
}
