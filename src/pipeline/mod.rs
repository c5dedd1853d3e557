// Click telemetry pipeline
//
// One `Telemetry` instance owns the buffer, the cooldown table and a single
// dispatcher worker. Callers record clicks synchronously; the worker runs the
// flush timer and any flush forced by buffer limits.
//
// - dispatch: flush, chunked delivery, retry/backoff
// - durability: snapshot persist and startup restore
// - lifecycle: worker loop, hide/unload hooks

mod dispatch;
mod durability;
mod lifecycle;

use clicktally_batch::{BufferLimits, ClickBuffer, CooldownTable};
use clicktally_breaker::{BreakerOptions, CircuitBreaker, CircuitState};
use clicktally_config::{BreakerConfig, RuntimeConfig};
use clicktally_core::{normalize_entity_id, BatchIdIssuer, ChunkLimits, ClickClassification};
use clicktally_writer::{
    BatchSink, Beacon, HttpBeacon, HttpSink, OpenDalStore, SnapshotStore, WriterError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dispatch::InterruptedBatch;
use durability::StoredSnapshot;
use lifecycle::Signal;

/// Identity used for batch ids until `set_user_id` is called.
pub const ANONYMOUS_USER: &str = "anonymous";

/// External collaborators the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub sink: Arc<dyn BatchSink>,
    pub beacon: Arc<dyn Beacon>,
    pub store: Arc<dyn SnapshotStore>,
    pub breaker: Option<Arc<CircuitBreaker>>,
}

impl Collaborators {
    pub fn new(
        sink: Arc<dyn BatchSink>,
        beacon: Arc<dyn Beacon>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            sink,
            beacon,
            store,
            breaker: None,
        }
    }

    /// Share a breaker registry with other dependencies of the host.
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// HTTP sink and beacon plus the configured storage backend.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, WriterError> {
        let sink = HttpSink::new(&config.endpoint, config.breaker.timeout())?;
        let beacon = HttpBeacon::new(&config.endpoint)?;
        let store = OpenDalStore::from_config(&config.storage)?;

        info!(
            endpoint = %sink.url(),
            storage = %config.storage.backend,
            "Initialized telemetry collaborators"
        );

        Ok(Self::new(Arc::new(sink), Arc::new(beacon), Arc::new(store)))
    }
}

/// Point-in-time view of the pipeline for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    pub buffered_entries: usize,
    pub retry_attempt: u32,
    pub timer_armed: bool,
    pub last_success_age: Duration,
    pub circuit: CircuitState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Disposed,
}

/// Mutable pipeline state. Every access goes through `Inner::state`.
struct PipelineState {
    buffer: ClickBuffer,
    cooldowns: CooldownTable,
    retry_count: u32,
    timer_armed: bool,
    user_id: Option<String>,
    stored: StoredSnapshot,
    batch_ids: BatchIdIssuer,
    /// A generation has been taken and its delivery has not settled yet.
    in_flight: bool,
    /// Continuation point of the last batch that did not fully go through.
    interrupted: Option<InterruptedBatch>,
}

struct Inner {
    config: RuntimeConfig,
    state: Mutex<PipelineState>,
    breaker: Arc<CircuitBreaker>,
    breaker_options: BreakerOptions,
    sink: Arc<dyn BatchSink>,
    beacon: Arc<dyn Beacon>,
    store: Arc<dyn SnapshotStore>,
    signals: mpsc::UnboundedSender<Signal>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Mutex<Lifecycle>,
}

/// Handle to a click telemetry pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Inner>,
}

impl Telemetry {
    pub fn new(config: RuntimeConfig, collaborators: Collaborators) -> Self {
        let now = Instant::now().into_std();
        let breaker_options = breaker_options(&config.breaker);
        let breaker = collaborators
            .breaker
            .unwrap_or_else(|| Arc::new(CircuitBreaker::new()));

        let limits = BufferLimits {
            max_entries: config.buffer.max_entries,
            max_bytes: config.buffer.max_bytes,
            entry_size_estimate: config.buffer.entry_size_estimate,
            stale_after: config.buffer.stale_flush(),
        };

        let state = PipelineState {
            buffer: ClickBuffer::new(limits, now),
            cooldowns: CooldownTable::new(config.buffer.cooldown()),
            retry_count: 0,
            timer_armed: false,
            user_id: config.endpoint.user_id.clone().filter(|u| !u.is_empty()),
            stored: StoredSnapshot::Unknown,
            batch_ids: BatchIdIssuer::new(),
            in_flight: false,
            interrupted: None,
        };

        let (signals, receiver) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                breaker,
                breaker_options,
                sink: collaborators.sink,
                beacon: collaborators.beacon,
                store: collaborators.store,
                signals,
                receiver: Mutex::new(Some(receiver)),
                worker: Mutex::new(None),
                lifecycle: Mutex::new(Lifecycle::Created),
            }),
        }
    }

    /// Spawn the dispatcher worker and restore any persisted snapshot.
    /// Calling it again is a no-op.
    pub async fn start(&self) {
        let receiver = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle != Lifecycle::Created {
                return;
            }
            *lifecycle = Lifecycle::Running;
            self.inner.receiver.lock().take()
        };
        let Some(receiver) = receiver else {
            return;
        };

        let handle = tokio::spawn(lifecycle::run_worker(Arc::downgrade(&self.inner), receiver));
        *self.inner.worker.lock() = Some(handle);

        info!(
            flush_interval = ?self.inner.config.dispatch.flush_interval(),
            breaker_key = %self.inner.config.dispatch.breaker_key,
            "Telemetry pipeline started"
        );

        self.inner.load_and_merge().await;
    }

    /// Cancel pending timers, stop the worker and persist whatever is still
    /// buffered. Calling it again is a no-op.
    pub async fn dispose(&self) {
        let handle = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle == Lifecycle::Disposed {
                return;
            }
            *lifecycle = Lifecycle::Disposed;
            self.inner.worker.lock().take()
        };

        self.inner.state.lock().timer_armed = false;
        self.inner.signal(Signal::Shutdown);

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatcher worker ended abnormally");
            }
        }

        // Never started: forced flushes are still sitting in the channel.
        let pending = self.inner.receiver.lock().take();
        if let Some(mut receiver) = pending {
            let mut state = self.inner.state.lock();
            while let Ok(signal) = receiver.try_recv() {
                if let Signal::Dispatch(batch) = signal {
                    state.buffer.merge(batch.records);
                }
            }
        }

        self.inner.persist().await;
        info!("Telemetry pipeline disposed");
    }

    /// Count one click on `entity_id`.
    ///
    /// Blank ids and repeats inside the cooldown window are dropped silently.
    /// When the buffer is at its limits the current generation is handed to
    /// the worker before the increment lands, unless an earlier generation is
    /// still being delivered.
    pub fn record_click(
        &self,
        entity_id: &str,
        shop_id: Option<&str>,
        classification: ClickClassification,
    ) {
        let raw = entity_id.trim();
        if raw.is_empty() {
            debug!("Ignoring click with empty entity id");
            return;
        }
        if *self.inner.lifecycle.lock() == Lifecycle::Disposed {
            debug!(entity_id = %raw, "Ignoring click after dispose");
            return;
        }
        let Some(key) = normalize_entity_id(raw) else {
            return;
        };

        let now = Instant::now();
        let mut state = self.inner.state.lock();

        if !state.cooldowns.try_record(raw, now.into_std()) {
            debug!(entity_id = %raw, "Click inside cooldown window");
            return;
        }

        let current_size = state.buffer.len();
        if !state.in_flight && state.buffer.should_force_flush(current_size, now.into_std()) {
            if let Some(batch) = self.inner.take_batch(&mut state) {
                info!(
                    batch_id = %batch.batch_id,
                    entries = batch.records.len(),
                    "Buffer limit reached, forcing flush"
                );
                self.inner.signal(Signal::Dispatch(batch));
            }
        }

        let count = state.buffer.increment(
            key,
            shop_id.map(str::to_string),
            classification,
            now.into_std(),
        );

        if !state.timer_armed {
            let at = now + self.inner.config.dispatch.flush_interval();
            self.inner.arm(&mut state, at);
        }

        debug!(
            entity_id = %key,
            classification = %classification,
            count,
            "Click recorded"
        );
    }

    pub fn record_shop_click(&self, shop_id: &str) {
        self.record_click(shop_id, None, ClickClassification::Shop);
    }

    /// Identity that future batch ids are derived from. `None` reverts to
    /// the anonymous identity.
    pub fn set_user_id(&self, user_id: Option<String>) {
        self.inner.state.lock().user_id = user_id.filter(|u| !u.is_empty());
    }

    /// Flush the buffer now and wait for delivery to settle.
    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Write the buffer to durable storage.
    pub async fn persist(&self) {
        self.inner.persist().await;
    }

    /// Restore a persisted snapshot into the buffer. `start` already does this.
    pub async fn load_and_merge(&self) -> usize {
        self.inner.load_and_merge().await
    }

    /// The host is going to the background.
    pub async fn on_hidden(&self) {
        self.inner.on_hidden().await;
    }

    /// The host is going away. Hands the buffer to the beacon without waiting.
    pub async fn on_unload(&self) {
        self.inner.on_unload().await;
    }

    pub fn stats(&self) -> PipelineStats {
        let now = Instant::now().into_std();
        let state = self.inner.state.lock();
        PipelineStats {
            buffered_entries: state.buffer.len(),
            retry_attempt: state.retry_count,
            timer_armed: state.timer_armed,
            last_success_age: now.saturating_duration_since(state.buffer.last_success()),
            circuit: self
                .inner
                .breaker
                .state(&self.inner.config.dispatch.breaker_key),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner.breaker
    }
}

impl Inner {
    fn chunk_limits(&self) -> ChunkLimits {
        ChunkLimits {
            max_entries: self.config.dispatch.chunk_max_entries,
            max_bytes: self.config.dispatch.chunk_max_bytes,
        }
    }

    fn signal(&self, signal: Signal) {
        if self.signals.send(signal).is_err() {
            debug!("Dispatcher worker is gone, dropping signal");
        }
    }

    /// Replace any pending timer with one firing at `at`.
    fn arm(&self, state: &mut PipelineState, at: Instant) {
        state.timer_armed = true;
        self.signal(Signal::Arm(at));
    }

    fn arm_if_idle(&self, state: &mut PipelineState) {
        if !state.timer_armed {
            let at = Instant::now() + self.config.dispatch.flush_interval();
            self.arm(state, at);
        }
    }

    fn disarm(&self, state: &mut PipelineState) {
        if state.timer_armed {
            state.timer_armed = false;
            self.signal(Signal::Disarm);
        }
    }
}

fn breaker_options(config: &BreakerConfig) -> BreakerOptions {
    BreakerOptions::default()
        .with_failure_threshold(config.failure_threshold)
        .with_success_threshold(config.success_threshold)
        .with_timeout(config.timeout())
        .with_cooldown_period(config.cooldown())
}
