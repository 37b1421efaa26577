use crate::collaborators::{Datastore, ManifestParser};
use crate::config::{ConfigError, PipelineConfig, SharedConfig};
use crate::control::{
    ControlChannel, ControlChannelError, ControlContext, InstructionAck, InstructionHandler,
    InstructionRouter,
};
use crate::error_handler::{ErrorHandler, RetryPolicy};
use crate::event::{classify, ChangeKind, ClassifiedEvent};
use crate::observability::logging::{JsonLineLogger, PipelineLog};
use crate::observability::metrics::ProcessingMetrics;
use crate::observability::StatusSnapshot;
use crate::orphan::OrphanManager;
use crate::processor::EventProcessor;
use crate::runtime::queue::EventQueue;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

const MODULE: &str = "epu_ingest::supervisor";
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Background workers owned by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkerKind {
    Processing,
    OrphanSweep,
    Control,
    Heartbeat,
}

impl WorkerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerKind::Processing => "processing",
            WorkerKind::OrphanSweep => "orphan_sweep",
            WorkerKind::Control => "control",
            WorkerKind::Heartbeat => "heartbeat",
        }
    }

    pub fn all() -> [WorkerKind; 4] {
        [
            WorkerKind::Processing,
            WorkerKind::OrphanSweep,
            WorkerKind::Control,
            WorkerKind::Heartbeat,
        ]
    }

    fn thread_name(self) -> String {
        format!("epu-ingest-{}", self.as_str())
    }
}

/// Stop flag that also wakes workers sleeping on it.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    triggered: Mutex<bool>,
    cv: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let mut triggered = self.lock();
        *triggered = true;
        self.cv.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.lock()
    }

    /// Sleeps up to `timeout`; returns true as soon as the signal fires.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut triggered = self.lock();
        while !*triggered {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .cv
                .wait_timeout(triggered, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            triggered = next;
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.triggered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Iteration counter for one worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerMetrics {
    iterations: Arc<AtomicU64>,
}

impl WorkerMetrics {
    fn record(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineWorkerMetrics {
    processing: WorkerMetrics,
    orphan_sweep: WorkerMetrics,
    control: WorkerMetrics,
    heartbeat: WorkerMetrics,
}

impl PipelineWorkerMetrics {
    pub fn worker(&self, kind: WorkerKind) -> &WorkerMetrics {
        match kind {
            WorkerKind::Processing => &self.processing,
            WorkerKind::OrphanSweep => &self.orphan_sweep,
            WorkerKind::Control => &self.control,
            WorkerKind::Heartbeat => &self.heartbeat,
        }
    }
}

/// Receives a status snapshot on every heartbeat tick.
pub trait HeartbeatSink: Send + 'static {
    fn beat(&mut self, snapshot: &StatusSnapshot);
}

impl<F> HeartbeatSink for F
where
    F: FnMut(&StatusSnapshot) + Send + 'static,
{
    fn beat(&mut self, snapshot: &StatusSnapshot) {
        self(snapshot);
    }
}

/// Producer entry point for the filesystem watcher.
#[derive(Clone)]
pub struct IngestHandle {
    queue: EventQueue,
    errors: Arc<ErrorHandler>,
    log: PipelineLog,
}

impl IngestHandle {
    /// Classifies a raw notification and enqueues it. Returns false for
    /// paths that match no EPU shape.
    pub fn submit(
        &self,
        path: impl AsRef<Path>,
        change_kind: ChangeKind,
        observed_at: SystemTime,
    ) -> bool {
        self.submit_event(classify(path, change_kind, observed_at))
    }

    pub fn submit_event(&self, event: ClassifiedEvent) -> bool {
        let path = event.path_key();
        // A fresh notification makes a permanently failed path eligible again.
        self.errors.clear_failure(&path);
        if event.is_unknown() {
            self.log
                .debug(MODULE, Some(&path), "dropping event for unrecognized file");
            return false;
        }
        self.queue.enqueue(event);
        true
    }
}

/// Which workers stopped within the join timeout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub joined: Vec<WorkerKind>,
    pub timed_out: Vec<WorkerKind>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn {worker} worker: {source}")]
    Spawn {
        worker: &'static str,
        source: std::io::Error,
    },
}

/// Builder for an [`IngestPipeline`].
pub struct IngestPipelineBuilder {
    config: PipelineConfig,
    parser: Arc<dyn ManifestParser>,
    datastore: Arc<dyn Datastore>,
    log: Option<PipelineLog>,
    control: Option<Box<dyn ControlChannel>>,
    heartbeat: Option<Box<dyn HeartbeatSink>>,
    handlers: Vec<(String, InstructionHandler)>,
}

impl IngestPipelineBuilder {
    /// Shares an existing log instead of building one from the logging config.
    pub fn log(mut self, log: PipelineLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn control_channel(mut self, channel: impl ControlChannel + 'static) -> Self {
        self.control = Some(Box::new(channel));
        self
    }

    pub fn heartbeat_sink(mut self, sink: impl HeartbeatSink) -> Self {
        self.heartbeat = Some(Box::new(sink));
        self
    }

    pub fn instruction_handler<F>(mut self, instruction_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&ControlContext, &Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.handlers
            .push((instruction_type.into(), Box::new(handler)));
        self
    }

    /// Validates the config, wires the components, and spawns the workers.
    pub fn start(self) -> Result<IngestPipeline, SupervisorError> {
        self.config.validate()?;
        let config = self.config;
        let log = self.log.unwrap_or_else(|| {
            PipelineLog::new(
                JsonLineLogger::new(config.rotation_policy())
                    .with_stderr_mirror(config.logging.mirror_stderr),
            )
        });
        log.set_level(config.logging.level);

        let queue = EventQueue::new(config.queue.capacity);
        let errors = Arc::new(ErrorHandler::new(config.retry_policy()));
        let processor = Arc::new(
            EventProcessor::builder(self.parser, self.datastore)
                .orphans(Arc::new(OrphanManager::new()))
                .error_handler(errors.clone())
                .metrics(Arc::new(ProcessingMetrics::new(config.metrics.latency_window)))
                .log(log.clone())
                .options(config.processor_options())
                .build(),
        );
        let shared = SharedConfig::new(config.clone());
        let context = ControlContext {
            processor: processor.clone(),
            queue: queue.clone(),
            config: shared.clone(),
        };
        let mut router = InstructionRouter::new(context);
        for (instruction_type, handler) in self.handlers {
            router.register(instruction_type, handler);
        }
        let router = Arc::new(router);

        // Dropping a half-started pipeline fires the shutdown signal.
        let pipeline = IngestPipeline {
            queue,
            processor,
            config: shared,
            router,
            log,
            signal: Arc::new(ShutdownSignal::new()),
            metrics: PipelineWorkerMetrics::default(),
            joins: Mutex::new(Vec::new()),
            join_timeout: Duration::from_millis(config.shutdown.join_timeout_ms),
            stopped: AtomicBool::new(false),
        };
        pipeline.spawn(WorkerKind::Processing, processing_loop)?;
        pipeline.spawn(WorkerKind::OrphanSweep, orphan_sweep_loop)?;
        if let Some(channel) = self.control {
            pipeline.spawn(WorkerKind::Control, move |worker| {
                control_loop(worker, channel)
            })?;
        }
        if let Some(interval_ms) = config.heartbeat.interval_ms {
            let sink = self.heartbeat;
            pipeline.spawn(WorkerKind::Heartbeat, move |worker| {
                heartbeat_loop(worker, Duration::from_millis(interval_ms), sink)
            })?;
        }
        pipeline.log.info(MODULE, None, "ingest pipeline started");
        Ok(pipeline)
    }
}

/// State handed to each worker thread.
struct WorkerContext {
    queue: EventQueue,
    processor: Arc<EventProcessor>,
    config: SharedConfig,
    router: Arc<InstructionRouter>,
    log: PipelineLog,
    signal: Arc<ShutdownSignal>,
    metrics: WorkerMetrics,
}

/// Running pipeline: the shared components plus their background workers.
pub struct IngestPipeline {
    queue: EventQueue,
    processor: Arc<EventProcessor>,
    config: SharedConfig,
    router: Arc<InstructionRouter>,
    log: PipelineLog,
    signal: Arc<ShutdownSignal>,
    metrics: PipelineWorkerMetrics,
    joins: Mutex<Vec<(WorkerKind, thread::JoinHandle<()>)>>,
    join_timeout: Duration,
    stopped: AtomicBool,
}

impl IngestPipeline {
    pub fn builder(
        config: PipelineConfig,
        parser: Arc<dyn ManifestParser>,
        datastore: Arc<dyn Datastore>,
    ) -> IngestPipelineBuilder {
        IngestPipelineBuilder {
            config,
            parser,
            datastore,
            log: None,
            control: None,
            heartbeat: None,
            handlers: Vec::new(),
        }
    }

    pub fn ingest_handle(&self) -> IngestHandle {
        IngestHandle {
            queue: self.queue.clone(),
            errors: self.processor.error_handler().clone(),
            log: self.log.clone(),
        }
    }

    pub fn processor(&self) -> &Arc<EventProcessor> {
        &self.processor
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn router(&self) -> &Arc<InstructionRouter> {
        &self.router
    }

    pub fn log(&self) -> &PipelineLog {
        &self.log
    }

    pub fn config(&self) -> PipelineConfig {
        self.config.snapshot()
    }

    pub fn worker_metrics(&self) -> &PipelineWorkerMetrics {
        &self.metrics
    }

    pub fn running_workers(&self) -> Vec<WorkerKind> {
        self.lock_joins().iter().map(|(kind, _)| *kind).collect()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.processor
            .status_snapshot(Some(self.queue.telemetry()))
    }

    /// Signals every worker and joins them within the configured timeout.
    ///
    /// Workers still running at the deadline are detached and reported.
    pub fn shutdown(&self) -> ShutdownReport {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }
        self.signal.trigger();
        let deadline = Instant::now() + self.join_timeout;
        let mut pending = std::mem::take(&mut *self.lock_joins());
        let mut report = ShutdownReport::default();
        loop {
            let mut still_running = Vec::new();
            for (kind, handle) in pending {
                if handle.is_finished() {
                    if handle.join().is_err() {
                        self.log.error(
                            MODULE,
                            None,
                            &format!("{} worker panicked", kind.as_str()),
                        );
                    }
                    report.joined.push(kind);
                } else {
                    still_running.push((kind, handle));
                }
            }
            pending = still_running;
            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(JOIN_POLL_INTERVAL);
        }
        for (kind, _) in pending {
            self.log.error(
                MODULE,
                None,
                &format!(
                    "{} worker did not stop within {}ms",
                    kind.as_str(),
                    self.join_timeout.as_millis()
                ),
            );
            report.timed_out.push(kind);
        }
        report.joined.sort();
        report.timed_out.sort();
        self.log.info(MODULE, None, "ingest pipeline stopped");
        report
    }

    fn spawn<F>(&self, kind: WorkerKind, body: F) -> Result<(), SupervisorError>
    where
        F: FnOnce(WorkerContext) + Send + 'static,
    {
        let worker = WorkerContext {
            queue: self.queue.clone(),
            processor: self.processor.clone(),
            config: self.config.clone(),
            router: self.router.clone(),
            log: self.log.clone(),
            signal: self.signal.clone(),
            metrics: self.metrics.worker(kind).clone(),
        };
        let handle = thread::Builder::new()
            .name(kind.thread_name())
            .spawn(move || body(worker))
            .map_err(|source| SupervisorError::Spawn {
                worker: kind.as_str(),
                source,
            })?;
        self.lock_joins().push((kind, handle));
        Ok(())
    }

    fn lock_joins(&self) -> MutexGuard<'_, Vec<(WorkerKind, thread::JoinHandle<()>)>> {
        self.joins
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for IngestPipeline {
    fn drop(&mut self) {
        self.signal.trigger();
    }
}

fn processing_loop(worker: WorkerContext) {
    while !worker.signal.is_triggered() {
        worker.metrics.record();
        let config = worker.config.snapshot();
        if worker.processor.options().requeue_retries {
            for event in worker
                .processor
                .error_handler()
                .take_due_retries(Instant::now())
            {
                worker.queue.enqueue(event);
            }
        }
        let batch = worker.queue.dequeue_batch(config.queue.batch_size);
        if batch.is_empty() {
            if worker.queue.recover_evicted_events() == 0
                && worker.signal.wait_timeout(config.idle_sleep())
            {
                break;
            }
            continue;
        }
        worker.processor.process_batch(batch);
        worker.queue.recover_evicted_events();
    }
}

fn orphan_sweep_loop(worker: WorkerContext) {
    loop {
        let config = worker.config.snapshot();
        if worker.signal.wait_timeout(config.sweep_interval()) {
            break;
        }
        worker.metrics.record();
        let expired = worker.processor.expire_orphans(config.orphan_timeout());
        if !expired.is_empty() {
            worker.log.warn(
                MODULE,
                None,
                &format!("orphan sweep expired {} record(s)", expired.len()),
            );
        }
    }
}

fn control_loop(worker: WorkerContext, mut channel: Box<dyn ControlChannel>) {
    let mut failed_attempts = 0u32;
    let mut pending_ack = None;
    while !worker.signal.is_triggered() {
        let config = worker.config.snapshot().control;
        let failure = match channel.connect() {
            Ok(()) => {
                worker.log.info(MODULE, None, "control channel connected");
                let served = serve_instructions(
                    &worker,
                    channel.as_mut(),
                    Duration::from_millis(config.poll_timeout_ms),
                    &mut pending_ack,
                    &mut failed_attempts,
                );
                match served {
                    Ok(()) => return,
                    Err(ControlChannelError::Closed) => {
                        worker.log.info(MODULE, None, "control channel closed by peer");
                        return;
                    }
                    Err(err) => err,
                }
            }
            Err(err) => err,
        };

        // Connect and stream failures share one budget; only a received
        // instruction resets it.
        failed_attempts += 1;
        if failed_attempts > config.max_reconnect_attempts {
            worker.log.error(
                MODULE,
                None,
                &format!("control channel unavailable after {failed_attempts} attempts: {failure}"),
            );
            return;
        }
        let backoff = RetryPolicy {
            max_retries: config.max_reconnect_attempts,
            base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
        }
        .delay_for_attempt(failed_attempts);
        worker.log.warn(
            MODULE,
            None,
            &format!(
                "{failure}; reconnecting in {}ms (attempt {failed_attempts} of {})",
                backoff.as_millis(),
                config.max_reconnect_attempts
            ),
        );
        if worker.signal.wait_timeout(backoff) {
            return;
        }
    }
}

/// Answers instructions until shutdown or a channel error. An ack that could
/// not be delivered is left in `pending_ack` and sent first on the next
/// connection.
fn serve_instructions(
    worker: &WorkerContext,
    channel: &mut dyn ControlChannel,
    poll_timeout: Duration,
    pending_ack: &mut Option<InstructionAck>,
    failed_attempts: &mut u32,
) -> Result<(), ControlChannelError> {
    if let Some(ack) = pending_ack.take() {
        deliver(channel, ack, pending_ack)?;
    }
    while !worker.signal.is_triggered() {
        worker.metrics.record();
        let Some(instruction) = channel.next_instruction(poll_timeout)? else {
            continue;
        };
        *failed_attempts = 0;
        let ack = worker.router.handle(&instruction);
        deliver(channel, ack, pending_ack)?;
    }
    Ok(())
}

fn deliver(
    channel: &mut dyn ControlChannel,
    ack: InstructionAck,
    pending_ack: &mut Option<InstructionAck>,
) -> Result<(), ControlChannelError> {
    channel.acknowledge(ack.clone()).map_err(|err| {
        *pending_ack = Some(ack);
        err
    })
}

fn heartbeat_loop(
    worker: WorkerContext,
    interval: Duration,
    mut sink: Option<Box<dyn HeartbeatSink>>,
) {
    while !worker.signal.wait_timeout(interval) {
        worker.metrics.record();
        let snapshot = worker
            .processor
            .status_snapshot(Some(worker.queue.telemetry()));
        worker.log.info(
            MODULE,
            None,
            &format!(
                "heartbeat: processed={} orphans={} queue_depth={}",
                snapshot.stats.total_processed,
                snapshot.orphans.total_orphans,
                worker.queue.size()
            ),
        );
        if let Some(sink) = sink.as_mut() {
            sink.beat(&snapshot);
        }
    }
}
