//! Ingest pipeline turning EPU acquisition file events into a persisted
//! grid → grid-square → foil-hole → micrograph hierarchy.

pub mod collaborators;
pub mod config;
pub mod control;
pub mod entity;
pub mod error_handler;
pub mod event;
pub mod observability;
pub mod orphan;
pub mod processor;
pub mod runtime;

pub use collaborators::{Datastore, DatastoreError, ManifestParser, ParseError, ParseErrorKind};
pub use config::{
    ConfigError, ControlConfig, HeartbeatConfig, LoggingConfig, MetricsConfig, OrphanConfig,
    PipelineConfig, ProcessingConfig, QueueConfig, RetryConfig, SharedConfig, ShutdownConfig,
};
pub use control::{
    AckStatus, ControlChannel, ControlChannelError, ControlContext, Instruction, InstructionAck,
    InstructionHandler, InstructionRouter,
};
pub use entity::{
    Atlas, AtlasManifest, EntityType, FoilHole, FoilHoleManifest, FoilHolePosition, Grid,
    GridSquare, GridSquareManifest, GridSquareMetadata, GridSquarePosition, Micrograph,
    MicrographManifest, SessionManifest, PARENT_TYPE_MAP,
};
pub use error_handler::{
    ErrorCategory, ErrorHandler, ErrorStats, ProcessingError, RetryPolicy, RetryState,
};
pub use event::{classify, ChangeKind, ClassifiedEvent, FileShape};
pub use observability::logging::{
    JsonLineLogger, LogFile, LogLevel, LogRotationPolicy, LoggingError, PipelineLog,
};
pub use observability::metrics::{
    render_summary, LatencyPercentiles, MetricsSummary, ProcessingMetrics, LATENCY_WINDOW,
};
pub use observability::{
    ensure_ms_only_metrics, scrape_metric_names, ObservabilityError, StatusSnapshot,
};
pub use orphan::{
    OrphanError, OrphanManager, OrphanPayload, OrphanRecord, OrphanStats, OrphansByType,
};
pub use processor::{
    EventProcessor, EventProcessorBuilder, ProcessOutcome, ProcessingStats, ProcessorOptions,
};
pub use runtime::{
    EventQueue, HeartbeatSink, IngestHandle, IngestPipeline, IngestPipelineBuilder,
    PipelineWorkerMetrics, QueueTelemetry, ShutdownReport, ShutdownSignal, SupervisorError,
    WorkerKind, WorkerMetrics, EVENT_QUEUE_CAPACITY,
};
