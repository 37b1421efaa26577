pub mod queue;
pub mod supervisor;

pub use queue::{EventQueue, QueueTelemetry, EVENT_QUEUE_CAPACITY};
pub use supervisor::{
    HeartbeatSink, IngestHandle, IngestPipeline, IngestPipelineBuilder, PipelineWorkerMetrics,
    ShutdownReport, ShutdownSignal, SupervisorError, WorkerKind, WorkerMetrics,
};
