//! Concurrent camera-to-RTMP frame pipeline.
//!
//! Three stages connected by bounded ordered queues: a capture adapter
//! produces timestamped frames, a pool of inference workers (each holding
//! one leased model) transforms them, and a single encoder thread restores
//! capture order and feeds the encoder sink with strictly increasing
//! timestamps. A single atomic running flag is the only cancellation token;
//! every wait in the pipeline is bounded so the flag is observed promptly.

pub mod model_pool;
pub mod ordered_queue;
pub mod orchestrator;
pub mod sink;
pub mod stats;
pub mod worker_pool;

pub use model_pool::ModelPool;
pub use ordered_queue::{FullPolicy, OrderedQueue, PushError};
pub use orchestrator::{Pipeline, PipelineState, StreamParams};
pub use sink::{SinkError, VideoSink};
pub use stats::{FrameStats, StatsSnapshot};
pub use worker_pool::{PoolError, TaskHandle, WorkerPool};
