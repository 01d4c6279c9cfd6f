//! Bounded blocking queues and threaded stages for streaming pipelines.
//!
//! Fixed-capacity queues connect independent worker stages into directed
//! graphs: linear chains, fan-out (tee) and fan-in (join). Each stage runs on
//! its own thread and moves fixed-size blocks of elements between queues.
//! There is no scheduler: the graph is driven by queue availability and
//! backpressure alone, and it shuts down by interrupting queues.
//!
//! # Features
//!
//! - `BoundedQueue` with begin/end block transfer and interruptible blocking
//! - Transform, tee, join and sink stages written against queue traits, so a
//!   connection can be backed by memory or by a device file descriptor
//! - Explicit stage builders with a single `start()`
//! - Per-stage and per-queue metrics
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stage_pipeline::{BoundedQueue, Pipeline, SinkStage, TransformStage};
//!
//! let input: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(2));
//! let doubled: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(2));
//!
//! let mut pipeline = Pipeline::new();
//! pipeline
//!     .add(TransformStage::new("double", 1, |v: &i32| v * 2).input(input.clone()).output(doubled.clone()))?
//!     .add(SinkStage::new("print", 1, |v: &i32| println!("{}", v)).input(doubled.clone()))?;
//!
//! input.push_one(21)?;
//! # Ok::<(), stage_pipeline::PipelineError>(())
//! ```

pub mod config;
#[cfg(unix)]
pub mod device;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod stage;

// Re-exports for convenience
pub use config::DemoConfig;
#[cfg(unix)]
pub use device::{DeviceInputQueue, DeviceOutputQueue, Element};
pub use error::{Interrupted, PipelineError, Result};
pub use ingest::{ingest_tokens, parse_digits};
pub use metrics::{MetricsSnapshot, PercentileTracker, QueueMetrics, StageMetrics};
pub use pipeline::Pipeline;
pub use queue::{BoundedQueue, Capacity, Queue, QueueReader, QueueWriter};
pub use stage::{
    JoinStage, SinkStage, StageBuilder, StageHandle, StageState, TeeStage, TransformStage,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
