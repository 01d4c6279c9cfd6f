//! Demo graph: numbers typed on stdin are replicated by a tee, the left
//! branch adds a constant, a join sums both branches and a display sink
//! prints the result.
//!
//! ```text
//!   stdin -> [input] -> tee --left--> [left] -> adder(+L) -> [join_left] --\
//!                          \                                                 join(+) -> [output] -> display
//!                           --right------------------------> [right] ------/
//! ```
//!
//! Settings come from `STAGE_PIPELINE_*` environment variables, see
//! [`stage_pipeline::config`].

use anyhow::Context;
use stage_pipeline::{
    ingest_tokens, logging, parse_digits, BoundedQueue, DemoConfig, JoinStage, Pipeline,
    SinkStage, TeeStage, TransformStage,
};
use std::io;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn main() -> ExitCode {
    let config = match DemoConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR:\n{}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.log_level);

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "pipeline failed");
            eprintln!("ERROR:\n{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: &DemoConfig) -> anyhow::Result<()> {
    let capacity = config.queue_capacity;
    let blocksize = config.blocksize;

    // Queues are created first and shared by the stages on both ends
    let q_input: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(capacity));
    let q_left: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(capacity));
    let q_right: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(capacity));
    let q_join_left: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(capacity));
    let q_output: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(capacity));

    let displayed = Arc::new(AtomicU64::new(0));
    let left_add = config.left_add;

    let mut pipeline = Pipeline::new();
    pipeline
        .add(
            TeeStage::<i32>::new("tee", blocksize)
                .input(q_input.clone())
                .output_left(q_left.clone())
                .output_right(q_right.clone()),
        )?
        .add(
            TransformStage::new("left-adder", blocksize, move |v: &i32| v.wrapping_add(left_add))
                .input(q_left.clone())
                .output(q_join_left.clone()),
        )?
        .add(
            JoinStage::new("join", blocksize, |l: &i32, r: &i32| l.wrapping_add(*r))
                .input_left(q_join_left.clone())
                .input_right(q_right.clone())
                .output(q_output.clone()),
        )?
        .add({
            let displayed = Arc::clone(&displayed);
            SinkStage::new("display", blocksize, move |v: &i32| {
                println!("{}", v);
                displayed.fetch_add(1, Ordering::Release);
            })
            .input(q_output.clone())
        })?;
    tracing::info!(capacity, blocksize, left_add, "pipeline running");

    let pushed = ingest_tokens(io::stdin().lock(), &q_input, |token| Some(parse_digits(token)))
        .context("reading input")?;

    // Trailing elements that do not fill a block never leave the input queue
    let expected = pushed - pushed % blocksize as u64;
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while displayed.load(Ordering::Acquire) < expected {
        if Instant::now() >= deadline {
            tracing::warn!(
                expected,
                displayed = displayed.load(Ordering::Acquire),
                "timed out waiting for the pipeline to drain"
            );
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    tracing::debug!("{}", pipeline.metrics_summary());
    pipeline.shutdown();
    Ok(())
}
