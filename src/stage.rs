//! Worker stages connecting bounded queues.
//!
//! Every stage is configured through a builder that collects its queue
//! endpoints, then [`StageBuilder::start`] spawns one dedicated worker thread and
//! returns a [`StageHandle`]. The worker loops over blocks until one of its
//! queue calls reports [`Interrupted`]; dropping or stopping the handle
//! interrupts the stage's inputs, then its outputs, and joins the thread.

use crate::error::{Interrupted, PipelineError, Result};
use crate::metrics::StageMetrics;
use crate::queue::{QueueReader, QueueWriter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Lifecycle of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Endpoints are still being bound, no thread exists
    Unbound,
    /// The worker thread is looping over blocks
    Running,
    /// Queues have been interrupted, waiting for the worker to exit
    Stopping,
    /// The worker thread has been joined
    Stopped,
}

/// A stage under construction that can be started on its own thread.
pub trait StageBuilder: Sized {
    /// Human-readable name, also used as the worker thread name
    fn name(&self) -> &str;

    /// Validate the bound endpoints and spawn the worker thread.
    fn start(self) -> Result<StageHandle>;
}

type InterruptFn = Box<dyn Fn() + Send + Sync>;

/// Owner of a running stage's worker thread.
pub struct StageHandle {
    name: String,
    state: StageState,
    interrupts: Vec<InterruptFn>,
    thread: Option<JoinHandle<()>>,
    metrics: StageMetrics,
}

impl StageHandle {
    fn spawn<F>(name: String, interrupts: Vec<InterruptFn>, step: F) -> Result<Self>
    where
        F: FnMut(&mut Instant) -> std::result::Result<usize, Interrupted> + Send + 'static,
    {
        let metrics = StageMetrics::new();
        let worker_metrics = metrics.clone();
        let worker_name = name.clone();

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_worker(&worker_name, &worker_metrics, step))
            .map_err(|e| PipelineError::ThreadError(format!("failed to spawn {}: {}", name, e)))?;

        tracing::debug!(stage = %name, "stage started");
        Ok(Self {
            name,
            state: StageState::Running,
            interrupts,
            thread: Some(thread),
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// Interrupt the stage's queues and wait for its worker to exit.
    ///
    /// Safe to call more than once.
    pub fn stop(&mut self) {
        if self.state != StageState::Running {
            return;
        }
        self.state = StageState::Stopping;

        for interrupt in &self.interrupts {
            interrupt();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(stage = %self.name, "stage worker panicked");
            }
        }

        self.state = StageState::Stopped;
        tracing::debug!(
            stage = %self.name,
            blocks = self.metrics.total_blocks(),
            "stage stopped"
        );
    }
}

impl Drop for StageHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for StageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHandle")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish()
    }
}

/// Loop `step` until it reports interruption. Any panic escaping a step has
/// no recovery path, so the process is aborted.
///
/// A step receives the clock to start once its input block is in hand, so
/// the recorded latency leaves out time spent waiting for input.
fn run_worker<F>(name: &str, metrics: &StageMetrics, mut step: F)
where
    F: FnMut(&mut Instant) -> std::result::Result<usize, Interrupted>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| loop {
        let mut start = Instant::now();
        match step(&mut start) {
            Ok(elements) => metrics.record_block(elements, start.elapsed().as_nanos() as u64),
            Err(Interrupted) => break,
        }
    }));

    if outcome.is_err() {
        tracing::error!(stage = %name, "stage worker panicked, aborting");
        std::process::abort();
    }
    tracing::trace!(stage = %name, "stage worker interrupted");
}

fn require<Q>(stage: &str, endpoint: Option<Q>, which: &'static str) -> Result<Q> {
    endpoint.ok_or_else(|| PipelineError::MissingEndpoint {
        stage: stage.to_string(),
        endpoint: which,
    })
}

fn check_blocksize(stage: &str, blocksize: usize, capacities: &[usize]) -> Result<()> {
    for &capacity in capacities {
        if blocksize == 0 || blocksize > capacity {
            return Err(PipelineError::InvalidBlockSize {
                stage: stage.to_string(),
                blocksize,
                capacity,
            });
        }
    }
    Ok(())
}

fn interrupt_reader<T: 'static>(queue: &Arc<dyn QueueReader<T>>) -> InterruptFn {
    let queue = Arc::clone(queue);
    Box::new(move || queue.interrupt_read())
}

fn interrupt_writer<T: 'static>(queue: &Arc<dyn QueueWriter<T>>) -> InterruptFn {
    let queue = Arc::clone(queue);
    Box::new(move || queue.interrupt_write())
}

/// One input, one output, element-wise map.
pub struct TransformStage<I, O, F> {
    name: String,
    blocksize: usize,
    transform: F,
    input: Option<Arc<dyn QueueReader<I>>>,
    output: Option<Arc<dyn QueueWriter<O>>>,
}

impl<I, O, F> TransformStage<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(&I) -> O + Send + 'static,
{
    pub fn new(name: impl Into<String>, blocksize: usize, transform: F) -> Self {
        Self {
            name: name.into(),
            blocksize,
            transform,
            input: None,
            output: None,
        }
    }

    pub fn input(mut self, queue: Arc<dyn QueueReader<I>>) -> Self {
        self.input = Some(queue);
        self
    }

    pub fn output(mut self, queue: Arc<dyn QueueWriter<O>>) -> Self {
        self.output = Some(queue);
        self
    }
}

impl<I, O, F> StageBuilder for TransformStage<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(&I) -> O + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn start(self) -> Result<StageHandle> {
        let input = require(&self.name, self.input, "input")?;
        let output = require(&self.name, self.output, "output")?;
        check_blocksize(&self.name, self.blocksize, &[input.capacity(), output.capacity()])?;

        let interrupts = vec![interrupt_reader(&input), interrupt_writer(&output)];
        let n = self.blocksize;
        let transform = self.transform;

        StageHandle::spawn(self.name, interrupts, move |start| {
            let src = input.begin_read(n)?;
            *start = Instant::now();
            let mut dst = output.begin_write(n)?;
            dst.extend(src.iter().map(&transform));
            output.end_write(dst);
            input.end_read(n);
            Ok(n)
        })
    }
}

/// One input replicated onto two outputs.
///
/// Each block is written to the left output before the right one; if either
/// output is interrupted the whole stage stops.
pub struct TeeStage<T> {
    name: String,
    blocksize: usize,
    input: Option<Arc<dyn QueueReader<T>>>,
    output_left: Option<Arc<dyn QueueWriter<T>>>,
    output_right: Option<Arc<dyn QueueWriter<T>>>,
}

impl<T> TeeStage<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(name: impl Into<String>, blocksize: usize) -> Self {
        Self {
            name: name.into(),
            blocksize,
            input: None,
            output_left: None,
            output_right: None,
        }
    }

    pub fn input(mut self, queue: Arc<dyn QueueReader<T>>) -> Self {
        self.input = Some(queue);
        self
    }

    pub fn output_left(mut self, queue: Arc<dyn QueueWriter<T>>) -> Self {
        self.output_left = Some(queue);
        self
    }

    pub fn output_right(mut self, queue: Arc<dyn QueueWriter<T>>) -> Self {
        self.output_right = Some(queue);
        self
    }
}

impl<T> StageBuilder for TeeStage<T>
where
    T: Clone + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn start(self) -> Result<StageHandle> {
        let input = require(&self.name, self.input, "input")?;
        let left = require(&self.name, self.output_left, "output_left")?;
        let right = require(&self.name, self.output_right, "output_right")?;
        check_blocksize(
            &self.name,
            self.blocksize,
            &[input.capacity(), left.capacity(), right.capacity()],
        )?;

        let interrupts = vec![
            interrupt_reader(&input),
            interrupt_writer(&left),
            interrupt_writer(&right),
        ];
        let n = self.blocksize;

        StageHandle::spawn(self.name, interrupts, move |start| {
            let src = input.begin_read(n)?;
            *start = Instant::now();

            let mut dst = left.begin_write(n)?;
            dst.extend_from_slice(&src);
            left.end_write(dst);

            let mut dst = right.begin_write(n)?;
            dst.extend(src);
            right.end_write(dst);

            input.end_read(n);
            Ok(n)
        })
    }
}

/// Two inputs combined pairwise into one output.
///
/// Acquires left, then right, then the output, and releases in reverse.
pub struct JoinStage<L, R, O, F> {
    name: String,
    blocksize: usize,
    combine: F,
    input_left: Option<Arc<dyn QueueReader<L>>>,
    input_right: Option<Arc<dyn QueueReader<R>>>,
    output: Option<Arc<dyn QueueWriter<O>>>,
}

impl<L, R, O, F> JoinStage<L, R, O, F>
where
    L: Send + 'static,
    R: Send + 'static,
    O: Send + 'static,
    F: Fn(&L, &R) -> O + Send + 'static,
{
    pub fn new(name: impl Into<String>, blocksize: usize, combine: F) -> Self {
        Self {
            name: name.into(),
            blocksize,
            combine,
            input_left: None,
            input_right: None,
            output: None,
        }
    }

    pub fn input_left(mut self, queue: Arc<dyn QueueReader<L>>) -> Self {
        self.input_left = Some(queue);
        self
    }

    pub fn input_right(mut self, queue: Arc<dyn QueueReader<R>>) -> Self {
        self.input_right = Some(queue);
        self
    }

    pub fn output(mut self, queue: Arc<dyn QueueWriter<O>>) -> Self {
        self.output = Some(queue);
        self
    }
}

impl<L, R, O, F> StageBuilder for JoinStage<L, R, O, F>
where
    L: Send + 'static,
    R: Send + 'static,
    O: Send + 'static,
    F: Fn(&L, &R) -> O + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn start(self) -> Result<StageHandle> {
        let left = require(&self.name, self.input_left, "input_left")?;
        let right = require(&self.name, self.input_right, "input_right")?;
        let output = require(&self.name, self.output, "output")?;
        check_blocksize(
            &self.name,
            self.blocksize,
            &[left.capacity(), right.capacity(), output.capacity()],
        )?;

        let interrupts = vec![
            interrupt_reader(&left),
            interrupt_reader(&right),
            interrupt_writer(&output),
        ];
        let n = self.blocksize;
        let combine = self.combine;

        StageHandle::spawn(self.name, interrupts, move |start| {
            let src_left = left.begin_read(n)?;
            let src_right = right.begin_read(n)?;
            *start = Instant::now();
            let mut dst = output.begin_write(n)?;
            dst.extend(src_left.iter().zip(&src_right).map(|(l, r)| combine(l, r)));
            output.end_write(dst);
            right.end_read(n);
            left.end_read(n);
            Ok(n)
        })
    }
}

/// One input consumed for its side effect.
pub struct SinkStage<T, F> {
    name: String,
    blocksize: usize,
    consume: F,
    input: Option<Arc<dyn QueueReader<T>>>,
}

impl<T, F> SinkStage<T, F>
where
    T: Send + 'static,
    F: FnMut(&T) + Send + 'static,
{
    pub fn new(name: impl Into<String>, blocksize: usize, consume: F) -> Self {
        Self {
            name: name.into(),
            blocksize,
            consume,
            input: None,
        }
    }

    pub fn input(mut self, queue: Arc<dyn QueueReader<T>>) -> Self {
        self.input = Some(queue);
        self
    }
}

impl<T, F> StageBuilder for SinkStage<T, F>
where
    T: Send + 'static,
    F: FnMut(&T) + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn start(self) -> Result<StageHandle> {
        let input = require(&self.name, self.input, "input")?;
        check_blocksize(&self.name, self.blocksize, &[input.capacity()])?;

        let interrupts = vec![interrupt_reader(&input)];
        let n = self.blocksize;
        let mut consume = self.consume;

        StageHandle::spawn(self.name, interrupts, move |start| {
            let src = input.begin_read(n)?;
            *start = Instant::now();
            src.iter().for_each(&mut consume);
            input.end_read(n);
            Ok(n)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BoundedQueue;
    use crossbeam::channel;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_transform_stage() {
        let input: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(4));
        let output: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(4));
        let mut stage = TransformStage::new("double", 2, |v: &i32| v * 2)
            .input(input.clone())
            .output(output.clone())
            .start()
            .unwrap();
        assert_eq!(stage.state(), StageState::Running);

        for v in [1, 2, 3, 4] {
            input.push_one(v).unwrap();
        }
        let first = output.begin_read(2).unwrap();
        output.end_read(2);
        let second = output.begin_read(2).unwrap();
        output.end_read(2);
        assert_eq!(first, vec![2, 4]);
        assert_eq!(second, vec![6, 8]);

        stage.stop();
        assert_eq!(stage.state(), StageState::Stopped);
        assert_eq!(stage.metrics().total_elements(), 4);
    }

    #[test]
    fn test_tee_stage_copies_to_both_outputs() {
        let input: Arc<BoundedQueue<String>> = Arc::new(BoundedQueue::new(2));
        let left: Arc<BoundedQueue<String>> = Arc::new(BoundedQueue::new(2));
        let right: Arc<BoundedQueue<String>> = Arc::new(BoundedQueue::new(2));
        let _tee = TeeStage::<String>::new("tee", 1)
            .output_right(right.clone())
            .input(input.clone())
            .output_left(left.clone())
            .start()
            .unwrap();

        input.push_one(String::from("x")).unwrap();
        assert_eq!(left.begin_read(1).unwrap(), vec!["x".to_string()]);
        left.end_read(1);
        assert_eq!(right.begin_read(1).unwrap(), vec!["x".to_string()]);
        right.end_read(1);
    }

    #[test]
    fn test_join_stage_combines_pairwise() {
        let left: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(2));
        let right: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(2));
        let output: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(2));
        let _join = JoinStage::new("join", 1, |l: &i32, r: &i32| l + r)
            .input_left(left.clone())
            .input_right(right.clone())
            .output(output.clone())
            .start()
            .unwrap();

        right.push_one(10).unwrap();
        right.push_one(20).unwrap();
        left.push_one(1).unwrap();
        left.push_one(2).unwrap();

        let mut sums = Vec::new();
        for _ in 0..2 {
            sums.extend(output.begin_read(1).unwrap());
            output.end_read(1);
        }
        assert_eq!(sums, vec![11, 22]);
    }

    #[test]
    fn test_sink_stage_observes_every_element() {
        let input: Arc<BoundedQueue<u8>> = Arc::new(BoundedQueue::new(3));
        let (tx, rx) = channel::unbounded();
        let _sink = SinkStage::new("sink", 3, move |v: &u8| tx.send(*v).unwrap())
            .input(input.clone())
            .start()
            .unwrap();

        for v in 1..=3 {
            input.push_one(v).unwrap();
        }
        let seen: Vec<u8> = (0..3).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_missing_endpoint() {
        let input: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(1));
        let result = TeeStage::<i32>::new("tee", 1)
            .input(input.clone())
            .output_left(input)
            .start();
        assert!(matches!(
            result,
            Err(PipelineError::MissingEndpoint { endpoint: "output_right", .. })
        ));
    }

    #[test]
    fn test_invalid_blocksize() {
        let input: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(2));
        let output: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(2));
        let result = TransformStage::new("t", 3, |v: &i32| *v)
            .input(input.clone())
            .output(output.clone())
            .start();
        assert!(matches!(
            result,
            Err(PipelineError::InvalidBlockSize { blocksize: 3, capacity: 2, .. })
        ));

        let result = SinkStage::new("s", 0, |_: &i32| {}).input(input).start();
        assert!(matches!(result, Err(PipelineError::InvalidBlockSize { blocksize: 0, .. })));
    }

    #[test]
    fn test_stop_without_data_and_twice() {
        let input: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(1));
        let mut sink = SinkStage::new("idle", 1, |_: &i32| {})
            .input(input.clone())
            .start()
            .unwrap();
        sink.stop();
        sink.stop();
        assert_eq!(sink.state(), StageState::Stopped);
        assert!(input.is_read_interrupted());
        assert_eq!(sink.metrics().total_blocks(), 0);
    }

    #[test]
    fn test_block_latency_excludes_idle_wait() {
        let input: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(1));
        let (tx, rx) = channel::unbounded();
        let sink = SinkStage::new("late", 1, move |v: &i32| tx.send(*v).unwrap())
            .input(input.clone())
            .start()
            .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        input.push_one(7).unwrap();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 7);

        let deadline = Instant::now() + TIMEOUT;
        while sink.metrics().total_blocks() < 1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(sink.metrics().total_blocks(), 1);
        // The worker idled for 200ms before the block arrived
        assert!(sink.metrics().snapshot().latency_p99_us < 100_000.0);
    }

    #[test]
    fn test_stop_unblocks_stage_stuck_on_full_output() {
        let input: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(1));
        let output: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(1));
        let stage = TransformStage::new("stuck", 1, |v: &i32| *v)
            .input(input.clone())
            .output(output.clone())
            .start()
            .unwrap();

        input.push_one(1).unwrap();
        input.push_one(2).unwrap();
        // Output now holds 1 and the worker waits to write 2
        std::thread::sleep(Duration::from_millis(50));
        drop(stage);
        assert!(output.is_write_interrupted());
        assert_eq!(output.len(), 1);
    }
}
