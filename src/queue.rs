//! Bounded blocking queues and the endpoint traits stages are written against.
//!
//! A queue transfers *blocks*: a reader calls [`QueueReader::begin_read`] to
//! obtain `n` elements and [`QueueReader::end_read`] to release their slots;
//! a writer calls [`QueueWriter::begin_write`] to reserve `n` free slots and
//! [`QueueWriter::end_write`] to commit the filled buffer. Only the two
//! `begin_*` calls ever block.

use crate::error::Interrupted;
use crate::metrics::QueueMetrics;
use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

/// Number of elements a queue endpoint can hold at once.
pub trait Capacity {
    fn capacity(&self) -> usize;
}

/// The consumer side of a queue.
pub trait QueueReader<T>: Capacity + Send + Sync {
    /// Block until `n` elements are available and lend them out.
    ///
    /// The slots stay occupied until the matching [`end_read`](Self::end_read).
    fn begin_read(&self, n: usize) -> Result<Vec<T>, Interrupted>;

    /// Release the `n` slots lent out by the last `begin_read`.
    fn end_read(&self, n: usize);

    /// Fail current and future `begin_read` calls. Idempotent.
    fn interrupt_read(&self);
}

/// The producer side of a queue.
pub trait QueueWriter<T>: Capacity + Send + Sync {
    /// Block until `n` slots are free, reserve them and return an empty
    /// buffer with room for `n` elements.
    fn begin_write(&self, n: usize) -> Result<Vec<T>, Interrupted>;

    /// Commit a block filled after `begin_write`. Its length must equal the
    /// reserved size.
    fn end_write(&self, block: Vec<T>);

    /// Fail current and future `begin_write` calls. Idempotent.
    fn interrupt_write(&self);
}

/// A queue usable from both ends.
pub trait Queue<T>: QueueReader<T> + QueueWriter<T> {}

impl<T, Q> Queue<T> for Q where Q: QueueReader<T> + QueueWriter<T> + ?Sized {}

#[derive(Debug, Default)]
struct State {
    /// Elements lent out by an unfinished read
    reading: usize,
    /// Slots reserved by an unfinished write
    writing: usize,
    read_interrupted: bool,
    write_interrupted: bool,
}

/// Fixed-capacity in-memory queue with blocking, interruptible block transfer.
///
/// Elements live in a crossbeam [`ArrayQueue`] ring; the mutex only guards
/// the slot accounting, so `ring.len() + reading + writing <= capacity`
/// always holds. One producer and one consumer per queue.
pub struct BoundedQueue<T> {
    ring: ArrayQueue<T>,
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
    metrics: QueueMetrics,
}

impl<T: Send> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` elements.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be at least 1");
        Self {
            ring: ArrayQueue::new(capacity),
            state: Mutex::new(State::default()),
            readable: Condvar::new(),
            writable: Condvar::new(),
            metrics: QueueMetrics::new(),
        }
    }

    /// Push a single element, blocking while the queue is full.
    ///
    /// This is the entry point used by ingestion loops feeding the head of a
    /// pipeline.
    pub fn push_one(&self, value: T) -> Result<(), Interrupted> {
        let mut block = self.begin_write(1)?;
        block.push(value);
        self.end_write(block);
        Ok(())
    }

    /// Elements currently held, including any lent out to an unfinished read
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        self.ring.len() + state.reading
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_read_interrupted(&self) -> bool {
        self.state.lock().read_interrupted
    }

    pub fn is_write_interrupted(&self) -> bool {
        self.state.lock().write_interrupted
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    fn check_block_size(&self, n: usize) {
        assert!(
            n > 0 && n <= self.ring.capacity(),
            "block size {} is outside 1..={}",
            n,
            self.ring.capacity()
        );
    }
}

impl<T> Capacity for BoundedQueue<T> {
    fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<T: Send> QueueReader<T> for BoundedQueue<T> {
    fn begin_read(&self, n: usize) -> Result<Vec<T>, Interrupted> {
        self.check_block_size(n);
        let mut state = self.state.lock();
        assert_eq!(state.reading, 0, "begin_read called twice without end_read");

        let mut waited = false;
        loop {
            if state.read_interrupted {
                return Err(Interrupted);
            }
            if self.ring.len() >= n {
                break;
            }
            waited = true;
            self.readable.wait(&mut state);
        }
        if waited {
            self.metrics.record_blocked_read();
        }

        let mut block = Vec::with_capacity(n);
        while block.len() < n {
            match self.ring.pop() {
                Some(value) => block.push(value),
                None => unreachable!("ring holds fewer elements than accounted for"),
            }
        }
        state.reading = n;
        Ok(block)
    }

    fn end_read(&self, n: usize) {
        let mut state = self.state.lock();
        assert_eq!(state.reading, n, "end_read size does not match begin_read");
        state.reading = 0;
        self.metrics.record_read(n);
        self.writable.notify_one();
    }

    fn interrupt_read(&self) {
        let mut state = self.state.lock();
        state.read_interrupted = true;
        self.readable.notify_all();
    }
}

impl<T: Send> QueueWriter<T> for BoundedQueue<T> {
    fn begin_write(&self, n: usize) -> Result<Vec<T>, Interrupted> {
        self.check_block_size(n);
        let mut state = self.state.lock();
        assert_eq!(state.writing, 0, "begin_write called twice without end_write");

        let capacity = self.ring.capacity();
        let mut waited = false;
        loop {
            if state.write_interrupted {
                return Err(Interrupted);
            }
            if self.ring.len() + state.reading + n <= capacity {
                break;
            }
            waited = true;
            self.writable.wait(&mut state);
        }
        if waited {
            self.metrics.record_blocked_write();
        }

        state.writing = n;
        Ok(Vec::with_capacity(n))
    }

    fn end_write(&self, block: Vec<T>) {
        let mut state = self.state.lock();
        let n = block.len();
        assert!(n > 0, "end_write called with an empty block");
        assert_eq!(state.writing, n, "end_write size does not match begin_write");

        for value in block {
            if self.ring.push(value).is_err() {
                unreachable!("reserved slot missing from ring");
            }
        }
        state.writing = 0;
        self.metrics.record_written(n);
        self.readable.notify_one();
    }

    fn interrupt_write(&self) {
        let mut state = self.state.lock();
        state.write_interrupted = true;
        self.writable.notify_all();
    }
}
