//! Queues backed by a file descriptor instead of memory.
//!
//! These let a connection be routed through an external device, such as a
//! FIFO character device, a pipe or a socket, while stages stay unaware of
//! the substitution. A device queue is one-sided: a [`DeviceOutputQueue`] is
//! only written by the pipeline, a [`DeviceInputQueue`] is only read.
//!
//! The device is switched to non-blocking mode and every wait goes through
//! `poll(2)` on two descriptors: the device and a wake pipe that
//! `interrupt_*` signals. An interrupt therefore releases a call blocked on a
//! silent or full device.

use crate::error::Interrupted;
use crate::queue::{Capacity, QueueReader, QueueWriter};
use parking_lot::Mutex;
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

/// Fixed-width binary encoding of a queue element.
pub trait Element: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Write the element into `buf`, which is exactly `SIZE` bytes long
    fn encode(&self, buf: &mut [u8]);

    /// Read an element from `buf`, which is exactly `SIZE` bytes long
    fn decode(buf: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Element for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn encode(&self, buf: &mut [u8]) {
                    buf.copy_from_slice(&self.to_ne_bytes());
                }

                fn decode(buf: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(buf);
                    <$ty>::from_ne_bytes(raw)
                }
            }
        )*
    };
}

impl_element!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Sticky interrupt flag that can also wake a `poll` call.
///
/// The first `wake` writes one byte into the pipe and nothing ever drains
/// it, so the read end stays readable from then on.
struct Waker {
    fired: AtomicBool,
    tx: UnixStream,
    rx: UnixStream,
}

impl Waker {
    fn new() -> io::Result<Self> {
        let (tx, rx) = UnixStream::pair()?;
        tx.set_nonblocking(true)?;
        Ok(Self {
            fired: AtomicBool::new(false),
            tx,
            rx,
        })
    }

    fn wake(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = (&self.tx).write(&[1]) {
            tracing::warn!(error = %e, "failed to signal device wake pipe");
        }
    }

    fn is_woken(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }
}

enum Readiness {
    Device,
    Woken,
}

/// Block until `device` reports `events` or the wake pipe becomes readable.
///
/// Error and hang-up conditions count as device readiness so that the next
/// read or write surfaces them. EINTR is retried.
fn wait_ready(device: RawFd, events: libc::c_short, wake: RawFd) -> io::Result<Readiness> {
    let mut fds = [
        libc::pollfd {
            fd: device,
            events,
            revents: 0,
        },
        libc::pollfd {
            fd: wake,
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    loop {
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if fds[1].revents != 0 {
            return Ok(Readiness::Woken);
        }
        if fds[0].revents != 0 {
            return Ok(Readiness::Device);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn check_block_size(n: usize, capacity: usize) {
    assert!(
        n > 0 && n <= capacity,
        "block size {} is outside 1..={}",
        n,
        capacity
    );
}

/// Write-only queue that streams committed blocks to a device.
///
/// `capacity` bounds the block size a stage may request; the device itself
/// provides the buffering and backpressure. `begin_write` waits until the
/// device accepts data. If the device fills up again while a block is being
/// flushed, `end_write` waits for room; an interrupt during that wait drops
/// the rest of the block.
pub struct DeviceOutputQueue<T, W> {
    device: Mutex<W>,
    fd: RawFd,
    capacity: usize,
    reserved: Mutex<usize>,
    waker: Waker,
    _element: std::marker::PhantomData<fn(T)>,
}

impl<T: Element, W: Write + AsRawFd> DeviceOutputQueue<T, W> {
    /// Take over `device`, switching its descriptor to non-blocking mode.
    pub fn new(device: W, capacity: usize) -> io::Result<Self> {
        assert!(capacity > 0, "queue capacity must be at least 1");
        let fd = device.as_raw_fd();
        set_nonblocking(fd)?;
        Ok(Self {
            device: Mutex::new(device),
            fd,
            capacity,
            reserved: Mutex::new(0),
            waker: Waker::new()?,
            _element: std::marker::PhantomData,
        })
    }

    pub fn is_write_interrupted(&self) -> bool {
        self.waker.is_woken()
    }

    /// Give back the device, e.g. to inspect what was written
    pub fn into_inner(self) -> W {
        self.device.into_inner()
    }

    fn fail(&self, e: io::Error) {
        tracing::error!(error = %e, "device write failed, closing write side");
        self.waker.wake();
    }
}

impl<T, W> Capacity for DeviceOutputQueue<T, W> {
    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T, W> QueueWriter<T> for DeviceOutputQueue<T, W>
where
    T: Element + Send,
    W: Write + AsRawFd + Send,
{
    fn begin_write(&self, n: usize) -> Result<Vec<T>, Interrupted> {
        check_block_size(n, self.capacity);
        if self.waker.is_woken() {
            return Err(Interrupted);
        }
        match wait_ready(self.fd, libc::POLLOUT, self.waker.fd()) {
            Ok(Readiness::Device) => {}
            Ok(Readiness::Woken) => return Err(Interrupted),
            Err(e) => {
                self.fail(e);
                return Err(Interrupted);
            }
        }

        let mut reserved = self.reserved.lock();
        assert_eq!(*reserved, 0, "begin_write called twice without end_write");
        *reserved = n;
        Ok(Vec::with_capacity(n))
    }

    fn end_write(&self, block: Vec<T>) {
        {
            let mut reserved = self.reserved.lock();
            assert_eq!(*reserved, block.len(), "end_write size does not match begin_write");
            *reserved = 0;
        }

        let mut bytes = vec![0u8; block.len() * T::SIZE];
        for (value, chunk) in block.iter().zip(bytes.chunks_exact_mut(T::SIZE)) {
            value.encode(chunk);
        }

        let mut device = self.device.lock();
        let mut written = 0;
        while written < bytes.len() {
            match device.write(&bytes[written..]) {
                Ok(0) => {
                    self.fail(ErrorKind::WriteZero.into());
                    return;
                }
                Ok(count) => written += count,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    match wait_ready(self.fd, libc::POLLOUT, self.waker.fd()) {
                        Ok(Readiness::Device) => {}
                        Ok(Readiness::Woken) => {
                            tracing::warn!(
                                dropped = bytes.len() - written,
                                "write side interrupted while flushing, dropping rest of block"
                            );
                            return;
                        }
                        Err(e) => {
                            self.fail(e);
                            return;
                        }
                    }
                }
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
        if let Err(e) = device.flush() {
            self.fail(e);
        }
    }

    fn interrupt_write(&self) {
        self.waker.wake();
    }
}

/// Read-only queue that decodes blocks arriving from a device.
///
/// End of stream and read errors latch the read side interrupted. An
/// interrupt releases a `begin_read` waiting on a silent device; bytes of a
/// partially received block are discarded.
pub struct DeviceInputQueue<T, R> {
    device: Mutex<R>,
    fd: RawFd,
    capacity: usize,
    lent: Mutex<usize>,
    waker: Waker,
    _element: std::marker::PhantomData<fn() -> T>,
}

impl<T: Element, R: Read + AsRawFd> DeviceInputQueue<T, R> {
    /// Take over `device`, switching its descriptor to non-blocking mode.
    pub fn new(device: R, capacity: usize) -> io::Result<Self> {
        assert!(capacity > 0, "queue capacity must be at least 1");
        let fd = device.as_raw_fd();
        set_nonblocking(fd)?;
        Ok(Self {
            device: Mutex::new(device),
            fd,
            capacity,
            lent: Mutex::new(0),
            waker: Waker::new()?,
            _element: std::marker::PhantomData,
        })
    }

    pub fn is_read_interrupted(&self) -> bool {
        self.waker.is_woken()
    }

    fn read_block(&self, bytes: &mut [u8]) -> Result<(), Interrupted> {
        let mut device = self.device.lock();
        let mut filled = 0;
        while filled < bytes.len() {
            match wait_ready(self.fd, libc::POLLIN, self.waker.fd()) {
                Ok(Readiness::Device) => {}
                Ok(Readiness::Woken) => return Err(Interrupted),
                Err(e) => {
                    tracing::error!(error = %e, "device poll failed, closing read side");
                    self.waker.wake();
                    return Err(Interrupted);
                }
            }
            match device.read(&mut bytes[filled..]) {
                Ok(0) => {
                    tracing::debug!(partial = filled, "device reached end of stream");
                    self.waker.wake();
                    return Err(Interrupted);
                }
                Ok(count) => filled += count,
                Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {}
                Err(e) => {
                    tracing::error!(error = %e, "device read failed, closing read side");
                    self.waker.wake();
                    return Err(Interrupted);
                }
            }
        }
        Ok(())
    }
}

impl<T, R> Capacity for DeviceInputQueue<T, R> {
    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T, R> QueueReader<T> for DeviceInputQueue<T, R>
where
    T: Element + Send,
    R: Read + AsRawFd + Send,
{
    fn begin_read(&self, n: usize) -> Result<Vec<T>, Interrupted> {
        check_block_size(n, self.capacity);
        if self.waker.is_woken() {
            return Err(Interrupted);
        }
        assert_eq!(*self.lent.lock(), 0, "begin_read called twice without end_read");

        let mut bytes = vec![0u8; n * T::SIZE];
        self.read_block(&mut bytes)?;
        *self.lent.lock() = n;
        Ok(bytes.chunks_exact(T::SIZE).map(T::decode).collect())
    }

    fn end_read(&self, n: usize) {
        let mut lent = self.lent.lock();
        assert_eq!(*lent, n, "end_read size does not match begin_read");
        *lent = 0;
    }

    fn interrupt_read(&self) {
        self.waker.wake();
    }
}
