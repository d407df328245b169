//! Flow-controlled transport over emulated socket pairs.
//!
//! A [`Registry`] hands out [`Fd`] descriptors. Descriptors created with
//! [`Registry::create_pair`] behave like the two ends of a serial line with
//! termios-style semantics layered on top of a plain byte stream:
//!
//! - [`Registry::read_min`] blocks until at least `min` bytes are available or
//!   the counterpart is closed, and never reports a connection reset.
//! - [`Registry::drain`] blocks the writer until the counterpart has consumed
//!   (or asked for) everything written to it.
//! - [`Registry::close`] wakes a counterpart blocked in a read or a drain
//!   instead of leaving it hanging.
//! - [`Registry::select`] waits until any of a set of descriptors is readable.
//!
//! Descriptors registered with [`Registry::adopt`] wrap an arbitrary
//! [`Read`] + [`Write`] stream and get ordinary blocking I/O.
//!
//! # Locking
//!
//! The registry map sits behind an [`RwLock`]. Pair creation and closure take
//! it exclusively; reads, writes, drains and readiness checks share it only
//! long enough to lock the pair involved, so a transfer blocked on one pair
//! never stalls another. Lock order is always registry, then pair, then wake
//! signal.
mod pair;

use std::{
    collections::HashMap,
    fmt,
    io::{self, Read, Write},
    sync::{Arc, Mutex, PoisonError, RwLock, atomic::AtomicU32, atomic::Ordering},
    time::{Duration, Instant},
};

use log::{debug, trace};
use thiserror::Error;

use pair::{Pair, Signal};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0} is not an open descriptor")]
    UnknownDescriptor(Fd),

    #[error("write on {0} after its counterpart was closed")]
    PeerClosed(Fd),

    #[error("only blocking or immediate reads are supported, got a {0:?} timeout")]
    UnsupportedTimeout(Duration),

    #[error("transport lock poisoned")]
    Poisoned,

    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

impl<T> From<PoisonError<T>> for TransportError {
    fn from(_: PoisonError<T>) -> Self {
        TransportError::Poisoned
    }
}

/// Descriptor handed out by a [`Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fd(u32);

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd{}", self.0)
    }
}

/// Byte stream adopted by the registry for plain blocking I/O.
pub trait Stream: Read + Write + Send {}

impl<T: Read + Write + Send> Stream for T {}

#[derive(Clone)]
enum Slot {
    Pair { pair: Arc<Pair>, side: usize },
    Stream(Arc<Mutex<Box<dyn Stream>>>),
}

/// Descriptor table for socket pairs and adopted streams.
///
/// Registries are independent of each other; share one between threads
/// through an [`Arc`].
#[derive(Default)]
pub struct Registry {
    slots: RwLock<HashMap<Fd, Slot>>,
    next: AtomicU32,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self) -> Fd {
        Fd(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates two linked endpoints.
    pub fn create_pair(&self) -> Result<(Fd, Fd), TransportError> {
        let pair = Arc::new(Pair::new());
        let mut slots = self.slots.write()?;
        let (a, b) = (self.allocate(), self.allocate());

        slots.insert(
            a,
            Slot::Pair {
                pair: Arc::clone(&pair),
                side: 0,
            },
        );
        slots.insert(b, Slot::Pair { pair, side: 1 });
        debug!("created socket pair {a} <-> {b}");
        Ok((a, b))
    }

    /// Registers a foreign stream; reads and writes on it go straight through.
    pub fn adopt<S: Stream + 'static>(&self, stream: S) -> Result<Fd, TransportError> {
        let mut slots = self.slots.write()?;
        let fd = self.allocate();
        slots.insert(fd, Slot::Stream(Arc::new(Mutex::new(Box::new(stream)))));
        debug!("adopted stream as {fd}");
        Ok(fd)
    }

    pub fn is_open(&self, fd: Fd) -> bool {
        self.slots
            .read()
            .map(|slots| slots.contains_key(&fd))
            .unwrap_or(false)
    }

    /// Reads at least one byte, blocking until some arrive. Returns 0 once
    /// the counterpart is closed and nothing is pending.
    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.read_min(fd, buf, 1, None)
    }

    /// Reads up to `buf.len()` bytes once at least `min` are available.
    ///
    /// `timeout` must be `None` (block until `min` bytes arrive or the
    /// counterpart closes) or [`Duration::ZERO`] (take whatever is pending
    /// without blocking). Any other value is rejected with
    /// [`TransportError::UnsupportedTimeout`].
    pub fn read_min(
        &self,
        fd: Fd,
        buf: &mut [u8],
        min: usize,
        timeout: Option<Duration>,
    ) -> Result<usize, TransportError> {
        let blocking = match timeout {
            None => true,
            Some(t) if t.is_zero() => false,
            Some(t) => return Err(TransportError::UnsupportedTimeout(t)),
        };

        let slots = self.slots.read()?;
        let slot = slots
            .get(&fd)
            .cloned()
            .ok_or(TransportError::UnknownDescriptor(fd))?;

        let n = match slot {
            Slot::Pair { pair, side } => pair.read(side, buf, min, blocking, slots)?,
            Slot::Stream(stream) => {
                drop(slots);
                read_stream(&stream, buf, min)?
            }
        };
        trace!("{fd} read {n} bytes (min {min})");
        Ok(n)
    }

    /// Writes all of `buf`; for a pair endpoint the bytes become readable on
    /// the counterpart and one blocked reader is woken.
    pub fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize, TransportError> {
        let slots = self.slots.read()?;
        let slot = slots
            .get(&fd)
            .cloned()
            .ok_or(TransportError::UnknownDescriptor(fd))?;

        let n = match slot {
            Slot::Pair { pair, side } => pair.write(fd, side, buf, slots)?,
            Slot::Stream(stream) => {
                drop(slots);
                stream.lock()?.write_all(buf)?;
                buf.len()
            }
        };
        trace!("{fd} wrote {n} bytes");
        Ok(n)
    }

    /// Blocks until the counterpart has consumed what was written to it.
    /// Returns at once if the counterpart is already closed.
    pub fn drain(&self, fd: Fd) -> Result<(), TransportError> {
        let slots = self.slots.read()?;
        let slot = slots
            .get(&fd)
            .cloned()
            .ok_or(TransportError::UnknownDescriptor(fd))?;

        match slot {
            Slot::Pair { pair, side } => pair.drain(side, slots),
            Slot::Stream(stream) => {
                drop(slots);
                stream.lock()?.flush()?;
                Ok(())
            }
        }
    }

    /// Closes `fd`. Data still queued for it is discarded and a counterpart
    /// blocked in a read or drain is released.
    pub fn close(&self, fd: Fd) -> Result<(), TransportError> {
        let mut slots = self.slots.write()?;
        let slot = slots
            .remove(&fd)
            .ok_or(TransportError::UnknownDescriptor(fd))?;

        debug!("closing {fd}");
        match slot {
            Slot::Pair { pair, side } => pair.close(side),
            Slot::Stream(stream) => {
                stream.lock()?.flush()?;
                Ok(())
            }
        }
    }

    /// Waits until at least one of `fds` is readable, or `timeout` elapses.
    ///
    /// A pair endpoint is readable when data is pending or its counterpart
    /// has been closed; adopted streams always count as readable. Returns the
    /// readable descriptors, empty on timeout.
    pub fn select(&self, fds: &[Fd], timeout: Option<Duration>) -> Result<Vec<Fd>, TransportError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let signal = Arc::new(Signal::default());

        self.watch(fds, &signal)?;
        let ready = self.wait_ready(fds, &signal, deadline);
        self.unwatch(fds, &signal)?;

        let ready = ready?;
        if ready.is_empty() {
            trace!("select on {fds:?} timed out");
        }
        Ok(ready)
    }

    fn wait_ready(
        &self,
        fds: &[Fd],
        signal: &Signal,
        deadline: Option<Instant>,
    ) -> Result<Vec<Fd>, TransportError> {
        loop {
            let ready = self.ready(fds)?;
            if !ready.is_empty() || !signal.wait(deadline)? {
                return Ok(ready);
            }
        }
    }

    fn ready(&self, fds: &[Fd]) -> Result<Vec<Fd>, TransportError> {
        let slots = self.slots.read()?;
        let mut ready = Vec::new();

        for fd in fds {
            let readable = match slots.get(fd) {
                Some(Slot::Pair { pair, side }) => pair.readable_side(*side)?,
                Some(Slot::Stream(_)) => true,
                None => return Err(TransportError::UnknownDescriptor(*fd)),
            };
            if readable {
                ready.push(*fd);
            }
        }
        Ok(ready)
    }

    fn watch(&self, fds: &[Fd], signal: &Arc<Signal>) -> Result<(), TransportError> {
        let slots = self.slots.read()?;
        for fd in fds {
            match slots.get(fd) {
                Some(Slot::Pair { pair, side }) => pair.watch(*side, signal)?,
                Some(Slot::Stream(_)) => {}
                None => return Err(TransportError::UnknownDescriptor(*fd)),
            }
        }
        Ok(())
    }

    fn unwatch(&self, fds: &[Fd], signal: &Arc<Signal>) -> Result<(), TransportError> {
        let slots = self.slots.read()?;
        for fd in fds {
            // closed in the meantime, nothing left to unregister
            if let Some(Slot::Pair { pair, side }) = slots.get(fd) {
                pair.unwatch(*side, signal)?;
            }
        }
        Ok(())
    }
}

fn read_stream(
    stream: &Mutex<Box<dyn Stream>>,
    buf: &mut [u8],
    min: usize,
) -> Result<usize, TransportError> {
    let mut stream = stream.lock()?;
    let mut total = 0;

    loop {
        let n = match stream.read(&mut buf[total..]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => 0,
            Err(e) => return Err(e.into()),
        };
        total += n;

        if n == 0 || total >= min || total == buf.len() {
            return Ok(total);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, thread, time::Duration};

    use super::*;

    #[test]
    fn read_min_fast_path() {
        let registry = Registry::new();
        let (a, b) = registry.create_pair().unwrap();

        registry.write(a, b"hello").unwrap();
        let mut buf = [0; 16];
        let n = registry.read_min(b, &mut buf, 5, None).unwrap();

        assert_eq!(n, 5);
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn read_min_waits_for_minimum() {
        let registry = Arc::new(Registry::new());
        let (a, b) = registry.create_pair().unwrap();

        let writer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for chunk in [&b"ab"[..], b"cd", b"ef"] {
                    thread::sleep(Duration::from_millis(10));
                    registry.write(a, chunk).unwrap();
                }
            })
        };

        let mut buf = [0; 16];
        let mut total = 0;
        while total < 6 {
            total += registry
                .read_min(b, &mut buf[total..], 6 - total, None)
                .unwrap();
        }
        writer.join().unwrap();

        assert_eq!(&buf[..6], b"abcdef");
    }

    #[test]
    fn close_unblocks_reader() {
        let registry = Arc::new(Registry::new());
        let (a, b) = registry.create_pair().unwrap();

        let reader = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let mut buf = [0; 8];
                registry.read_min(b, &mut buf, 4, None).unwrap()
            })
        };

        thread::sleep(Duration::from_millis(20));
        registry.close(a).unwrap();

        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn close_returns_short_read_with_pending_bytes() {
        let registry = Arc::new(Registry::new());
        let (a, b) = registry.create_pair().unwrap();

        let reader = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let mut buf = [0; 8];
                let n = registry.read_min(b, &mut buf, 4, None).unwrap();
                buf[..n].to_vec()
            })
        };

        thread::sleep(Duration::from_millis(20));
        registry.write(a, b"xy").unwrap();
        registry.close(a).unwrap();

        assert_eq!(reader.join().unwrap(), b"xy");
    }

    #[test]
    fn reads_after_close_drain_then_return_zero() {
        let registry = Registry::new();
        let (a, b) = registry.create_pair().unwrap();

        registry.write(a, b"z").unwrap();
        registry.close(a).unwrap();

        let mut buf = [0; 4];
        assert_eq!(registry.read(b, &mut buf).unwrap(), 1);
        assert_eq!(registry.read(b, &mut buf).unwrap(), 0);
        assert_eq!(registry.read_min(b, &mut buf, 3, None).unwrap(), 0);
    }

    #[test]
    #[should_panic(expected = "PeerClosed")]
    fn write_after_peer_close() {
        let registry = Registry::new();
        let (a, b) = registry.create_pair().unwrap();

        registry.close(b).unwrap();
        registry.write(a, b"late").unwrap();
    }

    #[test]
    #[should_panic(expected = "UnsupportedTimeout")]
    fn timed_reads_are_rejected() {
        let registry = Registry::new();
        let (_, b) = registry.create_pair().unwrap();

        let mut buf = [0; 4];
        registry
            .read_min(b, &mut buf, 1, Some(Duration::from_millis(100)))
            .unwrap();
    }

    #[test]
    fn immediate_read_does_not_block() {
        let registry = Registry::new();
        let (_, b) = registry.create_pair().unwrap();

        let mut buf = [0; 4];
        assert_eq!(
            registry
                .read_min(b, &mut buf, 1, Some(Duration::ZERO))
                .unwrap(),
            0
        );
    }

    #[test]
    fn drain_waits_for_consumer() {
        let registry = Arc::new(Registry::new());
        let (a, b) = registry.create_pair().unwrap();
        registry.write(a, b"0123456789").unwrap();

        let reader = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                let mut buf = [0; 16];
                registry.read_min(b, &mut buf, 10, None).unwrap()
            })
        };

        let started = Instant::now();
        registry.drain(a).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(25));
        assert_eq!(reader.join().unwrap(), 10);
    }

    #[test]
    fn drain_returns_when_counterpart_closed() {
        let registry = Registry::new();
        let (a, b) = registry.create_pair().unwrap();

        registry.write(a, b"never read").unwrap();
        registry.close(b).unwrap();
        registry.drain(a).unwrap();
    }

    #[test]
    fn drain_released_by_close() {
        let registry = Arc::new(Registry::new());
        let (a, b) = registry.create_pair().unwrap();
        registry.write(a, b"pending").unwrap();

        let drainer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.drain(a).unwrap())
        };

        thread::sleep(Duration::from_millis(20));
        registry.close(b).unwrap();
        drainer.join().unwrap();
    }

    #[test]
    fn blocked_pair_does_not_stall_others() {
        let registry = Arc::new(Registry::new());
        let (a, b) = registry.create_pair().unwrap();
        let (c, d) = registry.create_pair().unwrap();

        let reader = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let mut buf = [0; 4];
                registry.read(b, &mut buf).unwrap()
            })
        };

        thread::sleep(Duration::from_millis(10));
        registry.write(c, b"ok").unwrap();
        let mut buf = [0; 4];
        assert_eq!(registry.read(d, &mut buf).unwrap(), 2);
        // creation and closure still get the registry lock
        let (e, f) = registry.create_pair().unwrap();
        registry.close(e).unwrap();
        registry.close(f).unwrap();

        registry.write(a, b"!").unwrap();
        assert_eq!(reader.join().unwrap(), 1);
    }

    #[test]
    fn select_times_out_then_sees_data() {
        let registry = Arc::new(Registry::new());
        let (a, b) = registry.create_pair().unwrap();
        let (_c, d) = registry.create_pair().unwrap();

        let ready = registry
            .select(&[b, d], Some(Duration::from_millis(10)))
            .unwrap();
        assert!(ready.is_empty());

        let writer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                registry.write(a, b"x").unwrap();
            })
        };
        let ready = registry.select(&[b, d], None).unwrap();
        writer.join().unwrap();

        assert_eq!(ready, vec![b]);
    }

    #[test]
    fn select_wakes_on_close() {
        let registry = Arc::new(Registry::new());
        let (a, b) = registry.create_pair().unwrap();

        let closer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                registry.close(a).unwrap();
            })
        };

        assert_eq!(registry.select(&[b], None).unwrap(), vec![b]);
        closer.join().unwrap();

        let mut buf = [0; 1];
        assert_eq!(registry.read(b, &mut buf).unwrap(), 0);
    }

    #[test]
    fn adopted_streams_fall_through() {
        let registry = Registry::new();
        let fd = registry.adopt(Cursor::new(b"plain".to_vec())).unwrap();

        let mut buf = [0; 16];
        assert_eq!(registry.read_min(fd, &mut buf, 5, None).unwrap(), 5);
        assert_eq!(&buf[..5], b"plain");
        assert_eq!(registry.select(&[fd], Some(Duration::ZERO)).unwrap(), vec![fd]);
        registry.drain(fd).unwrap();
        registry.close(fd).unwrap();
        assert!(!registry.is_open(fd));
    }

    #[test]
    #[should_panic(expected = "UnknownDescriptor")]
    fn closed_descriptor_is_unknown() {
        let registry = Registry::new();
        let (a, _) = registry.create_pair().unwrap();

        registry.close(a).unwrap();
        registry.close(a).unwrap();
    }

    #[test]
    fn registries_are_independent() {
        let first = Registry::new();
        let second = Registry::new();
        let (a, _) = first.create_pair().unwrap();

        assert!(first.is_open(a));
        assert!(!second.is_open(a));
        assert!(second.write(a, b"x").is_err());
    }
}
