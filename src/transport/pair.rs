//! Shared state behind one socket pair.
//!
//! Both endpoints of a pair live in a single [`Pair`] guarded by one mutex, so
//! every operation updates the two endpoint records consistently. Each
//! endpoint owns the bytes its counterpart wrote and it has not consumed yet,
//! the number of bytes a blocked reader is still waiting for, and the wake
//! signals registered by readiness waits.
//!
//! Callers hand in the registry guard they looked the pair up with; it is
//! released as soon as the pair lock is held so that no wait below ever
//! keeps the registry locked.
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::Instant,
};

use log::trace;

use super::{Fd, TransportError};

/// Connection state of one endpoint as seen from that endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    Open,
    /// This endpoint has been closed.
    Closed,
    /// The counterpart has been closed.
    PeerClosed,
}

/// One-shot wake flag shared by every endpoint a readiness wait watches.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    pub fn notify(&self) {
        if let Ok(mut fired) = self.fired.lock() {
            *fired = true;
            self.cv.notify_all();
        }
    }

    /// Blocks until notified or until `deadline` passes. Returns `false` on
    /// timeout.
    pub fn wait(&self, deadline: Option<Instant>) -> Result<bool, TransportError> {
        let mut fired = self.fired.lock()?;
        loop {
            if *fired {
                *fired = false;
                return Ok(true);
            }

            fired = match deadline {
                None => self.cv.wait(fired)?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    self.cv.wait_timeout(fired, deadline - now)?.0
                }
            };
        }
    }
}

#[derive(Debug)]
pub(crate) struct End {
    pub link: Link,
    /// Written by the counterpart, not yet consumed here.
    inbox: VecDeque<u8>,
    /// Bytes blocked readers on this endpoint still need.
    wanted: usize,
    watchers: Vec<Arc<Signal>>,
}

impl End {
    fn new() -> Self {
        Self {
            link: Link::Open,
            inbox: VecDeque::new(),
            wanted: 0,
            watchers: Vec::new(),
        }
    }

    pub fn unconsumed(&self) -> usize {
        self.inbox.len()
    }

    /// Data pending, or the counterpart is gone and a read returns at once.
    pub fn readable(&self) -> bool {
        !self.inbox.is_empty() || self.link != Link::Open
    }

    fn take(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.inbox.len());
        for (dst, src) in buf.iter_mut().zip(self.inbox.drain(..n)) {
            *dst = src;
        }
        n
    }

    fn wake_watchers(&self) {
        for watcher in self.watchers.iter() {
            watcher.notify();
        }
    }
}

#[derive(Debug)]
pub(crate) struct Pair {
    ends: Mutex<[End; 2]>,
    readable: [Condvar; 2],
    drained: [Condvar; 2],
}

fn other(side: usize) -> usize {
    side ^ 1
}

impl Pair {
    pub fn new() -> Self {
        Self {
            ends: Mutex::new([End::new(), End::new()]),
            readable: [Condvar::new(), Condvar::new()],
            drained: [Condvar::new(), Condvar::new()],
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, [End; 2]>, TransportError> {
        Ok(self.ends.lock()?)
    }

    pub fn read<G>(
        &self,
        side: usize,
        buf: &mut [u8],
        min: usize,
        blocking: bool,
        registry: G,
    ) -> Result<usize, TransportError> {
        let mut ends = self.lock()?;
        drop(registry);

        let me = &mut ends[side];
        if me.link != Link::Open || !blocking || (me.wanted == 0 && me.unconsumed() >= min) {
            let n = me.take(buf);
            if n > 0 && me.unconsumed() <= me.wanted {
                self.drained[side].notify_all();
            }
            return Ok(n);
        }

        me.wanted += min;
        // the drain threshold just moved
        self.drained[side].notify_all();

        let mut ends = self.readable[side].wait_while(ends, |ends| {
            ends[side].unconsumed() < min && ends[side].link == Link::Open
        })?;

        let me = &mut ends[side];
        let n = me.take(buf);
        me.wanted -= min;
        trace!("reader on side {side} woke with {n} bytes");

        if me.unconsumed() > 0 || me.link == Link::PeerClosed {
            self.readable[side].notify_one();
        }
        if me.unconsumed() <= me.wanted {
            self.drained[side].notify_all();
        }
        Ok(n)
    }

    pub fn write<G>(
        &self,
        fd: Fd,
        side: usize,
        buf: &[u8],
        registry: G,
    ) -> Result<usize, TransportError> {
        let mut ends = self.lock()?;
        drop(registry);

        if ends[side].link != Link::Open {
            return Err(TransportError::PeerClosed(fd));
        }

        let peer = other(side);
        ends[peer].inbox.extend(buf.iter().copied());
        if !buf.is_empty() {
            self.readable[peer].notify_one();
            ends[peer].wake_watchers();
        }
        Ok(buf.len())
    }

    /// Waits until the counterpart has consumed what was written to it, or
    /// has asked for at least that much, or has been closed.
    pub fn drain<G>(&self, side: usize, registry: G) -> Result<(), TransportError> {
        let ends = self.lock()?;
        drop(registry);

        let peer = other(side);
        let _ends = self.drained[peer].wait_while(ends, |ends| {
            ends[peer].link == Link::Open && ends[peer].unconsumed() > ends[peer].wanted
        })?;
        Ok(())
    }

    /// Must be called with the registry write lock held.
    pub fn close(&self, side: usize) -> Result<(), TransportError> {
        let mut ends = self.lock()?;
        if ends[side].link == Link::PeerClosed {
            ends[side].link = Link::Closed;
            ends[side].inbox.clear();
            return Ok(());
        }

        let peer = other(side);
        ends[side].link = Link::Closed;
        ends[peer].link = Link::PeerClosed;

        if ends[side].unconsumed() > ends[side].wanted {
            // pending data is discarded, release anyone draining into us
            self.drained[side].notify_all();
        }
        ends[side].inbox.clear();

        if ends[peer].wanted > 0 {
            self.readable[peer].notify_one();
        }
        ends[peer].wake_watchers();
        Ok(())
    }

    pub fn readable_side(&self, side: usize) -> Result<bool, TransportError> {
        Ok(self.lock()?[side].readable())
    }

    pub fn watch(&self, side: usize, signal: &Arc<Signal>) -> Result<(), TransportError> {
        self.lock()?[side].watchers.push(Arc::clone(signal));
        Ok(())
    }

    pub fn unwatch(&self, side: usize, signal: &Arc<Signal>) -> Result<(), TransportError> {
        self.lock()?[side]
            .watchers
            .retain(|watcher| !Arc::ptr_eq(watcher, signal));
        Ok(())
    }
}
