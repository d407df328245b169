use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, trace, warn};

use crate::transport::{Fd, Registry};

use super::{CAN, CAN_LEN, Event, LinkMachine, ProtocolError, TM_2CHAR, TM_CHAR, Timing};

/// Console escape that cancels the running transfer.
const KB_ESCAPE: u8 = b'&';
const KB_CANCEL: u8 = b'c';

/// One end of a transfer: the medium and console descriptors, the protocol
/// clock, and the per-file results collected so far.
pub struct Peer {
    registry: Arc<Registry>,
    medium: Fd,
    console: Option<Fd>,
    timing: Timing,
    started: Instant,
    deadline: Instant,
    held: Option<Instant>,
    /// A lone `CAN` is waiting for its partner.
    can_pending: bool,
    escape_pending: bool,
    results: Vec<String>,
}

impl Peer {
    pub fn new(registry: Arc<Registry>, medium: Fd, console: Option<Fd>, timing: Timing) -> Self {
        let now = Instant::now();
        Self {
            registry,
            medium,
            console,
            timing,
            started: now,
            deadline: now,
            held: None,
            can_pending: false,
            escape_pending: false,
            results: Vec::new(),
        }
    }

    /// Time since this peer was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Sets the deadline `units` from now.
    pub fn tm(&mut self, units: u32) {
        self.deadline = Instant::now() + self.timing.units(units);
    }

    /// Moves the deadline `units` earlier.
    pub fn tm_red(&mut self, units: u32) {
        let by = self.timing.units(units);
        self.deadline = self.deadline.checked_sub(by).unwrap_or(self.started);
    }

    /// Holds the current deadline and installs one `units` from now. Only one
    /// deadline can be held; pushing again replaces it.
    pub fn tm_push(&mut self, units: u32) {
        self.held = Some(self.deadline);
        self.tm(units);
    }

    /// Restores the held deadline, if any.
    pub fn tm_pop(&mut self) {
        if let Some(held) = self.held.take() {
            self.deadline = held;
        }
    }

    pub fn send_byte(&mut self, byte: u8) -> Result<(), ProtocolError> {
        trace!("{} -> {byte:#04x}", self.medium);
        self.registry.write(self.medium, &[byte])?;
        Ok(())
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        trace!("{} -> {} bytes", self.medium, bytes.len());
        self.registry.write(self.medium, bytes)?;
        Ok(())
    }

    /// Tells the other side to abort.
    pub fn cans(&mut self) -> Result<(), ProtocolError> {
        debug!("{} sending cancel sequence", self.medium);
        self.send(&[CAN; CAN_LEN])
    }

    /// Waits until the medium has taken everything written so far.
    pub fn drain(&mut self) -> Result<(), ProtocolError> {
        self.registry.drain(self.medium)?;
        Ok(())
    }

    /// Reads until `buf` is full, giving up once nothing arrives for one
    /// character timeout or the medium closes. Returns the bytes read.
    pub fn read_timed(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let gap = self.timing.units(TM_CHAR);
        let mut total = 0;

        while total < buf.len() {
            let n = self
                .registry
                .read_min(self.medium, &mut buf[total..], 1, Some(Duration::ZERO))?;
            if n > 0 {
                total += n;
                continue;
            }

            let ready = self.registry.select(&[self.medium], Some(gap))?;
            if ready.is_empty() {
                break;
            }
            let n = self
                .registry
                .read_min(self.medium, &mut buf[total..], 1, Some(Duration::ZERO))?;
            if n == 0 {
                // readable with nothing pending: the medium is gone
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Discards input until the line stays idle for one character timeout.
    pub fn purge(&mut self) -> Result<(), ProtocolError> {
        let idle = self.timing.units(TM_CHAR);
        let mut scratch = [0; 256];
        let mut purged = 0;

        loop {
            if self.registry.select(&[self.medium], Some(idle))?.is_empty() {
                break;
            }
            let n = self
                .registry
                .read_min(self.medium, &mut scratch, 1, Some(Duration::ZERO))?;
            if n == 0 {
                break;
            }
            purged += n;
        }
        debug!("{} purged {purged} bytes", self.medium);
        Ok(())
    }

    /// Appends a per-file outcome.
    pub fn record(&mut self, outcome: &str) {
        self.results.push(outcome.to_string());
    }

    /// Outcomes recorded so far, comma separated.
    pub fn result(&self) -> String {
        self.results.join(", ")
    }

    /// Runs `machine` until it stops, posting medium, console and timeout
    /// events to it.
    pub fn transfer<M: LinkMachine>(&mut self, machine: &mut M) -> Result<(), ProtocolError> {
        machine.start(self)?;

        while machine.is_running() {
            let fds: Vec<Fd> = [Some(self.medium), self.console]
                .into_iter()
                .flatten()
                .collect();
            let left = self.deadline.saturating_duration_since(Instant::now());
            let ready = self.registry.select(&fds, Some(left))?;

            if ready.is_empty() {
                self.on_timeout(machine)?;
                continue;
            }
            if ready.contains(&self.medium) {
                self.on_medium(machine)?;
            }
            if let Some(console) = self.console {
                if machine.is_running() && ready.contains(&console) {
                    self.on_console(console, machine)?;
                }
            }
        }
        Ok(())
    }

    fn on_timeout<M: LinkMachine>(&mut self, machine: &mut M) -> Result<(), ProtocolError> {
        if self.can_pending {
            self.can_pending = false;
            self.tm_pop();
            debug!("{} lone CAN dropped", self.medium);
            return Ok(());
        }
        machine.handle(self, Event::Timeout)
    }

    fn on_medium<M: LinkMachine>(&mut self, machine: &mut M) -> Result<(), ProtocolError> {
        let mut byte = [0; 1];
        let n = self
            .registry
            .read_min(self.medium, &mut byte, 1, Some(Duration::ZERO))?;
        if n == 0 {
            warn!("{} medium closed mid-transfer", self.medium);
            return Err(ProtocolError::Disconnected);
        }

        let byte = byte[0];
        trace!("{} <- {byte:#04x}", self.medium);
        if byte == CAN {
            if self.can_pending {
                self.can_pending = false;
                self.tm_pop();
                warn!("{} remote cancel", self.medium);
                return machine.handle(self, Event::RemoteCancel);
            }
            self.can_pending = true;
            self.tm_push(TM_2CHAR);
            return Ok(());
        }

        if self.can_pending {
            self.can_pending = false;
            self.tm_pop();
            debug!("{} lone CAN dropped", self.medium);
        }
        machine.handle(self, Event::Byte(byte))
    }

    fn on_console<M: LinkMachine>(
        &mut self,
        console: Fd,
        machine: &mut M,
    ) -> Result<(), ProtocolError> {
        let mut key = [0; 1];
        let n = self
            .registry
            .read_min(console, &mut key, 1, Some(Duration::ZERO))?;
        if n == 0 {
            debug!("{console} console closed");
            self.console = None;
            return Ok(());
        }

        match (self.escape_pending, key[0]) {
            (true, KB_CANCEL) => {
                self.escape_pending = false;
                warn!("{} keyboard cancel", self.medium);
                machine.handle(self, Event::KeyboardCancel)
            }
            (_, KB_ESCAPE) => {
                self.escape_pending = true;
                Ok(())
            }
            _ => {
                self.escape_pending = false;
                Ok(())
            }
        }
    }
}
