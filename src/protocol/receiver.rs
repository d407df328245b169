use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use super::{
    ACK, BLOCK_LEN, CHUNK, EOT, Event, LinkMachine, MAX_ERRS, NAK, NCG, Peer, ProtocolError, SOH,
    TM_CHAR, TM_SOH, Timing,
    block::{BlockStatus, DATA_POS, CRC_POS, parse_stat_payload, validate},
};

/// Last-good block number while no file is open: block 0 comes next.
const NO_BLOCK: u8 = u8::MAX;

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub timing: Timing,
    /// Consecutive failures tolerated before giving up.
    pub max_errors: u32,
    /// Directory received files are created in.
    pub out_dir: PathBuf,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            timing: Timing::default(),
            max_errors: MAX_ERRS,
            out_dir: PathBuf::from("."),
        }
    }
}

/// What to do with a received block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Next in sequence and intact: acknowledge and keep.
    FirstGood,
    /// Intact repeat of the last good block: acknowledge only.
    Resent,
    /// Damaged: refuse it. `purge` is false when the line has already gone
    /// quiet (a short block).
    Bad { purge: bool },
    /// Out of sequence in a way a retransmission cannot explain.
    SyncLoss,
}

/// Classifies a received block, start marker included, against the last
/// block accepted.
pub fn classify(raw: &[u8], last_good: u8, file_open: bool) -> Verdict {
    let status = validate(raw);
    match status {
        BlockStatus::Short => return Verdict::Bad { purge: false },
        BlockStatus::Extra | BlockStatus::BadComplement => return Verdict::Bad { purge: true },
        BlockStatus::Good | BlockStatus::BadCrc => {}
    }

    let seq = raw[1];
    let first = seq == last_good.wrapping_add(1);
    if !first && (!file_open || seq != last_good) {
        return Verdict::SyncLoss;
    }

    match (status, first) {
        (BlockStatus::Good, true) => Verdict::FirstGood,
        (BlockStatus::Good, false) => Verdict::Resent,
        _ => Verdict::Bad { purge: true },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingBlock0,
    ReceivingData,
    AwaitingSecondEot,
    Done,
    Cancelled,
    CancelledCreate,
}

/// Receiving side of a YMODEM batch.
pub struct Receiver {
    config: ReceiverConfig,
    state: State,
    last_good: u8,
    file: Option<BufWriter<File>>,
    remaining: u64,
    errors: u32,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            state: State::WaitingBlock0,
            last_good: NO_BLOCK,
            file: None,
            remaining: 0,
            errors: 0,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state, State::Cancelled | State::CancelledCreate)
    }

    fn wait_block0(&mut self, peer: &mut Peer) -> Result<(), ProtocolError> {
        self.state = State::WaitingBlock0;
        peer.send_byte(NCG)?;
        peer.tm(TM_SOH);
        Ok(())
    }

    fn fail(&mut self, peer: &mut Peer) -> Result<(), ProtocolError> {
        self.errors += 1;
        if self.errors >= self.config.max_errors {
            warn!("receiver giving up after {} errors", self.errors);
            peer.cans()?;
            self.file = None;
            self.state = State::Cancelled;
            return Err(ProtocolError::Timeout {
                errors: self.errors,
            });
        }
        Ok(())
    }

    fn on_timeout(&mut self, peer: &mut Peer) -> Result<(), ProtocolError> {
        self.fail(peer)?;
        let prod = match self.state {
            State::WaitingBlock0 => NCG,
            _ => NAK,
        };
        debug!("receiver timed out, sending {prod:#04x}");
        peer.send_byte(prod)?;
        peer.tm(TM_SOH);
        Ok(())
    }

    fn on_block(&mut self, peer: &mut Peer) -> Result<(), ProtocolError> {
        let mut buf = [0; BLOCK_LEN];
        buf[0] = SOH;
        let n = peer.read_timed(&mut buf[1..])?;
        let raw = &buf[..n + 1];

        match classify(raw, self.last_good, self.file.is_some()) {
            Verdict::SyncLoss => {
                warn!("block {} after {}: synchronization lost", raw[1], self.last_good);
                peer.purge()?;
                peer.cans()?;
                self.file = None;
                self.state = State::Cancelled;
                Err(ProtocolError::SyncLoss {
                    received: raw[1],
                    last_good: self.last_good,
                })
            }
            Verdict::Bad { purge } => {
                debug!("bad block ({} of {BLOCK_LEN} bytes, {:?})", raw.len(), validate(raw));
                if purge {
                    peer.purge()?;
                }
                peer.send_byte(NAK)?;
                self.fail(peer)?;
                peer.tm(TM_SOH);
                if !purge {
                    // the short read already waited out one character timeout
                    peer.tm_red(TM_CHAR);
                }
                Ok(())
            }
            Verdict::Resent => {
                debug!("block {} resent", raw[1]);
                peer.send_byte(ACK)?;
                peer.tm(TM_SOH);
                Ok(())
            }
            Verdict::FirstGood => {
                debug!("block {} good", raw[1]);
                self.errors = 0;
                self.last_good = raw[1];
                let payload = &buf[DATA_POS..CRC_POS];
                if self.state == State::WaitingBlock0 {
                    self.on_stat(peer, payload)
                } else {
                    peer.send_byte(ACK)?;
                    self.write_chunk(payload)?;
                    peer.tm(TM_SOH);
                    Ok(())
                }
            }
        }
    }

    fn on_stat(&mut self, peer: &mut Peer, payload: &[u8]) -> Result<(), ProtocolError> {
        let Some(header) = parse_stat_payload(payload) else {
            peer.send_byte(ACK)?;
            info!("batch complete: {}", peer.result());
            self.state = State::Done;
            return Ok(());
        };

        match create(&self.config.out_dir, &header.name) {
            Ok(file) => {
                info!("receiving {} ({} bytes)", header.name, header.size);
                self.file = Some(BufWriter::new(file));
                self.remaining = header.size;
                peer.send_byte(ACK)?;
                peer.send_byte(NCG)?;
                self.state = State::ReceivingData;
                peer.tm(TM_SOH);
            }
            Err(e) => {
                warn!("cannot create {}: {e}", header.name);
                peer.cans()?;
                peer.record("CreateError");
                self.state = State::CancelledCreate;
            }
        }
        Ok(())
    }

    /// Writes what is left of the announced size; padding never reaches disk.
    fn write_chunk(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let n = self.remaining.min(CHUNK as u64) as usize;
        if let Some(file) = self.file.as_mut() {
            file.write_all(&payload[..n])?;
        }
        self.remaining -= n as u64;
        Ok(())
    }

    fn on_eot(&mut self, peer: &mut Peer) -> Result<(), ProtocolError> {
        match self.state {
            State::ReceivingData => {
                // the first EOT is always refused
                peer.send_byte(NAK)?;
                self.state = State::AwaitingSecondEot;
                peer.tm(TM_SOH);
                Ok(())
            }
            State::AwaitingSecondEot => {
                let outcome = match self.close_file() {
                    Ok(()) => "Done",
                    Err(e) => {
                        warn!("closing received file failed: {e}");
                        "CloseError"
                    }
                };
                peer.send_byte(ACK)?;
                peer.record(outcome);
                info!("file received: {outcome}, {:.2?} since start", peer.elapsed());
                self.last_good = NO_BLOCK;
                self.wait_block0(peer)
            }
            _ => {
                debug!("stray EOT ignored");
                Ok(())
            }
        }
    }

    fn close_file(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => file.into_inner().map_err(|e| e.into_error())?.sync_all(),
            None => Ok(()),
        }
    }

    fn cancel(&mut self, peer: &mut Peer) {
        self.file = None;
        peer.record("Cancelled");
        self.state = State::Cancelled;
    }
}

impl LinkMachine for Receiver {
    fn start(&mut self, peer: &mut Peer) -> Result<(), ProtocolError> {
        self.last_good = NO_BLOCK;
        self.wait_block0(peer)
    }

    fn handle(&mut self, peer: &mut Peer, event: Event) -> Result<(), ProtocolError> {
        match event {
            Event::Byte(SOH) => self.on_block(peer),
            Event::Byte(EOT) => self.on_eot(peer),
            Event::Byte(byte) => {
                debug!("receiver ignoring {byte:#04x}");
                Ok(())
            }
            Event::Timeout => self.on_timeout(peer),
            Event::RemoteCancel if self.state == State::WaitingBlock0 && self.file.is_none() => {
                info!("sender skipped a file");
                peer.tm(TM_SOH);
                Ok(())
            }
            Event::RemoteCancel => {
                self.cancel(peer);
                Ok(())
            }
            Event::KeyboardCancel => {
                peer.cans()?;
                self.cancel(peer);
                Ok(())
            }
        }
    }

    fn is_running(&self) -> bool {
        matches!(
            self.state,
            State::WaitingBlock0 | State::ReceivingData | State::AwaitingSecondEot
        )
    }
}

/// Creates `name` inside `dir`, refusing to overwrite. Only the final path
/// component of `name` is used.
fn create(dir: &Path, name: &str) -> io::Result<File> {
    let name = Path::new(name)
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no usable file name"))?;

    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dir.join(name))
}
