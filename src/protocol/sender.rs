use std::{
    collections::VecDeque,
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use super::{
    ACK, CHUNK, EOT, Event, LinkMachine, MAX_ERRS, NAK, NCG, Peer, ProtocolError, TM_ACK, TM_SOH,
    Timing,
    block::{Block, FileHeader, encode_data_block, encode_stat_block, end_of_batch_block},
};

/// How the sender treats the receiver's answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Every frame counts as acknowledged once the medium has taken it.
    AssumeAck,
    /// Wait for `C` and `ACK`, resend on `NAK` or timeout.
    #[default]
    NakRetry,
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub timing: Timing,
    pub policy: RetryPolicy,
    /// Consecutive failures tolerated before giving up.
    pub max_errors: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            timing: Timing::default(),
            policy: RetryPolicy::default(),
            max_errors: MAX_ERRS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    SendingStat,
    SendingData,
    EndOfFile,
    BatchEnd,
    Done,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    /// The receiver's `C` before block 0 or the first data block.
    Go,
    /// The answer to the last frame sent.
    Reply,
}

/// Sending side of a YMODEM batch.
pub struct Sender {
    config: SenderConfig,
    files: VecDeque<PathBuf>,
    state: State,
    awaiting: Awaiting,
    file: Option<File>,
    seq: u8,
    last: Vec<u8>,
    eots: u32,
    errors: u32,
}

impl Sender {
    pub fn new(files: Vec<PathBuf>, config: SenderConfig) -> Self {
        Self {
            config,
            files: files.into(),
            state: State::Idle,
            awaiting: Awaiting::Go,
            file: None,
            seq: 0,
            last: Vec::new(),
            eots: 0,
            errors: 0,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == State::Cancelled
    }

    fn wait(&mut self, peer: &mut Peer, awaiting: Awaiting) {
        self.awaiting = awaiting;
        match (self.config.policy, awaiting) {
            (RetryPolicy::AssumeAck, _) => peer.tm(0),
            (RetryPolicy::NakRetry, Awaiting::Go) => peer.tm(TM_SOH),
            (RetryPolicy::NakRetry, Awaiting::Reply) => peer.tm(TM_ACK),
        }
    }

    fn send_frame(&mut self, peer: &mut Peer, frame: Vec<u8>) -> Result<(), ProtocolError> {
        peer.send(&frame)?;
        if self.config.policy == RetryPolicy::AssumeAck {
            peer.drain()?;
        }
        self.last = frame;
        self.wait(peer, Awaiting::Reply);
        Ok(())
    }

    /// Opens the next file that can be opened and sends its block 0, or the
    /// end-of-batch block once none remain. Directories and names too long
    /// for block 0 count as open errors.
    fn offer_next(&mut self, peer: &mut Peer) -> Result<(), ProtocolError> {
        while let Some(path) = self.files.pop_front() {
            match open(&path) {
                Ok((file, header, block)) => {
                    info!("sending {} ({} bytes)", header.name, header.size);
                    self.file = Some(file);
                    self.seq = 0;
                    self.state = State::SendingStat;
                    return self.send_frame(peer, block.as_bytes().to_vec());
                }
                Err(e) => {
                    warn!("cannot open {}: {e}", path.display());
                    peer.cans()?;
                    peer.record("OpenError");
                }
            }
        }

        debug!("no files left, ending batch");
        self.state = State::BatchEnd;
        let block = end_of_batch_block(0);
        self.send_frame(peer, block.as_bytes().to_vec())
    }

    /// Sends the next data block, or starts the end-of-file exchange once the
    /// file is exhausted.
    fn send_next_data(&mut self, peer: &mut Peer) -> Result<(), ProtocolError> {
        let mut chunk = Vec::with_capacity(CHUNK);
        if let Some(file) = self.file.as_mut() {
            file.by_ref().take(CHUNK as u64).read_to_end(&mut chunk)?;
        }

        if chunk.is_empty() {
            self.state = State::EndOfFile;
            self.eots = 1;
            let frame = match self.config.policy {
                // both EOTs go out unprompted
                RetryPolicy::AssumeAck => vec![EOT, EOT],
                RetryPolicy::NakRetry => vec![EOT],
            };
            return self.send_frame(peer, frame);
        }

        self.seq = self.seq.wrapping_add(1);
        self.state = State::SendingData;
        let block = encode_data_block(self.seq, &chunk);
        self.send_frame(peer, block.as_bytes().to_vec())
    }

    fn on_go(&mut self, peer: &mut Peer) -> Result<(), ProtocolError> {
        self.errors = 0;
        match self.state {
            State::SendingStat => self.offer_next(peer),
            State::SendingData => self.send_next_data(peer),
            _ => Ok(()),
        }
    }

    fn on_ack(&mut self, peer: &mut Peer) -> Result<(), ProtocolError> {
        self.errors = 0;
        match self.state {
            State::SendingStat => {
                self.state = State::SendingData;
                self.wait(peer, Awaiting::Go);
            }
            State::SendingData => self.send_next_data(peer)?,
            State::EndOfFile => {
                self.file = None;
                peer.record("Done");
                info!("file sent, {} blocks, {:.2?} since start", self.seq, peer.elapsed());
                self.state = State::SendingStat;
                self.wait(peer, Awaiting::Go);
            }
            State::BatchEnd => {
                info!("batch complete: {}", peer.result());
                self.state = State::Done;
            }
            State::Idle | State::Done | State::Cancelled => {}
        }
        Ok(())
    }

    fn on_nak(&mut self, peer: &mut Peer) -> Result<(), ProtocolError> {
        if self.state == State::EndOfFile && self.eots == 1 {
            // the first EOT is always refused
            self.eots = 2;
            return self.send_frame(peer, vec![EOT]);
        }
        self.retry(peer)
    }

    /// Counts a failure and resends the last frame, or gives up.
    fn retry(&mut self, peer: &mut Peer) -> Result<(), ProtocolError> {
        self.count_error(peer)?;
        debug!("resending {} bytes, attempt {}", self.last.len(), self.errors);
        let frame = std::mem::take(&mut self.last);
        self.send_frame(peer, frame)
    }

    fn count_error(&mut self, peer: &mut Peer) -> Result<(), ProtocolError> {
        self.errors += 1;
        if self.errors >= self.config.max_errors {
            warn!("sender giving up after {} errors", self.errors);
            peer.cans()?;
            self.file = None;
            self.state = State::Cancelled;
            return Err(ProtocolError::Timeout {
                errors: self.errors,
            });
        }
        Ok(())
    }

    fn cancel(&mut self, peer: &mut Peer) {
        self.file = None;
        peer.record("Cancelled");
        self.state = State::Cancelled;
    }

    fn assume_ack(&mut self, peer: &mut Peer, event: Event) -> Result<(), ProtocolError> {
        // answers are not waited for; the clock alone moves things along
        if event != Event::Timeout {
            return Ok(());
        }
        match self.awaiting {
            Awaiting::Go => self.on_go(peer),
            Awaiting::Reply => self.on_ack(peer),
        }
    }

    fn nak_retry(&mut self, peer: &mut Peer, event: Event) -> Result<(), ProtocolError> {
        match (self.awaiting, event) {
            (Awaiting::Go, Event::Byte(NCG)) => self.on_go(peer),
            (Awaiting::Go, Event::Timeout) => {
                self.count_error(peer)?;
                self.wait(peer, Awaiting::Go);
                Ok(())
            }
            (Awaiting::Reply, Event::Byte(ACK)) => self.on_ack(peer),
            (Awaiting::Reply, Event::Byte(NAK)) => self.on_nak(peer),
            (Awaiting::Reply, Event::Timeout) => self.retry(peer),
            (_, Event::Byte(byte)) => {
                debug!("sender ignoring {byte:#04x}");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl LinkMachine for Sender {
    fn start(&mut self, peer: &mut Peer) -> Result<(), ProtocolError> {
        self.state = State::SendingStat;
        self.wait(peer, Awaiting::Go);
        Ok(())
    }

    fn handle(&mut self, peer: &mut Peer, event: Event) -> Result<(), ProtocolError> {
        match event {
            Event::KeyboardCancel => {
                peer.cans()?;
                self.cancel(peer);
                Ok(())
            }
            Event::RemoteCancel => {
                self.cancel(peer);
                Ok(())
            }
            event => match self.config.policy {
                RetryPolicy::AssumeAck => self.assume_ack(peer, event),
                RetryPolicy::NakRetry => self.nak_retry(peer, event),
            },
        }
    }

    fn is_running(&self) -> bool {
        !matches!(self.state, State::Done | State::Cancelled)
    }
}

/// Opens a regular file and builds the block 0 announcing it.
fn open(path: &Path) -> io::Result<(File, FileHeader, Block)> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }

    let header = FileHeader {
        name,
        size: metadata.len(),
    };
    let block = encode_stat_block(0, &header.name, header.size)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    Ok((file, header, block))
}
