//! The line between the two terminals.
//!
//! A [`Medium`] owns one endpoint of the sender's pair and one of the
//! receiver's, and copies bytes across in both directions until either side
//! goes away. It can flip a bit at chosen offsets of the sender's stream to
//! exercise error recovery, and counts the `NAK`s that come back.
//!
//! # Traffic Log
//!
//! With a log path configured every relayed chunk is appended as a
//! [`TrafficRecord`], bincode encoded (big-endian, fixed-width integers), so a
//! session can be inspected afterwards with [`read_traffic_log`].
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_std_read, encode_into_std_write,
};
use log::{debug, info, trace};
use thiserror::Error;

use crate::{
    protocol::NAK,
    transport::{Fd, Registry, TransportError},
};

#[derive(Debug, Error)]
pub enum MediumError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to encode traffic record: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode traffic record: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("Traffic log IO Error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct MediumConfig {
    /// Offsets into the sender's byte stream whose low bit gets flipped.
    pub corrupt_offsets: Vec<usize>,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediumStats {
    /// Bytes carried from sender to receiver.
    pub forward: usize,
    /// Bytes carried from receiver to sender.
    pub back: usize,
    pub corrupted: usize,
    pub naks: usize,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum Direction {
    /// Sender to receiver.
    Forward,
    /// Receiver to sender.
    Back,
}

/// One relayed chunk as stored in the traffic log.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct TrafficRecord {
    pub direction: Direction,
    /// Microseconds since the medium started.
    pub at_micros: u64,
    pub bytes: Vec<u8>,
}

fn log_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

pub struct Medium {
    registry: Arc<Registry>,
    sender_side: Fd,
    receiver_side: Fd,
    corrupt_offsets: Vec<usize>,
    log: Option<BufWriter<File>>,
    started: Instant,
    stats: MediumStats,
}

impl Medium {
    pub fn new(
        registry: Arc<Registry>,
        sender_side: Fd,
        receiver_side: Fd,
        config: MediumConfig,
    ) -> Result<Self, MediumError> {
        let log = match config.log_path {
            Some(path) => {
                info!("logging traffic to {}", path.display());
                Some(BufWriter::new(File::create(path)?))
            }
            None => None,
        };

        Ok(Self {
            registry,
            sender_side,
            receiver_side,
            corrupt_offsets: config.corrupt_offsets,
            log,
            started: Instant::now(),
            stats: MediumStats::default(),
        })
    }

    /// Relays until either side closes, then closes both of its endpoints.
    pub fn run(mut self) -> Result<MediumStats, MediumError> {
        let res = self.relay();
        self.shutdown()?;
        res?;

        info!("medium done: {:?}", self.stats);
        Ok(self.stats)
    }

    fn relay(&mut self) -> Result<(), MediumError> {
        let mut buf = [0; 512];
        let sides = [self.sender_side, self.receiver_side];

        loop {
            for fd in self.registry.select(&sides, None)? {
                let n = self
                    .registry
                    .read_min(fd, &mut buf, 1, Some(Duration::ZERO))?;
                if n == 0 {
                    debug!("{fd} closed, stopping medium");
                    return Ok(());
                }

                let direction = if fd == self.sender_side {
                    Direction::Forward
                } else {
                    Direction::Back
                };
                if !self.pass(direction, &mut buf[..n])? {
                    return Ok(());
                }
            }
        }
    }

    /// Forwards one chunk. Returns `false` once the destination is gone.
    fn pass(&mut self, direction: Direction, bytes: &mut [u8]) -> Result<bool, MediumError> {
        let to = match direction {
            Direction::Forward => {
                let start = self.stats.forward;
                for (i, byte) in bytes.iter_mut().enumerate() {
                    if self.corrupt_offsets.contains(&(start + i)) {
                        debug!("corrupting byte {}", start + i);
                        *byte ^= 0x01;
                        self.stats.corrupted += 1;
                    }
                }
                self.stats.forward += bytes.len();
                self.receiver_side
            }
            Direction::Back => {
                self.stats.naks += bytes.iter().filter(|b| **b == NAK).count();
                self.stats.back += bytes.len();
                self.sender_side
            }
        };
        trace!("medium {direction:?} {} bytes", bytes.len());

        if let Some(log) = self.log.as_mut() {
            let record = TrafficRecord {
                direction,
                at_micros: self.started.elapsed().as_micros() as u64,
                bytes: bytes.to_vec(),
            };
            encode_into_std_write(record, log, log_config())?;
        }

        match self.registry.write(to, bytes) {
            Ok(_) => Ok(true),
            Err(TransportError::PeerClosed(_)) => {
                debug!("{to} counterpart gone, stopping medium");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn shutdown(&mut self) -> Result<(), MediumError> {
        for fd in [self.sender_side, self.receiver_side] {
            if self.registry.is_open(fd) {
                self.registry.close(fd)?;
            }
        }
        if let Some(log) = self.log.as_mut() {
            log.flush()?;
        }
        Ok(())
    }
}

/// Reads back every record of a traffic log.
pub fn read_traffic_log(path: &Path) -> Result<Vec<TrafficRecord>, MediumError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();

    while !reader.fill_buf()?.is_empty() {
        let record: TrafficRecord = decode_from_std_read(&mut reader, log_config())?;
        records.push(record);
    }
    Ok(records)
}
