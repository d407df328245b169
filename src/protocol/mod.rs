//! YMODEM batch transfer engine.
//!
//! Both ends of a transfer are [`LinkMachine`]s driven by a [`Peer`]. The peer
//! owns the transport descriptors and the protocol clock; it waits on the
//! medium and the console at once and turns what it sees into [`Event`]s for
//! the machine. Machines never block on their own except while reading the
//! rest of a block or purging the line, both of which go through the peer.
//!
//! # Wire Format
//!
//! - Control bytes: `SOH` starts a block, `ACK`/`NAK` answer one, `EOT` ends a
//!   file, `C` asks for CRC mode and two back-to-back `CAN`s abort.
//! - Blocks: `[SOH][seq][!seq][payload; 128][crc_hi][crc_lo]`, see [`block`].
//! - Block 0 of every file carries `name\0size`; an empty name ends the batch.
//!
//! # Timing
//!
//! Timeouts are counted in protocol units (one second on a real line). A
//! [`Timing`] scales them so tests can run the same machines quickly.
//!
//! # See Also
//!
//! - [`transport`](crate::transport): the flow-controlled line both peers sit on.
//! - [`session`](crate::session): wires two peers and a medium together.
pub mod block;
mod peer;
mod receiver;
mod sender;

use std::{io, time::Duration};

use thiserror::Error;

use crate::transport::TransportError;

pub use block::{Block, BlockStatus, FileHeader, HeaderTooLong};
pub use peer::Peer;
pub use receiver::{Receiver, ReceiverConfig, Verdict, classify};
pub use sender::{RetryPolicy, Sender, SenderConfig};

pub const SOH: u8 = 0x01;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
/// Receiver's request for a CRC-mode transfer.
pub const NCG: u8 = b'C';
pub const CTRL_Z: u8 = 0x1a;

pub const CHUNK: usize = 128;
pub const BLOCK_LEN: usize = CHUNK + 5;
/// Bytes following the start marker.
pub const REST_LEN: usize = BLOCK_LEN - 1;
pub const CAN_LEN: usize = 2;

/// Wait for a block or a handshake byte.
pub const TM_SOH: u32 = 10;
/// Gap allowed between characters of one block.
pub const TM_CHAR: u32 = 1;
/// Window for the second character of a cancel sequence.
pub const TM_2CHAR: u32 = 2;
/// Wait for the answer to a block.
pub const TM_ACK: u32 = 10;
pub const MAX_ERRS: u32 = 10;

/// Clock scale for protocol timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub unit: Duration,
}

impl Timing {
    pub fn units(&self, n: u32) -> Duration {
        self.unit * n
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
        }
    }
}

/// Input posted by the [`Peer`] to the active machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A byte from the medium that is not part of a cancel sequence.
    Byte(u8),
    /// The current deadline passed with nothing received.
    Timeout,
    /// Two consecutive `CAN`s arrived from the other side.
    RemoteCancel,
    /// `&c` was typed on the console.
    KeyboardCancel,
}

/// A framed-link state machine: the common shape of sender and receiver.
pub trait LinkMachine {
    /// Runs the entry actions of the initial state.
    fn start(&mut self, peer: &mut Peer) -> Result<(), ProtocolError>;

    fn handle(&mut self, peer: &mut Peer, event: Event) -> Result<(), ProtocolError>;

    fn is_running(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("synchronization lost: received block {received} after block {last_good}")]
    SyncLoss { received: u8, last_good: u8 },

    #[error("gave up after {errors} consecutive errors")]
    Timeout { errors: u32 },

    #[error("medium closed while the transfer was still running")]
    Disconnected,

    #[error("file IO Error: {0}")]
    Io(#[from] io::Error),
}
