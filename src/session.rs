//! Wiring for one complete transfer.
//!
//! A [`Session`] builds the line the way a pair of terminals would see it:
//!
//! ```text
//! sender <-> medium <-> receiver
//!   ^                      ^
//! console               console
//! ```
//!
//! Every arrow is a socket pair from one shared [`Registry`]. The sender,
//! receiver and medium each run on their own named thread and talk to each
//! other only through those pairs. Keyboard input reaches the peers through
//! [`Consoles`].
//!
//! # Shutdown
//!
//! The receiver's endpoint is closed as soon as the receiver stops. A sender
//! that finished cleanly is closed only after that, so the receiver always
//! sees the last frame it was sent; a sender that failed or was cancelled is
//! closed at once. The medium notices either closure, closes its own ends and
//! is joined last.
use std::{
    io,
    path::PathBuf,
    sync::{Arc, mpsc},
    thread,
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    medium::{Medium, MediumConfig, MediumError, MediumStats},
    protocol::{Peer, ProtocolError, Receiver, ReceiverConfig, Sender, SenderConfig},
    transport::{Fd, Registry, TransportError},
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Medium(#[from] MediumError),
    #[error("Session IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("{0} thread panicked")]
    Thread(String),
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub files: Vec<PathBuf>,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
    pub medium: MediumConfig,
}

/// Which terminal keyboard input goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Sender,
    Receiver,
}

/// Keyboard ends of both peers' consoles.
#[derive(Clone)]
pub struct Consoles {
    registry: Arc<Registry>,
    sender: Fd,
    receiver: Fd,
}

impl Consoles {
    pub fn new(registry: Arc<Registry>, sender: Fd, receiver: Fd) -> Self {
        Self {
            registry,
            sender,
            receiver,
        }
    }

    /// Types `bytes` on one terminal.
    pub fn write(&self, terminal: Terminal, bytes: &[u8]) -> Result<(), TransportError> {
        let fd = match terminal {
            Terminal::Sender => self.sender,
            Terminal::Receiver => self.receiver,
        };
        self.registry.write(fd, bytes)?;
        Ok(())
    }

    /// Types the cancel escape on both terminals.
    pub fn cancel(&self) {
        for terminal in [Terminal::Sender, Terminal::Receiver] {
            if let Err(e) = self.write(terminal, b"&c") {
                debug!("{terminal:?} console gone: {e}");
            }
        }
    }
}

/// How one peer ended.
#[derive(Debug, Default)]
pub struct PeerReport {
    /// Per-file outcomes, comma separated.
    pub result: String,
    pub error: Option<ProtocolError>,
}

#[derive(Debug)]
pub struct SessionReport {
    pub sender: PeerReport,
    pub receiver: PeerReport,
    pub medium: MediumStats,
}

#[derive(Debug, Clone, Copy)]
enum Finished {
    Sender { clean: bool },
    Receiver,
}

pub struct Session {
    registry: Arc<Registry>,
    config: SessionConfig,
    sender_line: Fd,
    receiver_line: Fd,
    medium_ends: (Fd, Fd),
    sender_console: Fd,
    receiver_console: Fd,
    consoles: Consoles,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let registry = Arc::new(Registry::new());
        let (sender_line, medium_a) = registry.create_pair()?;
        let (medium_b, receiver_line) = registry.create_pair()?;
        let (sender_keys, sender_console) = registry.create_pair()?;
        let (receiver_keys, receiver_console) = registry.create_pair()?;

        let consoles = Consoles::new(Arc::clone(&registry), sender_keys, receiver_keys);

        Ok(Self {
            registry,
            config,
            sender_line,
            receiver_line,
            medium_ends: (medium_a, medium_b),
            sender_console,
            receiver_console,
            consoles,
        })
    }

    pub fn consoles(&self) -> Consoles {
        self.consoles.clone()
    }

    /// Runs the transfer to completion.
    pub fn run(self) -> Result<SessionReport, SessionError> {
        let Self {
            registry,
            config,
            sender_line,
            receiver_line,
            medium_ends,
            sender_console,
            receiver_console,
            consoles,
        } = self;

        info!("transferring {} file(s)", config.files.len());
        let medium = Medium::new(Arc::clone(&registry), medium_ends.0, medium_ends.1, config.medium)?;
        let medium = thread::Builder::new()
            .name("medium".into())
            .spawn(move || medium.run())?;

        let (tx, rx) = mpsc::channel();

        let sender = {
            let registry = Arc::clone(&registry);
            let tx = tx.clone();
            let timing = config.sender.timing;
            let mut machine = Sender::new(config.files, config.sender);
            thread::Builder::new().name("sender".into()).spawn(move || {
                let mut peer = Peer::new(registry, sender_line, Some(sender_console), timing);
                let res = peer.transfer(&mut machine);
                let clean = res.is_ok() && !machine.is_cancelled();
                let _ = tx.send(Finished::Sender { clean });
                PeerReport {
                    result: peer.result(),
                    error: res.err(),
                }
            })?
        };

        let receiver = {
            let registry = Arc::clone(&registry);
            let timing = config.receiver.timing;
            let mut machine = Receiver::new(config.receiver);
            thread::Builder::new()
                .name("receiver".into())
                .spawn(move || {
                    let mut peer =
                        Peer::new(registry, receiver_line, Some(receiver_console), timing);
                    let res = peer.transfer(&mut machine);
                    let _ = tx.send(Finished::Receiver);
                    PeerReport {
                        result: peer.result(),
                        error: res.err(),
                    }
                })?
        };

        let mut sender_waiting = false;
        for finished in rx.iter() {
            debug!("{finished:?}");
            match finished {
                Finished::Sender { clean: true } => sender_waiting = true,
                Finished::Sender { clean: false } => close(&registry, sender_line)?,
                Finished::Receiver => {
                    close(&registry, receiver_line)?;
                    if sender_waiting {
                        close(&registry, sender_line)?;
                    }
                }
            }
        }
        // a worker that panicked never reported in
        close(&registry, sender_line)?;
        close(&registry, receiver_line)?;

        let sender = join("sender", sender)?;
        let receiver = join("receiver", receiver)?;
        let medium = join("medium", medium)??;

        for fd in [consoles.sender, consoles.receiver, sender_console, receiver_console] {
            close(&registry, fd)?;
        }

        if let Some(e) = &sender.error {
            warn!("sender failed: {e}");
        }
        if let Some(e) = &receiver.error {
            warn!("receiver failed: {e}");
        }
        info!("sender: {:?}, receiver: {:?}", sender.result, receiver.result);

        Ok(SessionReport {
            sender,
            receiver,
            medium,
        })
    }
}

fn close(registry: &Registry, fd: Fd) -> Result<(), TransportError> {
    if registry.is_open(fd) {
        registry.close(fd)?;
    }
    Ok(())
}

fn join<T>(name: &str, handle: thread::JoinHandle<T>) -> Result<T, SessionError> {
    handle
        .join()
        .map_err(|_| SessionError::Thread(name.to_string()))
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use tempdir::TempDir;

    use super::*;
    use crate::protocol::{RetryPolicy, Timing};

    fn config(dir: &TempDir, files: &[&str], policy: RetryPolicy) -> SessionConfig {
        let timing = Timing {
            unit: Duration::from_millis(20),
        };
        let out_dir = dir.path().join("out");
        fs::create_dir_all(&out_dir).unwrap();

        SessionConfig {
            files: files.iter().map(|name| dir.path().join(name)).collect(),
            sender: SenderConfig {
                timing,
                policy,
                ..Default::default()
            },
            receiver: ReceiverConfig {
                timing,
                out_dir,
                ..Default::default()
            },
            medium: MediumConfig::default(),
        }
    }

    fn assert_copied(dir: &TempDir, name: &str) {
        assert_eq!(
            fs::read(dir.path().join("out").join(name)).unwrap(),
            fs::read(dir.path().join(name)).unwrap(),
            "{name} differs"
        );
    }

    #[test]
    fn transfers_batch() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = TempDir::new("session").unwrap();
        fs::write(dir.path().join("a.txt"), b"hello, world").unwrap();
        fs::write(dir.path().join("b.bin"), b"").unwrap();

        let session = Session::new(config(&dir, &["a.txt", "b.bin"], RetryPolicy::NakRetry)).unwrap();
        let report = session.run().unwrap();

        assert!(report.receiver.error.is_none());
        assert!(report.sender.error.is_none());
        assert_eq!(report.receiver.result, "Done, Done");
        assert_eq!(report.sender.result, "Done, Done");
        assert_copied(&dir, "a.txt");
        assert_copied(&dir, "b.bin");
        assert_eq!(fs::metadata(dir.path().join("out/b.bin")).unwrap().len(), 0);
    }

    #[test]
    fn corrupted_block_costs_one_retransmission() {
        let dir = TempDir::new("session").unwrap();
        fs::write(dir.path().join("a.txt"), b"hello, world").unwrap();

        let mut config = config(&dir, &["a.txt"], RetryPolicy::NakRetry);
        // block 0 is the first 133 bytes; this lands in block 1's payload
        config.medium.corrupt_offsets = vec![133 + 5];
        let report = Session::new(config).unwrap().run().unwrap();

        assert_eq!(report.receiver.result, "Done");
        assert_eq!(report.medium.corrupted, 1);
        // the damaged block plus the first EOT
        assert_eq!(report.medium.naks, 2);
        assert_copied(&dir, "a.txt");
    }

    #[test]
    fn clean_transfer_naks_only_first_eot() {
        let dir = TempDir::new("session").unwrap();
        fs::write(dir.path().join("a.txt"), b"hello, world").unwrap();

        let report = Session::new(config(&dir, &["a.txt"], RetryPolicy::NakRetry))
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(report.medium.naks, 1);
        assert_eq!(report.medium.corrupted, 0);
    }

    #[test]
    fn missing_file_is_skipped() {
        let dir = TempDir::new("session").unwrap();
        fs::write(dir.path().join("a.txt"), b"still sent").unwrap();

        let report = Session::new(config(&dir, &["gone.txt", "a.txt"], RetryPolicy::NakRetry))
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(report.sender.result, "OpenError, Done");
        assert_eq!(report.receiver.result, "Done");
        assert_copied(&dir, "a.txt");
    }

    #[test]
    fn name_too_long_for_block0_is_skipped() {
        let dir = TempDir::new("session").unwrap();
        let long = "x".repeat(124);
        fs::write(dir.path().join(&long), vec![b'x'; 1000]).unwrap();
        fs::write(dir.path().join("a.txt"), b"still sent").unwrap();

        let report = Session::new(config(&dir, &[long.as_str(), "a.txt"], RetryPolicy::NakRetry))
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(report.sender.result, "OpenError, Done");
        assert_eq!(report.receiver.result, "Done");
        assert!(!dir.path().join("out").join(&long).exists());
        assert_copied(&dir, "a.txt");
    }

    #[test]
    fn assume_ack_streams_multi_block_file() {
        let dir = TempDir::new("session").unwrap();
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        fs::write(dir.path().join("big.bin"), &content).unwrap();

        let report = Session::new(config(&dir, &["big.bin"], RetryPolicy::AssumeAck))
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(report.sender.result, "Done");
        assert_eq!(report.receiver.result, "Done");
        assert_copied(&dir, "big.bin");
    }

    #[test]
    fn keyboard_cancel_stops_both_peers() {
        let dir = TempDir::new("session").unwrap();
        fs::write(dir.path().join("a.txt"), b"never finished").unwrap();

        let session = Session::new(config(&dir, &["a.txt"], RetryPolicy::NakRetry)).unwrap();
        session.consoles().cancel();
        let report = session.run().unwrap();

        assert_eq!(report.sender.result, "Cancelled");
        assert_eq!(report.receiver.result, "Cancelled");
    }
}
