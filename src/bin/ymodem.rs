use std::{error::Error, io, path::PathBuf, thread, time::Duration};

use clap::Parser;
use log::{info, warn};
use ymodem_link::{
    cli::Kvm,
    medium::MediumConfig,
    protocol::{ReceiverConfig, RetryPolicy, SenderConfig, Timing},
    session::{Session, SessionConfig},
};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Files to send, in order
    #[arg(required = true)]
    files: Vec<PathBuf>,
    /// Directory received files are written to
    #[arg(short, long, default_value = ".")]
    out: PathBuf,
    /// Length of one protocol time unit in milliseconds
    #[arg(long, default_value_t = 1000)]
    unit_ms: u64,
    /// Treat every block as acknowledged instead of waiting for ACK/NAK
    #[arg(long)]
    assume_ack: bool,
    /// Consecutive errors tolerated before a peer gives up
    #[arg(long, default_value_t = 10)]
    max_errors: u32,
    /// Flip a bit at this offset of the sender's byte stream (repeatable)
    #[arg(long = "corrupt")]
    corrupt: Vec<usize>,
    /// Record relayed traffic to this file
    #[arg(long)]
    log: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let timing = Timing {
        unit: Duration::from_millis(cli.unit_ms),
    };
    let policy = if cli.assume_ack {
        RetryPolicy::AssumeAck
    } else {
        RetryPolicy::NakRetry
    };

    let session = Session::new(SessionConfig {
        files: cli.files,
        sender: SenderConfig {
            timing,
            policy,
            max_errors: cli.max_errors,
        },
        receiver: ReceiverConfig {
            timing,
            max_errors: cli.max_errors,
            out_dir: cli.out,
        },
        medium: MediumConfig {
            corrupt_offsets: cli.corrupt,
            log_path: cli.log,
        },
    })?;

    let consoles = session.consoles();
    ctrlc::set_handler({
        let consoles = consoles.clone();
        move || {
            warn!("interrupted, cancelling transfer");
            consoles.cancel();
        }
    })?;

    // stdin stays open for the life of the process; the thread is not joined
    thread::Builder::new().name("kvm".into()).spawn(move || {
        let mut kvm = Kvm::new(consoles);
        if let Err(e) = kvm.run(io::stdin().lock(), io::stdout()) {
            warn!("keyboard routing stopped: {e}");
        }
    })?;

    let report = session.run()?;
    info!("medium: {:?}", report.medium);

    println!("sender: {}", report.sender.result);
    println!("receiver: {}", report.receiver.result);
    for (role, error) in [
        ("sender", &report.sender.error),
        ("receiver", &report.receiver.error),
    ] {
        if let Some(e) = error {
            println!("{role} error: {e}");
        }
    }
    Ok(())
}
