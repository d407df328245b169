//! Keyboard switch for the two terminals.
//!
//! Lines typed on stdin go to whichever terminal is selected, the receiver
//! at first. A few lines are commands for the switch itself:
//!
//! - `~1` selects the sender's terminal.
//! - `~2` selects the receiver's terminal.
//! - `~q!` stops routing.
//!
//! Typing `&c` on a terminal cancels the transfer running there.
use std::io::{self, BufRead, Write};

use log::debug;

use crate::session::{Consoles, Terminal};

/// Possible lines from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `~1` or `~2`
    Switch(Terminal),
    /// `~q!`
    Quit,
    /// Anything else, newline included, for the selected terminal.
    Input(String),
}

/// Interprets one input line.
pub fn parse_line(line: &str) -> Result<Command, String> {
    match line.trim_end() {
        "~1" => Ok(Command::Switch(Terminal::Sender)),
        "~2" => Ok(Command::Switch(Terminal::Receiver)),
        "~q!" => Ok(Command::Quit),
        s if s.starts_with('~') => Err(format!("unrecognized switch command '{s}'")),
        _ => Ok(Command::Input(line.to_string())),
    }
}

/// Prompts for and reads one line. Returns `None` at end of input.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> io::Result<Option<Result<Command, String>>>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(None);
    }
    Ok(Some(parse_line(&s)))
}

fn terminal_number(terminal: Terminal) -> u8 {
    match terminal {
        Terminal::Sender => 1,
        Terminal::Receiver => 2,
    }
}

/// Routes keyboard lines to one of the two terminals.
pub struct Kvm {
    consoles: Consoles,
    selected: Terminal,
}

impl Kvm {
    pub fn new(consoles: Consoles) -> Self {
        Self {
            consoles,
            selected: Terminal::Receiver,
        }
    }

    pub fn selected(&self) -> Terminal {
        self.selected
    }

    /// Reads lines until `~q!`, end of input, or the selected terminal goes
    /// away.
    pub fn run<R, W>(&mut self, mut reader: R, mut writer: W) -> io::Result<()>
    where
        R: BufRead,
        W: Write,
    {
        writeln!(
            writer,
            "input routed to terminal {}",
            terminal_number(self.selected)
        )?;

        while let Some(command) = prompt(&mut reader, &mut writer)? {
            match command {
                Ok(Command::Switch(terminal)) => {
                    self.selected = terminal;
                    writeln!(writer, "switching to terminal {}", terminal_number(terminal))?;
                }
                Ok(Command::Quit) => {
                    writeln!(writer, "kvm terminating")?;
                    break;
                }
                Ok(Command::Input(line)) => {
                    if let Err(e) = self.consoles.write(self.selected, line.as_bytes()) {
                        debug!("console write failed: {e}");
                        writeln!(writer, "terminal {} is gone", terminal_number(self.selected))?;
                        break;
                    }
                }
                Err(e) => writeln!(writer, "{e}")?,
            }
        }
        Ok(())
    }
}
