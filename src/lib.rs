pub mod cli;
pub mod medium;
pub mod protocol;
pub mod session;
pub mod transport;

pub use cli::{Command, Kvm, prompt};
pub use session::{Session, SessionConfig, SessionReport};
pub use transport::{Fd, Registry};
