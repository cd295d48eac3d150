//! Container process I/O and signalling.

pub mod console;
pub mod fifo;
pub mod pump;
pub mod signal;

pub use console::{ConsoleSocket, send_pty_master};
pub use pump::ConsolePump;
pub use signal::StopSignal;
