//! Worker-side coordinator of a basalt pipeline module.
//!
//! [`ApplicationProcess`] performs the startup handshake with the controller
//! and datamanager and then hands out control messages, deferring the ones
//! that arrive while it waits for a specific reply.

mod error;
mod process;
mod queue;
mod state;

pub use error::AppError;
pub use process::ApplicationProcess;
pub use queue::MessageQueue;
pub use state::ProcessState;
