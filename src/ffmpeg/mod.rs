//! FFmpeg integration: argument construction/validation plus the process
//! supervisor that launches and monitors the resulting command.

pub mod args;
pub mod supervisor;

pub use args::ArgBuilder;
pub use supervisor::{status_for_outcome, ProcessSupervisor, SupervisorOutcome};
