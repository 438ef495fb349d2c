//! Exit codes for the conduit CLI.
//!
//! Following Unix conventions for exit codes.

use crate::commands::CommandError;

/// Exit code constants.
pub mod codes {
    /// Successful execution.
    pub const SUCCESS: i32 = 0;
    /// Invalid arguments.
    pub const INVALID_ARGS: i32 = 1;
    /// Configuration file unreadable or rejected.
    pub const CONFIG_ERROR: i32 = 2;
    /// IO error.
    pub const IO_ERROR: i32 = 3;
    /// Capture could not be decoded.
    pub const CAPTURE_ERROR: i32 = 4;
    /// Sink failed fatally.
    pub const SINK_ERROR: i32 = 5;
    /// Signal handlers could not be installed.
    pub const SIGNAL_ERROR: i32 = 6;
    /// Interrupted by signal (128 + signal number).
    pub const SIGINT: i32 = 130;
}

/// Map a CommandError to an exit code.
pub fn exit_code(error: &CommandError) -> i32 {
    match error {
        CommandError::InvalidArgument(_) => codes::INVALID_ARGS,
        CommandError::Config(_) => codes::CONFIG_ERROR,
        CommandError::Input { .. } => codes::IO_ERROR,
        CommandError::Capture(_) => codes::CAPTURE_ERROR,
        CommandError::Packet(_) => codes::CAPTURE_ERROR,
        CommandError::Sink(_) => codes::SINK_ERROR,
        CommandError::Signal(_) => codes::SIGNAL_ERROR,
        CommandError::Output(_) => codes::IO_ERROR,
        CommandError::Stats(_) => codes::IO_ERROR,
    }
}
