//! Command implementations.

mod export;
mod replay;

pub use export::{execute_ipfix, execute_pipe, ipfix_config, pipe_config};
pub use replay::{replay_capture, ReplayResult};

use std::path::PathBuf;

use conduit_export::{ConfigError, SignalError, SinkError};
use conduit_packet::PacketError;
use thiserror::Error;

use crate::cli::CliError;

/// Errors from command execution.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] CliError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to open {path}: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("capture error: {0}")]
    Capture(#[from] pcap_file::PcapError),

    #[error("malformed packet: {0}")]
    Packet(#[from] PacketError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("signal setup failed: {0}")]
    Signal(#[from] SignalError),

    #[error("failed to write statistics: {0}")]
    Output(#[from] std::io::Error),

    #[error("failed to encode statistics: {0}")]
    Stats(#[from] serde_json::Error),
}

/// Result of command execution.
pub type CommandResult<T> = Result<T, CommandError>;
