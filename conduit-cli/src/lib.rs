//! conduit CLI.
//!
//! Argument parsing, configuration layering and the replay loop that feeds a
//! PCAP capture into one of the export sinks.

pub mod cli;
pub mod commands;
pub mod exit;

pub use cli::{parse_collector, parse_from, Cli, CliError, Command, IpfixArgs, PipeArgs, ReplayArgs};
pub use commands::{
    execute_ipfix, execute_pipe, ipfix_config, pipe_config, replay_capture, CommandError,
    CommandResult, ReplayResult,
};
