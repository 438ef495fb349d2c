//! CLI argument parsing for conduit.
//!
//! Two subcommands replay a PCAP capture into a sink: `ipfix` into the batched
//! protocol exporter and `pipe` into the piped process exporter. Flags override
//! the values of the optional JSON configuration file.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use conduit_export::config::DEFAULT_COLLECTOR_PORT;
use conduit_export::{CollectorConfig, TransportKind};
use thiserror::Error;

/// Default seconds between statistics lines.
pub const DEFAULT_STATS_INTERVAL_SEC: u64 = 10;

/// Errors from CLI argument validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    #[error("invalid collector '{0}', expected [udp://|tcp://]host[:port]")]
    InvalidCollector(String),

    #[error("unknown collector transport '{0}'")]
    UnknownTransport(String),

    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error("no reader command given (--reader-cmd or pipe.reader_cmd in the config file)")]
    MissingReaderCommand,
}

/// conduit - replay captured packets into export sinks.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "conduit")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Batch packets into IPFIX messages for network collectors.
    Ipfix(IpfixArgs),
    /// Stream packets as PCAP into a supervised reader process.
    Pipe(PipeArgs),
}

/// Arguments shared by every subcommand.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ReplayArgs {
    /// PCAP capture to replay (required).
    #[arg(short, long)]
    pub input: PathBuf,

    /// JSON configuration file with `batch` and `pipe` sections.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Seconds between JSON statistics lines on stdout; 0 disables them.
    #[arg(long, default_value_t = DEFAULT_STATS_INTERVAL_SEC)]
    pub stats_interval_sec: u64,
}

/// Arguments for the ipfix command.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct IpfixArgs {
    #[command(flatten)]
    pub replay: ReplayArgs,

    /// Collector endpoint, repeatable. Transport defaults to UDP, port to 4739.
    #[arg(long = "collector", value_parser = parse_collector)]
    pub collectors: Vec<CollectorConfig>,

    /// Count trigger: records per message.
    #[arg(long)]
    pub max_packets_per_message: Option<usize>,

    /// Time trigger: maximum age of the oldest batched packet.
    #[arg(long)]
    pub max_packet_lifetime_ms: Option<u64>,

    /// Observation domain id written into every message header.
    #[arg(long)]
    pub observation_domain_id: Option<u32>,
}

impl IpfixArgs {
    /// Validate the arguments.
    pub fn validate(&self) -> Result<(), CliError> {
        if self.max_packets_per_message == Some(0) {
            return Err(CliError::Zero("max-packets-per-message"));
        }
        if self.max_packet_lifetime_ms == Some(0) {
            return Err(CliError::Zero("max-packet-lifetime-ms"));
        }
        Ok(())
    }
}

/// Arguments for the pipe command.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct PipeArgs {
    #[command(flatten)]
    pub replay: ReplayArgs,

    /// Reader command line, split on whitespace (e.g. "tcpdump -n -r -").
    #[arg(long)]
    pub reader_cmd: Option<String>,

    /// Working directory of the reader.
    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// File the reader's stdout and stderr are appended to.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Add a date and time suffix to the log file name.
    #[arg(long, requires = "log_file")]
    pub append_date: bool,

    /// Seconds between SIGTERM and SIGKILL when stopping the reader.
    #[arg(long)]
    pub sig_kill_timeout_sec: Option<u64>,

    /// Restart the reader every N seconds of packet time; 0 never.
    #[arg(long)]
    pub restart_interval_sec: Option<u64>,

    /// Ignore SIGUSR2 restart requests.
    #[arg(long)]
    pub no_restart_on_signal: bool,

    /// Per-record pipe write deadline.
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,
}

impl PipeArgs {
    /// Validate the arguments.
    pub fn validate(&self) -> Result<(), CliError> {
        if self.write_timeout_ms == Some(0) {
            return Err(CliError::Zero("write-timeout-ms"));
        }
        if self.reader_cmd.as_deref().is_some_and(|cmd| cmd.trim().is_empty()) {
            return Err(CliError::MissingReaderCommand);
        }
        Ok(())
    }
}

/// Parse `[udp://|tcp://]host[:port]`. IPv6 hosts with a port go in brackets.
pub fn parse_collector(value: &str) -> Result<CollectorConfig, CliError> {
    let invalid = || CliError::InvalidCollector(value.to_string());

    let (kind, rest) = match value.split_once("://") {
        Some((scheme, rest)) => {
            let kind = scheme
                .parse::<TransportKind>()
                .map_err(|_| CliError::UnknownTransport(scheme.to_string()))?;
            (kind, rest)
        }
        None => (TransportKind::Udp, value),
    };

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']').ok_or_else(invalid)?;
        let port = match after {
            "" => DEFAULT_COLLECTOR_PORT,
            _ => after
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .ok_or_else(invalid)?,
        };
        (host, port)
    } else {
        match rest.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                (host, port.parse().map_err(|_| invalid())?)
            }
            // No port, or a bare IPv6 address.
            _ => (rest, DEFAULT_COLLECTOR_PORT),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }
    Ok(CollectorConfig::new(host, port, kind.to_string()))
}

/// Parse CLI arguments from an iterator of strings.
/// Useful for testing.
pub fn parse_from<I, T>(iter: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(iter)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===========================================
    // Subcommand Parsing Tests
    // ===========================================

    #[test]
    fn test_ipfix_requires_input() {
        let err = parse_from(["conduit", "ipfix"]).unwrap_err();
        assert!(err.to_string().contains("--input"));
    }

    #[test]
    fn test_ipfix_defaults() {
        let cli = parse_from(["conduit", "ipfix", "--input", "capture.pcap"]).expect("parse");
        assert_eq!(cli.verbose, 0);
        match cli.command {
            Command::Ipfix(args) => {
                assert_eq!(args.replay.input, PathBuf::from("capture.pcap"));
                assert_eq!(args.replay.config, None);
                assert_eq!(args.replay.stats_interval_sec, DEFAULT_STATS_INTERVAL_SEC);
                assert!(args.collectors.is_empty());
                assert_eq!(args.max_packets_per_message, None);
            }
            _ => panic!("expected Ipfix"),
        }
    }

    #[test]
    fn test_ipfix_repeated_collectors() {
        let cli = parse_from([
            "conduit",
            "ipfix",
            "-i",
            "in.pcap",
            "--collector",
            "udp://127.0.0.1:2055",
            "--collector",
            "tcp://collector.local",
        ])
        .expect("parse");
        match cli.command {
            Command::Ipfix(args) => {
                assert_eq!(
                    args.collectors,
                    vec![
                        CollectorConfig::new("127.0.0.1", 2055, "UDP"),
                        CollectorConfig::new("collector.local", 4739, "TCP"),
                    ]
                );
            }
            _ => panic!("expected Ipfix"),
        }
    }

    #[test]
    fn test_ipfix_bad_collector_rejected_by_clap() {
        let result = parse_from(["conduit", "ipfix", "-i", "in.pcap", "--collector", "sctp://h:1"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_verbose_counts_globally() {
        let cli = parse_from(["conduit", "pipe", "-i", "in.pcap", "-vv"]).expect("parse");
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_pipe_flags() {
        let cli = parse_from([
            "conduit",
            "pipe",
            "--input",
            "in.pcap",
            "--reader-cmd",
            "tcpdump -n -r -",
            "--log-file",
            "/tmp/reader.log",
            "--append-date",
            "--sig-kill-timeout-sec",
            "5",
            "--restart-interval-sec",
            "60",
            "--no-restart-on-signal",
        ])
        .expect("parse");
        match cli.command {
            Command::Pipe(args) => {
                assert_eq!(args.reader_cmd.as_deref(), Some("tcpdump -n -r -"));
                assert_eq!(args.log_file, Some(PathBuf::from("/tmp/reader.log")));
                assert!(args.append_date);
                assert_eq!(args.sig_kill_timeout_sec, Some(5));
                assert_eq!(args.restart_interval_sec, Some(60));
                assert!(args.no_restart_on_signal);
            }
            _ => panic!("expected Pipe"),
        }
    }

    #[test]
    fn test_append_date_requires_log_file() {
        let result = parse_from(["conduit", "pipe", "-i", "in.pcap", "--append-date"]);
        assert!(result.is_err());
    }

    // ===========================================
    // Validation Tests
    // ===========================================

    fn ipfix_args(argv: &[&str]) -> IpfixArgs {
        let mut full = vec!["conduit", "ipfix", "-i", "in.pcap"];
        full.extend_from_slice(argv);
        match parse_from(full).expect("parse").command {
            Command::Ipfix(args) => args,
            _ => panic!("expected Ipfix"),
        }
    }

    fn pipe_args(argv: &[&str]) -> PipeArgs {
        let mut full = vec!["conduit", "pipe", "-i", "in.pcap"];
        full.extend_from_slice(argv);
        match parse_from(full).expect("parse").command {
            Command::Pipe(args) => args,
            _ => panic!("expected Pipe"),
        }
    }

    #[test]
    fn test_ipfix_validate_zero_count_trigger() {
        let args = ipfix_args(&["--max-packets-per-message", "0"]);
        assert_eq!(args.validate(), Err(CliError::Zero("max-packets-per-message")));
    }

    #[test]
    fn test_ipfix_validate_zero_lifetime() {
        let args = ipfix_args(&["--max-packet-lifetime-ms", "0"]);
        assert_eq!(args.validate(), Err(CliError::Zero("max-packet-lifetime-ms")));
    }

    #[test]
    fn test_ipfix_validate_ok() {
        assert_eq!(ipfix_args(&["--max-packets-per-message", "5"]).validate(), Ok(()));
    }

    #[test]
    fn test_pipe_validate_blank_command() {
        let args = pipe_args(&["--reader-cmd", "  "]);
        assert_eq!(args.validate(), Err(CliError::MissingReaderCommand));
    }

    #[test]
    fn test_pipe_validate_zero_write_timeout() {
        let args = pipe_args(&["--write-timeout-ms", "0"]);
        assert_eq!(args.validate(), Err(CliError::Zero("write-timeout-ms")));
    }

    // ===========================================
    // Collector Parsing Tests
    // ===========================================

    #[test]
    fn test_parse_collector_defaults() {
        assert_eq!(
            parse_collector("10.1.1.1"),
            Ok(CollectorConfig::new("10.1.1.1", 4739, "UDP"))
        );
    }

    #[test]
    fn test_parse_collector_scheme_case_insensitive() {
        assert_eq!(
            parse_collector("TCP://host:9995"),
            Ok(CollectorConfig::new("host", 9995, "TCP"))
        );
    }

    #[test]
    fn test_parse_collector_ipv6() {
        assert_eq!(
            parse_collector("udp://[::1]:2055"),
            Ok(CollectorConfig::new("::1", 2055, "UDP"))
        );
        assert_eq!(parse_collector("::1"), Ok(CollectorConfig::new("::1", 4739, "UDP")));
    }

    #[test]
    fn test_parse_collector_errors() {
        assert_eq!(
            parse_collector("sctp://host"),
            Err(CliError::UnknownTransport("sctp".to_string()))
        );
        assert_eq!(
            parse_collector("host:notaport"),
            Err(CliError::InvalidCollector("host:notaport".to_string()))
        );
        assert_eq!(
            parse_collector("udp://:4739"),
            Err(CliError::InvalidCollector("udp://:4739".to_string()))
        );
        assert_eq!(
            parse_collector("[::1"),
            Err(CliError::InvalidCollector("[::1".to_string()))
        );
    }
}
