//! conduit CLI binary.
//!
//! Entry point for the `conduit` command-line tool.

use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use conduit_cli::exit::{codes, exit_code};
use conduit_cli::{execute_ipfix, execute_pipe, Cli, Command, CommandError, ReplayResult};
use conduit_export::{Level, Logger, ProcessEvents, ShutdownCheck, ShutdownFlag, TracingLogger};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Set up shutdown handler for graceful termination on Ctrl+C
    let shutdown = ShutdownFlag::new();
    let logger: Arc<dyn Logger> = Arc::new(TracingLogger::new());

    let result = match cli.command {
        Command::Ipfix(args) => execute_ipfix(&args, &shutdown, logger, &mut io::stdout()),
        Command::Pipe(args) => run_pipe(args, &shutdown, logger),
    };

    match result {
        Ok(result) => {
            print_summary(&result);
            if result.interrupted || shutdown.should_stop() {
                ExitCode::from(codes::SIGINT as u8)
            } else {
                ExitCode::from(codes::SUCCESS as u8)
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(exit_code(&e) as u8)
        }
    }
}

/// `RUST_LOG` when set, otherwise the level selected by `-v`.
fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::from_verbosity(verbose).as_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Run the pipe command with SIGUSR2, SIGCHLD and SIGPIPE wired to the exporter.
fn run_pipe(
    args: conduit_cli::PipeArgs,
    shutdown: &ShutdownFlag,
    logger: Arc<dyn Logger>,
) -> Result<ReplayResult, CommandError> {
    let events = ProcessEvents::manual();
    let _registration = events.register()?;
    execute_pipe(&args, events, shutdown, logger, &mut io::stdout())
}

fn print_summary(result: &ReplayResult) {
    let stats = &result.stats;
    println!(
        "Replayed {} packets: {} forwarded ({} bytes), {} dropped, {} messages, {} restarts",
        result.packets_read,
        stats.forwarded_packets,
        stats.forwarded_bytes,
        stats.dropped_packets,
        stats.messages,
        stats.restarts
    );
    if stats.missing_fields > 0 {
        println!("  {} template fields were zero-filled", stats.missing_fields);
    }
}
