//! ipfix and pipe commands: configuration layering and sink lifecycle.

use std::fs::File;
use std::io::{BufReader, Write};
use std::sync::Arc;

use conduit_clock::SystemClock;
use conduit_export::{
    BatchConfig, BatchedProtocolExporter, ConduitConfig, Logger, PipeConfig, PipedProcessExporter,
    ProcessEvents, ShutdownCheck, Sink,
};

use crate::cli::{CliError, IpfixArgs, PipeArgs, ReplayArgs};

use super::replay::{replay_capture, ReplayResult};
use super::{CommandError, CommandResult};

fn load_config(replay: &ReplayArgs) -> CommandResult<ConduitConfig> {
    match &replay.config {
        Some(path) => Ok(ConduitConfig::load(path)?),
        None => Ok(ConduitConfig::default()),
    }
}

/// Batch configuration from the config file with CLI flags applied on top.
///
/// `--collector` flags are added after the collectors of the file.
pub fn ipfix_config(args: &IpfixArgs) -> CommandResult<BatchConfig> {
    let mut config = load_config(&args.replay)?.batch;
    if let Some(max) = args.max_packets_per_message {
        config.max_packets_per_message = max;
    }
    if let Some(lifetime_ms) = args.max_packet_lifetime_ms {
        config.max_packet_lifetime_ms = lifetime_ms;
    }
    if let Some(id) = args.observation_domain_id {
        config.observation_domain_id = id;
    }
    config.collectors.extend(args.collectors.iter().cloned());
    config.validate()?;
    Ok(config)
}

/// Pipe configuration from the config file with CLI flags applied on top.
pub fn pipe_config(args: &PipeArgs) -> CommandResult<PipeConfig> {
    let mut config = load_config(&args.replay)?.pipe;
    if let Some(cmd) = &args.reader_cmd {
        config.reader_cmd = cmd.clone();
    }
    if config.reader_cmd.trim().is_empty() {
        return Err(CliError::MissingReaderCommand.into());
    }
    if let Some(dir) = &args.working_dir {
        config.working_dir = Some(dir.clone());
    }
    if let Some(path) = &args.log_file {
        config.log_file = Some(path.clone());
        config.append_date = args.append_date;
    }
    if let Some(secs) = args.sig_kill_timeout_sec {
        config.sig_kill_timeout_sec = secs;
    }
    if let Some(secs) = args.restart_interval_sec {
        config.restart_interval_sec = secs;
    }
    if args.no_restart_on_signal {
        config.restart_on_signal = false;
    }
    if let Some(timeout_ms) = args.write_timeout_ms {
        config.write_timeout_ms = timeout_ms;
    }
    config.validate()?;
    Ok(config)
}

/// Replay the capture into a started sink, then stop it.
///
/// A complete replay lets the sink process everything still queued; an
/// interrupted or failed one terminates it. Either way every packet is released.
fn run_sink<S, H, W>(sink: &S, replay: &ReplayArgs, shutdown: &H, stats_out: &mut W) -> CommandResult<ReplayResult>
where
    S: Sink,
    H: ShutdownCheck,
    W: Write,
{
    let input = File::open(&replay.input).map_err(|source| CommandError::Input {
        path: replay.input.clone(),
        source,
    })?;

    sink.start()?;
    let replayed = replay_capture(
        BufReader::new(input),
        sink,
        shutdown,
        &SystemClock,
        replay.stats_interval_sec,
        stats_out,
    );
    let stopped = match &replayed {
        Ok(result) if !result.interrupted => sink.finish(shutdown),
        _ => sink.terminate(),
    };

    let mut result = replayed?;
    stopped?;
    result.stats = sink.stats();
    Ok(result)
}

/// Execute the ipfix command.
pub fn execute_ipfix<H, W>(
    args: &IpfixArgs,
    shutdown: &H,
    logger: Arc<dyn Logger>,
    stats_out: &mut W,
) -> CommandResult<ReplayResult>
where
    H: ShutdownCheck,
    W: Write,
{
    args.validate()?;
    let config = ipfix_config(args)?;
    let configured = config.collectors.len();

    let exporter = BatchedProtocolExporter::new(config, Arc::clone(&logger))?;
    if exporter.collector_count() == 0 {
        logger.warn("no usable collectors; messages will be built but not sent");
    } else if exporter.collector_count() < configured {
        logger.warn(&format!(
            "{} of {configured} collectors rejected",
            configured - exporter.collector_count()
        ));
    }

    run_sink(&exporter, &args.replay, shutdown, stats_out)
}

/// Execute the pipe command.
///
/// `events` is consumed by the exporter's worker; the caller decides whether it
/// is wired to real signals.
pub fn execute_pipe<H, W>(
    args: &PipeArgs,
    events: ProcessEvents,
    shutdown: &H,
    logger: Arc<dyn Logger>,
    stats_out: &mut W,
) -> CommandResult<ReplayResult>
where
    H: ShutdownCheck,
    W: Write,
{
    args.validate()?;
    let config = pipe_config(args)?;
    logger.info(&format!("reader command: {}", config.reader_cmd));

    let exporter = PipedProcessExporter::new(config, events, logger)?;
    run_sink(&exporter, &args.replay, shutdown, stats_out)
}
