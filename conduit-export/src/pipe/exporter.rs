//! Piped process exporter.
//!
//! Packets are framed as a PCAP stream and written into the stdin of a reader
//! process. The reader is restarted when it dies, when the operator asks for it,
//! or when the restart interval elapses in packet time. Every restart closes the
//! old pipe before the old process is stopped and a new one is spawned.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Local;
use conduit_clock::{Clock, SystemClock};
use conduit_packet::{Packet, Timestamp};

use crate::config::PipeConfig;
use crate::logger::Logger;
use crate::pipe::pcap_stream::PcapStream;
use crate::pipe::supervisor::{
    CommandSpec, PipeWriteError, PipeWriter, ProcessSupervisor, SpawnedProcess, SupervisorError,
};
use crate::pipe::unix::UnixSupervisor;
use crate::signal::{ProcessEvents, ShutdownCheck};
use crate::sink::{QueueConfig, Sink, SinkError, SinkHandler, SinkWorker};
use crate::sleeper::{RealSleeper, Sleeper};
use crate::stats::{SinkCounters, StatsSnapshot};

/// Minimum time between two respawn attempts.
const RESPAWN_RETRY_MS: u64 = 1000;

/// Liveness poll while waiting for a SIGTERM'd process to exit.
const KILL_POLL_MS: u64 = 50;

/// Consecutive writes that time out without a byte accepted before the reader is replaced.
const STALL_RESTART_THRESHOLD: u32 = 3;

/// Lifecycle of the reader process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Stopped,
    Starting,
    Running,
    Restarting,
}

type SharedState = Arc<Mutex<PipeState>>;

fn lock_state(state: &SharedState) -> MutexGuard<'_, PipeState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

struct ActiveReader {
    pid: u32,
    writer: Box<dyn PipeWriter>,
    stream: PcapStream,
    stalls: u32,
}

/// Reader supervision state machine run on the exporter's worker.
pub struct PipeExporterCore<S: ProcessSupervisor> {
    config: PipeConfig,
    spec: CommandSpec,
    supervisor: S,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    events: ProcessEvents,
    counters: Arc<SinkCounters>,
    logger: Arc<dyn Logger>,
    state: SharedState,
    reader: Option<ActiveReader>,
    next_restart: Option<Timestamp>,
    next_retry_ms: Option<u64>,
    last_liveness_ms: u64,
    shutting_down: bool,
}

impl<S: ProcessSupervisor> PipeExporterCore<S> {
    pub fn new(
        config: PipeConfig,
        supervisor: S,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        events: ProcessEvents,
        counters: Arc<SinkCounters>,
        logger: Arc<dyn Logger>,
    ) -> Result<Self, SinkError> {
        let spec = CommandSpec::parse(&config.reader_cmd)?.with_working_dir(config.working_dir.clone());
        Ok(Self {
            config,
            spec,
            supervisor,
            clock,
            sleeper,
            events,
            counters,
            logger,
            state: Arc::new(Mutex::new(PipeState::Stopped)),
            reader: None,
            next_restart: None,
            next_retry_ms: None,
            last_liveness_ms: 0,
            shutting_down: false,
        })
    }

    pub fn state(&self) -> PipeState {
        *lock_state(&self.state)
    }

    /// Pid of the current reader, if one is running.
    pub fn pid(&self) -> Option<u32> {
        self.reader.as_ref().map(|reader| reader.pid)
    }

    fn shared_state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    fn set_state(&self, state: PipeState) {
        *lock_state(&self.state) = state;
    }

    fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.config.write_timeout_ms)
    }

    /// Spawn the first reader. Failure here is fatal.
    pub fn perform_start(&mut self) -> Result<(), SinkError> {
        self.shutting_down = false;
        self.set_state(PipeState::Starting);
        self.last_liveness_ms = self.clock.now_unix_ms();

        match self.spawn_reader() {
            Ok(reader) => {
                self.logger
                    .info(&format!("pipe exporter started reader {} (pid {})", self.spec, reader.pid));
                self.reader = Some(reader);
                self.set_state(PipeState::Running);
                Ok(())
            }
            Err(e) => {
                self.set_state(PipeState::Stopped);
                Err(e)
            }
        }
    }

    fn spawn_reader(&mut self) -> Result<ActiveReader, SinkError> {
        let log_file = self.config.log_file_path(&Local::now());
        let spec = self.spec.clone().with_log_file(log_file);
        let SpawnedProcess { pid, mut writer } = self.supervisor.spawn(&spec)?;

        if !self.supervisor.is_running(pid) {
            return Err(SupervisorError::ExitedAtStart { pid }.into());
        }

        let (stream, header) = match PcapStream::start(self.config.snaplen) {
            Ok(started) => started,
            Err(e) => {
                drop(writer);
                self.stop_pid(pid);
                return Err(e.into());
            }
        };
        if let Err(source) = writer.write_with_deadline(&header, self.write_timeout()) {
            drop(writer);
            self.stop_pid(pid);
            return Err(SupervisorError::HeaderRejected { pid, source }.into());
        }

        Ok(ActiveReader {
            pid,
            writer,
            stream,
            stalls: 0,
        })
    }

    /// Write one packet to the reader, or drop it when none is running.
    pub fn handle_packet(&mut self, packet: Packet) {
        self.poll_control(false);
        self.check_restart_interval(packet.timestamp());

        if self.state() != PipeState::Running {
            self.drop_packet(packet);
            return;
        }
        let Some(reader) = self.reader.as_mut() else {
            self.drop_packet(packet);
            return;
        };

        let record = match reader.stream.encode(&packet) {
            Ok(record) => record,
            Err(e) => {
                self.logger.error(&format!("failed to frame packet: {e}"));
                self.drop_packet(packet);
                return;
            }
        };

        let pid = reader.pid;
        let timeout = Duration::from_millis(self.config.write_timeout_ms);
        match reader.writer.write_with_deadline(&record, timeout) {
            Ok(()) => {
                reader.stalls = 0;
                self.counters.record_forwarded(packet.len());
                packet.release();
            }
            Err(PipeWriteError::TimedOut { written: 0 }) => {
                reader.stalls += 1;
                let stalls = reader.stalls;
                self.drop_packet(packet);
                self.logger.error(&format!(
                    "reader {pid} stalled: packet dropped after {} ms",
                    self.config.write_timeout_ms
                ));
                if stalls >= STALL_RESTART_THRESHOLD {
                    self.restart(&format!("reader {pid} stalled on {stalls} consecutive writes"));
                }
            }
            Err(e) => {
                // A partial record leaves the stream unparseable, so it is restarted too.
                self.drop_packet(packet);
                self.restart(&format!("write to reader {pid} failed: {e}"));
            }
        }
    }

    fn check_restart_interval(&mut self, ts: Timestamp) {
        let interval = self.config.restart_interval_sec;
        if interval == 0 || self.shutting_down {
            return;
        }

        match self.next_restart {
            None => self.next_restart = Some(ts.saturating_add_secs(interval)),
            Some(next) if ts > next => {
                let interval_us = interval.saturating_mul(1_000_000);
                let steps = (ts.as_micros() - next.as_micros()) / interval_us + 1;
                self.next_restart = Some(next.saturating_add_secs(steps.saturating_mul(interval)));
                self.restart("restart interval elapsed");
            }
            Some(_) => {}
        }
    }

    /// Act on pending process events and retry a failed respawn when due.
    ///
    /// Liveness is checked on any notification, when `force_liveness` is set,
    /// and at least once per liveness poll period.
    pub fn poll_control(&mut self, force_liveness: bool) {
        if self.shutting_down {
            return;
        }

        if self.events.take_restart() {
            if self.config.restart_on_signal {
                self.restart("restart requested");
            } else {
                self.logger.debug("restart request ignored");
            }
        }

        let child_exited = self.events.take_child_exit();
        let broken_pipe = self.events.take_broken_pipe();
        let now = self.clock.now_unix_ms();
        let periodic = now >= self.last_liveness_ms.saturating_add(self.config.liveness_poll_ms);
        if child_exited || broken_pipe || force_liveness || periodic {
            self.last_liveness_ms = now;
            self.check_liveness();
        }

        if self.state() == PipeState::Restarting && self.retry_due(now) {
            self.try_respawn();
        }
    }

    fn check_liveness(&mut self) {
        if self.state() != PipeState::Running {
            return;
        }
        if let Some(pid) = self.pid() {
            if !self.supervisor.is_running(pid) {
                self.restart(&format!("reader {pid} exited"));
            }
        }
    }

    fn retry_due(&self, now: u64) -> bool {
        self.next_retry_ms.map_or(true, |at| now >= at)
    }

    /// Replace the reader with a fresh process.
    ///
    /// While a failed respawn is waiting for its retry, further requests only
    /// leave that retry in place.
    pub fn restart(&mut self, reason: &str) {
        if self.shutting_down {
            return;
        }
        if self.state() == PipeState::Restarting {
            self.logger.debug(&format!("respawn already pending, ignoring: {reason}"));
            return;
        }
        self.logger.warn(&format!("restarting reader: {reason}"));
        self.set_state(PipeState::Restarting);
        self.stop_process();
        self.counters.record_restart();
        self.try_respawn();
    }

    fn try_respawn(&mut self) {
        self.set_state(PipeState::Starting);
        match self.spawn_reader() {
            Ok(reader) => {
                self.logger.info(&format!("reader restarted (pid {})", reader.pid));
                self.reader = Some(reader);
                self.next_retry_ms = None;
                self.last_liveness_ms = self.clock.now_unix_ms();
                self.set_state(PipeState::Running);
            }
            Err(e) => {
                self.logger
                    .error(&format!("reader respawn failed: {e}; retrying in {RESPAWN_RETRY_MS} ms"));
                self.next_retry_ms = Some(self.clock.now_unix_ms().saturating_add(RESPAWN_RETRY_MS));
                self.set_state(PipeState::Restarting);
            }
        }
    }

    /// Close the pipe, then stop the process.
    fn stop_process(&mut self) {
        if let Some(ActiveReader { pid, writer, .. }) = self.reader.take() {
            drop(writer);
            self.stop_pid(pid);
        }
    }

    /// SIGTERM, then SIGKILL to the whole tree once the kill timeout passes.
    fn stop_pid(&mut self, pid: u32) {
        if let Err(e) = self.supervisor.terminate(pid) {
            self.logger.warn(&e.to_string());
        }

        let timeout_ms = self.config.sig_kill_timeout_sec.saturating_mul(1000);
        let deadline = self.clock.now_unix_ms().saturating_add(timeout_ms);
        while self.supervisor.is_running(pid) {
            if self.clock.now_unix_ms() >= deadline {
                self.logger.warn(&format!(
                    "reader {pid} still alive {} s after SIGTERM, sending SIGKILL",
                    self.config.sig_kill_timeout_sec
                ));
                if let Err(e) = self.supervisor.kill_tree(pid) {
                    self.logger.error(&e.to_string());
                }
                return;
            }
            self.sleeper.sleep_ms(KILL_POLL_MS);
        }
    }

    /// Stop the reader for good. No restart is scheduled afterwards.
    pub fn perform_shutdown(&mut self) {
        self.shutting_down = true;
        self.next_restart = None;
        self.next_retry_ms = None;
        self.stop_process();
        self.set_state(PipeState::Stopped);
        self.logger.info("pipe exporter stopped");
    }

    fn drop_packet(&self, packet: Packet) {
        packet.release();
        self.counters.record_dropped();
    }
}

impl<S: ProcessSupervisor + 'static> SinkHandler for PipeExporterCore<S> {
    fn on_start(&mut self) -> Result<(), SinkError> {
        self.perform_start()
    }

    fn on_packet(&mut self, packet: Packet) -> Result<(), SinkError> {
        self.handle_packet(packet);
        Ok(())
    }

    fn on_tick(&mut self) -> Result<(), SinkError> {
        self.poll_control(true);
        Ok(())
    }

    fn next_wakeup(&self) -> Duration {
        let poll = self.config.liveness_poll_ms;
        let wait = match (self.state(), self.next_retry_ms) {
            (PipeState::Restarting, Some(at)) => {
                poll.min(at.saturating_sub(self.clock.now_unix_ms()))
            }
            _ => poll,
        };
        Duration::from_millis(wait)
    }

    fn on_shutdown(&mut self) -> Result<(), SinkError> {
        self.perform_shutdown();
        Ok(())
    }
}

/// Sink that streams packets into a supervised reader process.
pub struct PipedProcessExporter<S: ProcessSupervisor + 'static = UnixSupervisor> {
    worker: SinkWorker<PipeExporterCore<S>>,
    state: SharedState,
    events: ProcessEvents,
}

impl PipedProcessExporter<UnixSupervisor> {
    /// Exporter for real processes, the system clock and real sleeps.
    pub fn new(config: PipeConfig, events: ProcessEvents, logger: Arc<dyn Logger>) -> Result<Self, SinkError> {
        Self::with_components(
            config,
            UnixSupervisor::new(),
            Arc::new(SystemClock),
            Arc::new(RealSleeper::new()),
            events,
            logger,
        )
    }
}

impl<S: ProcessSupervisor + 'static> PipedProcessExporter<S> {
    pub fn with_components(
        config: PipeConfig,
        supervisor: S,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        events: ProcessEvents,
        logger: Arc<dyn Logger>,
    ) -> Result<Self, SinkError> {
        config.validate()?;

        let queue = QueueConfig {
            capacity: config.queue_capacity,
            enqueue_timeout: Duration::from_millis(config.enqueue_timeout_ms),
        };
        let counters = Arc::new(SinkCounters::new());
        let core = PipeExporterCore::new(
            config,
            supervisor,
            clock,
            sleeper,
            events.clone(),
            Arc::clone(&counters),
            logger,
        )?;
        let state = core.shared_state();

        Ok(Self {
            worker: SinkWorker::new("pipe", core, queue, counters),
            state,
            events,
        })
    }

    pub fn state(&self) -> PipeState {
        *lock_state(&self.state)
    }

    /// Event flags the worker consumes; raise them to request a restart or report a death.
    pub fn events(&self) -> &ProcessEvents {
        &self.events
    }
}

impl<S: ProcessSupervisor + 'static> Sink for PipedProcessExporter<S> {
    fn name(&self) -> &str {
        self.worker.name()
    }

    fn start(&self) -> Result<(), SinkError> {
        self.worker.start()
    }

    fn receive(&self, packet: Packet) {
        self.worker.submit(packet);
    }

    fn terminate(&self) -> Result<(), SinkError> {
        self.worker.terminate()
    }

    fn finish(&self, shutdown: &dyn ShutdownCheck) -> Result<(), SinkError> {
        self.worker.finish(shutdown)
    }

    fn stats(&self) -> StatsSnapshot {
        self.worker.counters().snapshot()
    }
}
