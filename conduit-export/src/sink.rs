//! Sink contract and worker runtime.
//!
//! A sink runs its export work on one dedicated worker thread fed by a bounded
//! queue. `receive` never blocks longer than the enqueue timeout; every packet it is
//! given is either handed to the worker or released on the spot and counted as
//! dropped.
//!
//! Two ways to stop a worker:
//! - `terminate` raises a stop flag. The worker completes the packet in hand,
//!   releases whatever is still queued without processing it, runs the handler's
//!   shutdown path and exits.
//! - `finish` closes the queue and lets the worker process everything already
//!   queued before shutting down. It falls back to a stop as soon as the given
//!   shutdown check fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use conduit_packet::{Packet, TemplateError};
use flume::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use thiserror::Error;

use crate::batch::EncoderError;
use crate::config::ConfigError;
use crate::pipe::SupervisorError;
use crate::signal::ShutdownCheck;
use crate::stats::{SinkCounters, StatsSnapshot};

/// Poll period of `finish` while the worker drains its queue.
const FINISH_POLL: Duration = Duration::from_millis(20);

/// Fatal sink errors, returned from construction, `start` or `terminate`.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("template rejected: {0}")]
    Template(#[from] TemplateError),

    #[error("encoder initialization failed: {0}")]
    Encoder(#[from] EncoderError),

    #[error("pending batch overflow: capacity {capacity} exhausted")]
    BatchOverflow { capacity: usize },

    #[error("failed to start reader process: {0}")]
    Spawn(#[from] SupervisorError),

    #[error("pcap framing failed: {0}")]
    Pcap(#[from] pcap_file::PcapError),

    #[error("failed to start worker thread: {0}")]
    Thread(#[source] std::io::Error),

    #[error("worker thread panicked: {0}")]
    WorkerPanicked(String),

    #[error("sink already started")]
    AlreadyStarted,
}

/// Packet consumer with a managed lifecycle.
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// Begin steady-state operation.
    fn start(&self) -> Result<(), SinkError>;

    /// Hand a packet to the sink. The sink releases it exactly once.
    fn receive(&self, packet: Packet);

    /// Stop at the next safe point and join. Queued packets are released unprocessed.
    /// Returns the first fatal error the worker hit.
    fn terminate(&self) -> Result<(), SinkError>;

    /// Process every queued packet, then stop and join. Degrades to `terminate`
    /// once `shutdown` fires.
    fn finish(&self, shutdown: &dyn ShutdownCheck) -> Result<(), SinkError>;

    fn stats(&self) -> StatsSnapshot;
}

/// Export logic driven by a `SinkWorker`.
///
/// `on_start` runs on the caller's thread; the rest on the worker.
pub trait SinkHandler: Send + 'static {
    fn on_start(&mut self) -> Result<(), SinkError>;

    fn on_packet(&mut self, packet: Packet) -> Result<(), SinkError>;

    /// Called when `next_wakeup` elapses.
    fn on_tick(&mut self) -> Result<(), SinkError>;

    /// How long the worker may wait for the next packet before calling `on_tick`.
    fn next_wakeup(&self) -> Duration;

    /// Final flush or process stop. Runs once, after the queue is closed.
    fn on_shutdown(&mut self) -> Result<(), SinkError>;
}

/// Queue settings of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub enqueue_timeout: Duration,
}

enum WorkerState<H> {
    Idle(H),
    Starting,
    Running {
        sender: Sender<Packet>,
        handle: JoinHandle<Result<(), SinkError>>,
    },
    Finished,
}

/// Worker thread plus bounded queue around a `SinkHandler`.
pub struct SinkWorker<H: SinkHandler> {
    name: String,
    queue: QueueConfig,
    counters: Arc<SinkCounters>,
    stop: Arc<AtomicBool>,
    state: Mutex<WorkerState<H>>,
}

impl<H: SinkHandler> SinkWorker<H> {
    pub fn new(name: impl Into<String>, handler: H, queue: QueueConfig, counters: Arc<SinkCounters>) -> Self {
        Self {
            name: name.into(),
            queue,
            counters,
            stop: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(WorkerState::Idle(handler)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn counters(&self) -> &Arc<SinkCounters> {
        &self.counters
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState<H>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock(), WorkerState::Running { .. })
    }

    /// Run the handler's start hook, then spawn the worker.
    ///
    /// The hook runs without the state lock held. If it fails the handler goes
    /// back to idle and `start` may be called again.
    pub fn start(&self) -> Result<(), SinkError> {
        let mut handler = {
            let mut state = self.lock();
            let handler = match std::mem::replace(&mut *state, WorkerState::Starting) {
                WorkerState::Idle(handler) => handler,
                other => {
                    *state = other;
                    return Err(SinkError::AlreadyStarted);
                }
            };
            self.stop.store(false, Ordering::SeqCst);
            handler
        };

        if let Err(e) = handler.on_start() {
            *self.lock() = WorkerState::Idle(handler);
            return Err(e);
        }

        let (sender, receiver) = flume::bounded(self.queue.capacity);
        let counters = Arc::clone(&self.counters);
        let stop = Arc::clone(&self.stop);
        let spawned = std::thread::Builder::new()
            .name(format!("conduit-{}", self.name))
            .spawn(move || run_worker(handler, receiver, &counters, &stop));

        let mut state = self.lock();
        match spawned {
            Ok(handle) => {
                *state = WorkerState::Running { sender, handle };
                Ok(())
            }
            Err(e) => {
                *state = WorkerState::Finished;
                Err(SinkError::Thread(e))
            }
        }
    }

    pub fn submit(&self, packet: Packet) {
        let sender = match &*self.lock() {
            WorkerState::Running { sender, .. } => sender.clone(),
            _ => {
                self.drop_packet(packet);
                return;
            }
        };

        match sender.send_timeout(packet, self.queue.enqueue_timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(packet)) | Err(SendTimeoutError::Disconnected(packet)) => {
                self.drop_packet(packet);
            }
        }
    }

    fn drop_packet(&self, packet: Packet) {
        packet.release();
        self.counters.record_dropped();
    }

    /// Raise the stop flag, close the queue and join the worker.
    ///
    /// Called while `start` is still running its hook, it only raises the flag;
    /// the worker then stops right after it is spawned.
    pub fn terminate(&self) -> Result<(), SinkError> {
        match self.take_running(true) {
            Some((sender, handle)) => {
                drop(sender);
                join_worker(handle)
            }
            None => Ok(()),
        }
    }

    /// Close the queue and wait for the worker to process what is left.
    pub fn finish(&self, shutdown: &dyn ShutdownCheck) -> Result<(), SinkError> {
        let Some((sender, handle)) = self.take_running(false) else {
            return Ok(());
        };
        // Dropping the last sender disconnects the queue once it is drained.
        drop(sender);
        while !handle.is_finished() {
            if shutdown.should_stop() {
                self.stop.store(true, Ordering::SeqCst);
            }
            std::thread::sleep(FINISH_POLL);
        }
        join_worker(handle)
    }

    fn take_running(&self, raise_stop: bool) -> Option<(Sender<Packet>, JoinHandle<Result<(), SinkError>>)> {
        let mut state = self.lock();
        if raise_stop {
            self.stop.store(true, Ordering::SeqCst);
        }
        match std::mem::replace(&mut *state, WorkerState::Finished) {
            WorkerState::Running { sender, handle } => Some((sender, handle)),
            WorkerState::Starting => {
                *state = WorkerState::Starting;
                None
            }
            WorkerState::Idle(_) | WorkerState::Finished => None,
        }
    }
}

fn join_worker(handle: JoinHandle<Result<(), SinkError>>) -> Result<(), SinkError> {
    match handle.join() {
        Ok(result) => result,
        Err(panic) => Err(SinkError::WorkerPanicked(panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_worker<H: SinkHandler>(
    mut handler: H,
    receiver: Receiver<Packet>,
    counters: &SinkCounters,
    stop: &AtomicBool,
) -> Result<(), SinkError> {
    let outcome = pump(&mut handler, &receiver, counters, stop);

    // After a stop or a fatal error nothing queued is processed any more.
    drop_queued(&receiver, counters);
    let shutdown = handler.on_shutdown();
    drop_queued(&receiver, counters);
    drop(receiver);
    outcome.and(shutdown)
}

fn pump<H: SinkHandler>(
    handler: &mut H,
    receiver: &Receiver<Packet>,
    counters: &SinkCounters,
    stop: &AtomicBool,
) -> Result<(), SinkError> {
    loop {
        if stop.load(Ordering::SeqCst) {
            return Ok(());
        }

        let wait = handler.next_wakeup();
        if wait.is_zero() {
            handler.on_tick()?;
            continue;
        }

        match receiver.recv_timeout(wait) {
            Ok(packet) if stop.load(Ordering::SeqCst) => {
                packet.release();
                counters.record_dropped();
                return Ok(());
            }
            Ok(packet) => handler.on_packet(packet)?,
            Err(RecvTimeoutError::Timeout) => handler.on_tick()?,
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

fn drop_queued(receiver: &Receiver<Packet>, counters: &SinkCounters) {
    for packet in receiver.drain() {
        packet.release();
        counters.record_dropped();
    }
}
