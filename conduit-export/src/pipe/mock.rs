//! Scripted supervisor for state-machine tests.
//!
//! Pids are handed out sequentially from 1000. Every spawn, pipe close and
//! signal is recorded in order, and tests can make processes die, ignore
//! SIGTERM, refuse to spawn, make pipe writes fail, or stop reading altogether.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::pipe::supervisor::{
    CommandSpec, PipeWriteError, PipeWriter, ProcessSupervisor, SpawnedProcess, SupervisorError,
};

/// One recorded supervisor action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Spawned { pid: u32, command: String },
    PipeClosed { pid: u32 },
    Terminated { pid: u32 },
    Killed { pid: u32 },
}

/// How the next pipe write fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockWriteFailure {
    /// Reader closed the pipe.
    Broken,
    /// Deadline expired before any byte was accepted.
    Stalled,
    /// Deadline expired partway through the record.
    Partial,
}

#[derive(Debug)]
struct MockState {
    next_pid: u32,
    alive: HashSet<u32>,
    ignore_sigterm: bool,
    exit_on_spawn: bool,
    failing_spawns: usize,
    write_failure: Option<MockWriteFailure>,
    stalled: HashSet<u32>,
    written: HashMap<u32, Vec<u8>>,
    events: Vec<ProcessEvent>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            next_pid: 1000,
            alive: HashSet::new(),
            ignore_sigterm: false,
            exit_on_spawn: false,
            failing_spawns: 0,
            write_failure: None,
            stalled: HashSet::new(),
            written: HashMap::new(),
            events: Vec::new(),
        }
    }
}

/// Mock supervisor. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockSupervisor {
    state: Arc<Mutex<MockState>>,
}

impl MockSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulate `pid` exiting on its own.
    pub fn exit_process(&self, pid: u32) {
        self.lock().alive.remove(&pid);
    }

    pub fn set_ignore_sigterm(&self, ignore: bool) {
        self.lock().ignore_sigterm = ignore;
    }

    /// Spawned processes die before their first liveness check.
    pub fn set_exit_on_spawn(&self, exit: bool) {
        self.lock().exit_on_spawn = exit;
    }

    /// Make the next `count` spawns fail.
    pub fn fail_next_spawns(&self, count: usize) {
        self.lock().failing_spawns = count;
    }

    /// Make the next pipe write fail once with `failure`.
    pub fn fail_next_write(&self, failure: MockWriteFailure) {
        self.lock().write_failure = Some(failure);
    }

    /// `pid` stays alive but stops reading: every later write to it times out.
    pub fn stall_reader(&self, pid: u32) {
        self.lock().stalled.insert(pid);
    }

    pub fn events(&self) -> Vec<ProcessEvent> {
        self.lock().events.clone()
    }

    /// Pids in spawn order.
    pub fn spawned_pids(&self) -> Vec<u32> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::Spawned { pid, .. } => Some(*pid),
                _ => None,
            })
            .collect()
    }

    pub fn alive_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.lock().alive.iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Bytes written into the pipe of `pid`.
    pub fn written(&self, pid: u32) -> Vec<u8> {
        self.lock().written.get(&pid).cloned().unwrap_or_default()
    }
}

impl ProcessSupervisor for MockSupervisor {
    fn spawn(&mut self, spec: &CommandSpec) -> Result<SpawnedProcess, SupervisorError> {
        let mut state = self.lock();
        if state.failing_spawns > 0 {
            state.failing_spawns -= 1;
            return Err(SupervisorError::Spawn {
                program: spec.program.clone(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }

        let pid = state.next_pid;
        state.next_pid += 1;
        if !state.exit_on_spawn {
            state.alive.insert(pid);
        }
        state.written.insert(pid, Vec::new());
        state.events.push(ProcessEvent::Spawned {
            pid,
            command: spec.to_string(),
        });
        drop(state);

        Ok(SpawnedProcess {
            pid,
            writer: Box::new(MockPipeWriter {
                pid,
                supervisor: self.clone(),
            }),
        })
    }

    fn is_running(&mut self, pid: u32) -> bool {
        self.lock().alive.contains(&pid)
    }

    fn terminate(&mut self, pid: u32) -> Result<(), SupervisorError> {
        let mut state = self.lock();
        state.events.push(ProcessEvent::Terminated { pid });
        if !state.ignore_sigterm {
            state.alive.remove(&pid);
        }
        Ok(())
    }

    fn kill_tree(&mut self, pid: u32) -> Result<(), SupervisorError> {
        let mut state = self.lock();
        state.events.push(ProcessEvent::Killed { pid });
        state.alive.remove(&pid);
        Ok(())
    }
}

struct MockPipeWriter {
    pid: u32,
    supervisor: MockSupervisor,
}

impl PipeWriter for MockPipeWriter {
    fn write_with_deadline(&mut self, bytes: &[u8], _timeout: Duration) -> Result<(), PipeWriteError> {
        let mut state = self.supervisor.lock();
        if !state.alive.contains(&self.pid) {
            return Err(PipeWriteError::Broken { written: 0 });
        }

        if state.stalled.contains(&self.pid) {
            return Err(PipeWriteError::TimedOut { written: 0 });
        }

        match state.write_failure.take() {
            Some(MockWriteFailure::Broken) => Err(PipeWriteError::Broken { written: 0 }),
            Some(MockWriteFailure::Stalled) => Err(PipeWriteError::TimedOut { written: 0 }),
            Some(MockWriteFailure::Partial) => {
                let written = bytes.len() / 2;
                state
                    .written
                    .entry(self.pid)
                    .or_default()
                    .extend_from_slice(&bytes[..written]);
                Err(PipeWriteError::TimedOut { written })
            }
            None => {
                state
                    .written
                    .entry(self.pid)
                    .or_default()
                    .extend_from_slice(bytes);
                Ok(())
            }
        }
    }
}

impl Drop for MockPipeWriter {
    fn drop(&mut self) {
        self.supervisor
            .lock()
            .events
            .push(ProcessEvent::PipeClosed { pid: self.pid });
    }
}
