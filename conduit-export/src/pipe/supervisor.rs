//! Process supervision seam.
//!
//! The piped exporter's state machine only talks to a `ProcessSupervisor`, so the
//! same restart and kill-escalation logic runs against real processes
//! (`UnixSupervisor`) and against the scripted `MockSupervisor`.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from spawning or signalling reader processes.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("reader command is empty")]
    EmptyCommand,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("spawned process has no stdin pipe")]
    NoStdin,

    #[error("failed to configure stdin pipe: {0}")]
    PipeSetup(#[source] io::Error),

    #[error("process {pid} exited right after spawn")]
    ExitedAtStart { pid: u32 },

    #[error("process {pid} did not accept the stream header: {source}")]
    HeaderRejected {
        pid: u32,
        #[source]
        source: PipeWriteError,
    },

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Errors from writing into a reader's stdin pipe.
#[derive(Debug, Error)]
pub enum PipeWriteError {
    #[error("pipe closed by reader after {written} bytes")]
    Broken { written: usize },

    #[error("write deadline expired after {written} bytes")]
    TimedOut { written: usize },

    #[error("pipe write failed: {0}")]
    Io(#[from] io::Error),
}

impl PipeWriteError {
    /// Bytes of the current write that reached the pipe.
    pub fn written(&self) -> usize {
        match self {
            PipeWriteError::Broken { written } | PipeWriteError::TimedOut { written } => *written,
            PipeWriteError::Io(_) => 0,
        }
    }
}

/// Write end of a reader's stdin pipe. Dropping it closes the pipe.
pub trait PipeWriter: Send {
    /// Write all of `bytes`, giving up once `timeout` has elapsed.
    fn write_with_deadline(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), PipeWriteError>;
}

/// Program, arguments and environment of a reader process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl CommandSpec {
    /// Split a command line on whitespace into program and arguments.
    pub fn parse(command_line: &str) -> Result<Self, SupervisorError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(SupervisorError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
            working_dir: None,
            log_file: None,
        })
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_log_file(mut self, path: Option<PathBuf>) -> Self {
        self.log_file = path;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A freshly spawned reader.
pub struct SpawnedProcess {
    pub pid: u32,
    pub writer: Box<dyn PipeWriter>,
}

impl fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedProcess").field("pid", &self.pid).finish()
    }
}

/// Platform process control.
pub trait ProcessSupervisor: Send {
    /// Start a process in its own process group with `spec` and a stdin pipe.
    fn spawn(&mut self, spec: &CommandSpec) -> Result<SpawnedProcess, SupervisorError>;

    /// Whether `pid` is still alive. Reaps it when it is our child and has exited.
    fn is_running(&mut self, pid: u32) -> bool;

    /// Ask `pid` to exit (SIGTERM).
    fn terminate(&mut self, pid: u32) -> Result<(), SupervisorError>;

    /// Kill `pid`, its process group and every descendant (SIGKILL).
    fn kill_tree(&mut self, pid: u32) -> Result<(), SupervisorError>;
}
