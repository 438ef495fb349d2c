//! Unix process supervision with std::process and nix.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

use crate::pipe::supervisor::{
    CommandSpec, PipeWriteError, PipeWriter, ProcessSupervisor, SpawnedProcess, SupervisorError,
};

/// Supervisor for real child processes.
#[derive(Debug, Default)]
pub struct UnixSupervisor {
    children: HashMap<u32, Child>,
}

impl UnixSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn signal(pid: u32, signal: Signal) -> Result<(), SupervisorError> {
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(SupervisorError::Signal {
                pid,
                source: io::Error::from(errno),
            }),
        }
    }
}

impl ProcessSupervisor for UnixSupervisor {
    fn spawn(&mut self, spec: &CommandSpec) -> Result<SpawnedProcess, SupervisorError> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args).stdin(Stdio::piped()).process_group(0);

        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        if let Some(path) = &spec.log_file {
            let log_error = |source| SupervisorError::LogFile {
                path: path.clone(),
                source,
            };
            let log = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(log_error)?;
            let log_err = log.try_clone().map_err(log_error)?;
            command.stdout(log).stderr(log_err);
        }

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();

        let writer = match child.stdin.take() {
            Some(stdin) => UnixPipeWriter::new(stdin),
            None => Err(SupervisorError::NoStdin),
        };
        let writer = match writer {
            Ok(writer) => writer,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        self.children.insert(pid, child);
        Ok(SpawnedProcess {
            pid,
            writer: Box::new(writer),
        })
    }

    fn is_running(&mut self, pid: u32) -> bool {
        if let Some(child) = self.children.get_mut(&pid) {
            return match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) | Err(_) => {
                    self.children.remove(&pid);
                    false
                }
            };
        }

        // Not our child (or already reaped): check with signal 0.
        match kill(Pid::from_raw(pid as i32), None::<Signal>) {
            Ok(()) | Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn terminate(&mut self, pid: u32) -> Result<(), SupervisorError> {
        Self::signal(pid, Signal::SIGTERM)
    }

    fn kill_tree(&mut self, pid: u32) -> Result<(), SupervisorError> {
        let mut targets = vec![pid];
        targets.extend(descendants_of(pid));

        let mut first_error = match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => None,
            Err(errno) => Some(SupervisorError::Signal {
                pid,
                source: io::Error::from(errno),
            }),
        };
        // Descendants that left the group are still signalled when one target fails.
        if let Err(e) = signal_all(&targets, |target| Self::signal(target, Signal::SIGKILL)) {
            first_error.get_or_insert(e);
        }

        if let Some(mut child) = self.children.remove(&pid) {
            let _ = child.wait();
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Deliver to every target, returning the first failure.
fn signal_all<F>(targets: &[u32], mut send: F) -> Result<(), SupervisorError>
where
    F: FnMut(u32) -> Result<(), SupervisorError>,
{
    let mut first_error = None;
    for &target in targets {
        if let Err(e) = send(target) {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

impl Drop for UnixSupervisor {
    fn drop(&mut self) {
        for (pid, mut child) in self.children.drain() {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Non-blocking writer over a child's stdin.
#[derive(Debug)]
pub struct UnixPipeWriter {
    stdin: ChildStdin,
}

impl UnixPipeWriter {
    pub fn new(stdin: ChildStdin) -> Result<Self, SupervisorError> {
        let fd = stdin.as_raw_fd();
        let to_io = |errno: Errno| SupervisorError::PipeSetup(io::Error::from(errno));
        let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(to_io)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(to_io)?;
        Ok(Self { stdin })
    }

    fn wait_writable(&self, remaining: Duration) -> Result<(), PipeWriteError> {
        let millis = remaining.as_millis().clamp(1, u128::from(u16::MAX)) as u16;
        let mut fds = [PollFd::new(self.stdin.as_fd(), PollFlags::POLLOUT)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            // POLLERR/POLLHUP surface as EPIPE on the next write.
            Ok(_) | Err(Errno::EINTR) => Ok(()),
            Err(errno) => Err(PipeWriteError::Io(io::Error::from(errno))),
        }
    }
}

impl PipeWriter for UnixPipeWriter {
    fn write_with_deadline(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), PipeWriteError> {
        let deadline = Instant::now() + timeout;
        let mut written = 0;

        while written < bytes.len() {
            match self.stdin.write(&bytes[written..]) {
                Ok(0) => return Err(PipeWriteError::Broken { written }),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PipeWriteError::TimedOut { written });
                    }
                    self.wait_writable(deadline - now)?;
                }
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    return Err(PipeWriteError::Broken { written })
                }
                Err(e) => return Err(PipeWriteError::Io(e)),
            }
        }
        Ok(())
    }
}

/// Parent pid from the contents of `/proc/<pid>/stat`.
///
/// The command name may contain spaces and parentheses, so fields are counted
/// after the last `)`.
pub fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// Every live descendant of `root`, found by walking `/proc`.
pub fn descendants_of(root: u32) -> Vec<u32> {
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(ppid) = parse_stat_ppid(&stat) {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut found = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = vec![root];
    while let Some(parent) = queue.pop() {
        for &child in children.get(&parent).into_iter().flatten() {
            if seen.insert(child) {
                found.push(child);
                queue.push(child);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===========================================
    // /proc Parsing Tests
    // ===========================================

    #[test]
    fn test_parse_stat_ppid_simple() {
        let stat = "1234 (cat) S 1000 1234 1234 0 -1 4194304 100 0 0 0";
        assert_eq!(parse_stat_ppid(stat), Some(1000));
    }

    #[test]
    fn test_parse_stat_ppid_name_with_spaces_and_parens() {
        let stat = "42 (my (odd) reader) R 7 42 42 0";
        assert_eq!(parse_stat_ppid(stat), Some(7));
    }

    #[test]
    fn test_parse_stat_ppid_malformed() {
        assert_eq!(parse_stat_ppid(""), None);
        assert_eq!(parse_stat_ppid("12 (x)"), None);
        assert_eq!(parse_stat_ppid("12 (x) S notanumber"), None);
    }

    #[test]
    fn test_descendants_of_missing_pid_is_empty() {
        assert!(descendants_of(u32::MAX - 1).is_empty());
    }

    // ===========================================
    // Supervisor Tests
    // ===========================================

    #[test]
    fn test_spawn_failure_reports_program() {
        let mut supervisor = UnixSupervisor::new();
        let spec = CommandSpec::parse("/nonexistent/conduit-reader").expect("parse");
        let err = supervisor.spawn(&spec).unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { ref program, .. } if program == "/nonexistent/conduit-reader"));
    }

    #[test]
    fn test_signal_all_continues_past_failure() {
        let mut attempted = Vec::new();
        let result = signal_all(&[10, 11, 12], |pid| {
            attempted.push(pid);
            if pid == 10 {
                return Err(SupervisorError::Signal {
                    pid,
                    source: io::Error::from(Errno::EPERM),
                });
            }
            Ok(())
        });

        assert_eq!(attempted, vec![10, 11, 12]);
        assert!(matches!(result, Err(SupervisorError::Signal { pid: 10, .. })));
        assert!(signal_all(&[], |_| Ok(())).is_ok());
    }

    #[test]
    fn test_is_running_unknown_pid() {
        let mut supervisor = UnixSupervisor::new();
        assert!(!supervisor.is_running(u32::MAX / 2));
    }

    #[test]
    fn test_terminate_exited_process_is_ok() {
        let mut supervisor = UnixSupervisor::new();
        assert!(supervisor.terminate(u32::MAX / 2).is_ok());
    }
}
