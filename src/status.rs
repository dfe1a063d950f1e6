//! Exit status and the parent-side result handle.

use std::fmt;
use std::fs::File;

use log::trace;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::plan::Role;

/// How a child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited normally with the given code.
    Exited(i32),
    /// Terminated by the given signal.
    Signaled(Signal),
}

impl ExitStatus {
    pub fn success(self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    /// The numeric exit code, if the child exited normally.
    pub fn code(self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(code),
            ExitStatus::Signaled(_) => None,
        }
    }

    /// The terminating signal, if there was one.
    pub fn signal(self) -> Option<Signal> {
        match self {
            ExitStatus::Exited(_) => None,
            ExitStatus::Signaled(signal) => Some(signal),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {code}"),
            ExitStatus::Signaled(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// Parent-owned registry of live channel ends and process identity for one
/// spawned child.
///
/// Ends are tracked per role in canonical order (input, output, error).
/// Every tracked end is open; closing removes it from tracking, so a closed
/// descriptor is never reachable through the handle. Dropping the handle
/// closes whatever is still tracked and makes one non-blocking reap attempt
/// if the child was never waited.
#[derive(Debug)]
pub struct RunStatus {
    channels: [Option<File>; 3],
    pid: Pid,
    exit: Option<ExitStatus>,
    command: String,
}

impl RunStatus {
    pub(crate) fn new(channels: [Option<File>; 3], pid: Pid, command: String) -> Self {
        Self {
            channels,
            pid,
            exit: None,
            command,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The command line this handle belongs to, for display purposes.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Borrow the parent end for a role, if one was requested and is open.
    pub fn channel(&self, role: Role) -> Option<&File> {
        self.channels[role.index()].as_ref()
    }

    pub fn channel_mut(&mut self, role: Role) -> Option<&mut File> {
        self.channels[role.index()].as_mut()
    }

    /// Take ownership of the parent end for a role; later calls return
    /// `None`. Taking an end removes it from the handle's tracking.
    pub fn take_channel(&mut self, role: Role) -> Option<File> {
        self.channels[role.index()].take()
    }

    /// Close one role's parent end. An already-closed or never-requested
    /// role is silently skipped.
    pub fn close_role(&mut self, role: Role) {
        drop(self.channels[role.index()].take());
    }

    /// Close every tracked parent end. Idempotent.
    pub fn close(&mut self) {
        for role in Role::ALL {
            self.close_role(role);
        }
    }

    /// Block until the child exits and record how. The result is memoized:
    /// repeated calls return the recorded status without blocking or
    /// reaping twice.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    if let Some(exit) = self.record(status) {
                        return Ok(exit);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Wait(e)),
            }
        }
    }

    /// Non-blocking wait: `Some` once the child has exited, `None` while it
    /// is still running.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.exit {
            return Ok(Some(status));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(self.record(status)),
            Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(Error::Wait(e)),
        }
    }

    /// Send a signal to the child. A child that has already been reaped is
    /// a no-op, not an error.
    pub fn kill(&self, signal: Signal) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        kill(self.pid, signal).map_err(Error::Kill)
    }

    /// [`RunStatus::kill`] with SIGTERM.
    pub fn terminate(&self) -> Result<()> {
        self.kill(Signal::SIGTERM)
    }

    /// Close every channel, then wait. Safe to call repeatedly.
    pub fn complete(&mut self) -> Result<ExitStatus> {
        self.close();
        self.wait()
    }

    /// The recorded exit status, once `wait` has completed.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    fn record(&mut self, status: WaitStatus) -> Option<ExitStatus> {
        let exit = match status {
            WaitStatus::Exited(_, code) => ExitStatus::Exited(code),
            WaitStatus::Signaled(_, signal, _) => ExitStatus::Signaled(signal),
            // Stop/continue events are not terminations; keep waiting.
            _ => return None,
        };
        trace!("child {} terminated with {}", self.pid, exit);
        self.exit = Some(exit);
        Some(exit)
    }
}

impl Drop for RunStatus {
    fn drop(&mut self) {
        self.close();
        if self.exit.is_none() {
            let _ = waitpid(self.pid, Some(WaitPidFlag::WNOHANG));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_accessors() {
        let ok = ExitStatus::Exited(0);
        assert!(ok.success());
        assert_eq!(ok.code(), Some(0));
        assert_eq!(ok.signal(), None);

        let failed = ExitStatus::Exited(2);
        assert!(!failed.success());
        assert_eq!(failed.code(), Some(2));

        let killed = ExitStatus::Signaled(Signal::SIGKILL);
        assert!(!killed.success());
        assert_eq!(killed.code(), None);
        assert_eq!(killed.signal(), Some(Signal::SIGKILL));
    }

    #[test]
    fn exit_status_display() {
        assert_eq!(ExitStatus::Exited(2).to_string(), "exit code 2");
        assert_eq!(
            ExitStatus::Signaled(Signal::SIGKILL).to_string(),
            "signal SIGKILL"
        );
    }
}
