//! Forking, child-side plan application, and exec-failure detection.
//!
//! The launch sequence: allocate a channel for every `NewChannel` role
//! (plus the internal control channel for exec actions), fork, apply the
//! plan to the child's descriptors, then exec or run the callback. The
//! control channel's child end is close-on-exec, so a successful image
//! replace closes it without a byte written; a failed exec serializes the
//! error into it before the child exits.

use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use log::debug;
use nix::errno::Errno;
use nix::unistd::{dup2, execvp, fork, ForkResult, Pid};

use crate::channel::Channel;
use crate::error::{Error, LaunchError, Result};
use crate::plan::{RedirectionPlan, Role, Target};
use crate::status::RunStatus;

const NULL_DEVICE: &[u8] = b"/dev/null\0";

/// What the child does after its streams are wired.
pub enum ChildAction {
    /// Replace the process image with an external program. No shell
    /// interpretation is applied.
    Exec {
        /// Program path followed by its arguments.
        argv: Vec<String>,
        /// Display name passed to the program as argv[0], in place of the
        /// program path.
        argv0: Option<String>,
    },
    /// Run a closure in the child, then exit with its return value.
    Callback(Box<dyn FnOnce() -> i32>),
}

impl ChildAction {
    pub fn exec<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ChildAction::Exec {
            argv: argv.into_iter().map(Into::into).collect(),
            argv0: None,
        }
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce() -> i32 + 'static,
    {
        ChildAction::Callback(Box::new(f))
    }

    /// Human-readable form used in error messages.
    pub(crate) fn describe(&self) -> String {
        match self {
            ChildAction::Exec { argv, .. } => argv.join(" "),
            ChildAction::Callback(_) => "<in-process callback>".to_string(),
        }
    }
}

impl fmt::Debug for ChildAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildAction::Exec { argv, argv0 } => f
                .debug_struct("Exec")
                .field("argv", argv)
                .field("argv0", argv0)
                .finish(),
            ChildAction::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Outcome of [`fork_with_plan`], distinguishing which process the caller
/// is running in.
#[derive(Debug)]
pub enum Forked {
    /// The launching process; owns the result handle.
    Parent(RunStatus),
    /// The new child process. The caller is running on the child side of
    /// the fork and must confine itself to child-side work.
    Child,
}

enum Prepared {
    Exec(ExecImage),
    Callback(Box<dyn FnOnce() -> i32>),
}

/// The exec arguments, converted before the fork so the child does no
/// fallible work between fork and exec.
struct ExecImage {
    program: CString,
    argv: Vec<CString>,
}

impl ExecImage {
    fn prepare(argv: &[String], argv0: Option<&str>) -> Result<Self> {
        let program = argv
            .first()
            .ok_or_else(|| Error::Config("empty argument vector".to_string()))?;
        let program = to_cstring(program)?;
        let mut out = Vec::with_capacity(argv.len());
        out.push(match argv0 {
            Some(name) => to_cstring(name)?,
            None => program.clone(),
        });
        for arg in &argv[1..] {
            out.push(to_cstring(arg)?);
        }
        Ok(Self { program, argv: out })
    }

    /// Replace the process image. Returns only if the exec failed.
    fn run(&self) -> Errno {
        match execvp(&self.program, &self.argv) {
            Ok(infallible) => match infallible {},
            Err(errno) => errno,
        }
    }
}

fn to_cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::Config(format!("argument contains NUL byte: {s:?}")))
}

/// Spawn a child according to `plan` and run `action` in it.
///
/// For exec actions, a launch failure inside the child (missing binary,
/// permission denied) comes back as [`Error::Launch`] with the child fully
/// reaped and every parent-side end closed before this function returns.
/// If process creation itself fails, every channel allocated for the
/// attempt is closed on both ends before the error is reported.
pub fn launch(plan: RedirectionPlan, action: ChildAction) -> Result<RunStatus> {
    let command = action.describe();
    let prepared = match action {
        ChildAction::Exec { argv, argv0 } => {
            Prepared::Exec(ExecImage::prepare(&argv, argv0.as_deref())?)
        }
        ChildAction::Callback(f) => Prepared::Callback(f),
    };

    let mut targets = plan.into_targets();
    let mut channels = allocate_channels(&targets)?;

    // The control channel observes the exec attempt. It is never part of
    // the caller-visible plan or the resulting handle.
    let mut control = match &prepared {
        Prepared::Exec(_) => {
            let channel = Channel::pipe(true)?;
            channel.set_child_cloexec()?;
            Some(channel)
        }
        Prepared::Callback(_) => None,
    };

    match unsafe { fork() } {
        // Channels are dropped on this path, closing both ends.
        Err(errno) => Err(Error::Fork(errno)),
        Ok(ForkResult::Child) => {
            if let Some(channel) = control.as_mut() {
                channel.close_parent();
            }
            if apply_plan(&mut targets, &mut channels).is_err() {
                std::process::exit(1);
            }
            match prepared {
                Prepared::Exec(image) => {
                    let errno = image.run();
                    // A failed image replace does not terminate the
                    // process; report and exit so nothing runs twice.
                    report_launch_failure(control, errno);
                    std::process::exit(127);
                }
                Prepared::Callback(f) => {
                    drop(control);
                    std::process::exit(f());
                }
            }
        }
        Ok(ForkResult::Parent { child }) => {
            parent_after_fork(child, targets, channels, control, command)
        }
    }
}

/// Fork with the plan applied but no child action: the low-level primitive
/// for callers scripting the child themselves.
///
/// Returns [`Forked::Child`] to the caller running as the new process; that
/// branch must be checked before any parent-side work. A child whose
/// redirections cannot be applied exits with status 1 instead of returning,
/// so the caller's error path only ever runs in the parent.
pub fn fork_with_plan(plan: RedirectionPlan) -> Result<Forked> {
    let mut targets = plan.into_targets();
    let mut channels = allocate_channels(&targets)?;

    match unsafe { fork() } {
        Err(errno) => Err(Error::Fork(errno)),
        Ok(ForkResult::Child) => {
            if apply_plan(&mut targets, &mut channels).is_err() {
                // Returning an error here would run the caller's
                // parent-side error path in both processes.
                std::process::exit(1);
            }
            Ok(Forked::Child)
        }
        Ok(ForkResult::Parent { child }) => {
            let status =
                parent_after_fork(child, targets, channels, None, "<forked child>".to_string())?;
            Ok(Forked::Parent(status))
        }
    }
}

/// Allocate a channel for every role resolved to `NewChannel`: a duplex
/// socket pair when the child reads the stream, a pipe when it writes.
/// An allocation failure drops whatever was already allocated.
fn allocate_channels(targets: &[Target; 3]) -> Result<[Option<Channel>; 3]> {
    let mut channels = [None, None, None];
    for role in Role::ALL {
        if matches!(targets[role.index()], Target::NewChannel) {
            channels[role.index()] = Some(if role.child_reads() {
                Channel::duplex()?
            } else {
                Channel::pipe(true)?
            });
        }
    }
    Ok(channels)
}

/// Runs in the child: point each standard descriptor at its target, in
/// canonical role order.
fn apply_plan(
    targets: &mut [Target; 3],
    channels: &mut [Option<Channel>; 3],
) -> nix::Result<()> {
    for role in Role::ALL {
        match std::mem::take(&mut targets[role.index()]) {
            Target::Inherit => {}
            Target::Null => {
                let null = open_null(role)?;
                dup2(null.as_raw_fd(), role.fd())?;
            }
            Target::Explicit(fd) => {
                redirect_onto(fd, role)?;
            }
            Target::NewChannel => {
                let mut channel = match channels[role.index()].take() {
                    Some(channel) => channel,
                    None => return Err(Errno::EBADF),
                };
                channel.close_parent();
                match channel.take_child() {
                    Some(child) => redirect_onto(child, role)?,
                    None => return Err(Errno::EBADF),
                }
            }
        }
    }
    Ok(())
}

/// Duplicate `fd` onto the role's descriptor, then close the original.
/// When `fd` already is the role descriptor, leave it exactly as it is.
fn redirect_onto(fd: OwnedFd, role: Role) -> nix::Result<()> {
    if fd.as_raw_fd() == role.fd() {
        std::mem::forget(fd);
        return Ok(());
    }
    dup2(fd.as_raw_fd(), role.fd())?;
    Ok(())
}

fn open_null(role: Role) -> nix::Result<OwnedFd> {
    let flags = if role.child_reads() {
        libc::O_RDONLY
    } else {
        libc::O_WRONLY
    };
    let fd = unsafe { libc::open(NULL_DEVICE.as_ptr().cast(), flags) };
    if fd < 0 {
        return Err(Errno::last());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Runs in the child after a failed exec: ship the serialized failure to
/// the parent before exiting.
fn report_launch_failure(control: Option<Channel>, errno: Errno) {
    let Some(mut control) = control else { return };
    let Some(end) = control.take_child() else { return };
    let payload = LaunchError::from_errno(errno).encode();
    let mut file = File::from(end);
    let _ = file.write_all(&payload);
}

/// Runs in the parent once fork has returned: release the child's copies,
/// build the handle, and for exec actions drain the control channel.
fn parent_after_fork(
    pid: Pid,
    targets: [Target; 3],
    mut channels: [Option<Channel>; 3],
    control: Option<Channel>,
    command: String,
) -> Result<RunStatus> {
    let mut parent_ends: [Option<File>; 3] = [None, None, None];
    for (slot, end) in channels.iter_mut().zip(parent_ends.iter_mut()) {
        if let Some(channel) = slot.as_mut() {
            channel.close_child();
            *end = channel.take_parent().map(File::from);
        }
    }
    // Explicit targets were duplicated in the child; closing our copies
    // here lets EOF propagate through pipelines.
    drop(targets);

    let mut status = RunStatus::new(parent_ends, pid, command);
    debug!("spawned child {} for `{}`", pid, status.command());

    if let Some(mut control) = control {
        control.close_child();
        drain_control(&mut control, &mut status)?;
    }
    Ok(status)
}

/// Blocking read of the control channel until end-of-stream. Zero bytes
/// means the exec replaced the image; anything else is a serialized launch
/// failure, in which case the child is reaped and the handle torn down
/// before the error is surfaced.
fn drain_control(control: &mut Channel, status: &mut RunStatus) -> Result<()> {
    let Some(end) = control.take_parent() else {
        return Ok(());
    };
    let mut file = File::from(end);
    let mut buf = Vec::new();
    let read = file.read_to_end(&mut buf);
    drop(file);
    match read {
        Ok(0) => Ok(()),
        Ok(_) => {
            let error = LaunchError::decode(&buf);
            debug!(
                "launch of `{}` failed in child {}: {}",
                status.command(),
                status.pid(),
                error
            );
            // The child is exiting or has exited; reap it first, then tear
            // down the tracked ends so nothing survives the dead attempt.
            let _ = status.wait();
            status.close();
            Err(Error::Launch {
                command: status.command().to_string(),
                error,
            })
        }
        Err(e) => {
            // Same teardown as the failure arm: reap, then release the
            // tracked ends, so the aborted launch leaves nothing behind.
            let _ = status.wait();
            status.close();
            Err(Error::Io(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LaunchErrorKind;

    #[test]
    fn describe_joins_argv() {
        let action = ChildAction::exec(["ls", "-l", "/tmp"]);
        assert_eq!(action.describe(), "ls -l /tmp");
        let action = ChildAction::callback(|| 0);
        assert_eq!(action.describe(), "<in-process callback>");
    }

    #[test]
    fn prepare_rejects_empty_argv() {
        let result = ExecImage::prepare(&[], None);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn prepare_rejects_nul_bytes() {
        let argv = vec!["ec\0ho".to_string()];
        assert!(matches!(ExecImage::prepare(&argv, None), Err(Error::Config(_))));
    }

    #[test]
    fn prepare_overrides_argv0() {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()];
        let image = ExecImage::prepare(&argv, Some("customsh")).unwrap();
        assert_eq!(image.program.to_str().unwrap(), "/bin/sh");
        assert_eq!(image.argv[0].to_str().unwrap(), "customsh");
        assert_eq!(image.argv[1].to_str().unwrap(), "-c");
    }

    #[test]
    fn control_read_error_still_reaps_the_child() {
        let plan = RedirectionPlan::builder().build();
        let mut status = launch(plan, ChildAction::callback(|| 0)).unwrap();
        // A write end masquerading as the readable control end: the drain
        // fails with EBADF instead of reaching end-of-stream.
        let mut bad = Channel::pipe(false).unwrap();
        let result = drain_control(&mut bad, &mut status);
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(status.exit_status().is_some());
    }

    #[test]
    fn nonexistent_program_reports_not_found() {
        let plan = RedirectionPlan::builder().build();
        let result = launch(plan, ChildAction::exec(["spawnpipe-no-such-binary"]));
        match result {
            Err(Error::Launch { command, error }) => {
                assert_eq!(command, "spawnpipe-no-such-binary");
                assert_eq!(error.kind, LaunchErrorKind::NotFound);
                assert!(error.errno.is_some());
            }
            other => panic!("expected launch error, got {other:?}"),
        }
    }
}
