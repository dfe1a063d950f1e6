//! Typed invocation surface over the launcher.

use std::io::{BufRead, BufReader};

use crate::error::{Error, Result};
use crate::plan::{RedirectionPlan, Role, Target};
use crate::spawn::{launch, ChildAction};
use crate::status::{ExitStatus, RunStatus};

/// Builder for one external-program invocation.
///
/// The recognized options are exactly the argv, an argv\[0\] override, one
/// target per stream, and the `may_fail` policy; anything else is
/// unrepresentable. Directives are applied in declaration order, the last
/// one for a stream winning.
#[derive(Debug, Default)]
pub struct Command {
    argv: Vec<String>,
    argv0: Option<String>,
    directives: Vec<(Role, Target)>,
    may_fail: bool,
}

impl Command {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Display name passed to the program as argv\[0\], distinct from the
    /// executable path.
    pub fn argv0(mut self, name: impl Into<String>) -> Self {
        self.argv0 = Some(name.into());
        self
    }

    /// Add a redirection directive for a stream.
    pub fn redirect(mut self, role: Role, target: Target) -> Self {
        self.directives.push((role, target));
        self
    }

    /// Request a fresh channel for a stream.
    pub fn channel(self, role: Role) -> Self {
        self.redirect(role, Target::NewChannel)
    }

    /// Return non-success exits as a status instead of an error. Launch
    /// failures are still errors: the command never ran.
    pub fn may_fail(mut self) -> Self {
        self.may_fail = true;
        self
    }

    fn into_parts(self) -> (RedirectionPlan, ChildAction, bool) {
        let mut builder = RedirectionPlan::builder();
        for (role, target) in self.directives {
            builder = builder.redirect(role, target);
        }
        let action = ChildAction::Exec {
            argv: self.argv,
            argv0: self.argv0,
        };
        (builder.build(), action, self.may_fail)
    }

    /// Run to completion and return the exit status.
    ///
    /// A non-success exit becomes [`Error::Run`] unless [`Command::may_fail`]
    /// was set. Plans requesting fresh channels are rejected here; nobody
    /// would service them. Use [`Command::spawn`], [`Command::lines`], or
    /// [`Command::with_channels`] instead.
    pub fn status(self) -> Result<ExitStatus> {
        let (plan, action, may_fail) = self.into_parts();
        if plan.wants_channels() {
            return Err(Error::Config(
                "status() cannot service channels; use spawn(), lines(), or with_channels()"
                    .to_string(),
            ));
        }
        let mut status = launch(plan, action)?;
        finish(&mut status, may_fail)
    }

    /// Launch and hand the live handle to the caller, who owns reaping,
    /// closing, and error translation from then on. Pipelines compose by
    /// passing one invocation's output channel as another's explicit input.
    pub fn spawn(self) -> Result<RunStatus> {
        let (plan, action, _) = self.into_parts();
        launch(plan, action)
    }

    /// Line mode: deliver each output line to the callback, trailing line
    /// terminator stripped, in the order produced. Implies a fresh output
    /// channel. The handle's channels are closed on every exit path, then
    /// the child is waited and `may_fail` translation applied.
    ///
    /// Other streams may be redirected, but not onto fresh channels: a
    /// caller who wants raw access uses [`Command::with_channels`].
    pub fn lines<F>(self, mut callback: F) -> Result<ExitStatus>
    where
        F: FnMut(&str),
    {
        for (role, target) in &self.directives {
            if *role == Role::Output && !matches!(target, Target::NewChannel) {
                return Err(Error::Config(
                    "line mode reads the output stream; it cannot be redirected elsewhere"
                        .to_string(),
                ));
            }
            if *role != Role::Output && matches!(target, Target::NewChannel) {
                return Err(Error::Config(
                    "line mode only services the output stream; use with_channels() for raw access"
                        .to_string(),
                ));
            }
        }
        let may_fail = self.may_fail;
        let mut status = self.channel(Role::Output).spawn()?;
        let output = match status.take_channel(Role::Output) {
            Some(output) => output,
            None => {
                status.close();
                return Err(Error::Config("output channel missing after spawn".to_string()));
            }
        };
        let reader = BufReader::new(output);
        for line in reader.lines() {
            match line {
                Ok(line) => callback(&line),
                Err(e) => {
                    status.close();
                    return Err(Error::Io(e));
                }
            }
        }
        status.close();
        finish(&mut status, may_fail)
    }

    /// Raw mode: the callback receives the handle with its live channels
    /// (canonical order input, output, error; only those requested). The
    /// channels are closed once the callback returns, success or not, and
    /// only then is the child waited and `may_fail` translation applied.
    /// A callback error propagates without waiting; the caller still gets
    /// closed channels and a reapable child behind the error.
    pub fn with_channels<F>(self, callback: F) -> Result<ExitStatus>
    where
        F: FnOnce(&mut RunStatus) -> Result<()>,
    {
        let may_fail = self.may_fail;
        let mut status = self.spawn()?;
        let result = callback(&mut status);
        status.close();
        result?;
        finish(&mut status, may_fail)
    }
}

fn finish(status: &mut RunStatus, may_fail: bool) -> Result<ExitStatus> {
    let exit = status.wait()?;
    if exit.success() || may_fail {
        Ok(exit)
    } else {
        Err(Error::Run {
            command: status.command().to_string(),
            status: exit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_rejects_channel_plans() {
        let result = Command::new(["true"]).channel(Role::Output).status();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn status_rejects_empty_argv() {
        let result = Command::new(Vec::<String>::new()).status();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn lines_rejects_conflicting_output_redirect() {
        let result = Command::new(["true"])
            .redirect(Role::Output, Target::Null)
            .lines(|_| {});
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn lines_rejects_extra_channels() {
        let result = Command::new(["true"]).channel(Role::Input).lines(|_| {});
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn builder_appends_arguments() {
        let command = Command::new(["echo"]).arg("one").args(["two", "three"]);
        assert_eq!(command.argv, ["echo", "one", "two", "three"]);
    }
}
