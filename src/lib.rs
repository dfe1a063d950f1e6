//! Spawnpipe - child process spawning with per-stream redirection plans
//!
//! This crate spawns a single child process per invocation and wires its
//! standard streams according to a caller-built plan:
//!
//! - `plan`: which target backs each stream (inherit, null device, an
//!   existing descriptor, or a fresh channel)
//! - `channel`: the pipe / socket-pair conduits split across the fork
//! - `spawn`: fork, child-side plan application, exec-failure detection
//! - `status`: the parent-owned handle with close/wait/kill semantics
//! - `command`: the typed invocation surface over the launcher
//!
//! A failed exec never vanishes silently: the child reports it over an
//! internal close-on-exec channel and the parent surfaces it as a
//! structured [`Error::Launch`] after reaping the child.
//!
//! ```no_run
//! use spawnpipe::Command;
//!
//! # fn main() -> spawnpipe::Result<()> {
//! let status = Command::new(["ls", "-l"]).may_fail().status()?;
//! println!("ls finished with {}", status);
//!
//! Command::new(["ls"]).lines(|line| println!("entry: {line}"))?;
//! # Ok(())
//! # }
//! ```

mod channel;
mod command;
mod error;
mod plan;
mod spawn;
mod status;

pub use command::Command;
pub use error::{Error, LaunchError, LaunchErrorKind, Result};
pub use plan::{PlanBuilder, RedirectionPlan, Role, Target};
pub use spawn::{fork_with_plan, launch, ChildAction, Forked};
pub use status::{ExitStatus, RunStatus};
