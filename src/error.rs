//! Error types for spawning and running child processes.

use std::fmt;
use std::io;

use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::ExitStatus;

/// Spawn error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Allocating a channel failed. Every end already allocated for the
    /// invocation has been closed.
    #[error("failed to create channel: {0}")]
    Channel(#[source] nix::Error),

    /// Process creation itself failed; nothing was spawned.
    #[error("failed to fork: {0}")]
    Fork(#[source] nix::Error),

    /// Waiting for the child failed.
    #[error("failed to wait for child: {0}")]
    Wait(#[source] nix::Error),

    /// Signaling the child failed.
    #[error("failed to signal child: {0}")]
    Kill(#[source] nix::Error),

    /// The invocation itself was malformed.
    #[error("invalid invocation: {0}")]
    Config(String),

    /// The child could not start the requested program at all. The command
    /// never ran; this is raised even under a `may_fail` policy.
    #[error("cannot launch `{command}`: {error}")]
    Launch {
        /// The attempted command line, arguments joined.
        command: String,
        /// The failure reported by the child.
        error: LaunchError,
    },

    /// The program ran and terminated unsuccessfully.
    #[error("`{command}` failed with {status}")]
    Run {
        /// The command line, arguments joined.
        command: String,
        /// Exit code or terminating signal.
        status: ExitStatus,
    },

    /// Stream I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for spawn operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why an exec attempt failed, reconstructed in the parent's address space.
///
/// This is the closed payload carried over the control channel. Both sides
/// of the fork agree on its shape; nothing dynamic crosses the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchError {
    /// Broad classification of the failure.
    pub kind: LaunchErrorKind,
    /// Human-readable description.
    pub message: String,
    /// OS error code, when one was available.
    pub errno: Option<i32>,
}

/// Classification of a launch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaunchErrorKind {
    /// The executable does not exist.
    NotFound,
    /// The executable exists but may not be executed.
    PermissionDenied,
    /// Any other launch failure.
    Other,
}

impl LaunchError {
    pub(crate) fn from_errno(errno: Errno) -> Self {
        let kind = match errno {
            Errno::ENOENT => LaunchErrorKind::NotFound,
            Errno::EACCES => LaunchErrorKind::PermissionDenied,
            _ => LaunchErrorKind::Other,
        };
        Self {
            kind,
            message: errno.desc().to_string(),
            errno: Some(errno as i32),
        }
    }

    /// Serialize for the trip through the control channel.
    pub(crate) fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| self.message.clone().into_bytes())
    }

    /// Decode the bytes the parent drained from the control channel.
    /// Undecodable bytes degrade to a plain message, never a parent-side
    /// failure.
    pub(crate) fn decode(bytes: &[u8]) -> Self {
        serde_json::from_slice(bytes).unwrap_or_else(|_| Self {
            kind: LaunchErrorKind::Other,
            message: String::from_utf8_lossy(bytes).into_owned(),
            errno: None,
        })
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errno {
            Some(code) => write!(f, "{} (os error {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for LaunchError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_error_roundtrip() {
        let original = LaunchError::from_errno(Errno::ENOENT);
        let decoded = LaunchError::decode(&original.encode());
        assert_eq!(decoded, original);
        assert_eq!(decoded.kind, LaunchErrorKind::NotFound);
        assert_eq!(decoded.errno, Some(Errno::ENOENT as i32));
    }

    #[test]
    fn launch_error_decode_garbage() {
        let decoded = LaunchError::decode(b"not json at all");
        assert_eq!(decoded.kind, LaunchErrorKind::Other);
        assert_eq!(decoded.message, "not json at all");
        assert_eq!(decoded.errno, None);
    }

    #[test]
    fn launch_error_kind_classification() {
        assert_eq!(
            LaunchError::from_errno(Errno::EACCES).kind,
            LaunchErrorKind::PermissionDenied
        );
        assert_eq!(
            LaunchError::from_errno(Errno::ENOMEM).kind,
            LaunchErrorKind::Other
        );
    }
}
