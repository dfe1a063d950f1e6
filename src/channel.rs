//! Channels connecting the parent to one child stream.
//!
//! A channel is created before the fork and split across it: the child
//! closes the parent end, the parent closes the child end, and each side
//! owns exactly one end from then on. Closing an end is idempotent.
//!
//! Parent ends are close-on-exec from the moment they exist, so a child
//! spawned by a later (or nested) invocation never inherits a copy of a
//! live channel end; otherwise that copy would hold the stream open and
//! stall EOF for the invocation that owns it. Handing an end to a child on
//! purpose still works: the child-side `dup2` clears the flag on the
//! duplicated descriptor.

use std::os::fd::{AsRawFd, OwnedFd};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::pipe;

use crate::error::{Error, Result};

/// A two-ended OS conduit between parent and child.
#[derive(Debug)]
pub(crate) struct Channel {
    parent: Option<OwnedFd>,
    child: Option<OwnedFd>,
}

impl Channel {
    /// A unidirectional pipe. The child holds the write end when it is the
    /// writer (output, error, and control streams), the read end otherwise.
    pub fn pipe(child_writes: bool) -> Result<Self> {
        let (read, write) = pipe().map_err(Error::Channel)?;
        let (parent, child) = if child_writes {
            (read, write)
        } else {
            (write, read)
        };
        set_cloexec(&parent)?;
        Ok(Self {
            parent: Some(parent),
            child: Some(child),
        })
    }

    /// A full-duplex Unix stream socket pair, used for the input stream so
    /// that either side can both read and write.
    pub fn duplex() -> Result<Self> {
        let (child, parent) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(Error::Channel)?;
        set_cloexec(&parent)?;
        Ok(Self {
            parent: Some(parent),
            child: Some(child),
        })
    }

    /// Mark the child end close-on-exec. Only the control channel wants
    /// this: a successful image replace must close it without a write.
    pub fn set_child_cloexec(&self) -> Result<()> {
        if let Some(fd) = &self.child {
            set_cloexec(fd)?;
        }
        Ok(())
    }

    pub fn take_parent(&mut self) -> Option<OwnedFd> {
        self.parent.take()
    }

    pub fn take_child(&mut self) -> Option<OwnedFd> {
        self.child.take()
    }

    /// Close the parent end. No-op if already closed.
    pub fn close_parent(&mut self) {
        drop(self.parent.take());
    }

    /// Close the child end. No-op if already closed.
    pub fn close_child(&mut self) {
        drop(self.child.take());
    }
}

fn set_cloexec(fd: &OwnedFd) -> Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(Error::Channel)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};

    #[test]
    fn pipe_carries_bytes_child_to_parent() {
        let mut channel = Channel::pipe(true).unwrap();
        let mut writer = File::from(channel.take_child().unwrap());
        let mut reader = File::from(channel.take_parent().unwrap());

        writer.write_all(b"hello").unwrap();
        drop(writer);

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn duplex_carries_bytes_both_ways() {
        let mut channel = Channel::duplex().unwrap();
        let mut parent = File::from(channel.take_parent().unwrap());
        let mut child = File::from(channel.take_child().unwrap());

        parent.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        child.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        child.write_all(b"pong").unwrap();
        parent.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn close_is_idempotent() {
        let mut channel = Channel::pipe(true).unwrap();
        assert!(channel.parent.is_some());
        channel.close_parent();
        assert!(channel.parent.is_none());
        channel.close_parent();
        channel.close_child();
        channel.close_child();
        assert!(channel.child.is_none());
        assert!(channel.take_parent().is_none());
        assert!(channel.take_child().is_none());
    }

    fn has_cloexec(fd: &OwnedFd) -> bool {
        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC)
    }

    #[test]
    fn cloexec_flag_sticks() {
        let channel = Channel::pipe(true).unwrap();
        channel.set_child_cloexec().unwrap();
        assert!(has_cloexec(channel.child.as_ref().unwrap()));
    }

    #[test]
    fn parent_ends_are_cloexec_from_allocation() {
        for channel in [Channel::pipe(true).unwrap(), Channel::duplex().unwrap()] {
            assert!(has_cloexec(channel.parent.as_ref().unwrap()));
            // The child end crosses the fork and must survive an exec.
            assert!(!has_cloexec(channel.child.as_ref().unwrap()));
        }
    }
}
