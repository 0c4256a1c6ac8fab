//! OS Abstraction: the narrow capability set {pid, dup-fd, send-fds,
//! recv-fds} that the rest of the crate is built against.
//!
//! Kept as one small trait rather than a hierarchy of traits, per the
//! design notes: there is exactly one thing under test that needs mocking
//! (the pid, so tests can exercise pid-reuse scenarios deterministically),
//! and everything else is real `nix` syscalls even in tests — a socketpair
//! and a pipe are real file descriptors, so the fd-passing path is
//! exercised end to end without needing root or a real listening socket.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};
use nix::unistd;

/// Capability set required by the coordination protocol. Implemented once
/// for production (`RealOs`) and once for tests (`FakeOs`), per the design
/// notes' "small interface, no deep subtype hierarchy" guidance.
pub trait SystemOs: Send + Sync {
    fn pid(&self) -> i32;

    fn open(&self, path: &Path) -> io::Result<OwnedFd>;

    fn dup(&self, fd: BorrowedFd<'_>) -> nix::Result<OwnedFd>;

    /// Send `payload` (at least one byte) with `fds` attached as a single
    /// `SCM_RIGHTS` control message.
    fn send_fds(&self, socket: BorrowedFd<'_>, payload: &[u8], fds: &[RawFd]) -> nix::Result<usize>;

    /// Receive up to `max_fds` descriptors alongside up to `buf.len()` bytes
    /// of payload. Returns the number of payload bytes read and whatever
    /// descriptors rode along.
    fn recv_fds(
        &self,
        socket: BorrowedFd<'_>,
        buf: &mut [u8],
        max_fds: usize,
    ) -> nix::Result<(usize, Vec<RawFd>)>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RealOs;

impl SystemOs for RealOs {
    fn pid(&self) -> i32 {
        unistd::getpid().as_raw()
    }

    fn open(&self, path: &Path) -> io::Result<OwnedFd> {
        Ok(File::options().read(true).write(true).open(path)?.into())
    }

    fn dup(&self, fd: BorrowedFd<'_>) -> nix::Result<OwnedFd> {
        unistd::dup(fd.as_raw_fd()).map(|raw| unsafe { OwnedFd::from_raw_fd(raw) })
    }

    fn send_fds(&self, socket: BorrowedFd<'_>, payload: &[u8], fds: &[RawFd]) -> nix::Result<usize> {
        let iov = [io::IoSlice::new(payload)];
        let cmsgs = if fds.is_empty() {
            vec![]
        } else {
            vec![ControlMessage::ScmRights(fds)]
        };
        socket::sendmsg::<UnixAddr>(socket.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
    }

    fn recv_fds(
        &self,
        socket: BorrowedFd<'_>,
        buf: &mut [u8],
        max_fds: usize,
    ) -> nix::Result<(usize, Vec<RawFd>)> {
        let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
        let mut iov = [io::IoSliceMut::new(buf)];
        let msg = socket::recvmsg::<UnixAddr>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )?;

        let mut fds = Vec::new();
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                fds.extend(received.into_iter().take(max_fds));
            }
        }
        Ok((msg.bytes, fds))
    }
}

/// Test double: real syscalls under the hood, deterministic pid on top, so
/// tests can construct pid-reuse scenarios (`FakeOs::with_pid(1)` twice in a
/// row) without needing two real OS processes with the same pid.
#[derive(Clone)]
pub struct FakeOs {
    pid: i32,
    inner: RealOs,
}

impl FakeOs {
    pub fn with_pid(pid: i32) -> Self {
        Self {
            pid,
            inner: RealOs,
        }
    }
}

impl SystemOs for FakeOs {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn open(&self, path: &Path) -> io::Result<OwnedFd> {
        self.inner.open(path)
    }

    fn dup(&self, fd: BorrowedFd<'_>) -> nix::Result<OwnedFd> {
        self.inner.dup(fd)
    }

    fn send_fds(&self, socket: BorrowedFd<'_>, payload: &[u8], fds: &[RawFd]) -> nix::Result<usize> {
        self.inner.send_fds(socket, payload, fds)
    }

    fn recv_fds(
        &self,
        socket: BorrowedFd<'_>,
        buf: &mut [u8],
        max_fds: usize,
    ) -> nix::Result<(usize, Vec<RawFd>)> {
        self.inner.recv_fds(socket, buf, max_fds)
    }
}
