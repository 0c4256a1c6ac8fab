//! Upgrade wire protocol: request byte, payload count, repeated
//! `(name, descriptor)` frames, ready byte. All multi-byte integers are
//! little-endian. See [`crate::session`] for the state machine that drives
//! these frames and [`crate::os::SystemOs`] for the underlying syscalls.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::error::SessionError;
use crate::os::SystemOs;

pub const REQUEST_BYTE: u8 = b'R';
pub const READY_BYTE: u8 = b'\x01';

pub fn send_request(stream: &mut UnixStream) -> io::Result<()> {
    stream.write_all(&[REQUEST_BYTE])
}

pub fn recv_request(stream: &mut UnixStream) -> io::Result<()> {
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf)
}

pub fn send_count(stream: &mut UnixStream, count: u64) -> io::Result<()> {
    stream.write_all(&count.to_le_bytes())
}

pub fn recv_count(stream: &mut UnixStream) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn send_ready(stream: &mut UnixStream) -> io::Result<()> {
    stream.write_all(&[READY_BYTE])
}

pub fn recv_ready(stream: &mut UnixStream) -> io::Result<()> {
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf)?;
    if buf[0] != READY_BYTE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad ready byte"));
    }
    Ok(())
}

/// Send one `(name, fd)` frame: a plain 4-byte name length, then a single
/// `sendmsg` carrying the name bytes (prefixed with a one-byte marker so the
/// ancillary payload is never empty) with the descriptor riding along as an
/// `SCM_RIGHTS` control message.
pub fn send_named_fd(
    os: &dyn SystemOs,
    stream: &mut UnixStream,
    name: &str,
    fd: RawFd,
) -> Result<(), SessionError> {
    let len = name.len() as u32;
    stream
        .write_all(&len.to_le_bytes())
        .map_err(|source| SessionError::SendName {
            name: name.to_string(),
            source,
        })?;

    let mut payload = Vec::with_capacity(1 + name.len());
    payload.push(0u8);
    payload.extend_from_slice(name.as_bytes());

    os.send_fds(stream.as_fd(), &payload, &[fd])
        .map_err(|source| SessionError::SendFd {
            name: name.to_string(),
            source,
        })?;
    Ok(())
}

pub fn recv_named_fd(
    os: &dyn SystemOs,
    stream: &mut UnixStream,
) -> Result<(String, OwnedFd), SessionError> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .map_err(SessionError::ReadName)?;
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut buf = vec![0u8; 1 + len];
    let (n, mut fds) = os
        .recv_fds(stream.as_fd(), &mut buf, 1)
        .map_err(|source| SessionError::RecvFd {
            name: String::new(),
            source,
        })?;

    if n != buf.len() {
        return Err(SessionError::RecvFd {
            name: String::new(),
            source: nix::Error::EIO,
        });
    }

    let name = String::from_utf8(buf[1..].to_vec()).map_err(|_| SessionError::InvalidName)?;

    if fds.is_empty() {
        return Err(SessionError::MissingFd { name });
    }
    let fd = unsafe {
        use std::os::fd::FromRawFd;
        OwnedFd::from_raw_fd(fds.remove(0))
    };
    Ok((name, fd))
}
