// src/handoff.rs

//! Descriptor handoff over a connected UNIX domain socket.
//!
//! `send_fd` consumes the descriptor being handed off: once the call returns
//! the local process no longer holds it, whether or not the peer got a copy.
//! That move models the ownership transfer and rules out the double-use /
//! double-close bugs of raw descriptor juggling.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};

use crate::error::{Result, TransportError};

/// Transfers ownership of `fd` to the peer of `control`.
///
/// The local copy is closed on return regardless of the outcome: on success
/// the peer holds a duplicate, on failure the descriptor is of no further
/// use here. MSG_NOSIGNAL keeps a closed peer from raising SIGPIPE; the
/// failure comes back as an error instead.
pub fn send_fd(control: BorrowedFd<'_>, fd: OwnedFd) -> Result<()> {
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    // One data byte so the message is never empty.
    let iov = [IoSlice::new(&[0u8])];

    socket::sendmsg::<()>(
        control.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::MSG_NOSIGNAL,
        None,
    )
    .map_err(|e| {
        TransportError::transport("failed to hand descriptor to peer", std::io::Error::from(e))
    })?;
    Ok(())
}

/// Receives a descriptor sent by the peer of `control`.
pub fn recv_fd(control: BorrowedFd<'_>) -> Result<OwnedFd> {
    let mut data = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut data)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);

    let msg = socket::recvmsg::<UnixAddr>(
        control.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::empty(),
    )
    .map_err(|e| {
        TransportError::transport(
            "failed to receive descriptor from peer",
            std::io::Error::from(e),
        )
    })?;

    let cmsgs = msg.cmsgs().map_err(|e| {
        TransportError::transport(
            "failed to parse descriptor control message",
            std::io::Error::from(e),
        )
    })?;

    for cmsg in cmsgs {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                // SAFETY: the kernel just installed this descriptor into our
                // table for the SCM_RIGHTS transfer; nothing else owns it.
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }

    Err(TransportError::transport_msg(
        "peer closed the control socket without sending a descriptor",
    ))
}
