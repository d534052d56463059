// src/pipe.rs

//! Pipe upgrade: converting a control exchange into a raw data pipe.
//!
//! Moving image bytes over the control socket would funnel them through the
//! message framing and socket buffering. Handing the peer one end of a fresh
//! pipe instead gives both processes a plain kernel pipe that splice() can
//! drive with minimal overhead.

use std::os::fd::BorrowedFd;

use crate::channel::ImageChannel;
use crate::error::{Result, TransportError};
use crate::handoff;

/// Which end of the upgraded pipe the local process keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    /// Keep the readable end (the peer writes into the pipe).
    Read,
    /// Keep the writable end (the peer reads from the pipe).
    Write,
}

/// Creates a pipe, hands the end opposite `keep` to the peer of `control`,
/// and returns the kept end as the new data-plane channel.
///
/// On handoff failure both pipe ends are closed before the error is
/// propagated; the failure is never retried here, the caller decides whether
/// to redo the whole open sequence. The control socket itself is untouched:
/// the remote protocol drops it right after a successful upgrade, the
/// streamer keeps using it for the next request.
pub fn upgrade_to_pipe(control: BorrowedFd<'_>, keep: PipeEnd) -> Result<ImageChannel> {
    let (read_end, write_end) = nix::unistd::pipe().map_err(|e| {
        TransportError::transport("failed to create data pipe", std::io::Error::from(e))
    })?;

    let (kept, peer) = match keep {
        PipeEnd::Read => (read_end, write_end),
        PipeEnd::Write => (write_end, read_end),
    };

    // send_fd consumes the peer end either way; on failure the kept end is
    // dropped here, so nothing leaks.
    handoff::send_fd(control, peer)?;

    Ok(ImageChannel::from(kept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;
    use std::thread;

    use crate::handoff::recv_fd;

    fn open_fd_count() -> usize {
        std::fs::read_dir("/proc/self/fd").unwrap().count()
    }

    #[test]
    fn test_upgrade_keep_write_end() {
        let (local, remote) = UnixStream::pair().unwrap();

        let peer = thread::spawn(move || {
            let fd = recv_fd(remote.as_fd()).unwrap();
            let mut out = Vec::new();
            File::from(fd).read_to_end(&mut out).unwrap();
            out
        });

        let mut chan = upgrade_to_pipe(local.as_fd(), PipeEnd::Write).unwrap();
        chan.write_all(b"dumped pages").unwrap();
        drop(chan);

        assert_eq!(peer.join().unwrap(), b"dumped pages");
    }

    #[test]
    fn test_upgrade_keep_read_end() {
        let (local, remote) = UnixStream::pair().unwrap();

        let peer = thread::spawn(move || {
            let fd = recv_fd(remote.as_fd()).unwrap();
            File::from(fd).write_all(b"restored pages").unwrap();
        });

        let mut chan = upgrade_to_pipe(local.as_fd(), PipeEnd::Read).unwrap();
        let mut out = Vec::new();
        chan.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"restored pages");

        peer.join().unwrap();
    }

    #[test]
    fn test_failed_handoff_leaks_no_descriptors() {
        let (local, remote) = UnixStream::pair().unwrap();
        drop(remote);

        let before = open_fd_count();
        let err = upgrade_to_pipe(local.as_fd(), PipeEnd::Write).unwrap_err();
        assert!(matches!(err, TransportError::Transport { .. }));
        assert_eq!(open_fd_count(), before);
    }

    #[test]
    fn test_successful_upgrade_owns_exactly_one_new_descriptor() {
        let (local, remote) = UnixStream::pair().unwrap();
        let before = open_fd_count();

        let peer = thread::spawn(move || recv_fd(remote.as_fd()).unwrap());
        let chan = upgrade_to_pipe(local.as_fd(), PipeEnd::Write).unwrap();
        let received = peer.join().unwrap();

        // The kept end plus the end the "peer" received back into this
        // process; the remote socket itself was dropped by the peer thread.
        assert_eq!(open_fd_count(), before + 1);

        drop(chan);
        drop(received);
        assert_eq!(open_fd_count(), before - 1);
    }
}
