// src/channel.rs

//! Owned data-plane channels and non-seekable stream skipping.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;

use crate::error::{Result, TransportError};

const SKIP_BUF_LEN: usize = 4096;

/// An open, connected data-plane descriptor.
///
/// Either a raw control socket (when the open was not generation-scoped) or
/// the locally-kept end of a freshly upgraded pipe. The channel owns the
/// descriptor: dropping it closes it, and every error path inside an open
/// operation drops partially-opened channels before returning, so a failed
/// open never leaks a descriptor.
#[derive(Debug)]
pub struct ImageChannel {
    inner: File,
}

impl ImageChannel {
    /// Consumes the channel, handing the descriptor to the caller.
    pub fn into_fd(self) -> OwnedFd {
        self.inner.into()
    }
}

impl From<OwnedFd> for ImageChannel {
    fn from(fd: OwnedFd) -> Self {
        Self {
            inner: File::from(fd),
        }
    }
}

impl From<UnixStream> for ImageChannel {
    fn from(stream: UnixStream) -> Self {
        Self::from(OwnedFd::from(stream))
    }
}

impl AsFd for ImageChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Read for ImageChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for ImageChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Discards exactly `len` bytes from a non-seekable stream.
///
/// Sockets and pipes have no seek primitive, so advancing the read position
/// has to be emulated by consuming and discarding. End-of-stream before `len`
/// bytes means the two sides disagree about a record boundary and is fatal.
/// Interrupted reads are retried without bound; no timeout is imposed, the
/// call blocks for as long as the peer does.
pub fn skip_bytes<R: Read + ?Sized>(reader: &mut R, len: u64) -> Result<()> {
    let mut buf = [0u8; SKIP_BUF_LEN];
    let mut skipped: u64 = 0;

    while skipped < len {
        let want = (len - skipped).min(SKIP_BUF_LEN as u64) as usize;
        match reader.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(TransportError::desync(format!(
                    "unexpected end of stream while skipping ({skipped}/{len} bytes)"
                )))
            }
            Ok(n) => skipped += n as u64,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(TransportError::transport(
                    format!("error while skipping bytes from stream ({skipped}/{len})"),
                    e,
                ))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_skip_zero_bytes_reads_nothing() {
        // A reader that panics on any read proves skip(0) never touches it.
        struct Untouchable;
        impl Read for Untouchable {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                panic!("skip_bytes(_, 0) must not read");
            }
        }

        skip_bytes(&mut Untouchable, 0).unwrap();
    }

    #[test]
    fn test_skip_exact_length_leaves_stream_at_eof() {
        let data = vec![7u8; 10_000];
        let mut cursor = Cursor::new(data);

        skip_bytes(&mut cursor, 10_000).unwrap();

        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_skip_partial_then_read_remainder() {
        let mut data = vec![0u8; 100];
        data.extend_from_slice(b"payload");
        let mut cursor = Cursor::new(data);

        skip_bytes(&mut cursor, 100).unwrap();

        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"payload");
    }

    #[test]
    fn test_skip_past_eof_is_desync() {
        let mut cursor = Cursor::new(vec![0u8; 50]);
        let err = skip_bytes(&mut cursor, 51).unwrap_err();
        assert!(matches!(err, TransportError::Desync { .. }));
    }

    #[test]
    fn test_channel_roundtrip_over_socketpair() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut tx = ImageChannel::from(left);
        let mut rx = ImageChannel::from(right);

        tx.write_all(b"image bytes").unwrap();
        drop(tx);

        let mut out = Vec::new();
        rx.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"image bytes");
    }

    #[test]
    fn test_into_fd_keeps_the_descriptor_usable() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut tx = ImageChannel::from(left);
        tx.write_all(b"handed over").unwrap();
        drop(tx);

        // The engine takes the raw descriptor for splice-style I/O.
        let fd = ImageChannel::from(right).into_fd();
        let mut out = Vec::new();
        File::from(fd).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"handed over");
    }
}
