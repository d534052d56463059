// src/streamer.rs

//! Client for the same-host image streamer service.
//!
//! Unlike the remote proxy/cache, the streamer speaks over a single
//! persistent control connection shared by every caller in the process (and
//! by helpers forked from it). Requests, replies and pipe handoffs all
//! interleave on that one stream, so each open holds a cross-process lock
//! for its whole request → (reply) → handoff sequence; otherwise one caller
//! could receive a pipe end intended for another.

use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::channel::ImageChannel;
use crate::codec::{self, StreamerReply, StreamerRequest};
use crate::config::StreamerConfig;
use crate::error::{Result, TransportError};
use crate::pipe::{self, PipeEnd};
use crate::sync::ShmMutex;

/// Session mode, fixed at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerMode {
    /// Dump side: the streamer captures image files we write.
    Capture,
    /// Restore side: the streamer serves image files we read.
    Serve,
}

impl StreamerMode {
    /// Pipe end kept locally for an open in this mode.
    fn kept_end(self) -> PipeEnd {
        match self {
            StreamerMode::Capture => PipeEnd::Write,
            StreamerMode::Serve => PipeEnd::Read,
        }
    }
}

/// A connected streamer session.
#[derive(Debug)]
pub struct ImageStreamer {
    socket: UnixStream,
    lock: ShmMutex,
    mode: StreamerMode,
}

impl ImageStreamer {
    /// Connects to the streamer socket for `mode` under the configured
    /// image directory and sets up the shared lock.
    ///
    /// Must run before forking any helper that will call [`open`]; the lock
    /// is shared through fork, not through the filesystem.
    ///
    /// [`open`]: ImageStreamer::open
    pub fn connect(config: &StreamerConfig, mode: StreamerMode) -> Result<Self> {
        let path = config.socket_path(mode);
        Self::connect_path(&path, mode)
    }

    fn connect_path(path: &Path, mode: StreamerMode) -> Result<Self> {
        let socket = UnixStream::connect(path).map_err(|e| TransportError::socket(path, e))?;
        let lock = ShmMutex::new()?;

        tracing::debug!("connected to image streamer at {}", path.display());
        Ok(Self { socket, lock, mode })
    }

    /// Opens an image file via a pipe handed off by the streamer.
    ///
    /// `mode` must equal the session mode; a mismatch is a caller bug and
    /// panics. In serve mode a missing file is reported as `NotFound`. In
    /// capture mode there is no existence reply by design: a sick streamer
    /// shows up later as a broken data pipe, which callers treat the same
    /// as a transport failure.
    pub fn open(&self, filename: &str, mode: StreamerMode) -> Result<ImageChannel> {
        assert_eq!(
            mode, self.mode,
            "streamer open mode must match the session mode"
        );

        let _guard = self.lock.lock();
        self.open_locked(filename)
    }

    fn open_locked(&self, filename: &str) -> Result<ImageChannel> {
        let mut sock = &self.socket;

        codec::write_message(
            &mut sock,
            &StreamerRequest {
                filename: filename.to_string(),
            },
        )?;

        if self.mode == StreamerMode::Serve {
            let reply: StreamerReply = codec::read_message(&mut sock)?.ok_or_else(|| {
                TransportError::desync("streamer closed the control connection")
            })?;
            if !reply.exists {
                tracing::debug!("streamer has no file named {filename}");
                return Err(TransportError::not_found(filename));
            }
        }

        pipe::upgrade_to_pipe(self.socket.as_fd(), self.mode.kept_end())
    }

    /// Dismisses the streamer, closing the control connection. No more
    /// files will be opened through this session.
    pub fn finish(self) {
        tracing::debug!("dismissing the image streamer");
    }
}
