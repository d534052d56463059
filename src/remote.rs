// src/remote.rs

//! Client for the remote image proxy (write path) and cache (read path).
//!
//! Every open is an independent control-socket connection: the client sends
//! one open request, the cache answers the read path with one reply, and a
//! generation-tagged open is then upgraded to a dedicated pipe. There is no
//! ordering between concurrent opens; callers serialize if they need one.

use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::channel::ImageChannel;
use crate::codec::{self, ImageOpenReply, ImageOpenRequest, REPLY_NOT_FOUND, REPLY_OK};
use crate::config::RemoteConfig;
use crate::error::{Result, TransportError};
use crate::pipe::{self, PipeEnd};
use crate::snapshot::SnapshotId;

/// Reserved target name of the end-of-session handshake.
pub const FINISH_IMAGE: &str = "finish";

/// Open mode carried in an open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
    Append,
}

/// Client session against the proxy/cache pair.
///
/// Cheap to clone; holds nothing but the rendezvous paths. Connections are
/// made per open and owned by the returned [`ImageChannel`].
#[derive(Debug, Clone)]
pub struct RemoteImageClient {
    cache_socket: PathBuf,
    proxy_socket: PathBuf,
}

impl RemoteImageClient {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            cache_socket: config.cache_socket.clone(),
            proxy_socket: config.proxy_socket.clone(),
        }
    }

    fn connect(&self, path: &Path) -> Result<UnixStream> {
        UnixStream::connect(path).map_err(|e| TransportError::socket(path, e))
    }

    /// Opens a read channel for `name` against the cache service.
    ///
    /// With a snapshot id the channel is the read end of an upgraded pipe;
    /// with `None` (a control request that is not generation-scoped) the raw
    /// control socket doubles as the data channel.
    ///
    /// # Errors
    ///
    /// `NotFound` when the cache reports the image absent; an expected
    /// outcome on the read path, not a failure. Any other nonzero reply code
    /// becomes `OpenFailed`; socket-level problems become `Socket` or
    /// `Transport`.
    pub fn open_for_read(&self, snapshot: Option<&SnapshotId>, name: &str) -> Result<ImageChannel> {
        let mut sock = self.connect(&self.cache_socket)?;

        codec::write_message(&mut sock, &open_request(name, snapshot, OpenMode::ReadOnly))?;

        let reply: ImageOpenReply = codec::read_message(&mut sock)?.ok_or_else(|| {
            TransportError::desync("cache closed the connection before replying to open")
        })?;

        match reply.error {
            REPLY_OK => {
                if snapshot.is_some() {
                    // The control socket is dropped (closed) once the pipe
                    // is established.
                    pipe::upgrade_to_pipe(sock.as_fd(), PipeEnd::Read)
                } else {
                    Ok(ImageChannel::from(sock))
                }
            }
            REPLY_NOT_FOUND => {
                tracing::debug!(
                    "image does not exist ({name}:{})",
                    snapshot.map(SnapshotId::as_str).unwrap_or("-")
                );
                Err(TransportError::not_found(name))
            }
            code => Err(TransportError::open_failed(name, code)),
        }
    }

    /// Opens a write channel for `name` against the proxy service.
    ///
    /// `mode` must be `WriteOnly` or `Append`. The write path sends no reply:
    /// if the proxy is unhealthy the failure surfaces later as a broken data
    /// pipe, which callers treat as a transport failure.
    pub fn open_for_write(
        &self,
        snapshot: Option<&SnapshotId>,
        name: &str,
        mode: OpenMode,
    ) -> Result<ImageChannel> {
        assert!(
            mode != OpenMode::ReadOnly,
            "open_for_write requires a write-capable mode"
        );

        let mut sock = self.connect(&self.proxy_socket)?;

        codec::write_message(&mut sock, &open_request(name, snapshot, mode))?;

        if snapshot.is_some() {
            pipe::upgrade_to_pipe(sock.as_fd(), PipeEnd::Write)
        } else {
            Ok(ImageChannel::from(sock))
        }
    }

    /// Signals the proxy that no more images will be sent this session.
    ///
    /// A pure control handshake: open the reserved finish name write-side,
    /// then close. Failure to establish it is fatal to the session.
    pub fn finish_dump(&self) -> Result<()> {
        tracing::debug!("dump side is calling finish");
        let channel = self.open_for_write(None, FINISH_IMAGE, OpenMode::WriteOnly)?;
        drop(channel);
        Ok(())
    }

    /// Signals the cache that no more images will be requested this session.
    pub fn finish_restore(&self) -> Result<()> {
        tracing::debug!("restore side is calling finish");
        let channel = self.open_for_read(None, FINISH_IMAGE)?;
        drop(channel);
        Ok(())
    }
}

fn open_request(name: &str, snapshot: Option<&SnapshotId>, mode: OpenMode) -> ImageOpenRequest {
    ImageOpenRequest {
        name: name.to_string(),
        snapshot_id: snapshot.map(|s| s.as_str().to_string()),
        mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixListener;
    use std::thread::{self, JoinHandle};

    use tempfile::TempDir;

    use crate::handoff::recv_fd;

    fn client_in(dir: &TempDir) -> RemoteImageClient {
        RemoteImageClient::new(&RemoteConfig::under_dir(dir.path()))
    }

    fn bind_cache(dir: &TempDir) -> UnixListener {
        UnixListener::bind(dir.path().join("img-cache.sock")).unwrap()
    }

    fn bind_proxy(dir: &TempDir) -> UnixListener {
        UnixListener::bind(dir.path().join("img-proxy.sock")).unwrap()
    }

    /// Accepts one read-side open, replies with `error`, and (on success with
    /// a snapshot id) serves `payload` down the handed-off pipe.
    fn spawn_cache(
        listener: UnixListener,
        error: u32,
        payload: &'static [u8],
    ) -> JoinHandle<ImageOpenRequest> {
        thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let req: ImageOpenRequest = codec::read_message(&mut sock).unwrap().unwrap();
            codec::write_message(&mut sock, &ImageOpenReply { error }).unwrap();

            if error == REPLY_OK && req.snapshot_id.is_some() {
                let fd = recv_fd(sock.as_fd()).unwrap();
                File::from(fd).write_all(payload).unwrap();
            }
            req
        })
    }

    #[test]
    fn test_open_for_read_with_snapshot_upgrades_to_pipe() {
        let dir = TempDir::new().unwrap();
        let cache = spawn_cache(bind_cache(&dir), REPLY_OK, b"image bytes");

        let snap = SnapshotId::new("snap-a").unwrap();
        let mut chan = client_in(&dir)
            .open_for_read(Some(&snap), "pages-1.img")
            .unwrap();

        let mut out = Vec::new();
        chan.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"image bytes");

        let req = cache.join().unwrap();
        assert_eq!(req.name, "pages-1.img");
        assert_eq!(req.snapshot_id.as_deref(), Some("snap-a"));
        assert_eq!(req.mode, OpenMode::ReadOnly);
    }

    #[test]
    fn test_open_for_read_without_snapshot_returns_raw_socket() {
        let dir = TempDir::new().unwrap();
        let listener = bind_cache(&dir);

        let cache = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let req: ImageOpenRequest = codec::read_message(&mut sock).unwrap().unwrap();
            assert!(req.snapshot_id.is_none());
            codec::write_message(&mut sock, &ImageOpenReply { error: REPLY_OK }).unwrap();
            // Data flows over the control socket itself.
            sock.write_all(b"over the socket").unwrap();
        });

        let mut chan = client_in(&dir).open_for_read(None, "inventory.img").unwrap();
        let mut out = Vec::new();
        chan.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"over the socket");

        cache.join().unwrap();
    }

    #[test]
    fn test_open_for_read_not_found() {
        let dir = TempDir::new().unwrap();
        let cache = spawn_cache(bind_cache(&dir), REPLY_NOT_FOUND, b"");

        let snap = SnapshotId::new("snap-a").unwrap();
        let err = client_in(&dir)
            .open_for_read(Some(&snap), "missing.img")
            .unwrap_err();
        assert!(err.is_not_found());

        cache.join().unwrap();
    }

    #[test]
    fn test_open_for_read_opaque_failure() {
        let dir = TempDir::new().unwrap();
        let cache = spawn_cache(bind_cache(&dir), 13, b"");

        let snap = SnapshotId::new("snap-a").unwrap();
        let err = client_in(&dir)
            .open_for_read(Some(&snap), "pages-1.img")
            .unwrap_err();
        assert!(matches!(err, TransportError::OpenFailed { code: 13, .. }));

        cache.join().unwrap();
    }

    #[test]
    fn test_open_for_read_peer_hangup_before_reply_is_desync() {
        let dir = TempDir::new().unwrap();
        let listener = bind_cache(&dir);

        let cache = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let _req: ImageOpenRequest = codec::read_message(&mut sock).unwrap().unwrap();
            // Hang up without replying.
        });

        let snap = SnapshotId::new("snap-a").unwrap();
        let err = client_in(&dir)
            .open_for_read(Some(&snap), "pages-1.img")
            .unwrap_err();
        assert!(matches!(err, TransportError::Desync { .. }));

        cache.join().unwrap();
    }

    #[test]
    fn test_open_for_read_no_service_is_socket_error() {
        let dir = TempDir::new().unwrap();
        let err = client_in(&dir).open_for_read(None, "pages-1.img").unwrap_err();
        assert!(matches!(err, TransportError::Socket { .. }));
    }

    #[test]
    fn test_open_for_write_roundtrip_through_pipe() {
        let dir = TempDir::new().unwrap();
        let listener = bind_proxy(&dir);

        let proxy = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let req: ImageOpenRequest = codec::read_message(&mut sock).unwrap().unwrap();
            assert_eq!(req.mode, OpenMode::WriteOnly);
            let fd = recv_fd(sock.as_fd()).unwrap();
            let mut out = Vec::new();
            File::from(fd).read_to_end(&mut out).unwrap();
            out
        });

        let snap = SnapshotId::new("snap-a").unwrap();
        let mut chan = client_in(&dir)
            .open_for_write(Some(&snap), "pages-1.img", OpenMode::WriteOnly)
            .unwrap();
        chan.write_all(b"dumped pages").unwrap();
        drop(chan);

        assert_eq!(proxy.join().unwrap(), b"dumped pages");
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let proxy_listener = bind_proxy(&dir);
        let cache_listener = bind_cache(&dir);

        // A fake proxy/cache pair sharing one in-memory store, keyed by
        // (snapshot id, name).
        let services = thread::spawn(move || {
            let mut store: std::collections::HashMap<(Option<String>, String), Vec<u8>> =
                std::collections::HashMap::new();

            let (mut sock, _) = proxy_listener.accept().unwrap();
            let req: ImageOpenRequest = codec::read_message(&mut sock).unwrap().unwrap();
            let fd = recv_fd(sock.as_fd()).unwrap();
            let mut payload = Vec::new();
            File::from(fd).read_to_end(&mut payload).unwrap();
            store.insert((req.snapshot_id, req.name), payload);

            let (mut sock, _) = cache_listener.accept().unwrap();
            let req: ImageOpenRequest = codec::read_message(&mut sock).unwrap().unwrap();
            match store.get(&(req.snapshot_id, req.name)) {
                Some(payload) => {
                    codec::write_message(&mut sock, &ImageOpenReply { error: REPLY_OK }).unwrap();
                    let fd = recv_fd(sock.as_fd()).unwrap();
                    File::from(fd).write_all(payload).unwrap();
                }
                None => {
                    codec::write_message(&mut sock, &ImageOpenReply { error: REPLY_NOT_FOUND })
                        .unwrap();
                }
            }
        });

        let client = client_in(&dir);
        let snap = SnapshotId::new("snap-a").unwrap();

        let mut chan = client
            .open_for_write(Some(&snap), "pages-1.img", OpenMode::WriteOnly)
            .unwrap();
        chan.write_all(b"round trip bytes").unwrap();
        drop(chan);

        let mut chan = client.open_for_read(Some(&snap), "pages-1.img").unwrap();
        let mut out = Vec::new();
        chan.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"round trip bytes");

        services.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "write-capable mode")]
    fn test_open_for_write_rejects_read_only() {
        let dir = TempDir::new().unwrap();
        let _ = client_in(&dir).open_for_write(None, "pages-1.img", OpenMode::ReadOnly);
    }

    #[test]
    fn test_finish_dump_handshake() {
        let dir = TempDir::new().unwrap();
        let listener = bind_proxy(&dir);

        let proxy = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let req: ImageOpenRequest = codec::read_message(&mut sock).unwrap().unwrap();
            assert_eq!(req.name, FINISH_IMAGE);
            assert!(req.snapshot_id.is_none());
            assert_eq!(req.mode, OpenMode::WriteOnly);
            // The client closes right away; observe EOF.
            let next: Option<ImageOpenRequest> = codec::read_message(&mut sock).unwrap();
            assert!(next.is_none());
        });

        client_in(&dir).finish_dump().unwrap();
        proxy.join().unwrap();
    }

    #[test]
    fn test_finish_restore_handshake() {
        let dir = TempDir::new().unwrap();
        let listener = bind_cache(&dir);

        let cache = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let req: ImageOpenRequest = codec::read_message(&mut sock).unwrap().unwrap();
            assert_eq!(req.name, FINISH_IMAGE);
            codec::write_message(&mut sock, &ImageOpenReply { error: REPLY_OK }).unwrap();
        });

        client_in(&dir).finish_restore().unwrap();
        cache.join().unwrap();
    }

    #[test]
    fn test_finish_restore_fails_without_service() {
        let dir = TempDir::new().unwrap();
        let err = client_in(&dir).finish_restore().unwrap_err();
        assert!(matches!(err, TransportError::Socket { .. }));
    }
}
