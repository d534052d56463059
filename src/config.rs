// src/config.rs

//! Rendezvous configuration for the transport services.
//!
//! The proxy and cache services listen on fixed well-known socket names; the
//! streamer uses one of two mode-specific names under a caller-supplied image
//! directory. All paths can be overridden by deserializing over the defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::streamer::StreamerMode;

/// Default rendezvous name of the image cache (read-side) service.
pub const DEFAULT_CACHE_SOCKET: &str = "img-cache.sock";

/// Default rendezvous name of the image proxy (write-side) service.
pub const DEFAULT_PROXY_SOCKET: &str = "img-proxy.sock";

/// Streamer socket name used in capture (dump) mode.
pub const STREAMER_CAPTURE_SOCKET: &str = "streamer-capture.sock";

/// Streamer socket name used in serve (restore) mode.
pub const STREAMER_SERVE_SOCKET: &str = "streamer-serve.sock";

// Top-level transport configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub remote: RemoteConfig,
    pub streamer: StreamerConfig,
}

/// Rendezvous paths of the remote proxy/cache services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    // Socket path of the cache service (read path).
    pub cache_socket: PathBuf,
    // Socket path of the proxy service (write path).
    pub proxy_socket: PathBuf,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            cache_socket: PathBuf::from(DEFAULT_CACHE_SOCKET),
            proxy_socket: PathBuf::from(DEFAULT_PROXY_SOCKET),
        }
    }
}

impl RemoteConfig {
    /// Resolves the default socket names under `dir`.
    pub fn under_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            cache_socket: dir.join(DEFAULT_CACHE_SOCKET),
            proxy_socket: dir.join(DEFAULT_PROXY_SOCKET),
        }
    }
}

/// Rendezvous configuration of the image streamer.
///
/// Capture and serve use different socket names so that a mixed-up pairing
/// (streamer capturing while the engine restores, or vice versa) fails at
/// connect time instead of mid-protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Directory under which the streamer sockets live (the image directory).
    pub base_dir: PathBuf,
    pub capture_socket_name: String,
    pub serve_socket_name: String,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            capture_socket_name: STREAMER_CAPTURE_SOCKET.to_string(),
            serve_socket_name: STREAMER_SERVE_SOCKET.to_string(),
        }
    }
}

impl StreamerConfig {
    /// Resolves the defaults under `base_dir`.
    pub fn under_dir(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Full socket path for the given session mode.
    pub fn socket_path(&self, mode: StreamerMode) -> PathBuf {
        let name = match mode {
            StreamerMode::Capture => &self.capture_socket_name,
            StreamerMode::Serve => &self.serve_socket_name,
        };
        self.base_dir.join(name)
    }
}
