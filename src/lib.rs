// src/lib.rs

//! Image Transport - Checkpoint Image Transport Core
//!
//! This crate is the client-side transport that lets a checkpoint/restore
//! engine read and write its image files through external storage services
//! instead of a local filesystem:
//!
//! - a remote **proxy** accepts image writes and a remote **cache** serves
//!   image reads, each open negotiated over a short-lived control socket and
//!   upgraded to a splice-capable pipe;
//! - a same-host **streamer** offers the same capability over one persistent
//!   control connection shared by all callers;
//! - a lazily-loaded **snapshot hierarchy** orders checkpoint generations so
//!   incremental (parent/child) chains can be resolved by index.
//!
//! Every operation is a plain blocking call; no timeouts are imposed here, a
//! hung peer hangs the caller until the surrounding process applies its own
//! deadline.

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod handoff;
pub mod pipe;
pub mod remote;
pub mod snapshot;
pub mod streamer;
pub mod sync;

// Re-export commonly used types for convenience
pub use channel::{skip_bytes, ImageChannel};
pub use config::{RemoteConfig, StreamerConfig, TransportConfig};
pub use error::{Result, TransportError};
pub use remote::{OpenMode, RemoteImageClient, FINISH_IMAGE};
pub use snapshot::{SnapshotHierarchy, SnapshotId, CURRENT_INDEX, PARENT_IMAGE};
pub use streamer::{ImageStreamer, StreamerMode};
