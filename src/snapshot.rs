// src/snapshot.rs

//! Snapshot-id hierarchy for incremental dump/restore chains.
//!
//! Every image is tagged with the snapshot id of the dump or pre-dump that
//! produced it. The cache service keeps the ids ordered oldest-to-newest, so
//! an index into the sequence is a position in the parent chain: images at
//! index 1 are more recent than images at index 0. The hierarchy is pulled
//! from the cache lazily, at most once, and is immutable afterwards.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::codec::{self, SnapshotIdEntry};
use crate::error::{Result, TransportError};
use crate::remote::{OpenMode, RemoteImageClient};

/// Reserved target name for pulling and pushing the snapshot-id sequence.
pub const PARENT_IMAGE: &str = "parent";

/// Index sentinel standing for "the current snapshot"; translated to
/// [`SnapshotHierarchy::current_index`] by [`SnapshotHierarchy::id_at`].
pub const CURRENT_INDEX: usize = usize::MAX;

/// Identifier of one checkpoint/pre-dump generation.
///
/// Opaque, non-empty, bounded-length; equality is exact string match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Maximum length of a snapshot id in bytes.
    pub const MAX_LEN: usize = 4096;

    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(TransportError::invalid_snapshot_id("empty id"));
        }
        if id.len() > Self::MAX_LEN {
            return Err(TransportError::invalid_snapshot_id(format!(
                "id of {} bytes exceeds the {} byte limit",
                id.len(),
                Self::MAX_LEN
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered registry of ancestor snapshot ids, queried by index.
///
/// The current snapshot id is fixed at construction, which makes the
/// "set before query" requirement unrepresentable rather than a runtime
/// assertion. Entries are loaded from the cache on first query; a failed
/// load is discarded wholesale and retried on the next query.
pub struct SnapshotHierarchy {
    client: RemoteImageClient,
    current: SnapshotId,
    entries: Mutex<Option<Vec<SnapshotId>>>,
}

impl SnapshotHierarchy {
    pub fn new(client: RemoteImageClient, current: SnapshotId) -> Self {
        Self {
            client,
            current,
            entries: Mutex::new(None),
        }
    }

    /// The current snapshot id this hierarchy resolves against.
    pub fn current(&self) -> &SnapshotId {
        &self.current
    }

    /// Position of the current snapshot id, 0-based, oldest first.
    pub fn current_index(&self) -> Result<usize> {
        self.with_entries(|entries| {
            entries
                .iter()
                .position(|id| id == &self.current)
                .ok_or_else(|| TransportError::snapshot_not_found(self.current.as_str()))
        })
    }

    /// Index of the current snapshot's parent, `None` when the current
    /// snapshot is the root of the chain.
    pub fn parent_index(&self) -> Result<Option<usize>> {
        Ok(self.current_index()?.checked_sub(1))
    }

    /// Snapshot id at `index`; [`CURRENT_INDEX`] resolves to the current
    /// snapshot's position first.
    pub fn id_at(&self, index: usize) -> Result<SnapshotId> {
        let index = if index == CURRENT_INDEX {
            self.current_index()?
        } else {
            index
        };

        self.with_entries(|entries| {
            entries
                .get(index)
                .cloned()
                .ok_or_else(|| TransportError::index_out_of_range(index, entries.len()))
        })
    }

    /// Registers the current snapshot id as the new leaf of the hierarchy,
    /// as observed by future readers.
    pub fn push_current(&self) -> Result<()> {
        let mut channel = self
            .client
            .open_for_write(None, PARENT_IMAGE, OpenMode::Append)?;
        codec::write_message(
            &mut channel,
            &SnapshotIdEntry {
                snapshot_id: self.current.as_str().to_string(),
            },
        )?;
        Ok(())
    }

    fn with_entries<T>(&self, f: impl FnOnce(&[SnapshotId]) -> Result<T>) -> Result<T> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| TransportError::lock("snapshot hierarchy lock poisoned"))?;

        if guard.is_none() {
            *guard = Some(self.load()?);
        }

        match guard.as_deref() {
            Some(entries) => f(entries),
            None => unreachable!("hierarchy populated above"),
        }
    }

    /// Pulls the full id sequence from the cache, in arrival order.
    fn load(&self) -> Result<Vec<SnapshotId>> {
        let mut channel = self.client.open_for_read(None, PARENT_IMAGE)?;
        let mut entries = Vec::new();

        while let Some(entry) = codec::read_message::<SnapshotIdEntry, _>(&mut channel)? {
            tracing::debug!("hierarchy entry {}: {}", entries.len(), entry.snapshot_id);
            entries.push(SnapshotId::new(entry.snapshot_id)?);
        }
        Ok(entries)
    }
}
