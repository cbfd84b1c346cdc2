//! The set of admitted connections.
//!
//! Admission hands the registry the write half of a connection; the read half
//! stays with that connection's handler. The registry is therefore the only
//! writer to an admitted peer, and every add, remove and fan-out goes through
//! one async mutex so nobody ever observes (or writes into) a half-updated
//! set.
//!
//! The dispatcher keeps that mutex for the whole fan-out. Broadcasts from
//! different senders are serialized, and a slow peer holds up admissions and
//! removals for at most one write timeout per broadcast.

use std::{
    collections::BTreeMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, warn};

use crate::error::RegistryError;

/// Identity of an admitted connection, rendered as its decimal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out process-unique ids, starting at 1. Ids are never reused.
#[derive(Debug)]
pub struct ConnectionIds {
    next: AtomicU64,
}

impl Default for ConnectionIds {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Registry contents, only reachable through the lock.
pub(crate) struct Members<W> {
    pub(crate) entries: BTreeMap<ConnectionId, W>,
    closed: bool,
}

pub struct Registry<W> {
    capacity: usize,
    members: Mutex<Members<W>>,
}

impl<W> Registry<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            members: Mutex::new(Members {
                entries: BTreeMap::new(),
                closed: false,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admits `id`, taking ownership of its write half.
    ///
    /// On rejection the set is left untouched and `writer` is dropped, which
    /// closes that side of the stream.
    pub async fn add(&self, id: ConnectionId, writer: W) -> Result<(), RegistryError> {
        let mut members = self.members.lock().await;

        if members.closed {
            return Err(RegistryError::Closed);
        }
        if members.entries.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        if members.entries.len() >= self.capacity {
            warn!(%id, capacity = self.capacity, "registry full, rejecting connection");
            return Err(RegistryError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        members.entries.insert(id, writer);
        debug!(%id, members = members.entries.len(), "connection registered");
        Ok(())
    }

    /// Removes `id` and shuts down its write half.
    ///
    /// Returns `false` if `id` was not registered. Disconnect notifications
    /// can race with shutdown, so an absent id is not an error.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.members.lock().await.entries.remove(&id);

        match removed {
            Some(mut writer) => {
                if let Err(err) = writer.shutdown().await {
                    debug!(%id, error = ?err, "failed to shut down writer on removal");
                }
                debug!(%id, "connection removed");
                true
            }
            None => {
                debug!(%id, "remove requested for unregistered connection");
                false
            }
        }
    }

    /// Ids currently admitted, ascending.
    pub async fn snapshot(&self) -> Vec<ConnectionId> {
        self.members.lock().await.entries.keys().copied().collect()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.members.lock().await.entries.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drains every member and shuts down its write half, so each peer reads
    /// end-of-stream. Later admissions fail with [`RegistryError::Closed`].
    ///
    /// Returns how many connections were closed. Calling it again returns 0.
    pub async fn close_all(&self) -> usize {
        let drained = {
            let mut members = self.members.lock().await;
            members.closed = true;
            std::mem::take(&mut members.entries)
        };

        let closed = drained.len();
        for (id, mut writer) in drained {
            if let Err(err) = writer.shutdown().await {
                debug!(%id, error = ?err, "failed to shut down writer during close");
            }
        }
        closed
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Members<W>> {
        self.members.lock().await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    use super::*;

    fn peer() -> (DuplexStream, DuplexStream) {
        duplex(256)
    }

    #[tokio::test]
    async fn ids_are_unique_and_increasing() {
        let ids = ConnectionIds::new();
        let first = ids.next_id();
        let second = ids.next_id();

        assert_eq!(first.get(), 1);
        assert!(second > first);
        assert_eq!(second.to_string(), "2");
    }

    #[tokio::test]
    async fn add_and_remove_track_membership() {
        let registry = Registry::new(4);
        let (writer, _reader) = peer();

        registry
            .add(ConnectionId::new(7), writer)
            .await
            .expect("admit");
        assert!(registry.contains(ConnectionId::new(7)).await);
        assert_eq!(registry.len().await, 1);

        assert!(registry.remove(ConnectionId::new(7)).await);
        assert!(!registry.contains(ConnectionId::new(7)).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_identity_is_rejected() {
        let registry = Registry::new(4);
        let (first, _first_reader) = peer();
        let (second, _second_reader) = peer();
        let id = ConnectionId::new(1);

        registry.add(id, first).await.expect("first admission");
        let result = registry.add(id, second).await;

        assert_eq!(result, Err(RegistryError::AlreadyRegistered(id)));
        assert_eq!(registry.snapshot().await, vec![id]);
    }

    #[tokio::test]
    async fn removing_absent_identity_is_a_no_op() {
        let registry = Registry::new(2);
        let (writer, _reader) = peer();
        registry
            .add(ConnectionId::new(1), writer)
            .await
            .expect("admit");

        assert!(!registry.remove(ConnectionId::new(9)).await);
        assert!(registry.remove(ConnectionId::new(1)).await);
        assert!(!registry.remove(ConnectionId::new(1)).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn removed_identity_does_not_come_back() {
        let registry = Registry::new(8);
        let mut readers = Vec::new();
        for raw in 1..=5 {
            let (writer, reader) = peer();
            readers.push(reader);
            registry
                .add(ConnectionId::new(raw), writer)
                .await
                .expect("admit");
        }

        registry.remove(ConnectionId::new(2)).await;
        registry.remove(ConnectionId::new(4)).await;
        registry.remove(ConnectionId::new(2)).await;

        let ids: Vec<u64> = registry
            .snapshot()
            .await
            .into_iter()
            .map(ConnectionId::get)
            .collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn capacity_overflow_leaves_set_unchanged() {
        let registry = Registry::new(2);
        let mut readers = Vec::new();
        for raw in 1..=2 {
            let (writer, reader) = peer();
            readers.push(reader);
            registry
                .add(ConnectionId::new(raw), writer)
                .await
                .expect("admit");
        }

        let before = registry.snapshot().await;
        let (overflow, mut overflow_reader) = peer();
        let result = registry.add(ConnectionId::new(3), overflow).await;

        assert_eq!(result, Err(RegistryError::CapacityExceeded { capacity: 2 }));
        assert_eq!(registry.snapshot().await, before);

        // the rejected writer was dropped, so its peer sees end-of-stream
        let mut buf = [0u8; 8];
        let read = overflow_reader.read(&mut buf).await.expect("read");
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn remove_closes_the_peer_stream() {
        let registry = Registry::new(2);
        let (writer, mut reader) = peer();
        registry
            .add(ConnectionId::new(1), writer)
            .await
            .expect("admit");

        registry.remove(ConnectionId::new(1)).await;

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.expect("read"), 0);
    }

    #[tokio::test]
    async fn close_all_drains_and_refuses_new_members() {
        let registry = Registry::new(4);
        let mut readers = Vec::new();
        for raw in 1..=3 {
            let (writer, reader) = peer();
            readers.push(reader);
            registry
                .add(ConnectionId::new(raw), writer)
                .await
                .expect("admit");
        }

        assert_eq!(registry.close_all().await, 3);
        assert_eq!(registry.close_all().await, 0);
        assert!(registry.is_empty().await);

        for reader in &mut readers {
            let mut buf = [0u8; 8];
            assert_eq!(reader.read(&mut buf).await.expect("read"), 0);
        }

        let (late, _late_reader) = peer();
        let result = registry.add(ConnectionId::new(4), late).await;
        assert_eq!(result, Err(RegistryError::Closed));
    }

    #[tokio::test]
    async fn zero_capacity_is_raised_to_one() {
        let registry: Registry<DuplexStream> = Registry::new(0);
        assert_eq!(registry.capacity(), 1);
    }

    #[tokio::test]
    async fn concurrent_admissions_never_duplicate() {
        let registry = std::sync::Arc::new(Registry::new(64));
        let ids = std::sync::Arc::new(ConnectionIds::new());
        let mut tasks = tokio::task::JoinSet::new();

        for _ in 0..32 {
            let registry = std::sync::Arc::clone(&registry);
            let ids = std::sync::Arc::clone(&ids);
            tasks.spawn(async move {
                let (writer, reader) = duplex(64);
                registry.add(ids.next_id(), writer).await.map(|_| reader)
            });
        }

        let mut readers = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            readers.push(joined.expect("task").expect("admit"));
        }

        let snapshot = registry.snapshot().await;
        let mut deduped = snapshot.clone();
        deduped.dedup();
        assert_eq!(snapshot.len(), 32);
        assert_eq!(deduped, snapshot);
    }
}
