//! Server-wide set of open connections

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::object_stream::ObjectStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub peer: String,
    pub opened_at: DateTime<Utc>,
}

struct Entry {
    info: ConnectionInfo,
    stream: Arc<ObjectStream>,
}

/// Removes its connection from the registry when dropped, so a session task
/// that panics does not leave a stale entry behind.
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: Uuid,
}

impl Registration {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<Uuid, Entry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, peer: String, stream: Arc<ObjectStream>) {
        let info = ConnectionInfo {
            id,
            peer,
            opened_at: Utc::now(),
        };
        self.entries.lock().insert(id, Entry { info, stream });
    }

    /// Register and hand back a guard that deregisters on drop
    pub fn enroll(
        self: &Arc<Self>,
        id: Uuid,
        peer: String,
        stream: Arc<ObjectStream>,
    ) -> Registration {
        self.register(id, peer, stream);
        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Returns whether `id` was registered
    pub fn deregister(&self, id: Uuid) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot, oldest first
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .entries
            .lock()
            .values()
            .map(|e| e.info.clone())
            .collect();
        infos.sort_by_key(|i| i.opened_at);
        infos
    }

    /// Close every registered stream. Sessions notice and deregister themselves.
    pub async fn close_all(&self) {
        let streams: Vec<Arc<ObjectStream>> = self
            .entries
            .lock()
            .values()
            .map(|e| Arc::clone(&e.stream))
            .collect();
        join_all(streams.iter().map(|s| s.close())).await;
    }
}
