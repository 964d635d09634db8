//! Set of live sessions, keyed by a per-connection id

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::framing::Outbox;

/// Enough of a session to deliver a message to it
#[derive(Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub outbox: Outbox,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Outbox>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a session. It stays registered until the returned guard drops,
    /// which also covers handlers that unwind or get cancelled.
    pub fn register(self: &Arc<Self>, outbox: Outbox) -> Registration {
        let id = Uuid::new_v4();
        self.sessions.lock().insert(id, outbox);
        Registration {
            id,
            registry: Arc::clone(self),
        }
    }

    pub fn deregister(&self, id: Uuid) -> bool {
        self.sessions.lock().remove(&id).is_some()
    }

    /// Copy of the current membership; the lock is not held while sending.
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions
            .lock()
            .iter()
            .map(|(id, outbox)| SessionHandle {
                id: *id,
                outbox: outbox.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Registration {
    id: Uuid,
    registry: Arc<SessionRegistry>,
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
