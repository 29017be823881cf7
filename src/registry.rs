use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, RwLockReadGuard, mpsc};
use tokio_tungstenite::tungstenite::Message;

/// Outbound frame queue feeding a connection's writer task
pub type ClientSender = mpsc::Sender<Message>;

/// Identity of one live connection, never reused within a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered connection
#[derive(Debug)]
pub struct Member {
    pub nickname: String,
    pub sender: ClientSender,
}

/// Shared table of live connections and their nicknames
#[derive(Debug, Default, Clone)]
pub struct Registry {
    members: Arc<RwLock<HashMap<ConnectionId, Member>>>,
    next_id: Arc<AtomicU64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection under `nickname`. Duplicate nicknames are allowed.
    pub async fn register(&self, nickname: String, sender: ClientSender) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut members = self.members.write().await;
        members.insert(id, Member { nickname, sender });
        id
    }

    /// Remove a connection, returning its entry. Absent ids are a no-op.
    pub async fn deregister(&self, id: ConnectionId) -> Option<Member> {
        let mut members = self.members.write().await;
        members.remove(&id)
    }

    /// Point-in-time copy of every registered nickname
    pub async fn snapshot_nicknames(&self) -> Vec<String> {
        self.view().await.nicknames()
    }

    /// Visit every registered connection while holding the read lock.
    /// Iteration order is unspecified.
    pub async fn for_each_connection<F>(&self, f: F)
    where
        F: FnMut(ConnectionId, &ClientSender),
    {
        self.view().await.for_each_connection(f);
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }

    /// Hold the registry read lock so several reads observe the same state
    pub(crate) async fn view(&self) -> RegistryView<'_> {
        RegistryView {
            members: self.members.read().await,
        }
    }
}

/// Consistent read-only view over the registry
pub(crate) struct RegistryView<'a> {
    members: RwLockReadGuard<'a, HashMap<ConnectionId, Member>>,
}

impl RegistryView<'_> {
    pub(crate) fn nicknames(&self) -> Vec<String> {
        self.members.values().map(|m| m.nickname.clone()).collect()
    }

    pub(crate) fn for_each_connection<F>(&self, mut f: F)
    where
        F: FnMut(ConnectionId, &ClientSender),
    {
        for (id, member) in self.members.iter() {
            f(*id, &member.sender);
        }
    }
}
