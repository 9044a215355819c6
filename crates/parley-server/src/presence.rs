//! Live presence: who is connected and which conversations they have open.
//!
//! Presence is process-lifetime state. It starts empty on boot and nothing
//! durable depends on it; delivered/read truth lives in the store.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use parley_shared::{ConversationId, UserId};

/// Registry of connected users and their open rooms.
///
/// Implementations must apply each call atomically per user so that rapid
/// join/leave/disconnect sequences cannot interleave inconsistently. A
/// shared external store can stand in for [`InMemoryPresence`] behind this
/// trait when several processes serve the same users.
#[async_trait]
pub trait PresenceRegistry: Send + Sync {
    /// Register one more connection for `user`. Returns `true` when this is
    /// the user's first live connection.
    async fn connect(&self, user: UserId) -> bool;

    /// Drop one connection. Returns `true` when it was the user's last, in
    /// which case the user and all their rooms are forgotten.
    async fn disconnect(&self, user: UserId) -> bool;

    async fn join_room(&self, user: UserId, room: ConversationId);

    async fn leave_room(&self, user: UserId, room: ConversationId);

    async fn is_present_in_room(&self, user: UserId, room: ConversationId) -> bool;

    async fn is_connected(&self, user: UserId) -> bool;

    async fn connected_user_ids(&self) -> HashSet<UserId>;
}

#[derive(Debug, Default)]
struct PresenceEntry {
    connections: usize,
    rooms: HashSet<ConversationId>,
}

/// Single-process presence map guarded by one async mutex.
#[derive(Debug, Default)]
pub struct InMemoryPresence {
    entries: Mutex<HashMap<UserId, PresenceEntry>>,
}

impl InMemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceRegistry for InMemoryPresence {
    async fn connect(&self, user: UserId) -> bool {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(user).or_default();
        entry.connections += 1;
        debug!(user = %user, connections = entry.connections, "presence connect");
        entry.connections == 1
    }

    async fn disconnect(&self, user: UserId) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&user) else {
            warn!(user = %user, "disconnect for user with no presence entry");
            return false;
        };

        entry.connections = entry.connections.saturating_sub(1);
        if entry.connections > 0 {
            return false;
        }
        entries.remove(&user);
        debug!(user = %user, "presence entry removed");
        true
    }

    async fn join_room(&self, user: UserId, room: ConversationId) {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&user) {
            Some(entry) => {
                entry.rooms.insert(room);
            }
            None => warn!(user = %user, chat = %room, "join-chat from a disconnected user ignored"),
        }
    }

    async fn leave_room(&self, user: UserId, room: ConversationId) {
        let mut entries = self.entries.lock().await;
        let removed = entries
            .get_mut(&user)
            .map(|entry| entry.rooms.remove(&room))
            .unwrap_or(false);
        if !removed {
            warn!(user = %user, chat = %room, "leave-chat for a room that was not open");
        }
    }

    async fn is_present_in_room(&self, user: UserId, room: ConversationId) -> bool {
        self.entries
            .lock()
            .await
            .get(&user)
            .is_some_and(|entry| entry.rooms.contains(&room))
    }

    async fn is_connected(&self, user: UserId) -> bool {
        self.entries.lock().await.contains_key(&user)
    }

    async fn connected_user_ids(&self) -> HashSet<UserId> {
        self.entries.lock().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rooms_follow_join_and_leave() {
        let presence = InMemoryPresence::new();
        let user = UserId::new();
        let room = ConversationId::new();

        assert!(presence.connect(user).await);
        presence.join_room(user, room).await;
        assert!(presence.is_present_in_room(user, room).await);

        presence.leave_room(user, room).await;
        assert!(!presence.is_present_in_room(user, room).await);
        assert!(presence.is_connected(user).await);
    }

    #[tokio::test]
    async fn last_disconnect_clears_rooms() {
        let presence = InMemoryPresence::new();
        let user = UserId::new();
        let room = ConversationId::new();

        assert!(presence.connect(user).await);
        assert!(!presence.connect(user).await);
        presence.join_room(user, room).await;

        assert!(!presence.disconnect(user).await);
        assert!(presence.is_present_in_room(user, room).await);

        assert!(presence.disconnect(user).await);
        assert!(!presence.is_connected(user).await);
        assert!(!presence.is_present_in_room(user, room).await);
        assert!(presence.connected_user_ids().await.is_empty());
    }

    #[tokio::test]
    async fn anomalies_are_noops() {
        let presence = InMemoryPresence::new();
        let user = UserId::new();
        let room = ConversationId::new();

        presence.join_room(user, room).await;
        assert!(!presence.is_present_in_room(user, room).await);
        presence.leave_room(user, room).await;
        assert!(!presence.disconnect(user).await);
        assert!(!presence.is_connected(user).await);
    }

    #[tokio::test]
    async fn connected_ids_lists_everyone() {
        let presence = InMemoryPresence::new();
        let a = UserId::new();
        let b = UserId::new();
        presence.connect(a).await;
        presence.connect(b).await;

        let ids = presence.connected_user_ids().await;
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a) && ids.contains(&b));
    }
}
