//! Outbound event fan-out.
//!
//! Every user id is an implicit broadcast room: an event emitted to a user
//! reaches each of that user's live connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{trace, warn};

use parley_shared::protocol::ServerEvent;
use parley_shared::UserId;

/// Identifies one socket of a user.
pub type ConnId = u64;

/// Events queued per connection before new ones are dropped.
pub const OUTBOUND_QUEUE: usize = 256;

/// Outbound events of one connection.
pub type EventStream = mpsc::Receiver<ServerEvent>;

type Senders = HashMap<UserId, HashMap<ConnId, mpsc::Sender<ServerEvent>>>;

/// Queue without waiting. A full queue means the client stopped reading;
/// the event is dropped for that connection only.
fn offer(tx: &mpsc::Sender<ServerEvent>, user: UserId, conn: ConnId, event: ServerEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            warn!(user = %user, conn, event = event.name(), "outbound queue full, dropping event");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[derive(Clone, Default)]
pub struct EventHub {
    senders: Arc<RwLock<Senders>>,
    next_conn: Arc<AtomicU64>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new connection for `user` and return its event stream.
    pub async fn register(&self, user: UserId) -> (ConnId, EventStream) {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        self.senders
            .write()
            .await
            .entry(user)
            .or_default()
            .insert(conn, tx);
        (conn, rx)
    }

    pub async fn unregister(&self, user: UserId, conn: ConnId) {
        let mut senders = self.senders.write().await;
        if let Some(conns) = senders.get_mut(&user) {
            conns.remove(&conn);
            if conns.is_empty() {
                senders.remove(&user);
            }
        }
    }

    /// Send `event` to every connection of `user`. Returns how many
    /// connections accepted it.
    pub async fn emit(&self, user: UserId, event: ServerEvent) -> usize {
        let senders = self.senders.read().await;
        let Some(conns) = senders.get(&user) else {
            trace!(user = %user, event = event.name(), "no live connection, event dropped");
            return 0;
        };
        conns
            .iter()
            .filter(|(conn, tx)| offer(tx, user, **conn, event.clone()))
            .count()
    }

    /// Send `event` to a single connection.
    pub async fn emit_to(&self, user: UserId, conn: ConnId, event: ServerEvent) -> bool {
        self.senders
            .read()
            .await
            .get(&user)
            .and_then(|conns| conns.get(&conn))
            .is_some_and(|tx| offer(tx, user, conn, event))
    }

    /// Send `event` to every connected user.
    pub async fn broadcast(&self, event: ServerEvent) {
        let senders = self.senders.read().await;
        for (user, conns) in senders.iter() {
            for (conn, tx) in conns {
                offer(tx, *user, *conn, event.clone());
            }
        }
    }
}
