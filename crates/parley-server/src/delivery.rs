//! Delivery and read state transitions.
//!
//! A message moves `(undelivered, unread) -> (delivered, unread) ->
//! (delivered, read)`. Every transition here is a watermark over a
//! conversation: all messages addressed to the recipient at or before a
//! timestamp move forward together, so replays and out-of-order
//! acknowledgements converge.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use parley_shared::protocol::{MessageDelivered, MessagesSeen, ServerEvent};
use parley_shared::{ConversationId, MessageId, UserId};
use parley_store::{conversations, messages, Conversation, Message};

use crate::db::Store;
use crate::error::{ServerError, MSG_CHAT_NOT_FOUND};
use crate::hub::EventHub;
use crate::presence::PresenceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Delivered,
    Read,
}

#[derive(Clone)]
pub struct DeliveryCoordinator {
    store: Store,
    presence: Arc<dyn PresenceRegistry>,
    hub: EventHub,
}

impl DeliveryCoordinator {
    pub fn new(store: Store, presence: Arc<dyn PresenceRegistry>, hub: EventHub) -> Self {
        Self {
            store,
            presence,
            hub,
        }
    }

    pub fn presence(&self) -> &Arc<dyn PresenceRegistry> {
        &self.presence
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    /// Load `chat` and check that `user` takes part in it.
    pub async fn authorize(
        &self,
        user: UserId,
        chat: ConversationId,
    ) -> Result<Conversation, ServerError> {
        let conversation = self
            .store
            .call(move |conn| Ok(conversations::find_by_id(conn, chat)?))
            .await?
            .ok_or_else(|| ServerError::NotFound(MSG_CHAT_NOT_FOUND.to_string()))?;

        if !conversation.has_participant(user) {
            return Err(ServerError::not_participant());
        }
        Ok(conversation)
    }

    /// Move the watermark for `recipient` up to `up_to` and tell the
    /// counterpart which message it reached. Returns the number of messages
    /// that changed state.
    async fn advance(
        &self,
        conversation: &Conversation,
        recipient: UserId,
        up_to: DateTime<Utc>,
        mark: Mark,
    ) -> Result<usize, ServerError> {
        let chat = conversation.id;
        let (changed, latest) = self
            .store
            .call(move |conn| {
                let changed = match mark {
                    Mark::Delivered => messages::mark_delivered_up_to(conn, chat, recipient, up_to)?,
                    Mark::Read => messages::mark_read_up_to(conn, chat, recipient, up_to)?,
                };
                let latest = if changed > 0 {
                    messages::latest_from_other(conn, chat, recipient, up_to)?
                } else {
                    None
                };
                Ok((changed, latest))
            })
            .await?;

        if let (Some(sender), Some(latest)) = (conversation.other(recipient), latest) {
            debug!(chat = %chat, user = %recipient, changed, ?mark, "watermark advanced");
            self.hub
                .emit(
                    sender,
                    ServerEvent::MessageDelivered(MessageDelivered {
                        chat_id: chat,
                        message_id: latest.id,
                        message_time: latest.created_at,
                    }),
                )
                .await;
        }
        Ok(changed)
    }

    async fn announce_seen(&self, conversation: &Conversation, reader: UserId) {
        if let Some(other) = conversation.other(reader) {
            self.hub
                .emit(
                    other,
                    ServerEvent::MessagesSeen(MessagesSeen {
                        chat_id: conversation.id,
                        seen_time: Utc::now(),
                    }),
                )
                .await;
        }
    }

    async fn mark_for(&self, user: UserId, chat: ConversationId) -> Mark {
        if self.presence.is_present_in_room(user, chat).await {
            Mark::Read
        } else {
            Mark::Delivered
        }
    }

    /// A user came online: deliver everything that waited for them.
    /// Returns the number of conversations touched.
    pub async fn on_connect(&self, user: UserId) -> Result<usize, ServerError> {
        let pending = self
            .store
            .call(move |conn| {
                let pending = messages::latest_undelivered_per_conversation(conn, user)?;
                let mut out = Vec::with_capacity(pending.len());
                for message in pending {
                    if let Some(chat) = message.conversation_id {
                        out.push((conversations::get(conn, chat)?, message));
                    }
                }
                Ok(out)
            })
            .await?;

        let touched = pending.len();
        for (conversation, newest) in pending {
            let mark = self.mark_for(user, conversation.id).await;
            let changed = self
                .advance(&conversation, user, newest.created_at, mark)
                .await?;
            if mark == Mark::Read && changed > 0 {
                self.announce_seen(&conversation, user).await;
            }
        }
        Ok(touched)
    }

    /// The client confirmed it received `message_id`.
    pub async fn on_delivery_ack(
        &self,
        user: UserId,
        message_id: MessageId,
    ) -> Result<(), ServerError> {
        let message = self
            .store
            .call(move |conn| Ok(messages::get(conn, message_id)?))
            .await?;
        let chat = message
            .conversation_id
            .ok_or_else(|| ServerError::NotFound(MSG_CHAT_NOT_FOUND.to_string()))?;
        let conversation = self.authorize(user, chat).await?;

        if message.sender_id.is_none() || message.sender_id == Some(user) {
            return Ok(());
        }

        let mark = self.mark_for(user, chat).await;
        let changed = self
            .advance(&conversation, user, message.created_at, mark)
            .await?;
        if mark == Mark::Read && changed > 0 {
            self.announce_seen(&conversation, user).await;
        }
        Ok(())
    }

    /// The user opened a conversation: everything in it is now read.
    pub async fn on_room_join(
        &self,
        user: UserId,
        chat: ConversationId,
    ) -> Result<(), ServerError> {
        let conversation = self.authorize(user, chat).await?;
        self.presence.join_room(user, chat).await;
        self.advance(&conversation, user, Utc::now(), Mark::Read)
            .await?;
        self.announce_seen(&conversation, user).await;
        Ok(())
    }

    pub async fn on_room_leave(
        &self,
        user: UserId,
        chat: ConversationId,
    ) -> Result<(), ServerError> {
        self.presence.leave_room(user, chat).await;
        Ok(())
    }

    /// The conversation was shown to `viewer` in a listing or fetch.
    /// Delivered only, unless the room is open.
    pub async fn on_shown(
        &self,
        conversation: &Conversation,
        viewer: UserId,
    ) -> Result<usize, ServerError> {
        let mark = self.mark_for(viewer, conversation.id).await;
        let changed = self
            .advance(conversation, viewer, Utc::now(), mark)
            .await?;
        if mark == Mark::Read && changed > 0 {
            self.announce_seen(conversation, viewer).await;
        }
        Ok(changed)
    }

    /// Freshly persisted messages reached the store. When `recipient` has
    /// the room open they go straight to read. Returns whether they did.
    pub async fn on_message_persisted(
        &self,
        conversation: &Conversation,
        batch: &[Message],
        recipient: UserId,
    ) -> Result<bool, ServerError> {
        let Some(last) = batch.iter().map(|m| m.created_at).max() else {
            return Ok(false);
        };
        if !self.presence.is_present_in_room(recipient, conversation.id).await {
            return Ok(false);
        }

        self.advance(conversation, recipient, last, Mark::Read)
            .await?;
        self.announce_seen(conversation, recipient).await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::InMemoryPresence;
    use chrono::Duration;
    use parley_shared::{MessageKind, ParticipantPair};
    use parley_store::{users, User};
    use crate::hub::EventStream;

    struct Fixture {
        store: Store,
        coordinator: DeliveryCoordinator,
        a: UserId,
        b: UserId,
        chat: Conversation,
    }

    async fn fixture() -> Fixture {
        let store = Store::in_memory().unwrap();
        let a = User::new("Ada", "A");
        let b = User::new("Bob", "B");
        let (a_id, b_id) = (a.id, b.id);
        let chat = store
            .call(move |conn| {
                users::insert(conn, &a)?;
                users::insert(conn, &b)?;
                let pair = ParticipantPair::new(a.id, b.id)?;
                Ok(conversations::find_or_create(conn, &pair, Utc::now())?.0)
            })
            .await
            .unwrap();
        let coordinator =
            DeliveryCoordinator::new(store.clone(), Arc::new(InMemoryPresence::new()), EventHub::new());
        Fixture {
            store,
            coordinator,
            a: a_id,
            b: b_id,
            chat,
        }
    }

    async fn send(f: &Fixture, from: UserId, offset_ms: i64) -> Message {
        let msg = Message::new(
            f.chat.id,
            from,
            "hi",
            MessageKind::Text,
            Utc::now() - Duration::seconds(10) + Duration::milliseconds(offset_ms),
        );
        let stored = msg.clone();
        f.store
            .call(move |conn| Ok(messages::insert(conn, &stored)?))
            .await
            .unwrap();
        msg
    }

    async fn reload(f: &Fixture, id: MessageId) -> Message {
        f.store.call(move |conn| Ok(messages::get(conn, id)?)).await.unwrap()
    }

    fn drain(rx: &mut EventStream) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn connect_delivers_pending_and_notifies_sender() {
        let f = fixture().await;
        let (_, mut a_rx) = f.coordinator.hub().register(f.a).await;
        send(&f, f.a, 0).await;
        let last = send(&f, f.a, 1).await;

        f.coordinator.presence().connect(f.b).await;
        assert_eq!(f.coordinator.on_connect(f.b).await.unwrap(), 1);

        let msg = reload(&f, last.id).await;
        assert!(msg.is_delivered && !msg.is_read);

        let events = drain(&mut a_rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::MessageDelivered(d) => {
                assert_eq!(d.message_id, last.id);
                assert_eq!(d.chat_id, f.chat.id);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(f.coordinator.on_connect(f.b).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ack_uses_message_timestamp_as_watermark() {
        let f = fixture().await;
        let first = send(&f, f.a, 0).await;
        let second = send(&f, f.a, 1).await;

        f.coordinator.on_delivery_ack(f.b, first.id).await.unwrap();
        assert!(reload(&f, first.id).await.is_delivered);
        assert!(!reload(&f, second.id).await.is_delivered);

        // Acknowledging one's own message changes nothing.
        f.coordinator.on_delivery_ack(f.a, second.id).await.unwrap();
        assert!(!reload(&f, second.id).await.is_delivered);
    }

    #[tokio::test]
    async fn join_marks_read_and_announces_seen() {
        let f = fixture().await;
        let (_, mut a_rx) = f.coordinator.hub().register(f.a).await;
        let msg = send(&f, f.a, 0).await;

        f.coordinator.presence().connect(f.b).await;
        f.coordinator.on_room_join(f.b, f.chat.id).await.unwrap();

        let msg = reload(&f, msg.id).await;
        assert!(msg.is_delivered && msg.is_read);
        assert!(f.coordinator.presence().is_present_in_room(f.b, f.chat.id).await);

        let events = drain(&mut a_rx);
        assert!(events.iter().any(|e| matches!(e, ServerEvent::MessagesSeen(_))));
    }

    #[tokio::test]
    async fn outsiders_are_rejected_without_mutation() {
        let f = fixture().await;
        let msg = send(&f, f.a, 0).await;
        let outsider = UserId::new();

        let err = f.coordinator.on_room_join(outsider, f.chat.id).await.unwrap_err();
        assert!(matches!(err, ServerError::Unauthorized(_)));
        assert!(!f.coordinator.presence().is_present_in_room(outsider, f.chat.id).await);

        let err = f.coordinator.on_delivery_ack(outsider, msg.id).await.unwrap_err();
        assert!(matches!(err, ServerError::Unauthorized(_)));
        assert!(!reload(&f, msg.id).await.is_delivered);

        let err = f
            .coordinator
            .on_room_join(f.b, ConversationId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[tokio::test]
    async fn shown_marks_delivered_unless_room_open() {
        let f = fixture().await;
        let first = send(&f, f.a, 0).await;

        f.coordinator.on_shown(&f.chat, f.b).await.unwrap();
        let first = reload(&f, first.id).await;
        assert!(first.is_delivered && !first.is_read);

        f.coordinator.presence().connect(f.b).await;
        f.coordinator.presence().join_room(f.b, f.chat.id).await;
        let second = send(&f, f.a, 1).await;
        f.coordinator.on_shown(&f.chat, f.b).await.unwrap();
        assert!(reload(&f, second.id).await.is_read);
    }
}
