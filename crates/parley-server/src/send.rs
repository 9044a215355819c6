//! Send pipeline: text and media messages.
//!
//! A send resolves (or creates) the conversation, checks the block
//! relation, decides per participant whether this is the first message they
//! can see, and persists the batch, all in one transaction. Fan-out and the
//! push notification happen only after commit.
//!
//! Media goes through a [`MediaSaga`]: files are staged in external storage
//! first, and if anything later fails the staged objects are deleted again.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use parley_shared::constants::MAX_TEXT_LENGTH;
use parley_shared::protocol::{SendTarget, ServerEvent};
use parley_shared::{MessageKind, ParticipantPair, UserId};
use parley_store::{blocks, conversations, messages, users, Conversation, Message, User};

use crate::config::MediaLimits;
use crate::db::Store;
use crate::delivery::DeliveryCoordinator;
use crate::error::{ServerError, MSG_CHAT_NOT_FOUND};
use crate::media::{MediaStorage, StoredMedia};
use crate::push::{self, PushNotification, PushNotifier};
use crate::view::load_summary;

pub const MSG_MEDIA_REQUIRED: &str = "Media file is required";
pub const MSG_CHAT_BLOCKED: &str = "You can't send messages in a blocked chat";
pub const MSG_TARGET_REQUIRED: &str = "Please provide either chat id or receiver id";

/// One uploaded file, before staging.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Upload {
    pub fn kind(&self) -> MessageKind {
        MessageKind::from_mime(&self.content_type)
    }
}

/// What a successful send produced.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    pub created: bool,
}

/// Result of the transactional step.
struct Committed {
    conversation: Conversation,
    created: bool,
    messages: Vec<Message>,
    /// Participants for whom this batch is the first visible message.
    first_visible: Vec<UserId>,
    sender: User,
    recipient: User,
}

// ---------------------------------------------------------------------------
// Media saga
// ---------------------------------------------------------------------------

/// A staged upload awaiting commit.
#[derive(Debug, Clone)]
pub struct StagedMedia {
    pub kind: MessageKind,
    pub stored: StoredMedia,
}

/// Uploads staged in external storage for one send attempt.
///
/// Exactly one of [`MediaSaga::complete`] or [`MediaSaga::compensate`] ends
/// the saga.
pub struct MediaSaga {
    storage: Arc<dyn MediaStorage>,
    staged: Vec<StagedMedia>,
}

impl MediaSaga {
    pub fn new(storage: Arc<dyn MediaStorage>) -> Self {
        Self {
            storage,
            staged: Vec::new(),
        }
    }

    /// Upload one file. On failure nothing new is staged.
    pub async fn stage(&mut self, upload: &Upload) -> Result<(), ServerError> {
        let kind = upload.kind();
        let stored = self
            .storage
            .put(kind, &upload.data, &upload.content_type)
            .await?;
        debug!(key = %stored.key, kind = %kind, file = %upload.file_name, "media staged");
        self.staged.push(StagedMedia { kind, stored });
        Ok(())
    }

    pub fn staged(&self) -> &[StagedMedia] {
        &self.staged
    }

    /// The durable write succeeded: keep the uploads.
    pub fn complete(mut self) -> Vec<StagedMedia> {
        std::mem::take(&mut self.staged)
    }

    /// Delete everything staged. Best effort: failures are logged and the
    /// remaining objects are still attempted. Returns how many were removed.
    pub async fn compensate(mut self) -> usize {
        let staged = std::mem::take(&mut self.staged);
        let mut removed = 0;
        for media in &staged {
            match self.storage.delete(&media.stored.key).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(key = %media.stored.key, error = %e, "media compensation failed"),
            }
        }
        info!(removed, staged = staged.len(), "media send rolled back");
        removed
    }
}

impl Drop for MediaSaga {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            warn!(
                staged = self.staged.len(),
                "media saga dropped without complete or compensate"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SendPipeline {
    store: Store,
    coordinator: DeliveryCoordinator,
    storage: Arc<dyn MediaStorage>,
    notifier: Arc<dyn PushNotifier>,
    limits: MediaLimits,
    max_media: usize,
    recent: u32,
}

impl SendPipeline {
    pub fn new(
        store: Store,
        coordinator: DeliveryCoordinator,
        storage: Arc<dyn MediaStorage>,
        notifier: Arc<dyn PushNotifier>,
        limits: MediaLimits,
        max_media: usize,
        recent: u32,
    ) -> Self {
        Self {
            store,
            coordinator,
            storage,
            notifier,
            limits,
            max_media,
            recent,
        }
    }

    /// Send one text message.
    pub async fn send_text(
        &self,
        sender: UserId,
        target: SendTarget,
        content: &str,
        kind: MessageKind,
    ) -> Result<SendOutcome, ServerError> {
        if kind == MessageKind::Label {
            return Err(ServerError::invalid_input());
        }
        let content = content.trim();
        if content.is_empty() || content.chars().count() > MAX_TEXT_LENGTH {
            return Err(ServerError::invalid_input());
        }

        self.commit_and_fan_out(sender, target, vec![(kind, content.to_string())])
            .await
    }

    /// Send a batch of media files as one message group.
    pub async fn send_media(
        &self,
        sender: UserId,
        target: SendTarget,
        uploads: Vec<Upload>,
    ) -> Result<SendOutcome, ServerError> {
        if uploads.is_empty() {
            return Err(ServerError::Validation(MSG_MEDIA_REQUIRED.to_string()));
        }
        if uploads.len() > self.max_media {
            return Err(ServerError::Validation(format!(
                "At most {} media files per message",
                self.max_media
            )));
        }
        for upload in &uploads {
            let max = self.limits.for_kind(upload.kind());
            if upload.data.len() > max {
                return Err(ServerError::MediaTooLarge {
                    size: upload.data.len(),
                    max,
                });
            }
        }

        let mut saga = MediaSaga::new(self.storage.clone());
        for upload in &uploads {
            if let Err(e) = saga.stage(upload).await {
                saga.compensate().await;
                return Err(e);
            }
        }

        let items = saga
            .staged()
            .iter()
            .map(|m| (m.kind, m.stored.url.clone()))
            .collect();
        match self.commit(sender, target, items).await {
            Ok(committed) => {
                saga.complete();
                Ok(self.fan_out(committed).await)
            }
            Err(e) => {
                saga.compensate().await;
                Err(e)
            }
        }
    }

    async fn commit_and_fan_out(
        &self,
        sender: UserId,
        target: SendTarget,
        items: Vec<(MessageKind, String)>,
    ) -> Result<SendOutcome, ServerError> {
        let committed = self.commit(sender, target, items).await?;
        Ok(self.fan_out(committed).await)
    }

    /// Resolve, authorize and persist in one transaction.
    async fn commit(
        &self,
        sender: UserId,
        target: SendTarget,
        items: Vec<(MessageKind, String)>,
    ) -> Result<Committed, ServerError> {
        let now = Utc::now();
        self.store
            .transaction(move |tx| {
                let (conversation, created) = match target {
                    SendTarget::Conversation(chat) => {
                        let conversation = conversations::find_by_id(tx, chat)?
                            .ok_or_else(|| ServerError::NotFound(MSG_CHAT_NOT_FOUND.to_string()))?;
                        if !conversation.has_participant(sender) {
                            return Err(ServerError::not_participant());
                        }
                        (conversation, false)
                    }
                    SendTarget::User(other) => {
                        users::get(tx, other)?;
                        let pair = ParticipantPair::new(sender, other)?;
                        conversations::find_or_create(tx, &pair, now)?
                    }
                };

                let other = conversation
                    .other(sender)
                    .ok_or_else(ServerError::not_participant)?;
                if blocks::status(tx, sender, other)?.blocked() {
                    return Err(ServerError::Forbidden(MSG_CHAT_BLOCKED.to_string()));
                }

                let mut first_visible = Vec::new();
                for participant in conversation.participants.as_array() {
                    let first = created
                        || match conversation.visible_after(participant) {
                            Some(epoch) => {
                                messages::count_after(tx, conversation.id, Some(epoch))? == 0
                            }
                            None => false,
                        };
                    if first {
                        first_visible.push(participant);
                    }
                }

                let batch = items
                    .into_iter()
                    .enumerate()
                    .map(|(i, (kind, content))| {
                        let at = batch_time(now, i);
                        Message::new(conversation.id, sender, content, kind, at)
                    })
                    .collect::<Vec<_>>();
                for message in &batch {
                    messages::insert(tx, message)?;
                }

                Ok(Committed {
                    sender: users::get(tx, sender)?,
                    recipient: users::get(tx, other)?,
                    conversation,
                    created,
                    messages: batch,
                    first_visible,
                })
            })
            .await
    }

    /// Post-commit effects. Failures here are logged, never surfaced: the
    /// messages are already durable.
    async fn fan_out(&self, committed: Committed) -> SendOutcome {
        let Committed {
            conversation,
            created,
            mut messages,
            first_visible,
            sender,
            recipient,
        } = committed;
        let hub = self.coordinator.hub();

        let read = match self
            .coordinator
            .on_message_persisted(&conversation, &messages, recipient.id)
            .await
        {
            Ok(read) => read,
            Err(e) => {
                warn!(chat = %conversation.id, error = %e, "read watermark after send failed");
                false
            }
        };
        if read {
            for message in &mut messages {
                message.is_delivered = true;
                message.is_read = true;
            }
        }

        for participant in [sender.id, recipient.id] {
            if first_visible.contains(&participant) {
                let conv = conversation.clone();
                let recent = self.recent;
                match self
                    .store
                    .call(move |conn| load_summary(conn, conv, participant, recent))
                    .await
                {
                    Ok(summary) => {
                        hub.emit(participant, ServerEvent::NewChat(summary)).await;
                    }
                    Err(e) => {
                        warn!(chat = %conversation.id, user = %participant, error = %e, "new-chat summary failed");
                    }
                }
            } else {
                for message in &messages {
                    hub.emit(participant, ServerEvent::Message(message.view_for(participant)))
                        .await;
                }
            }
        }

        if !read {
            if let Some(notification) =
                PushNotification::for_messages(&sender, &recipient, conversation.id, &messages)
            {
                push::dispatch(self.notifier.clone(), notification);
            }
        }

        debug!(
            chat = %conversation.id,
            count = messages.len(),
            created,
            read,
            "messages sent"
        );
        SendOutcome {
            conversation,
            messages,
            created,
        }
    }
}

/// Creation time of the `index`-th message of a batch. Strictly increasing
/// so creation time stays the sole ordering key.
fn batch_time(base: DateTime<Utc>, index: usize) -> DateTime<Utc> {
    base + Duration::microseconds(i64::try_from(index).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::EventHub;
    use crate::media::FsMediaStorage;
    use crate::presence::{InMemoryPresence, PresenceRegistry};
    use crate::push::testing::RecordingNotifier;
    use async_trait::async_trait;
    use parley_shared::ConversationId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use crate::hub::EventStream;

    struct Fixture {
        pipeline: SendPipeline,
        store: Store,
        presence: Arc<InMemoryPresence>,
        hub: EventHub,
        notifier: Arc<RecordingNotifier>,
        a: UserId,
        b: UserId,
        _dir: TempDir,
        media_dir: std::path::PathBuf,
    }

    async fn fixture_with(storage: Option<Arc<dyn MediaStorage>>) -> Fixture {
        let store = Store::in_memory().unwrap();
        let a = User::new("Ada", "Lovelace");
        let mut b = User::new("Bob", "Builder");
        b.notification_token = Some("device-b".into());
        let (a_id, b_id) = (a.id, b.id);
        store
            .call(move |conn| {
                users::insert(conn, &a)?;
                users::insert(conn, &b)?;
                Ok(())
            })
            .await
            .unwrap();

        let dir = TempDir::new().unwrap();
        let media_dir = dir.path().join("media");
        let storage = match storage {
            Some(storage) => storage,
            None => Arc::new(FsMediaStorage::new(media_dir.clone(), "/media").await.unwrap()),
        };
        let presence = Arc::new(InMemoryPresence::new());
        let hub = EventHub::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let coordinator = DeliveryCoordinator::new(store.clone(), presence.clone(), hub.clone());
        let pipeline = SendPipeline::new(
            store.clone(),
            coordinator,
            storage,
            notifier.clone(),
            MediaLimits::default(),
            3,
            10,
        );
        Fixture {
            pipeline,
            store,
            presence,
            hub,
            notifier,
            a: a_id,
            b: b_id,
            _dir: dir,
            media_dir,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(None).await
    }

    fn drain(rx: &mut EventStream) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn image(name: &str) -> Upload {
        Upload {
            file_name: name.to_string(),
            content_type: "image/png".to_string(),
            data: b"png".to_vec(),
        }
    }

    fn media_files(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn first_message_creates_chat_and_announces_it() {
        let f = fixture().await;
        let (_, mut a_rx) = f.hub.register(f.a).await;
        let (_, mut b_rx) = f.hub.register(f.b).await;

        let outcome = f
            .pipeline
            .send_text(f.a, SendTarget::User(f.b), "  hello  ", MessageKind::Text)
            .await
            .unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0].content, "hello");
        assert!(!outcome.messages[0].is_delivered && !outcome.messages[0].is_read);

        assert_eq!(f.store.count_rows("conversations").await, 1);

        let a_events = drain(&mut a_rx);
        let b_events = drain(&mut b_rx);
        match (&a_events[..], &b_events[..]) {
            ([ServerEvent::NewChat(for_a)], [ServerEvent::NewChat(for_b)]) => {
                assert_eq!(for_a.unread_messages_count, 0);
                assert_eq!(for_b.unread_messages_count, 1);
                assert!(for_a.messages[0].is_my_msg);
                assert!(!for_b.messages[0].is_my_msg);
            }
            other => panic!("unexpected events {other:?}"),
        }

        let pushed = f.notifier.settle().await;
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].body, "hello");
    }

    #[tokio::test]
    async fn follow_up_is_incremental() {
        let f = fixture().await;
        let first = f
            .pipeline
            .send_text(f.a, SendTarget::User(f.b), "one", MessageKind::Text)
            .await
            .unwrap();
        let (_, mut b_rx) = f.hub.register(f.b).await;

        let second = f
            .pipeline
            .send_text(f.b, SendTarget::Conversation(first.conversation.id), "two", MessageKind::Text)
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.conversation.id, first.conversation.id);

        let events = drain(&mut b_rx);
        assert!(matches!(&events[..], [ServerEvent::Message(m)] if m.is_my_msg));
    }

    #[tokio::test]
    async fn recipient_in_room_reads_immediately_without_push() {
        let f = fixture().await;
        let first = f
            .pipeline
            .send_text(f.a, SendTarget::User(f.b), "one", MessageKind::Text)
            .await
            .unwrap();
        let chat = first.conversation.id;
        f.notifier.settle().await;

        f.presence.connect(f.b).await;
        f.presence.join_room(f.b, chat).await;
        let (_, mut a_rx) = f.hub.register(f.a).await;

        let outcome = f
            .pipeline
            .send_text(f.a, SendTarget::Conversation(chat), "two", MessageKind::Text)
            .await
            .unwrap();
        let id = outcome.messages[0].id;
        let stored = f.store.call(move |conn| Ok(messages::get(conn, id)?)).await.unwrap();
        assert!(stored.is_delivered && stored.is_read);

        let events = drain(&mut a_rx);
        assert!(events.iter().any(|e| matches!(e, ServerEvent::MessagesSeen(_))));
        assert_eq!(f.notifier.settle().await.len(), 1);
    }

    #[tokio::test]
    async fn clearer_gets_new_chat_again() {
        let f = fixture().await;
        let first = f
            .pipeline
            .send_text(f.a, SendTarget::User(f.b), "one", MessageKind::Text)
            .await
            .unwrap();
        let (chat, b) = (first.conversation.id, f.b);
        f.store
            .transaction(move |tx| Ok(conversations::clear(tx, chat, b, Utc::now())?))
            .await
            .unwrap();

        let (_, mut a_rx) = f.hub.register(f.a).await;
        let (_, mut b_rx) = f.hub.register(f.b).await;
        f.pipeline
            .send_text(f.a, SendTarget::User(f.b), "again", MessageKind::Text)
            .await
            .unwrap();

        assert!(matches!(&drain(&mut a_rx)[..], [ServerEvent::Message(_)]));
        match &drain(&mut b_rx)[..] {
            [ServerEvent::NewChat(summary)] => assert_eq!(summary.messages.len(), 1),
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn blocked_send_is_forbidden_and_persists_nothing() {
        let f = fixture().await;
        let (a, b) = (f.a, f.b);
        f.store
            .call(move |conn| Ok(blocks::block(conn, b, a, Utc::now())?))
            .await
            .unwrap();

        let err = f
            .pipeline
            .send_text(a, SendTarget::User(b), "hi", MessageKind::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Forbidden(_)));

        assert_eq!(f.store.count_rows("conversations").await, 0);
    }

    #[tokio::test]
    async fn blocked_media_send_compensates_uploads() {
        let f = fixture().await;
        let (a, b) = (f.a, f.b);
        f.store
            .call(move |conn| Ok(blocks::block(conn, a, b, Utc::now())?))
            .await
            .unwrap();

        let err = f
            .pipeline
            .send_media(a, SendTarget::User(b), vec![image("1.png"), image("2.png")])
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Forbidden(_)));
        assert_eq!(media_files(&f.media_dir), 0);
        assert!(f.notifier.settle().await.is_empty());
    }

    #[tokio::test]
    async fn media_batch_sends_one_push() {
        let f = fixture().await;
        let outcome = f
            .pipeline
            .send_media(f.a, SendTarget::User(f.b), vec![image("1.png"), image("2.png")])
            .await
            .unwrap();

        assert_eq!(outcome.messages.len(), 2);
        assert!(outcome.messages[0].created_at < outcome.messages[1].created_at);
        assert!(outcome.messages.iter().all(|m| m.kind == MessageKind::Image));
        assert_eq!(media_files(&f.media_dir), 2);

        let pushed = f.notifier.settle().await;
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].body, "2 images");
    }

    #[tokio::test]
    async fn validation_happens_before_upload() {
        let f = fixture().await;
        let err = f
            .pipeline
            .send_media(f.a, SendTarget::User(f.b), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));

        let too_many = (0..4).map(|i| image(&format!("{i}.png"))).collect();
        assert!(f.pipeline.send_media(f.a, SendTarget::User(f.b), too_many).await.is_err());

        let mut big = image("big.png");
        big.data = vec![0; MediaLimits::default().image + 1];
        let err = f
            .pipeline
            .send_media(f.a, SendTarget::User(f.b), vec![big])
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::MediaTooLarge { .. }));
        assert_eq!(media_files(&f.media_dir), 0);

        for bad in ["   ", ""] {
            assert!(f
                .pipeline
                .send_text(f.a, SendTarget::User(f.b), bad, MessageKind::Text)
                .await
                .is_err());
        }
        assert!(f
            .pipeline
            .send_text(f.a, SendTarget::User(f.b), "x", MessageKind::Label)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unknown_targets() {
        let f = fixture().await;
        let err = f
            .pipeline
            .send_text(f.a, SendTarget::Conversation(ConversationId::new()), "x", MessageKind::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));

        let err = f
            .pipeline
            .send_text(f.a, SendTarget::User(UserId::new()), "x", MessageKind::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));

        let err = f
            .pipeline
            .send_text(f.a, SendTarget::User(f.a), "x", MessageKind::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));
    }

    /// Storage that accepts `accept` uploads, then fails. Deletes fail too.
    struct FlakyStorage {
        accept: usize,
        puts: AtomicUsize,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl MediaStorage for FlakyStorage {
        async fn put(
            &self,
            _kind: MessageKind,
            _data: &[u8],
            _content_type: &str,
        ) -> Result<StoredMedia, ServerError> {
            let n = self.puts.fetch_add(1, Ordering::SeqCst);
            if n >= self.accept {
                return Err(ServerError::MediaStorage("bucket unavailable".into()));
            }
            Ok(StoredMedia {
                key: format!("k{n}"),
                url: format!("/media/k{n}"),
            })
        }

        async fn get(&self, _key: &str) -> Result<Vec<u8>, ServerError> {
            Err(ServerError::NotFound("Media not found".into()))
        }

        async fn delete(&self, _key: &str) -> Result<(), ServerError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Err(ServerError::MediaStorage("delete failed".into()))
        }
    }

    #[tokio::test]
    async fn failed_upload_compensates_and_surfaces_original_error() {
        let storage = Arc::new(FlakyStorage {
            accept: 1,
            puts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        });
        let f = fixture_with(Some(storage.clone())).await;

        let err = f
            .pipeline
            .send_media(f.a, SendTarget::User(f.b), vec![image("1.png"), image("2.png")])
            .await
            .unwrap_err();

        assert!(matches!(err, ServerError::MediaStorage(ref m) if m == "bucket unavailable"));
        assert_eq!(storage.deletes.load(Ordering::SeqCst), 1);

        assert_eq!(f.store.count_rows("messages").await, 0);
    }

    #[tokio::test]
    async fn saga_compensation_removes_staged_objects() {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn MediaStorage> =
            Arc::new(FsMediaStorage::new(dir.path().to_path_buf(), "/media").await.unwrap());
        let mut saga = MediaSaga::new(storage);
        saga.stage(&image("a.png")).await.unwrap();
        saga.stage(&image("b.png")).await.unwrap();
        assert_eq!(saga.staged().len(), 2);
        assert_eq!(media_files(dir.path()), 2);

        assert_eq!(saga.compensate().await, 2);
        assert_eq!(media_files(dir.path()), 0);
    }
}
