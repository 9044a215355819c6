//! Conversation views: the "my conversations" list, one conversation, and
//! message history.
//!
//! The list is built as a fixed sequence of typed queries (candidates,
//! counterpart profiles, block relation, recent visible messages, unread
//! counts) followed by [`select_page`], a pure function that filters,
//! sorts and paginates. Only the selected page is marked as shown.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use parley_shared::constants::{
    DEFAULT_HISTORY_LIMIT, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT,
};
use parley_shared::views::{ConversationSummary, MessageView, Page, Pagination};
use parley_shared::{ConversationId, MessageKind, UserId};
use parley_store::messages::{HistoryFilter, SortOrder};
use parley_store::rusqlite::Connection;
use parley_store::{blocks, conversations, messages, users, BlockStatus, Conversation, Message, User};

use crate::db::Store;
use crate::delivery::DeliveryCoordinator;
use crate::error::{ServerError, MSG_USER_NOT_FOUND};

/// Query of `GET /chats`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub search: Option<String>,
    pub no_of_messages: Option<u32>,
}

/// Query of `GET /chats/:id/messages`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub kind: Option<MessageKind>,
    pub sort: Option<HistorySort>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySort {
    #[default]
    Latest,
    Oldest,
}

fn page_and_limit(page: Option<u32>, limit: Option<u32>, default_limit: u32) -> (u32, u32) {
    let page = page.unwrap_or(1).max(1);
    let limit = limit.unwrap_or(default_limit).clamp(1, MAX_PAGE_LIMIT);
    (page, limit)
}

/// Everything needed to render one conversation for one viewer.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub conversation: Conversation,
    pub counterpart: Option<User>,
    pub block: BlockStatus,
    /// Visible messages, newest first.
    pub recent: Vec<Message>,
    pub unread: u64,
}

impl Candidate {
    fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.recent.first().map(|m| m.created_at)
    }

    fn into_summary(self, viewer: UserId) -> Option<ConversationSummary> {
        let last = self.last_activity();
        let to = self.counterpart?.profile();
        Some(ConversationSummary {
            id: self.conversation.id,
            to,
            blocked: self.block.blocked(),
            blocked_by_me: self.block.by_me,
            blocked_by_other: self.block.by_other,
            unread_messages_count: self.unread,
            last_message_created_at: last,
            messages: self.recent.iter().map(|m| m.view_for(viewer)).collect(),
        })
    }
}

/// Gather a candidate for `conversation` as seen by `viewer`.
fn load_candidate(
    conn: &Connection,
    conversation: Conversation,
    viewer: UserId,
    recent: u32,
    counterpart: Option<User>,
    block: BlockStatus,
) -> Result<Candidate, ServerError> {
    let after = conversation.visible_after(viewer);
    let id = conversation.id;
    Ok(Candidate {
        recent: messages::recent_visible(conn, id, after, recent)?,
        unread: messages::count_unread(conn, id, viewer, after)?,
        conversation,
        counterpart,
        block,
    })
}

/// Summary of one conversation for `viewer`, read in the caller's
/// connection or transaction.
pub fn load_summary(
    conn: &Connection,
    conversation: Conversation,
    viewer: UserId,
    recent: u32,
) -> Result<ConversationSummary, ServerError> {
    let other = conversation
        .other(viewer)
        .ok_or_else(ServerError::not_participant)?;
    let counterpart = users::find(conn, other)?;
    let block = blocks::status(conn, viewer, other)?;
    load_candidate(conn, conversation, viewer, recent, counterpart, block)?
        .into_summary(viewer)
        .ok_or_else(|| ServerError::NotFound(MSG_USER_NOT_FOUND.to_string()))
}

/// Filter, sort and paginate candidates.
///
/// Kept: counterpart known and active, at least one visible message, and
/// a counterpart name containing `search` (case-insensitive) when given.
/// Order: most recent visible message first, ties broken by conversation
/// id. The total counts exactly the kept set.
pub fn select_page(
    candidates: Vec<Candidate>,
    search: Option<&str>,
    page: u32,
    limit: u32,
) -> (Pagination, Vec<Candidate>) {
    let needle = search
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase);

    let mut kept: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| c.counterpart.as_ref().is_some_and(|u| u.is_active))
        .filter(|c| !c.recent.is_empty())
        .filter(|c| match (&needle, &c.counterpart) {
            (Some(needle), Some(user)) => user.full_name().to_lowercase().contains(needle),
            _ => true,
        })
        .collect();

    kept.sort_by(|x, y| {
        y.last_activity()
            .cmp(&x.last_activity())
            .then_with(|| x.conversation.id.as_key().cmp(&y.conversation.id.as_key()))
    });

    let pagination = Pagination::new(kept.len() as u64, page, limit);
    let selected = kept
        .into_iter()
        .skip(usize::try_from(pagination.offset()).unwrap_or(usize::MAX))
        .take(pagination.limit as usize)
        .collect();
    (pagination, selected)
}

#[derive(Clone)]
pub struct ViewBuilder {
    store: Store,
    coordinator: DeliveryCoordinator,
    recent_default: u32,
}

impl ViewBuilder {
    pub fn new(store: Store, coordinator: DeliveryCoordinator, recent_default: u32) -> Self {
        Self {
            store,
            coordinator,
            recent_default,
        }
    }

    fn recent(&self, requested: Option<u32>) -> u32 {
        requested.unwrap_or(self.recent_default).clamp(1, MAX_PAGE_LIMIT)
    }

    /// The caller's conversations. Only the returned page is marked
    /// delivered (read for rooms the caller has open); its messages are
    /// re-read afterwards so the flags match the store.
    pub async fn list_conversations(
        &self,
        viewer: UserId,
        query: ListQuery,
    ) -> Result<Page<ConversationSummary>, ServerError> {
        let (page, limit) = page_and_limit(query.page, query.limit, DEFAULT_PAGE_LIMIT);
        let recent = self.recent(query.no_of_messages);

        let all = self
            .store
            .call(move |conn| Ok(conversations::list_for_user(conn, viewer)?))
            .await?;

        let candidates = self
            .store
            .call(move |conn| {
                let others: Vec<UserId> = all.iter().filter_map(|c| c.other(viewer)).collect();
                let mut profiles: HashMap<UserId, User> = users::get_many(conn, &others)?
                    .into_iter()
                    .map(|u| (u.id, u))
                    .collect();
                let blocked_by_me: HashSet<UserId> =
                    blocks::blocked_ids(conn, viewer)?.into_iter().collect();
                let blocked_me: HashSet<UserId> =
                    blocks::blocked_by(conn, viewer)?.into_iter().collect();

                let mut candidates = Vec::with_capacity(all.len());
                for conversation in all {
                    let Some(other) = conversation.other(viewer) else {
                        continue;
                    };
                    let block = BlockStatus {
                        by_me: blocked_by_me.contains(&other),
                        by_other: blocked_me.contains(&other),
                    };
                    let counterpart = profiles.remove(&other);
                    candidates.push(load_candidate(
                        conn,
                        conversation,
                        viewer,
                        recent,
                        counterpart,
                        block,
                    )?);
                }
                Ok(candidates)
            })
            .await?;

        let (pagination, selected) =
            select_page(candidates, query.search.as_deref(), page, limit);

        let mut changed = 0;
        for candidate in &selected {
            changed += self.coordinator.on_shown(&candidate.conversation, viewer).await?;
        }
        let selected = if changed == 0 {
            selected
        } else {
            self.store
                .call(move |conn| {
                    selected
                        .into_iter()
                        .map(|c| {
                            load_candidate(conn, c.conversation, viewer, recent, c.counterpart, c.block)
                        })
                        .collect::<Result<Vec<_>, _>>()
                })
                .await?
        };

        Ok(Page {
            pagination,
            data: selected
                .into_iter()
                .filter_map(|c| c.into_summary(viewer))
                .collect(),
        })
    }

    /// One conversation with its most recent visible messages.
    pub async fn get_conversation(
        &self,
        viewer: UserId,
        chat: ConversationId,
        no_of_messages: Option<u32>,
    ) -> Result<ConversationSummary, ServerError> {
        let conversation = self.coordinator.authorize(viewer, chat).await?;
        self.coordinator.on_shown(&conversation, viewer).await?;
        self.summary_for(chat, viewer, no_of_messages).await
    }

    /// Summary of `chat` for `viewer` without side effects.
    pub async fn summary_for(
        &self,
        chat: ConversationId,
        viewer: UserId,
        no_of_messages: Option<u32>,
    ) -> Result<ConversationSummary, ServerError> {
        let recent = self.recent(no_of_messages);
        self.store
            .call(move |conn| {
                let conversation = conversations::get(conn, chat)?;
                load_summary(conn, conversation, viewer, recent)
            })
            .await
    }

    /// Paginated, filterable message history of one conversation.
    pub async fn message_history(
        &self,
        viewer: UserId,
        chat: ConversationId,
        query: HistoryQuery,
    ) -> Result<Page<MessageView>, ServerError> {
        let conversation = self.coordinator.authorize(viewer, chat).await?;
        self.coordinator.on_shown(&conversation, viewer).await?;

        let (page, limit) = page_and_limit(query.page, query.limit, DEFAULT_HISTORY_LIMIT);
        let filter = HistoryFilter {
            conversation: chat,
            visible_after: conversation.visible_after(viewer),
            start: query.start_date,
            end: query.end_date,
            kind: query.kind,
            order: match query.sort.unwrap_or_default() {
                HistorySort::Latest => SortOrder::Latest,
                HistorySort::Oldest => SortOrder::Oldest,
            },
        };

        self.store
            .call(move |conn| {
                let total = messages::count_history(conn, &filter)?;
                let pagination = Pagination::new(total, page, limit);
                let rows = messages::history(conn, &filter, pagination.limit, pagination.offset())?;
                Ok(Page {
                    pagination,
                    data: rows.iter().map(|m| m.view_for(viewer)).collect(),
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::EventHub;
    use crate::presence::InMemoryPresence;
    use chrono::Duration;
    use parley_shared::protocol::ServerEvent;
    use parley_shared::ParticipantPair;
    use std::sync::Arc;

    fn compose_page(
        candidates: Vec<Candidate>,
        viewer: UserId,
        search: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Page<ConversationSummary> {
        let (pagination, selected) = select_page(candidates, search, page, limit);
        Page {
            pagination,
            data: selected.into_iter().filter_map(|c| c.into_summary(viewer)).collect(),
        }
    }

    fn candidate(viewer: UserId, name: &str, active: bool, last: Option<i64>) -> Candidate {
        let mut other = User::new(name, "");
        other.is_active = active;
        let base = Utc::now();
        let conversation =
            Conversation::new(ParticipantPair::new(viewer, other.id).unwrap(), base);
        let recent = last
            .map(|secs| {
                vec![Message::new(
                    conversation.id,
                    other.id,
                    "x",
                    MessageKind::Text,
                    base + Duration::seconds(secs),
                )]
            })
            .unwrap_or_default();
        Candidate {
            conversation,
            counterpart: Some(other),
            block: BlockStatus::default(),
            recent,
            unread: 0,
        }
    }

    #[test]
    fn compose_filters_sorts_and_counts_consistently() {
        let viewer = UserId::new();
        let candidates = vec![
            candidate(viewer, "Old", true, Some(1)),
            candidate(viewer, "Inactive", false, Some(9)),
            candidate(viewer, "Empty", true, None),
            candidate(viewer, "New", true, Some(5)),
            candidate(viewer, "Middle", true, Some(3)),
        ];

        let page = compose_page(candidates, viewer, None, 1, 2);
        assert_eq!(page.pagination.total_results, 3);
        assert_eq!(page.pagination.total_pages, 2);
        let names: Vec<_> = page.data.iter().map(|s| s.to.full_name.as_str()).collect();
        assert_eq!(names, ["New", "Middle"]);
    }

    #[test]
    fn compose_search_is_case_insensitive() {
        let viewer = UserId::new();
        let candidates = vec![
            candidate(viewer, "Alice", true, Some(1)),
            candidate(viewer, "Bob", true, Some(2)),
        ];
        let page = compose_page(candidates, viewer, Some("  aLi "), 1, 10);
        assert_eq!(page.pagination.total_results, 1);
        assert_eq!(page.data[0].to.full_name, "Alice");
    }

    #[test]
    fn compose_second_page() {
        let viewer = UserId::new();
        let candidates = (0..5)
            .map(|i| candidate(viewer, &format!("U{i}"), true, Some(i)))
            .collect();
        let page = compose_page(candidates, viewer, None, 3, 2);
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].to.full_name, "U0");
    }

    struct Fixture {
        builder: ViewBuilder,
        store: Store,
        hub: EventHub,
        a: UserId,
        b: UserId,
        chat: ConversationId,
    }

    async fn fixture() -> Fixture {
        let store = Store::in_memory().unwrap();
        let a = User::new("Ada", "Lovelace");
        let b = User::new("Bob", "Builder");
        let (a_id, b_id) = (a.id, b.id);
        let chat = store
            .call(move |conn| {
                users::insert(conn, &a)?;
                users::insert(conn, &b)?;
                let pair = ParticipantPair::new(a.id, b.id)?;
                let (conv, _) = conversations::find_or_create(conn, &pair, Utc::now())?;
                for i in 0..3 {
                    let from = if i == 1 { b.id } else { a.id };
                    let at = Utc::now() - Duration::seconds(30 - i);
                    messages::insert(conn, &Message::new(conv.id, from, "m", MessageKind::Text, at))?;
                }
                Ok(conv.id)
            })
            .await
            .unwrap();
        let hub = EventHub::new();
        let coordinator =
            DeliveryCoordinator::new(store.clone(), Arc::new(InMemoryPresence::new()), hub.clone());
        Fixture {
            builder: ViewBuilder::new(store.clone(), coordinator, 10),
            store,
            hub,
            a: a_id,
            b: b_id,
            chat,
        }
    }

    #[tokio::test]
    async fn listing_marks_delivered_not_read() {
        let f = fixture().await;
        let page = f.builder.list_conversations(f.b, ListQuery::default()).await.unwrap();

        assert_eq!(page.pagination.total_results, 1);
        let summary = &page.data[0];
        assert_eq!(summary.to.id, f.a);
        assert_eq!(summary.unread_messages_count, 2);
        assert_eq!(summary.messages.len(), 3);
        assert!(summary
            .messages
            .iter()
            .filter(|m| !m.is_my_msg)
            .all(|m| m.is_delivered && !m.is_read));
    }

    async fn undelivered_for(f: &Fixture, user: UserId) -> usize {
        f.store
            .call(move |conn| Ok(messages::latest_undelivered_per_conversation(conn, user)?.len()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn listing_leaves_hidden_conversations_undelivered() {
        let f = fixture().await;
        let (_, mut sender) = f.hub.register(f.a).await;

        let missed = ListQuery {
            search: Some("zzz-no-match".into()),
            ..Default::default()
        };
        let page = f.builder.list_conversations(f.b, missed).await.unwrap();
        assert!(page.data.is_empty());

        let beyond = ListQuery {
            page: Some(2),
            ..Default::default()
        };
        let page = f.builder.list_conversations(f.b, beyond).await.unwrap();
        assert_eq!(page.pagination.total_results, 1);
        assert!(page.data.is_empty());

        assert_eq!(undelivered_for(&f, f.b).await, 1);
        assert!(sender.try_recv().is_err());

        let shown = f.builder.list_conversations(f.b, ListQuery::default()).await.unwrap();
        assert_eq!(shown.data.len(), 1);
        assert_eq!(undelivered_for(&f, f.b).await, 0);
        assert!(matches!(sender.try_recv(), Ok(ServerEvent::MessageDelivered(_))));
    }

    #[tokio::test]
    async fn blocked_flags_per_viewer() {
        let f = fixture().await;
        let (a, b) = (f.a, f.b);
        f.store
            .call(move |conn| Ok(blocks::block(conn, a, b, Utc::now())?))
            .await
            .unwrap();

        let from_a = f.builder.get_conversation(a, f.chat, None).await.unwrap();
        assert!(from_a.blocked && from_a.blocked_by_me && !from_a.blocked_by_other);
        let from_b = f.builder.get_conversation(b, f.chat, None).await.unwrap();
        assert!(from_b.blocked && !from_b.blocked_by_me && from_b.blocked_by_other);
    }

    #[tokio::test]
    async fn cleared_conversation_leaves_clearer_list() {
        let f = fixture().await;
        let (a, chat) = (f.a, f.chat);
        f.store
            .transaction(move |tx| Ok(conversations::clear(tx, chat, a, Utc::now())?))
            .await
            .unwrap();

        let for_a = f.builder.list_conversations(a, ListQuery::default()).await.unwrap();
        assert_eq!(for_a.pagination.total_results, 0);
        let for_b = f.builder.list_conversations(f.b, ListQuery::default()).await.unwrap();
        assert_eq!(for_b.data[0].messages.len(), 3);
    }

    #[tokio::test]
    async fn history_filters_and_paginates() {
        let f = fixture().await;
        let query = HistoryQuery {
            sort: Some(HistorySort::Oldest),
            limit: Some(2),
            page: Some(2),
            ..Default::default()
        };
        let page = f.builder.message_history(f.b, f.chat, query).await.unwrap();
        assert_eq!(page.pagination.total_results, 3);
        assert_eq!(page.pagination.total_pages, 2);
        assert_eq!(page.data.len(), 1);

        let outsider = f
            .builder
            .message_history(UserId::new(), f.chat, HistoryQuery::default())
            .await;
        assert!(matches!(outsider, Err(ServerError::Unauthorized(_))));
    }
}
