//! Message persistence, delivery watermarks and history queries.
//!
//! Delivery and read flags only move through the watermark functions, which
//! update every qualifying message at or before a timestamp in one statement.
//! Replaying a watermark is a no-op.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use parley_shared::{ConversationId, MessageId, MessageKind, UserId};

use crate::error::{Result, StoreError};
use crate::models::Message;
use crate::time;

const COLUMNS: &str =
    "id, conversation_id, sender_id, content, kind, is_delivered, is_read, created_at";

pub fn insert(conn: &Connection, message: &Message) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO messages ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        params![
            message.id.as_key(),
            message.conversation_id.as_ref().map(ConversationId::as_key),
            message.sender_id.as_ref().map(UserId::as_key),
            message.content,
            message.kind.as_str(),
            message.is_delivered,
            message.is_read,
            time::encode(&message.created_at),
        ],
    )?;
    Ok(())
}

pub fn find(conn: &Connection, id: MessageId) -> Result<Option<Message>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"),
            params![id.as_key()],
            row_to_message,
        )
        .optional()?)
}

pub fn get(conn: &Connection, id: MessageId) -> Result<Message> {
    find(conn, id)?.ok_or_else(|| StoreError::not_found("message", id))
}

/// The newest `limit` messages created strictly after `after`, newest first.
pub fn recent_visible(
    conn: &Connection,
    conversation: ConversationId,
    after: Option<DateTime<Utc>>,
    limit: u32,
) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM messages
         WHERE conversation_id = ?1 AND (?2 IS NULL OR created_at > ?2)
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?3"
    ))?;
    let rows = stmt.query_map(
        params![
            conversation.as_key(),
            after.as_ref().map(time::encode),
            i64::from(limit)
        ],
        row_to_message,
    )?;
    collect(rows)
}

/// Number of messages created strictly after `after` (all when `None`).
pub fn count_after(
    conn: &Connection,
    conversation: ConversationId,
    after: Option<DateTime<Utc>>,
) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE conversation_id = ?1 AND (?2 IS NULL OR created_at > ?2)",
        params![conversation.as_key(), after.as_ref().map(time::encode)],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

/// Unread messages sent to `viewer` by the other participant that are
/// visible to `viewer`.
pub fn count_unread(
    conn: &Connection,
    conversation: ConversationId,
    viewer: UserId,
    after: Option<DateTime<Utc>>,
) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE conversation_id = ?1
           AND sender_id IS NOT NULL AND sender_id != ?2
           AND is_read = 0
           AND (?3 IS NULL OR created_at > ?3)",
        params![
            conversation.as_key(),
            viewer.as_key(),
            after.as_ref().map(time::encode)
        ],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

/// Mark every message sent to `recipient` at or before `up_to` as delivered.
///
/// Label messages are untouched. Returns the number of rows that changed.
pub fn mark_delivered_up_to(
    conn: &Connection,
    conversation: ConversationId,
    recipient: UserId,
    up_to: DateTime<Utc>,
) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE messages SET is_delivered = 1
         WHERE conversation_id = ?1
           AND sender_id IS NOT NULL AND sender_id != ?2
           AND created_at <= ?3
           AND is_delivered = 0",
        params![conversation.as_key(), recipient.as_key(), time::encode(&up_to)],
    )?;
    Ok(changed)
}

/// Mark every message sent to `recipient` at or before `up_to` as delivered
/// and read in the same statement.
pub fn mark_read_up_to(
    conn: &Connection,
    conversation: ConversationId,
    recipient: UserId,
    up_to: DateTime<Utc>,
) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE messages SET is_delivered = 1, is_read = 1
         WHERE conversation_id = ?1
           AND sender_id IS NOT NULL AND sender_id != ?2
           AND created_at <= ?3
           AND is_read = 0",
        params![conversation.as_key(), recipient.as_key(), time::encode(&up_to)],
    )?;
    Ok(changed)
}

/// The newest message sent to `recipient` at or before `up_to`.
pub fn latest_from_other(
    conn: &Connection,
    conversation: ConversationId,
    recipient: UserId,
    up_to: DateTime<Utc>,
) -> Result<Option<Message>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM messages
                 WHERE conversation_id = ?1
                   AND sender_id IS NOT NULL AND sender_id != ?2
                   AND created_at <= ?3
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT 1"
            ),
            params![conversation.as_key(), recipient.as_key(), time::encode(&up_to)],
            row_to_message,
        )
        .optional()?)
}

/// For every conversation of `recipient` holding undelivered messages from
/// the counterpart, the newest such message.
pub fn latest_undelivered_per_conversation(
    conn: &Connection,
    recipient: UserId,
) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM messages m
         WHERE m.rowid IN (
             SELECT (
                 SELECT m2.rowid FROM messages m2
                 WHERE m2.conversation_id = c.id
                   AND m2.sender_id IS NOT NULL AND m2.sender_id != ?1
                   AND m2.is_delivered = 0
                 ORDER BY m2.created_at DESC, m2.rowid DESC
                 LIMIT 1
             )
             FROM conversations c
             WHERE c.participant_a = ?1 OR c.participant_b = ?1
         )
         ORDER BY m.created_at"
    ))?;
    let rows = stmt.query_map(params![recipient.as_key()], row_to_message)?;
    collect(rows)
}

/// Delete messages created strictly before `before`.
pub fn delete_before(
    conn: &Connection,
    conversation: ConversationId,
    before: DateTime<Utc>,
) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM messages WHERE conversation_id = ?1 AND created_at < ?2",
        params![conversation.as_key(), time::encode(&before)],
    )?;
    Ok(removed)
}

pub fn delete_for_conversation(conn: &Connection, conversation: ConversationId) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM messages WHERE conversation_id = ?1",
        params![conversation.as_key()],
    )?;
    Ok(removed)
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Latest,
    Oldest,
}

/// Filter over one conversation's messages. Both [`history`] and
/// [`count_history`] build their `WHERE` clause from it.
#[derive(Debug, Clone)]
pub struct HistoryFilter {
    pub conversation: ConversationId,
    /// Clear epoch of the viewer (exclusive).
    pub visible_after: Option<DateTime<Utc>>,
    /// Inclusive lower bound.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub end: Option<DateTime<Utc>>,
    pub kind: Option<MessageKind>,
    pub order: SortOrder,
}

impl HistoryFilter {
    pub fn new(conversation: ConversationId) -> Self {
        Self {
            conversation,
            visible_after: None,
            start: None,
            end: None,
            kind: None,
            order: SortOrder::Latest,
        }
    }

    fn where_clause(&self) -> (String, Vec<Value>) {
        let mut clauses = vec!["conversation_id = ?".to_string()];
        let mut values = vec![Value::Text(self.conversation.as_key())];

        if let Some(after) = &self.visible_after {
            clauses.push("created_at > ?".into());
            values.push(Value::Text(time::encode(after)));
        }
        if let Some(start) = &self.start {
            clauses.push("created_at >= ?".into());
            values.push(Value::Text(time::encode(start)));
        }
        if let Some(end) = &self.end {
            clauses.push("created_at <= ?".into());
            values.push(Value::Text(time::encode(end)));
        }
        if let Some(kind) = self.kind {
            clauses.push("kind = ?".into());
            values.push(Value::Text(kind.as_str().to_string()));
        }

        (clauses.join(" AND "), values)
    }
}

/// One page of history matching `filter`.
pub fn history(
    conn: &Connection,
    filter: &HistoryFilter,
    limit: u32,
    offset: u64,
) -> Result<Vec<Message>> {
    let (clause, mut values) = filter.where_clause();
    let order = match filter.order {
        SortOrder::Latest => "created_at DESC, rowid DESC",
        SortOrder::Oldest => "created_at ASC, rowid ASC",
    };
    values.push(Value::Integer(i64::from(limit)));
    values.push(Value::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));

    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM messages WHERE {clause} ORDER BY {order} LIMIT ? OFFSET ?"
    ))?;
    let rows = stmt.query_map(params_from_iter(values.iter()), row_to_message)?;
    collect(rows)
}

/// Total number of messages matching `filter`.
pub fn count_history(conn: &Connection, filter: &HistoryFilter) -> Result<u64> {
    let (clause, values) = filter.where_clause();
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM messages WHERE {clause}"),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn collect(
    rows: impl Iterator<Item = rusqlite::Result<Message>>,
) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let conversation: Option<String> = row.get(1)?;
    let sender: Option<String> = row.get(2)?;
    let kind: String = row.get(4)?;
    let created: String = row.get(7)?;

    Ok(Message {
        id: time::parse_id(0, &id)?,
        conversation_id: conversation
            .map(|raw| time::parse_id(1, &raw))
            .transpose()?,
        sender_id: sender.map(|raw| time::parse_id(2, &raw)).transpose()?,
        content: row.get(3)?,
        kind: kind.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        is_delivered: row.get(5)?,
        is_read: row.get(6)?,
        created_at: time::decode(7, &created)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use crate::{conversations, users, Database};
    use chrono::{Duration, TimeZone};
    use parley_shared::ParticipantPair;

    struct Fixture {
        db: Database,
        a: UserId,
        b: UserId,
        chat: ConversationId,
        t0: DateTime<Utc>,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let a = User::new("A", "A");
        let b = User::new("B", "B");
        users::insert(db.conn(), &a).unwrap();
        users::insert(db.conn(), &b).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let pair = ParticipantPair::new(a.id, b.id).unwrap();
        let (conv, _) = conversations::find_or_create(db.conn(), &pair, t0).unwrap();
        Fixture {
            db,
            a: a.id,
            b: b.id,
            chat: conv.id,
            t0,
        }
    }

    fn send(f: &Fixture, from: UserId, secs: i64) -> Message {
        let msg = Message::new(
            f.chat,
            from,
            "hi",
            MessageKind::Text,
            f.t0 + Duration::seconds(secs),
        );
        insert(f.db.conn(), &msg).unwrap();
        msg
    }

    #[test]
    fn delivered_watermark_is_idempotent() {
        let f = fixture();
        let m1 = send(&f, f.a, 1);
        let m2 = send(&f, f.a, 2);
        let m3 = send(&f, f.a, 3);
        send(&f, f.b, 4);

        assert_eq!(mark_delivered_up_to(f.db.conn(), f.chat, f.b, m2.created_at).unwrap(), 2);
        assert_eq!(mark_delivered_up_to(f.db.conn(), f.chat, f.b, m2.created_at).unwrap(), 0);

        assert!(get(f.db.conn(), m1.id).unwrap().is_delivered);
        assert!(get(f.db.conn(), m2.id).unwrap().is_delivered);
        let m3 = get(f.db.conn(), m3.id).unwrap();
        assert!(!m3.is_delivered && !m3.is_read);
    }

    #[test]
    fn out_of_order_acks_converge() {
        let f = fixture();
        let m1 = send(&f, f.a, 1);
        let m2 = send(&f, f.a, 2);

        mark_delivered_up_to(f.db.conn(), f.chat, f.b, m2.created_at).unwrap();
        assert_eq!(mark_delivered_up_to(f.db.conn(), f.chat, f.b, m1.created_at).unwrap(), 0);
        assert!(get(f.db.conn(), m1.id).unwrap().is_delivered);
    }

    #[test]
    fn read_implies_delivered() {
        let f = fixture();
        let m1 = send(&f, f.a, 1);

        assert_eq!(mark_read_up_to(f.db.conn(), f.chat, f.b, f.t0 + Duration::seconds(10)).unwrap(), 1);
        let m1 = get(f.db.conn(), m1.id).unwrap();
        assert!(m1.is_delivered && m1.is_read);
        assert_eq!(count_unread(f.db.conn(), f.chat, f.b, None).unwrap(), 0);
    }

    #[test]
    fn own_messages_and_labels_are_never_marked() {
        let f = fixture();
        let own = send(&f, f.b, 1);
        let label = Message::label(f.chat, "blocked", f.t0 + Duration::seconds(2));
        insert(f.db.conn(), &label).unwrap();

        let later = f.t0 + Duration::seconds(10);
        assert_eq!(mark_read_up_to(f.db.conn(), f.chat, f.b, later).unwrap(), 0);
        assert!(!get(f.db.conn(), own.id).unwrap().is_read);
        assert!(!get(f.db.conn(), label.id).unwrap().is_delivered);
    }

    #[test]
    fn flags_cannot_regress() {
        let f = fixture();
        let m1 = send(&f, f.a, 1);
        mark_read_up_to(f.db.conn(), f.chat, f.b, m1.created_at).unwrap();

        let result = f.db.conn().execute(
            "UPDATE messages SET is_read = 0 WHERE id = ?1",
            params![m1.id.as_key()],
        );
        assert!(result.is_err());
        assert!(get(f.db.conn(), m1.id).unwrap().is_read);
    }

    #[test]
    fn recent_respects_epoch_and_order() {
        let f = fixture();
        send(&f, f.a, 1);
        let m2 = send(&f, f.b, 2);
        let m3 = send(&f, f.a, 3);

        let all = recent_visible(f.db.conn(), f.chat, None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, m3.id);

        let after = recent_visible(f.db.conn(), f.chat, Some(f.t0 + Duration::seconds(1)), 1).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, m3.id);
        assert_eq!(count_after(f.db.conn(), f.chat, Some(m2.created_at)).unwrap(), 1);
    }

    #[test]
    fn latest_undelivered_is_per_conversation() {
        let f = fixture();
        send(&f, f.a, 1);
        let newest = send(&f, f.a, 2);
        send(&f, f.b, 3);

        let pending = latest_undelivered_per_conversation(f.db.conn(), f.b).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, newest.id);

        mark_delivered_up_to(f.db.conn(), f.chat, f.b, newest.created_at).unwrap();
        assert!(latest_undelivered_per_conversation(f.db.conn(), f.b).unwrap().is_empty());
    }

    #[test]
    fn history_count_matches_filter() {
        let f = fixture();
        for i in 0..5 {
            send(&f, f.a, i);
        }
        let image = Message::new(f.chat, f.b, "/media/x", MessageKind::Image, f.t0 + Duration::seconds(6));
        insert(f.db.conn(), &image).unwrap();

        let mut filter = HistoryFilter::new(f.chat);
        assert_eq!(count_history(f.db.conn(), &filter).unwrap(), 6);

        filter.kind = Some(MessageKind::Text);
        filter.start = Some(f.t0 + Duration::seconds(1));
        filter.end = Some(f.t0 + Duration::seconds(3));
        assert_eq!(count_history(f.db.conn(), &filter).unwrap(), 3);

        filter.order = SortOrder::Oldest;
        let page = history(f.db.conn(), &filter, 2, 0).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].created_at, f.t0 + Duration::seconds(1));
        let rest = history(f.db.conn(), &filter, 2, 2).unwrap();
        assert_eq!(rest.len(), 1);
    }
}
