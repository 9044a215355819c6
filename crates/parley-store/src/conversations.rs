//! Conversation identity and lifecycle.
//!
//! At most one conversation exists per participant pair. The pair is stored
//! in canonical order and backed by a UNIQUE index, so concurrent creators
//! race on the index rather than on application locks: the loser sees a
//! constraint violation and re-reads the winner's row.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use parley_shared::{ConversationId, ParticipantPair, UserId};

use crate::error::{is_unique_violation, Result, StoreError};
use crate::messages;
use crate::models::{ClearOutcome, Conversation};
use crate::time;

const COLUMNS: &str = "id, participant_a, participant_b, cleared_by, cleared_at, created_at";

pub fn find_by_id(conn: &Connection, id: ConversationId) -> Result<Option<Conversation>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM conversations WHERE id = ?1"),
            params![id.as_key()],
            row_to_conversation,
        )
        .optional()?)
}

pub fn get(conn: &Connection, id: ConversationId) -> Result<Conversation> {
    find_by_id(conn, id)?.ok_or_else(|| StoreError::not_found("conversation", id))
}

pub fn find_by_pair(conn: &Connection, pair: &ParticipantPair) -> Result<Option<Conversation>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM conversations
                 WHERE participant_a = ?1 AND participant_b = ?2"
            ),
            params![pair.first().as_key(), pair.second().as_key()],
            row_to_conversation,
        )
        .optional()?)
}

/// Look up the conversation between two users, in either order.
pub fn find_by_participants(
    conn: &Connection,
    a: UserId,
    b: UserId,
) -> Result<Option<Conversation>> {
    find_by_pair(conn, &ParticipantPair::new(a, b)?)
}

pub fn insert(conn: &Connection, conversation: &Conversation) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO conversations ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
        params![
            conversation.id.as_key(),
            conversation.participants.first().as_key(),
            conversation.participants.second().as_key(),
            conversation.cleared_by.as_ref().map(UserId::as_key),
            conversation.cleared_at.as_ref().map(time::encode),
            time::encode(&conversation.created_at),
        ],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Conflict {
                entity: "conversation",
                id: conversation.id.to_string(),
            }
        } else {
            e.into()
        }
    })?;
    Ok(())
}

/// Return the conversation for `pair`, creating it if needed.
///
/// The boolean is `true` when this call created the row. A concurrent
/// creator that wins the race is picked up by re-reading after the
/// constraint violation.
pub fn find_or_create(
    conn: &Connection,
    pair: &ParticipantPair,
    now: DateTime<Utc>,
) -> Result<(Conversation, bool)> {
    if let Some(existing) = find_by_pair(conn, pair)? {
        return Ok((existing, false));
    }

    let conversation = Conversation::new(*pair, now);
    match insert(conn, &conversation) {
        Ok(()) => {
            tracing::debug!(chat = %conversation.id, "conversation created");
            Ok((conversation, true))
        }
        Err(StoreError::Conflict { id, .. }) => {
            tracing::debug!(lost = %id, "conversation creation raced, re-reading");
            find_by_pair(conn, pair)?
                .map(|winner| (winner, false))
                .ok_or(StoreError::Conflict {
                    entity: "conversation",
                    id,
                })
        }
        Err(e) => Err(e),
    }
}

/// Every conversation `user` participates in.
pub fn list_for_user(conn: &Connection, user: UserId) -> Result<Vec<Conversation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM conversations
         WHERE participant_a = ?1 OR participant_b = ?1
         ORDER BY created_at DESC"
    ))?;
    let rows = stmt.query_map(params![user.as_key()], row_to_conversation)?;

    let mut conversations = Vec::new();
    for row in rows {
        conversations.push(row?);
    }
    Ok(conversations)
}

/// Clear the conversation for `requester` at `now`.
///
/// Runs inside the caller's transaction since it interleaves reads and
/// writes over conversations and messages.
pub fn clear(
    tx: &Transaction<'_>,
    id: ConversationId,
    requester: UserId,
    now: DateTime<Utc>,
) -> Result<ClearOutcome> {
    let conversation = get(tx, id)?;
    if !conversation.has_participant(requester) {
        return Err(StoreError::NotParticipant {
            conversation: id.to_string(),
            user: requester.to_string(),
        });
    }

    let outcome = match (conversation.cleared_by, conversation.cleared_at) {
        (Some(by), Some(previous)) if by == requester => {
            if messages::count_after(tx, id, Some(previous))? == 0 {
                let removed_messages = delete(tx, id)?;
                return Ok(ClearOutcome::Deleted { removed_messages });
            }
            let removed = messages::delete_before(tx, id, previous)?;
            if removed > 0 {
                ClearOutcome::Purged { removed }
            } else {
                ClearOutcome::Bumped
            }
        }
        (Some(_), Some(counterpart_epoch)) => {
            // Overwriting the counterpart's epoch would make these visible
            // to them again.
            let purged = messages::delete_before(tx, id, counterpart_epoch)?;
            ClearOutcome::Cleared { purged }
        }
        _ => ClearOutcome::Cleared { purged: 0 },
    };

    tx.execute(
        "UPDATE conversations SET cleared_by = ?2, cleared_at = ?3 WHERE id = ?1",
        params![id.as_key(), requester.as_key(), time::encode(&now)],
    )?;

    tracing::debug!(chat = %id, user = %requester, ?outcome, "conversation cleared");
    Ok(outcome)
}

/// Delete a conversation and all of its messages. Returns the number of
/// messages removed.
pub fn delete(conn: &Connection, id: ConversationId) -> Result<usize> {
    let removed = messages::delete_for_conversation(conn, id)?;
    let affected = conn.execute(
        "DELETE FROM conversations WHERE id = ?1",
        params![id.as_key()],
    )?;
    if affected == 0 {
        return Err(StoreError::not_found("conversation", id));
    }
    Ok(removed)
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    let a: String = row.get(1)?;
    let b: String = row.get(2)?;
    let cleared_by: Option<String> = row.get(3)?;
    let cleared_at: Option<String> = row.get(4)?;
    let created: String = row.get(5)?;

    let participants = ParticipantPair::new(time::parse_id(1, &a)?, time::parse_id(2, &b)?)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Conversation {
        id: time::parse_id(0, &id)?,
        participants,
        cleared_by: cleared_by.map(|raw| time::parse_id(3, &raw)).transpose()?,
        cleared_at: cleared_at.map(|raw| time::decode(4, &raw)).transpose()?,
        created_at: time::decode(5, &created)?,
    })
}
