//! Directional block relation between users.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use parley_shared::UserId;

use crate::error::Result;
use crate::models::BlockStatus;
use crate::time;

/// Record that `blocker` blocked `blocked`. Returns `false` if the block
/// already existed.
pub fn block(conn: &Connection, blocker: UserId, blocked: UserId, now: DateTime<Utc>) -> Result<bool> {
    let affected = conn.execute(
        "INSERT OR IGNORE INTO blocked_users (blocker_id, blocked_id, created_at)
         VALUES (?1, ?2, ?3)",
        params![blocker.as_key(), blocked.as_key(), time::encode(&now)],
    )?;
    Ok(affected > 0)
}

/// Remove a block. Returns `false` if there was nothing to remove.
pub fn unblock(conn: &Connection, blocker: UserId, blocked: UserId) -> Result<bool> {
    let affected = conn.execute(
        "DELETE FROM blocked_users WHERE blocker_id = ?1 AND blocked_id = ?2",
        params![blocker.as_key(), blocked.as_key()],
    )?;
    Ok(affected > 0)
}

pub fn has_blocked(conn: &Connection, blocker: UserId, blocked: UserId) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM blocked_users WHERE blocker_id = ?1 AND blocked_id = ?2)",
        params![blocker.as_key(), blocked.as_key()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// The ids `blocker` has blocked.
pub fn blocked_ids(conn: &Connection, blocker: UserId) -> Result<Vec<UserId>> {
    let mut stmt = conn.prepare(
        "SELECT blocked_id FROM blocked_users WHERE blocker_id = ?1 ORDER BY created_at",
    )?;
    let rows = stmt.query_map(params![blocker.as_key()], |row| {
        let raw: String = row.get(0)?;
        time::parse_id(0, &raw)
    })?;

    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

/// The ids that have blocked `user`.
pub fn blocked_by(conn: &Connection, user: UserId) -> Result<Vec<UserId>> {
    let mut stmt = conn.prepare("SELECT blocker_id FROM blocked_users WHERE blocked_id = ?1")?;
    let rows = stmt.query_map(params![user.as_key()], |row| {
        let raw: String = row.get(0)?;
        time::parse_id(0, &raw)
    })?;

    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

/// Both directions of the relation, from `viewer`'s point of view.
pub fn status(conn: &Connection, viewer: UserId, other: UserId) -> Result<BlockStatus> {
    Ok(BlockStatus {
        by_me: has_blocked(conn, viewer, other)?,
        by_other: has_blocked(conn, other, viewer)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use crate::{users, Database};

    fn two_users(db: &Database) -> (UserId, UserId) {
        let a = User::new("A", "A");
        let b = User::new("B", "B");
        users::insert(db.conn(), &a).unwrap();
        users::insert(db.conn(), &b).unwrap();
        (a.id, b.id)
    }

    #[test]
    fn block_is_idempotent_and_directional() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = two_users(&db);

        assert!(block(db.conn(), a, b, Utc::now()).unwrap());
        assert!(!block(db.conn(), a, b, Utc::now()).unwrap());

        let from_a = status(db.conn(), a, b).unwrap();
        let from_b = status(db.conn(), b, a).unwrap();
        assert!(from_a.by_me && !from_a.by_other);
        assert!(!from_b.by_me && from_b.by_other);
        assert!(from_a.blocked() && from_b.blocked());

        assert_eq!(blocked_ids(db.conn(), a).unwrap(), vec![b]);
        assert_eq!(blocked_by(db.conn(), b).unwrap(), vec![a]);
    }

    #[test]
    fn unblock_reports_noop() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = two_users(&db);

        assert!(!unblock(db.conn(), a, b).unwrap());
        block(db.conn(), a, b, Utc::now()).unwrap();
        assert!(unblock(db.conn(), a, b).unwrap());
        assert!(!status(db.conn(), a, b).unwrap().blocked());
    }
}
