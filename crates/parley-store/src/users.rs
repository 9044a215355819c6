//! User rows mirrored from the account service, plus their sessions.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use parley_shared::UserId;

use crate::error::{Result, StoreError};
use crate::models::User;
use crate::time;

const COLUMNS: &str = "id, first_name, last_name, profile_picture, is_active, is_suspended, \
                       lang, session_token, session_expires_at, notification_token, created_at";

pub fn insert(conn: &Connection, user: &User) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO users ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            user.id.as_key(),
            user.first_name,
            user.last_name,
            user.profile_picture,
            user.is_active,
            user.is_suspended,
            user.lang,
            user.session_token,
            user.session_expires_at.as_ref().map(time::encode),
            user.notification_token,
            time::encode(&user.created_at),
        ],
    )
    .map_err(|e| {
        if crate::error::is_unique_violation(&e) {
            StoreError::Conflict {
                entity: "user",
                id: user.id.to_string(),
            }
        } else {
            e.into()
        }
    })?;
    Ok(())
}

pub fn get(conn: &Connection, id: UserId) -> Result<User> {
    find(conn, id)?.ok_or_else(|| StoreError::not_found("user", id))
}

pub fn find(conn: &Connection, id: UserId) -> Result<Option<User>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM users WHERE id = ?1"),
            params![id.as_key()],
            row_to_user,
        )
        .optional()?)
}

/// Batch-fetch profiles. Unknown ids are silently skipped.
pub fn get_many(conn: &Connection, ids: &[UserId]) -> Result<Vec<User>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM users WHERE id IN ({placeholders})"
    ))?;
    let rows = stmt.query_map(params_from_iter(ids.iter().map(UserId::as_key)), row_to_user)?;

    let mut users = Vec::with_capacity(ids.len());
    for row in rows {
        users.push(row?);
    }
    Ok(users)
}

pub fn find_by_session_token(conn: &Connection, token: &str) -> Result<Option<User>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM users WHERE session_token = ?1"),
            params![token],
            row_to_user,
        )
        .optional()?)
}

pub fn set_notification_token(conn: &Connection, id: UserId, token: Option<&str>) -> Result<()> {
    let affected = conn.execute(
        "UPDATE users SET notification_token = ?2 WHERE id = ?1",
        params![id.as_key(), token],
    )?;
    if affected == 0 {
        return Err(StoreError::not_found("user", id));
    }
    Ok(())
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let expires: Option<String> = row.get(8)?;
    let created: String = row.get(10)?;

    Ok(User {
        id: time::parse_id(0, &id)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        profile_picture: row.get(3)?,
        is_active: row.get(4)?,
        is_suspended: row.get(5)?,
        lang: row.get(6)?,
        session_token: row.get(7)?,
        session_expires_at: expires.map(|raw| time::decode(8, &raw)).transpose()?,
        notification_token: row.get(9)?,
        created_at: time::decode(10, &created)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[test]
    fn insert_and_fetch() {
        let db = Database::open_in_memory().unwrap();
        let mut user = User::new("Ada", "Lovelace");
        user.session_token = Some("tok".into());
        insert(db.conn(), &user).unwrap();

        let back = get(db.conn(), user.id).unwrap();
        assert_eq!(back.full_name(), "Ada Lovelace");
        assert!(back.is_active);

        let by_token = find_by_session_token(db.conn(), "tok").unwrap().unwrap();
        assert_eq!(by_token.id, user.id);
        assert!(find_by_session_token(db.conn(), "nope").unwrap().is_none());
    }

    #[test]
    fn duplicate_insert_is_conflict() {
        let db = Database::open_in_memory().unwrap();
        let user = User::new("A", "B");
        insert(db.conn(), &user).unwrap();
        assert!(matches!(
            insert(db.conn(), &user),
            Err(StoreError::Conflict { entity: "user", .. })
        ));
    }

    #[test]
    fn get_many_skips_unknown() {
        let db = Database::open_in_memory().unwrap();
        let a = User::new("A", "A");
        let b = User::new("B", "B");
        insert(db.conn(), &a).unwrap();
        insert(db.conn(), &b).unwrap();

        let found = get_many(db.conn(), &[a.id, UserId::new(), b.id]).unwrap();
        assert_eq!(found.len(), 2);
        assert!(get_many(db.conn(), &[]).unwrap().is_empty());
    }

    #[test]
    fn missing_user_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            get(db.conn(), UserId::new()),
            Err(StoreError::NotFound { entity: "user", .. })
        ));
        assert!(set_notification_token(db.conn(), UserId::new(), Some("x")).is_err());
    }
}
