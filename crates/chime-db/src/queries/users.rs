use anyhow::Result;
use rusqlite::Connection;

use super::OptionalExt;
use crate::Database;
use crate::models::UserRow;

const USER_COLUMNS: &str = "id, username, password_hash, email, created_at";

impl Database {
    pub fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        email: Option<&str>,
    ) -> Result<i64> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (username, password_hash, email) VALUES (?1, ?2, ?3)",
                rusqlite::params![username, password_hash, email],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username = ?1", username))
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email = ?1", email))
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id = ?1", id))
    }

    pub fn user_exists(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| user_exists(conn, id))
    }

    /// All known users as `(id, username)`, ordered by id.
    pub fn list_users(&self) -> Result<Vec<(i64, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, username FROM users ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Returns the number of rows changed (0 when the user does not exist).
    pub fn rename_user(&self, id: i64, new_username: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users SET username = ?1 WHERE id = ?2",
                rusqlite::params![new_username, id],
            )?;
            Ok(changed)
        })
    }
}

pub fn user_exists(conn: &Connection, id: i64) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", [id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

pub fn username_of(conn: &Connection, id: i64) -> Result<Option<String>> {
    let name = conn
        .query_row("SELECT username FROM users WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(name)
}

/// Of the given ids, the ones with no user row.
pub fn missing_user_ids(conn: &Connection, ids: &[i64]) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT 1 FROM users WHERE id = ?1")?;
    let mut missing = Vec::new();
    for &id in ids {
        if !stmt.exists([id])? {
            missing.push(id);
        }
    }
    Ok(missing)
}

fn query_user<P: rusqlite::ToSql>(
    conn: &Connection,
    predicate: &str,
    value: P,
) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE {}", USER_COLUMNS, predicate);
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password_hash: row.get(2)?,
                email: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .optional()?;

    Ok(row)
}

#[cfg(test)]
mod tests {
    use crate::Database;
    use crate::queries::is_unique_violation;

    #[test]
    fn duplicate_username_is_a_unique_violation() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("alice", "s$d", None).unwrap();

        let err = db.create_user("alice", "s$d", None).unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[test]
    fn missing_ids_are_reported() {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("alice", "s$d", Some("a@example.com")).unwrap();

        let missing = db
            .with_conn(|conn| super::missing_user_ids(conn, &[a, a + 10]))
            .unwrap();
        assert_eq!(missing, vec![a + 10]);
        assert_eq!(
            db.get_user_by_email("a@example.com").unwrap().unwrap().id,
            a
        );
    }

    #[test]
    fn rename_changes_lookup_key() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_user("before", "s$d", None).unwrap();

        assert_eq!(db.rename_user(id, "after").unwrap(), 1);
        assert!(db.get_user_by_username("before").unwrap().is_none());
        assert_eq!(db.get_user_by_username("after").unwrap().unwrap().id, id);
        assert_eq!(db.rename_user(id + 1, "nobody").unwrap(), 0);
    }
}
