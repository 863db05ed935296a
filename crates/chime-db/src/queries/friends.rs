use anyhow::Result;
use rusqlite::Connection;

use super::OptionalExt;
use crate::Database;
use crate::models::{FriendRow, FriendViewRow};

const FRIEND_COLUMNS: &str = "id, user_a, user_b, status, initiator";

fn map_friend(row: &rusqlite::Row) -> rusqlite::Result<FriendRow> {
    Ok(FriendRow {
        id: row.get(0)?,
        user_a: row.get(1)?,
        user_b: row.get(2)?,
        status: row.get(3)?,
        initiator: row.get(4)?,
    })
}

/// Relation between two users in either order.
pub fn find_relation(conn: &Connection, a: i64, b: i64) -> Result<Option<FriendRow>> {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    let sql = format!(
        "SELECT {} FROM friends WHERE user_a = ?1 AND user_b = ?2",
        FRIEND_COLUMNS
    );
    let row = conn.query_row(&sql, [lo, hi], map_friend).optional()?;
    Ok(row)
}

pub fn get_relation(conn: &Connection, relation_id: i64) -> Result<Option<FriendRow>> {
    let sql = format!("SELECT {} FROM friends WHERE id = ?1", FRIEND_COLUMNS);
    let row = conn.query_row(&sql, [relation_id], map_friend).optional()?;
    Ok(row)
}

/// Inserts a pending relation in canonical order and returns its id.
pub fn insert_relation(conn: &Connection, initiator: i64, other: i64) -> Result<i64> {
    let (lo, hi) = if initiator < other {
        (initiator, other)
    } else {
        (other, initiator)
    };
    conn.execute(
        "INSERT INTO friends (user_a, user_b, status, initiator) VALUES (?1, ?2, 'pending', ?3)",
        [lo, hi, initiator],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Flips a relation to accepted. Returns false when it was no longer pending.
pub fn accept_pending_relation(conn: &Connection, relation_id: i64) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE friends SET status = 'accepted' WHERE id = ?1 AND status = 'pending'",
        [relation_id],
    )?;
    Ok(changed == 1)
}

/// Deletes a relation only while it is still pending.
pub fn delete_pending_relation(conn: &Connection, relation_id: i64) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM friends WHERE id = ?1 AND status = 'pending'",
        [relation_id],
    )?;
    Ok(changed == 1)
}

impl Database {
    pub fn get_relation(&self, relation_id: i64) -> Result<Option<FriendRow>> {
        self.with_conn(|conn| get_relation(conn, relation_id))
    }

    pub fn find_relation(&self, a: i64, b: i64) -> Result<Option<FriendRow>> {
        self.with_conn(|conn| find_relation(conn, a, b))
    }

    /// Every relation `user_id` is party to, with the other side's username.
    pub fn list_relations(&self, user_id: i64) -> Result<Vec<FriendViewRow>> {
        self.with_conn(|conn| query_relation_views(conn, user_id, "1 = 1"))
    }

    /// Pending relations that someone else initiated toward `user_id`.
    pub fn incoming_requests(&self, user_id: i64) -> Result<Vec<FriendViewRow>> {
        self.with_conn(|conn| {
            query_relation_views(conn, user_id, "f.status = 'pending' AND f.initiator != ?1")
        })
    }

    pub fn accepted_friend_ids(&self, user_id: i64) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT CASE WHEN user_a = ?1 THEN user_b ELSE user_a END
                 FROM friends
                 WHERE (user_a = ?1 OR user_b = ?1) AND status = 'accepted'
                 ORDER BY id",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            Ok(ids)
        })
    }

    /// Removes an accepted friendship. Returns false when none existed.
    pub fn delete_friendship(&self, a: i64, b: i64) -> Result<bool> {
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "DELETE FROM friends WHERE user_a = ?1 AND user_b = ?2 AND status = 'accepted'",
                [lo, hi],
            )?;
            Ok(changed == 1)
        })
    }
}

fn query_relation_views(
    conn: &Connection,
    user_id: i64,
    extra: &str,
) -> Result<Vec<FriendViewRow>> {
    let sql = format!(
        "SELECT f.id, u.id, u.username, f.status, f.initiator
         FROM friends f
         JOIN users u ON u.id = CASE WHEN f.user_a = ?1 THEN f.user_b ELSE f.user_a END
         WHERE (f.user_a = ?1 OR f.user_b = ?1) AND {}
         ORDER BY f.id",
        extra
    );
    let mut stmt = conn.prepare(&sql)?;

    let rows = stmt
        .query_map([user_id], |row| {
            Ok(FriendViewRow {
                relation_id: row.get(0)?,
                other_id: row.get(1)?,
                other_username: row.get(2)?,
                status: row.get(3)?,
                initiator: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> (Database, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("alice", "s$d", None).unwrap();
        let b = db.create_user("bob", "s$d", None).unwrap();
        (db, a, b)
    }

    #[test]
    fn relation_is_stored_canonically() {
        let (db, a, b) = seed();
        let id = db
            .with_tx(|tx| insert_relation(tx, b, a))
            .unwrap();

        let row = db.find_relation(b, a).unwrap().unwrap();
        assert_eq!(row.id, id);
        assert_eq!((row.user_a, row.user_b), (a, b));
        assert_eq!(row.initiator, b);
        assert_eq!(row.counterparty(a), Some(b));
    }

    #[test]
    fn accept_only_succeeds_once() {
        let (db, a, b) = seed();
        let id = db.with_tx(|tx| insert_relation(tx, a, b)).unwrap();

        assert!(db.with_tx(|tx| accept_pending_relation(tx, id)).unwrap());
        assert!(!db.with_tx(|tx| accept_pending_relation(tx, id)).unwrap());
        assert!(!db.with_tx(|tx| delete_pending_relation(tx, id)).unwrap());
        assert_eq!(db.accepted_friend_ids(a).unwrap(), vec![b]);
        assert_eq!(db.accepted_friend_ids(b).unwrap(), vec![a]);
    }

    #[test]
    fn incoming_requests_exclude_own() {
        let (db, a, b) = seed();
        db.with_tx(|tx| insert_relation(tx, a, b)).unwrap();

        assert!(db.incoming_requests(a).unwrap().is_empty());
        let incoming = db.incoming_requests(b).unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].other_username, "alice");
        assert_eq!(db.list_relations(a).unwrap()[0].other_username, "bob");
    }

    #[test]
    fn delete_friendship_requires_accepted() {
        let (db, a, b) = seed();
        let id = db.with_tx(|tx| insert_relation(tx, a, b)).unwrap();
        assert!(!db.delete_friendship(a, b).unwrap());

        db.with_tx(|tx| accept_pending_relation(tx, id)).unwrap();
        assert!(db.delete_friendship(b, a).unwrap());
        assert!(db.find_relation(a, b).unwrap().is_none());
    }
}
