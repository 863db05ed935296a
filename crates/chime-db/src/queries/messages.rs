use anyhow::Result;
use rusqlite::Connection;

use crate::Database;
use crate::models::MessageRow;

/// Sender name falls back to "unknown" when the user row is gone.
const MESSAGE_SELECT: &str = "
    SELECT m.id, m.sender_id, COALESCE(u.username, 'unknown'), m.receiver_kind,
           m.receiver_id, m.content, m.content_type, m.created_at
    FROM messages m
    LEFT JOIN users u ON u.id = m.sender_id";

fn map_message(row: &rusqlite::Row) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        sender_name: row.get(2)?,
        receiver_kind: row.get(3)?,
        receiver_id: row.get(4)?,
        content: row.get(5)?,
        content_type: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl Database {
    /// Persists a message and returns it as stored, sender name included.
    pub fn insert_message(
        &self,
        sender_id: i64,
        receiver_kind: &str,
        receiver_id: i64,
        content: &str,
        content_type: &str,
    ) -> Result<MessageRow> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages (sender_id, receiver_kind, receiver_id, content, content_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![sender_id, receiver_kind, receiver_id, content, content_type],
            )?;
            let id = conn.last_insert_rowid();

            let sql = format!("{} WHERE m.id = ?1", MESSAGE_SELECT);
            let row = conn.query_row(&sql, [id], map_message)?;
            Ok(row)
        })
    }

    /// Both directions of the conversation between `a` and `b`, newest first.
    pub fn private_history(
        &self,
        a: i64,
        b: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            query_page(
                conn,
                "m.receiver_kind = 'private'
                 AND ((m.sender_id = ?1 AND m.receiver_id = ?2)
                   OR (m.sender_id = ?2 AND m.receiver_id = ?1))",
                rusqlite::params![a, b, limit, offset],
            )
        })
    }

    pub fn group_history(&self, group_id: i64, limit: u32, offset: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            query_page(
                conn,
                "m.receiver_kind = 'group' AND m.receiver_id = ?1",
                rusqlite::params![group_id, limit, offset],
            )
        })
    }

    /// Latest private messages `user_id` sent or received, across all peers.
    pub fn private_inbox(&self, user_id: i64, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            query_page(
                conn,
                "m.receiver_kind = 'private' AND (m.sender_id = ?1 OR m.receiver_id = ?1)",
                rusqlite::params![user_id, limit, 0u32],
            )
        })
    }
}

/// The last two `params` are always limit and offset.
fn query_page(
    conn: &Connection,
    filter: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<MessageRow>> {
    let n = params.len();
    let sql = format!(
        "{} WHERE {} ORDER BY m.created_at DESC, m.id DESC LIMIT ?{} OFFSET ?{}",
        MESSAGE_SELECT,
        filter,
        n - 1,
        n
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, map_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use crate::Database;

    fn seed() -> (Database, i64, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("alice", "s$d", None).unwrap();
        let b = db.create_user("bob", "s$d", None).unwrap();
        let c = db.create_user("carol", "s$d", None).unwrap();
        (db, a, b, c)
    }

    #[test]
    fn private_history_covers_both_directions_newest_first() {
        let (db, a, b, c) = seed();
        db.insert_message(a, "private", b, "one", "text").unwrap();
        db.insert_message(b, "private", a, "two", "text").unwrap();
        db.insert_message(a, "private", c, "elsewhere", "text").unwrap();
        db.insert_message(a, "private", b, "three", "text").unwrap();

        let page = db.private_history(b, a, 10, 0).unwrap();
        let contents: Vec<_> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["three", "two", "one"]);

        let second = db.private_history(a, b, 2, 2).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].content, "one");
    }

    #[test]
    fn group_history_is_scoped_to_group() {
        let (db, a, b, _) = seed();
        db.insert_message(a, "group", 1, "g1", "text").unwrap();
        db.insert_message(b, "group", 2, "g2", "text").unwrap();

        let page = db.group_history(1, 20, 0).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].sender_name, "alice");
        assert_eq!(page[0].receiver_kind, "group");
    }

    #[test]
    fn inbox_spans_all_peers() {
        let (db, a, b, c) = seed();
        db.insert_message(b, "private", a, "from bob", "text").unwrap();
        db.insert_message(a, "private", c, "to carol", "text").unwrap();
        db.insert_message(b, "private", c, "not mine", "text").unwrap();

        let inbox = db.private_inbox(a, 100).unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].content, "to carol");
    }

    #[test]
    fn insert_returns_stored_row() {
        let (db, a, b, _) = seed();
        let row = db.insert_message(a, "private", b, "hello", "image").unwrap();
        assert_eq!(row.sender_name, "alice");
        assert_eq!(row.content_type, "image");
        assert!(!row.created_at.is_empty());
    }
}
