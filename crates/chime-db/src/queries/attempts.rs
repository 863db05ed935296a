use anyhow::Result;

use super::OptionalExt;
use crate::Database;
use crate::models::AttemptRow;

impl Database {
    /// Drops every record whose last attempt is older than `before` (unix seconds).
    pub fn purge_login_attempts(&self, before: i64) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let removed = conn.execute(
                "DELETE FROM login_attempts WHERE last_attempt < ?1",
                [before],
            )?;
            Ok(removed)
        })
    }

    pub fn get_login_attempt(&self, username: &str) -> Result<Option<AttemptRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT username, count, last_attempt FROM login_attempts WHERE username = ?1",
                    [username],
                    |row| {
                        Ok(AttemptRow {
                            username: row.get(0)?,
                            count: row.get(1)?,
                            last_attempt: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Counts one more failure for `username` and stamps it with `now`.
    pub fn record_failed_login(&self, username: &str, now: i64) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO login_attempts (username, count, last_attempt) VALUES (?1, 1, ?2)
                 ON CONFLICT(username) DO UPDATE SET
                     count = count + 1,
                     last_attempt = excluded.last_attempt",
                rusqlite::params![username, now],
            )?;
            Ok(())
        })
    }

    pub fn reset_login_attempts(&self, username: &str, now: i64) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO login_attempts (username, count, last_attempt) VALUES (?1, 0, ?2)
                 ON CONFLICT(username) DO UPDATE SET count = 0, last_attempt = excluded.last_attempt",
                rusqlite::params![username, now],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::Database;

    #[test]
    fn failures_accumulate_and_reset() {
        let db = Database::open_in_memory().unwrap();

        db.record_failed_login("alice", 100).unwrap();
        db.record_failed_login("alice", 105).unwrap();
        let row = db.get_login_attempt("alice").unwrap().unwrap();
        assert_eq!(row.count, 2);
        assert_eq!(row.last_attempt, 105);

        db.reset_login_attempts("alice", 110).unwrap();
        assert_eq!(db.get_login_attempt("alice").unwrap().unwrap().count, 0);
    }

    #[test]
    fn purge_removes_only_stale_records() {
        let db = Database::open_in_memory().unwrap();
        db.record_failed_login("old", 10).unwrap();
        db.record_failed_login("fresh", 500).unwrap();

        assert_eq!(db.purge_login_attempts(100).unwrap(), 1);
        assert!(db.get_login_attempt("old").unwrap().is_none());
        assert!(db.get_login_attempt("fresh").unwrap().is_some());
    }
}
