use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                username        TEXT NOT NULL UNIQUE,
                password_hash   TEXT NOT NULL,
                email           TEXT UNIQUE,
                created_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE friends (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                user_a      INTEGER NOT NULL REFERENCES users(id),
                user_b      INTEGER NOT NULL REFERENCES users(id),
                status      TEXT NOT NULL CHECK (status IN ('pending', 'accepted')),
                initiator   INTEGER NOT NULL REFERENCES users(id),
                created_at  TEXT NOT NULL DEFAULT (datetime('now')),
                CHECK (user_a < user_b),
                UNIQUE (user_a, user_b)
            );

            CREATE INDEX idx_friends_user_b ON friends(user_b);

            CREATE TABLE chat_groups (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                creator_id  INTEGER NOT NULL REFERENCES users(id),
                created_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE group_members (
                group_id    INTEGER NOT NULL REFERENCES chat_groups(id),
                user_id     INTEGER NOT NULL REFERENCES users(id),
                role        TEXT NOT NULL CHECK (role IN ('owner', 'admin', 'member')),
                joined_at   TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (group_id, user_id)
            );

            CREATE INDEX idx_group_members_user ON group_members(user_id);

            CREATE TABLE messages (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id       INTEGER NOT NULL REFERENCES users(id),
                receiver_kind   TEXT NOT NULL CHECK (receiver_kind IN ('private', 'group')),
                receiver_id     INTEGER NOT NULL,
                content         TEXT NOT NULL,
                content_type    TEXT NOT NULL DEFAULT 'text',
                created_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX idx_messages_receiver
                ON messages(receiver_kind, receiver_id, created_at);
            CREATE INDEX idx_messages_sender
                ON messages(receiver_kind, sender_id, created_at);

            CREATE TABLE login_attempts (
                username        TEXT PRIMARY KEY,
                count           INTEGER NOT NULL DEFAULT 0,
                last_attempt    INTEGER NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn friend_rows_must_be_canonical() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO users (username, password_hash) VALUES ('aaa', 'x$y'), ('bbb', 'x$y');",
        )
        .unwrap();

        let reversed = conn.execute(
            "INSERT INTO friends (user_a, user_b, status, initiator) VALUES (2, 1, 'pending', 2)",
            [],
        );
        assert!(reversed.is_err());

        conn.execute(
            "INSERT INTO friends (user_a, user_b, status, initiator) VALUES (1, 2, 'pending', 2)",
            [],
        )
        .unwrap();
        let duplicate = conn.execute(
            "INSERT INTO friends (user_a, user_b, status, initiator) VALUES (1, 2, 'pending', 1)",
            [],
        );
        assert!(duplicate.is_err());
    }
}
