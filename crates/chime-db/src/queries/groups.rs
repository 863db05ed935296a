use anyhow::Result;
use rusqlite::Connection;

use super::OptionalExt;
use crate::Database;
use crate::models::{GroupRow, MembershipRow};

pub fn insert_group(conn: &Connection, name: &str, creator_id: i64) -> Result<i64> {
    conn.execute(
        "INSERT INTO chat_groups (name, creator_id) VALUES (?1, ?2)",
        rusqlite::params![name, creator_id],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Makes `user_id` the owner of `group_id`, upgrading an existing membership.
pub fn insert_owner(conn: &Connection, group_id: i64, user_id: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO group_members (group_id, user_id, role) VALUES (?1, ?2, 'owner')
         ON CONFLICT(group_id, user_id) DO UPDATE SET role = 'owner'",
        [group_id, user_id],
    )?;
    Ok(())
}

/// Adds a plain member. Existing memberships are left untouched; returns
/// whether a row was inserted.
pub fn insert_member_ignore(conn: &Connection, group_id: i64, user_id: i64) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO group_members (group_id, user_id, role) VALUES (?1, ?2, 'member')",
        [group_id, user_id],
    )?;
    Ok(changed == 1)
}

pub fn get_group(conn: &Connection, group_id: i64) -> Result<Option<GroupRow>> {
    let row = conn
        .query_row(
            "SELECT id, name, creator_id FROM chat_groups WHERE id = ?1",
            [group_id],
            |row| {
                Ok(GroupRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    creator_id: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn member_role(conn: &Connection, group_id: i64, user_id: i64) -> Result<Option<String>> {
    let role = conn
        .query_row(
            "SELECT role FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            [group_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(role)
}

impl Database {
    pub fn get_group(&self, group_id: i64) -> Result<Option<GroupRow>> {
        self.with_conn(|conn| get_group(conn, group_id))
    }

    pub fn member_role(&self, group_id: i64, user_id: i64) -> Result<Option<String>> {
        self.with_conn(|conn| member_role(conn, group_id, user_id))
    }

    pub fn is_group_member(&self, group_id: i64, user_id: i64) -> Result<bool> {
        Ok(self.member_role(group_id, user_id)?.is_some())
    }

    /// Groups `user_id` belongs to, with the caller's role and the member count.
    pub fn groups_for_user(&self, user_id: i64) -> Result<Vec<MembershipRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT g.id, g.name, m.role,
                        (SELECT COUNT(*) FROM group_members c WHERE c.group_id = g.id)
                 FROM group_members m
                 JOIN chat_groups g ON g.id = m.group_id
                 WHERE m.user_id = ?1
                 ORDER BY g.id",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(MembershipRow {
                        group_id: row.get(0)?,
                        group_name: row.get(1)?,
                        role: row.get(2)?,
                        member_count: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn group_ids_for_user(&self, user_id: i64) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT group_id FROM group_members WHERE user_id = ?1 ORDER BY group_id")?;
            let ids = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            Ok(ids)
        })
    }

    pub fn group_member_ids(&self, group_id: i64) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY user_id")?;
            let ids = stmt
                .query_map([group_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            Ok(ids)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creator_is_owner_and_members_are_deduplicated() {
        let db = Database::open_in_memory().unwrap();
        let owner = db.create_user("owner", "s$d", None).unwrap();
        let bob = db.create_user("bob", "s$d", None).unwrap();

        let gid = db
            .with_tx(|tx| {
                let gid = insert_group(tx, "crew", owner)?;
                insert_owner(tx, gid, owner)?;
                for id in [bob, bob, owner] {
                    insert_member_ignore(tx, gid, id)?;
                }
                Ok::<_, anyhow::Error>(gid)
            })
            .unwrap();

        assert_eq!(db.member_role(gid, owner).unwrap().as_deref(), Some("owner"));
        assert_eq!(db.member_role(gid, bob).unwrap().as_deref(), Some("member"));
        assert_eq!(db.group_member_ids(gid).unwrap(), vec![owner, bob]);

        let memberships = db.groups_for_user(bob).unwrap();
        assert_eq!(memberships.len(), 1);
        assert_eq!(memberships[0].group_name, "crew");
        assert_eq!(memberships[0].member_count, 2);
        assert_eq!(db.group_ids_for_user(owner).unwrap(), vec![gid]);
    }

    #[test]
    fn unknown_group_has_no_members() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_group(42).unwrap().is_none());
        assert!(!db.is_group_member(42, 1).unwrap());
        assert!(db.group_member_ids(42).unwrap().is_empty());
    }
}
