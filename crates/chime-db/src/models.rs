//! Database row types. These map directly to SQLite rows and are distinct
//! from the chime-types wire models.

pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub email: Option<String>,
    pub created_at: String,
}

pub struct FriendRow {
    pub id: i64,
    pub user_a: i64,
    pub user_b: i64,
    pub status: String,
    pub initiator: i64,
}

impl FriendRow {
    /// The other side of the relation, if `user_id` is a party to it.
    pub fn counterparty(&self, user_id: i64) -> Option<i64> {
        if self.user_a == user_id {
            Some(self.user_b)
        } else if self.user_b == user_id {
            Some(self.user_a)
        } else {
            None
        }
    }
}

/// A relation joined with the other party's username, from one user's view.
pub struct FriendViewRow {
    pub relation_id: i64,
    pub other_id: i64,
    pub other_username: String,
    pub status: String,
    pub initiator: i64,
}

pub struct GroupRow {
    pub id: i64,
    pub name: String,
    pub creator_id: i64,
}

pub struct MembershipRow {
    pub group_id: i64,
    pub group_name: String,
    pub role: String,
    pub member_count: i64,
}

pub struct MessageRow {
    pub id: i64,
    pub sender_id: i64,
    pub sender_name: String,
    pub receiver_kind: String,
    pub receiver_id: i64,
    pub content: String,
    pub content_type: String,
    pub created_at: String,
}

pub struct AttemptRow {
    pub username: String,
    pub count: u32,
    pub last_attempt: i64,
}
