mod attempts;
mod friends;
mod groups;
mod messages;
mod users;

pub use friends::{
    accept_pending_relation, delete_pending_relation, find_relation, get_relation, insert_relation,
};
pub use groups::{get_group, insert_group, insert_member_ignore, insert_owner, member_role};
pub use users::{missing_user_ids, user_exists, username_of};

use anyhow::Result;
use rusqlite::ffi;

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// True when `err` is a UNIQUE / PRIMARY KEY constraint failure, i.e. a
/// concurrent writer won the race for the same key.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(e, _)) => {
            e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        }
        _ => false,
    }
}
