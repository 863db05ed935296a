pub mod api;
pub mod events;
pub mod models;

/// Numeric user identity. Canonical friend pairs compare these numerically.
pub type UserId = i64;

pub type GroupId = i64;

pub type MessageId = i64;
