use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, warn};

use chime_db::Database;
use chime_db::models::MessageRow;
use chime_types::api::MAX_PAGE_SIZE;
use chime_types::models::{ChatMessage, ReceiverKind};
use chime_types::{GroupId, UserId};

use crate::error::{ServiceError, ServiceResult};

const DEFAULT_CONTENT_TYPE: &str = "text";

/// What a user missed: their private inbox page plus one page per group.
#[derive(Debug, Clone, Default)]
pub struct Replay {
    pub inbox: Vec<ChatMessage>,
    pub groups: Vec<(GroupId, Vec<ChatMessage>)>,
}

/// Validation, persistence and paging of chat messages. Delivery is the
/// router's job.
pub struct MessageService {
    db: Arc<Database>,
}

impl MessageService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Checks that `sender` may address the receiver, then persists.
    pub fn store(
        &self,
        sender: UserId,
        receiver_kind: ReceiverKind,
        receiver_id: i64,
        content: &str,
        content_type: Option<&str>,
    ) -> ServiceResult<ChatMessage> {
        if content.trim().is_empty() {
            return Err(ServiceError::validation("message content must not be empty"));
        }
        let content_type = content_type
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE);

        if !self.db.user_exists(sender)? {
            return Err(ServiceError::not_found("user not found"));
        }

        match receiver_kind {
            ReceiverKind::Private => {
                if !self.db.user_exists(receiver_id)? {
                    return Err(ServiceError::not_found("user not found"));
                }
            }
            ReceiverKind::Group => {
                if self.db.get_group(receiver_id)?.is_none() {
                    return Err(ServiceError::not_found("group not found"));
                }
                if !self.db.is_group_member(receiver_id, sender)? {
                    return Err(ServiceError::auth("not a member of this group"));
                }
            }
        }

        let row = self.db.insert_message(
            sender,
            receiver_kind.as_str(),
            receiver_id,
            content,
            content_type,
        )?;
        debug!(
            "Stored message {} from {} to {} {}",
            row.id, sender, receiver_kind, receiver_id
        );
        Ok(to_chat_message(row))
    }

    /// One page of a conversation, newest first. `page` starts at 1.
    pub fn history(
        &self,
        user_id: UserId,
        receiver_kind: ReceiverKind,
        receiver_id: i64,
        page: u32,
        page_size: u32,
    ) -> ServiceResult<Vec<ChatMessage>> {
        if page == 0 {
            return Err(ServiceError::validation("page must be at least 1"));
        }
        let limit = page_size.clamp(1, MAX_PAGE_SIZE);
        let offset = (page - 1).saturating_mul(limit);

        let rows = match receiver_kind {
            ReceiverKind::Private => self.db.private_history(user_id, receiver_id, limit, offset)?,
            ReceiverKind::Group => {
                if !self.db.is_group_member(receiver_id, user_id)? {
                    return Err(ServiceError::not_found("group not found"));
                }
                self.db.group_history(receiver_id, limit, offset)?
            }
        };

        Ok(rows.into_iter().map(to_chat_message).collect())
    }

    /// The most recent `page_size` private messages across every peer, then
    /// the same depth for each group `user_id` belongs to.
    pub fn replay(&self, user_id: UserId, page_size: u32) -> ServiceResult<Replay> {
        let limit = page_size.max(1);
        let inbox = self
            .db
            .private_inbox(user_id, limit)?
            .into_iter()
            .map(to_chat_message)
            .collect();

        let mut groups = Vec::new();
        for group_id in self.db.group_ids_for_user(user_id)? {
            let page = self
                .db
                .group_history(group_id, limit, 0)?
                .into_iter()
                .map(to_chat_message)
                .collect();
            groups.push((group_id, page));
        }

        Ok(Replay { inbox, groups })
    }
}

fn to_chat_message(row: MessageRow) -> ChatMessage {
    let receiver_type = row.receiver_kind.parse().unwrap_or_else(|e| {
        warn!("Corrupt receiver kind on message {}: {}", row.id, e);
        ReceiverKind::Private
    });

    ChatMessage {
        message_id: row.id,
        sender_id: row.sender_id,
        sender_name: row.sender_name,
        receiver_type,
        receiver_id: row.receiver_id,
        content: row.content,
        content_type: row.content_type,
        created_at: parse_timestamp(row.id, &row.created_at),
    }
}

fn parse_timestamp(message_id: i64, raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') has no zone; it is UTC.
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt created_at '{}' on message {}: {}", raw, message_id, e);
            DateTime::default()
        })
}
