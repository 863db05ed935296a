use std::sync::Arc;

use tracing::{info, warn};

use chime_db::Database;
use chime_db::models::FriendViewRow;
use chime_db::queries::{self, is_unique_violation};
use chime_types::UserId;
use chime_types::models::{
    FriendDecision, FriendEntry, FriendStatus, PendingRequest, RequestDirection, UserProfile,
};

use crate::error::{ServiceError, ServiceResult};

/// Outcome of a successful `request`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub request_id: i64,
    pub from: UserProfile,
    pub to: UserId,
}

/// Outcome of a successful `respond`: the decision and the other party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub decision: FriendDecision,
    pub counterparty: UserProfile,
}

/// Friend-request state machine over the `friends` table.
pub struct FriendService {
    db: Arc<Database>,
}

impl FriendService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn request(&self, from: UserId, to: UserId) -> ServiceResult<SentRequest> {
        if from == to {
            return Err(ServiceError::conflict("cannot befriend yourself"));
        }

        let result = self.db.with_tx(|tx| -> ServiceResult<SentRequest> {
            let Some(sender) = queries::username_of(tx, from)? else {
                return Err(ServiceError::not_found("user not found"));
            };
            if !queries::user_exists(tx, to)? {
                return Err(ServiceError::not_found("user not found"));
            }

            if let Some(existing) = queries::find_relation(tx, from, to)? {
                return Err(match existing.status.as_str() {
                    "accepted" => ServiceError::conflict("already friends"),
                    _ => ServiceError::conflict("request already sent"),
                });
            }

            let request_id = queries::insert_relation(tx, from, to)?;
            Ok(SentRequest {
                request_id,
                from: UserProfile {
                    user_id: from,
                    username: sender,
                },
                to,
            })
        });

        match result {
            Ok(sent) => {
                info!("Friend request {} from {} to {}", sent.request_id, from, to);
                Ok(sent)
            }
            Err(ServiceError::Storage(e)) if is_unique_violation(&e) => {
                Err(ServiceError::conflict("request already sent"))
            }
            Err(e) => Err(e),
        }
    }

    pub fn respond(
        &self,
        relation_id: i64,
        actor: UserId,
        decision: FriendDecision,
    ) -> ServiceResult<Resolution> {
        let counterparty = self.db.with_tx(|tx| -> ServiceResult<UserProfile> {
            let relation = queries::get_relation(tx, relation_id)?
                .ok_or_else(|| ServiceError::not_found("friend request not found"))?;
            let Some(other) = relation.counterparty(actor) else {
                return Err(ServiceError::not_found("friend request not found"));
            };
            if relation.initiator == actor {
                return Err(ServiceError::auth("cannot act on your own request"));
            }
            if relation.status != FriendStatus::Pending.as_str() {
                return Err(ServiceError::conflict("request already handled"));
            }

            let applied = match decision {
                FriendDecision::Accept => queries::accept_pending_relation(tx, relation_id)?,
                FriendDecision::Reject => queries::delete_pending_relation(tx, relation_id)?,
            };
            if !applied {
                return Err(ServiceError::conflict("request already handled"));
            }

            let username = queries::username_of(tx, other)?
                .unwrap_or_else(|| "unknown".to_string());
            Ok(UserProfile {
                user_id: other,
                username,
            })
        })?;

        info!("Friend request {} {:?} by {}", relation_id, decision, actor);
        Ok(Resolution {
            decision,
            counterparty,
        })
    }

    /// Every relation touching `user_id`, accepted or pending, in either direction.
    pub fn list(&self, user_id: UserId) -> ServiceResult<Vec<FriendEntry>> {
        let rows = self.db.list_relations(user_id)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| to_entry(user_id, row))
            .collect())
    }

    /// Incoming requests still waiting for `user_id` to decide.
    pub fn pending(&self, user_id: UserId) -> ServiceResult<Vec<PendingRequest>> {
        let rows = self.db.incoming_requests(user_id)?;
        Ok(rows
            .into_iter()
            .map(|row| PendingRequest {
                request_id: row.relation_id,
                sender_id: row.other_id,
                username: row.other_username,
            })
            .collect())
    }

    pub fn remove(&self, user_id: UserId, friend_id: UserId) -> ServiceResult<()> {
        if user_id == friend_id {
            return Err(ServiceError::conflict("cannot unfriend yourself"));
        }
        if !self.db.delete_friendship(user_id, friend_id)? {
            return Err(ServiceError::conflict("not currently friends"));
        }
        info!("Users {} and {} are no longer friends", user_id, friend_id);
        Ok(())
    }

    pub fn accepted_friend_ids(&self, user_id: UserId) -> ServiceResult<Vec<UserId>> {
        Ok(self.db.accepted_friend_ids(user_id)?)
    }
}

fn to_entry(user_id: UserId, row: FriendViewRow) -> Option<FriendEntry> {
    let status = match row.status.parse::<FriendStatus>() {
        Ok(status) => status,
        Err(e) => {
            warn!("Skipping relation {}: {}", row.relation_id, e);
            return None;
        }
    };
    let direction = if row.initiator == user_id {
        RequestDirection::Outgoing
    } else {
        RequestDirection::Incoming
    };

    Some(FriendEntry {
        relation_id: row.relation_id,
        user_id: row.other_id,
        username: row.other_username,
        status,
        direction,
        is_online: false,
    })
}
