use std::sync::Arc;

use tracing::debug;

use chime_api::messages::MessageService;
use chime_api::{GroupService, ServiceResult};
use chime_types::events::ServerEvent;
use chime_types::models::{ChatMessage, Delivery, PrivateMessage, ReceiverKind};
use chime_types::{GroupId, UserId};

use crate::blocking;
use crate::registry::ConnectionRegistry;

/// Persists messages, then fans them out to whoever is connected.
#[derive(Clone)]
pub struct MessageRouter {
    registry: ConnectionRegistry,
    messages: Arc<MessageService>,
    groups: Arc<GroupService>,
}

impl MessageRouter {
    pub fn new(
        registry: ConnectionRegistry,
        messages: Arc<MessageService>,
        groups: Arc<GroupService>,
    ) -> Self {
        Self {
            registry,
            messages,
            groups,
        }
    }

    pub async fn send(
        &self,
        sender: UserId,
        receiver_kind: ReceiverKind,
        receiver_id: i64,
        content: String,
        content_type: Option<String>,
    ) -> ServiceResult<ChatMessage> {
        let messages = self.messages.clone();
        let message = blocking(move || {
            messages.store(
                sender,
                receiver_kind,
                receiver_id,
                &content,
                content_type.as_deref(),
            )
        })
        .await?;

        match receiver_kind {
            ReceiverKind::Private => self.deliver_private(&message).await,
            ReceiverKind::Group => self.deliver_group(receiver_id, &message).await?,
        }
        Ok(message)
    }

    async fn deliver_private(&self, message: &ChatMessage) {
        let sent = ServerEvent::NewPrivateMessage {
            message: PrivateMessage {
                message: message.clone(),
                direction: Delivery::Sent,
            },
        };
        self.registry.send(message.sender_id, sent).await;

        if message.receiver_id == message.sender_id {
            return;
        }
        let received = ServerEvent::NewPrivateMessage {
            message: PrivateMessage {
                message: message.clone(),
                direction: Delivery::Received,
            },
        };
        if !self.registry.send(message.receiver_id, received).await {
            debug!(
                "User {} offline, message {} left for replay",
                message.receiver_id, message.message_id
            );
        }
    }

    async fn deliver_group(&self, group_id: GroupId, message: &ChatMessage) -> ServiceResult<()> {
        let groups = self.groups.clone();
        let members = blocking(move || groups.member_ids(group_id)).await?;

        let mut delivered = 0usize;
        for member in members {
            if !self.registry.is_subscribed(member, group_id).await {
                continue;
            }
            let event = ServerEvent::NewGroupMessage {
                group_id,
                message: message.clone(),
            };
            if self.registry.send(member, event).await {
                delivered += 1;
            }
        }
        debug!(
            "Group message {} delivered live to {} members",
            message.message_id, delivered
        );
        Ok(())
    }

    pub async fn history(
        &self,
        user_id: UserId,
        receiver_kind: ReceiverKind,
        receiver_id: i64,
        page: u32,
        page_size: u32,
    ) -> ServiceResult<Vec<ChatMessage>> {
        let messages = self.messages.clone();
        blocking(move || messages.history(user_id, receiver_kind, receiver_id, page, page_size))
            .await
    }

    /// Pushes what `user_id` missed straight to their connection: the private
    /// inbox first, then one `message_history` per group.
    pub async fn replay(&self, user_id: UserId, page_size: u32) -> ServiceResult<()> {
        let messages = self.messages.clone();
        let replay = blocking(move || messages.replay(user_id, page_size)).await?;

        self.registry
            .send(
                user_id,
                ServerEvent::MessageHistory {
                    receiver_type: ReceiverKind::Private,
                    receiver_id: None,
                    messages: replay.inbox,
                },
            )
            .await;

        for (group_id, page) in replay.groups {
            self.registry
                .send(
                    user_id,
                    ServerEvent::MessageHistory {
                        receiver_type: ReceiverKind::Group,
                        receiver_id: Some(group_id),
                        messages: page,
                    },
                )
                .await;
        }
        Ok(())
    }
}
