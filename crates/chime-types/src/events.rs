use serde::{Deserialize, Serialize};

use crate::api::{default_page, default_page_size};
use crate::models::{
    ChatMessage, FriendDecision, FriendEntry, GroupSummary, PendingRequest, PrivateMessage,
    ReceiverKind, RosterEntry, UserProfile,
};
use crate::{GroupId, MessageId, UserId};

/// Requests sent FROM client TO server. Every frame is one JSON object whose
/// `action` field selects the variant.
///
/// Unknown fields are ignored, so older clients that still send their own
/// `sender_id` / `user_id` keep working; identity always comes from the
/// authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    Login {
        username: String,
        password: String,
    },

    Register {
        username: String,
        password: String,
        #[serde(default)]
        email: Option<String>,
    },

    /// Attach this connection to an identity that already logged in elsewhere.
    WebOnline { token: String },

    SendMessage {
        receiver_type: ReceiverKind,
        receiver_id: i64,
        content: String,
        #[serde(default)]
        content_type: Option<String>,
    },

    GetMessages {
        receiver_type: ReceiverKind,
        receiver_id: i64,
        #[serde(default = "default_page")]
        page: u32,
        #[serde(default = "default_page_size")]
        page_size: u32,
    },

    CreateGroup {
        group_name: String,
        #[serde(default)]
        initial_members: Vec<UserId>,
    },

    AddGroupMember {
        group_id: GroupId,
        user_id: UserId,
    },

    UpdateNickname { nickname: String },

    AddFriend { to_user_id: UserId },

    RespondFriend {
        request_id: i64,
        decision: FriendDecision,
    },

    RemoveFriend { friend_id: UserId },

    GetFriends,

    GetGroups,

    GetPendingRequests,

    Logout,
}

impl ClientAction {
    /// Every `action` value the server understands. Used to tell an unknown
    /// action apart from a known action with malformed fields.
    pub const NAMES: &'static [&'static str] = &[
        "login",
        "register",
        "web_online",
        "send_message",
        "get_messages",
        "create_group",
        "add_group_member",
        "update_nickname",
        "add_friend",
        "respond_friend",
        "remove_friend",
        "get_friends",
        "get_groups",
        "get_pending_requests",
        "logout",
    ];

    /// Actions allowed before the connection has authenticated. Logout is
    /// among them so it always closes the connection.
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            Self::Login { .. } | Self::Register { .. } | Self::WebOnline { .. } | Self::Logout
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Login { .. } => "login",
            Self::Register { .. } => "register",
            Self::WebOnline { .. } => "web_online",
            Self::SendMessage { .. } => "send_message",
            Self::GetMessages { .. } => "get_messages",
            Self::CreateGroup { .. } => "create_group",
            Self::AddGroupMember { .. } => "add_group_member",
            Self::UpdateNickname { .. } => "update_nickname",
            Self::AddFriend { .. } => "add_friend",
            Self::RespondFriend { .. } => "respond_friend",
            Self::RemoveFriend { .. } => "remove_friend",
            Self::GetFriends => "get_friends",
            Self::GetGroups => "get_groups",
            Self::GetPendingRequests => "get_pending_requests",
            Self::Logout => "logout",
        }
    }
}

/// Stable error codes carried by the `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    Conflict,
    NotFound,
    Internal,
    Protocol,
}

/// Events sent FROM server TO client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServerEvent {
    LoginResponse {
        success: bool,
        user_id: UserId,
        username: String,
        token: String,
    },

    RegisterResponse {
        success: bool,
        user_id: UserId,
        username: String,
    },

    Error {
        kind: ErrorKind,
        message: String,
    },

    /// Full roster snapshot, pushed after every presence change.
    AllUsers { users: Vec<RosterEntry> },

    FriendList { friends: Vec<FriendEntry> },

    GroupList { groups: Vec<GroupSummary> },

    PendingRequests { requests: Vec<PendingRequest> },

    NewPrivateMessage { message: PrivateMessage },

    NewGroupMessage {
        group_id: GroupId,
        message: ChatMessage,
    },

    /// Acknowledges a `send_message` with the persisted id.
    MessageSent {
        message_id: MessageId,
        receiver_type: ReceiverKind,
        receiver_id: i64,
    },

    /// One page of history. `receiver_id` is `None` for the login replay of the
    /// caller's private inbox across all conversations.
    MessageHistory {
        receiver_type: ReceiverKind,
        receiver_id: Option<i64>,
        messages: Vec<ChatMessage>,
    },

    GroupCreated {
        group_id: GroupId,
        group_name: String,
    },

    AddedToGroup {
        group_id: GroupId,
        group_name: String,
    },

    GroupMemberAdded {
        group_id: GroupId,
        user_id: UserId,
    },

    FriendRequest {
        request_id: i64,
        from_user_id: UserId,
        from_username: String,
    },

    FriendRequestSent {
        request_id: i64,
        to_user_id: UserId,
    },

    FriendRequestRejected {
        request_id: i64,
        user_id: UserId,
    },

    FriendAdded {
        friend_id: UserId,
        friend_info: UserProfile,
    },

    FriendRemoved { friend_id: UserId },

    FriendStatus {
        friend_id: UserId,
        is_online: bool,
    },

    NicknameUpdated {
        success: bool,
        new_nickname: String,
    },

    FriendNicknameUpdated {
        friend_id: UserId,
        new_nickname: String,
    },
}

impl ServerEvent {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::LoginResponse { .. } => "login_response",
            Self::RegisterResponse { .. } => "register_response",
            Self::Error { .. } => "error",
            Self::AllUsers { .. } => "all_users",
            Self::FriendList { .. } => "friend_list",
            Self::GroupList { .. } => "group_list",
            Self::PendingRequests { .. } => "pending_requests",
            Self::NewPrivateMessage { .. } => "new_private_message",
            Self::NewGroupMessage { .. } => "new_group_message",
            Self::MessageSent { .. } => "message_sent",
            Self::MessageHistory { .. } => "message_history",
            Self::GroupCreated { .. } => "group_created",
            Self::AddedToGroup { .. } => "added_to_group",
            Self::GroupMemberAdded { .. } => "group_member_added",
            Self::FriendRequest { .. } => "friend_request",
            Self::FriendRequestSent { .. } => "friend_request_sent",
            Self::FriendRequestRejected { .. } => "friend_request_rejected",
            Self::FriendAdded { .. } => "friend_added",
            Self::FriendRemoved { .. } => "friend_removed",
            Self::FriendStatus { .. } => "friend_status",
            Self::NicknameUpdated { .. } => "nickname_updated",
            Self::FriendNicknameUpdated { .. } => "friend_nickname_updated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_unit_and_defaulted_actions() {
        let logout: ClientAction = serde_json::from_value(json!({ "action": "logout" })).unwrap();
        assert!(matches!(logout, ClientAction::Logout));
        assert!(logout.is_public());

        let history: ClientAction = serde_json::from_value(json!({
            "action": "get_messages",
            "receiver_type": "group",
            "receiver_id": 3,
        }))
        .unwrap();
        match history {
            ClientAction::GetMessages { page, page_size, receiver_type, .. } => {
                assert_eq!(page, 1);
                assert_eq!(page_size, 20);
                assert_eq!(receiver_type, ReceiverKind::Group);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn ignores_client_supplied_identity_fields() {
        let action: ClientAction = serde_json::from_value(json!({
            "action": "send_message",
            "sender_id": 99,
            "receiver_type": "private",
            "receiver_id": 2,
            "content": "hi",
        }))
        .unwrap();
        assert_eq!(action.name(), "send_message");
    }

    #[test]
    fn every_variant_name_is_registered() {
        let samples = [
            json!({ "action": "get_friends" }),
            json!({ "action": "get_groups" }),
            json!({ "action": "get_pending_requests" }),
            json!({ "action": "respond_friend", "request_id": 1, "decision": "accept" }),
            json!({ "action": "web_online", "token": "t" }),
        ];
        for sample in samples {
            let action: ClientAction = serde_json::from_value(sample).unwrap();
            assert!(ClientAction::NAMES.contains(&action.name()));
        }
    }

    #[test]
    fn server_events_carry_action_tag() {
        let event = ServerEvent::FriendStatus {
            friend_id: 4,
            is_online: false,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], "friend_status");
        assert_eq!(value["friend_id"], 4);
        assert_eq!(value["action"], event.name());

        let error = serde_json::to_value(ServerEvent::error(ErrorKind::NotFound, "nope")).unwrap();
        assert_eq!(error["action"], "error");
        assert_eq!(error["kind"], "not_found");
    }
}
