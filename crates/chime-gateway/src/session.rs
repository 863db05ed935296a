use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use chime_api::{ServiceError, ServiceResult};
use chime_types::UserId;
use chime_types::events::{ClientAction, ServerEvent};
use chime_types::models::{FriendDecision, FriendStatus, UserProfile};

use crate::blocking;
use crate::registry::{ConnectionHandle, Outbound};
use crate::state::GatewayState;

/// How long the writer may keep flushing after the read side has finished.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Serve one websocket until either side gives up. Teardown always runs
/// exactly once, whichever half finishes first.
pub async fn handle_connection(socket: WebSocket, ctx: GatewayState) {
    let (sink, mut stream) = socket.split();
    let (handle, outbound) = ConnectionHandle::new();
    let conn_id = handle.conn_id();
    info!("Connection {} opened", conn_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let mut send_task = tokio::spawn(write_loop(
        sink,
        outbound,
        pong_received.clone(),
        ctx.settings.heartbeat_interval,
        conn_id,
    ));

    let mut session = Session::new(ctx, handle);
    let read_finished = tokio::select! {
        _ = &mut send_task => false,
        _ = session.read_loop(&mut stream, &pong_received) => true,
    };

    session.teardown().await;
    drop(session);

    if read_finished && tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }
    info!("Connection {} closed", conn_id);
}

/// Drains the outbound queue into the socket and keeps the heartbeat.
/// Two missed pongs in a row drop the connection.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    pong_received: Arc<AtomicBool>,
    interval: Duration,
    conn_id: Uuid,
) {
    let mut heartbeat = tokio::time::interval(interval);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Event(event)) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode {} for {}: {}", event.name(), conn_id, e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!("Connection {} missed {} pongs, dropping", conn_id, missed_heartbeats);
                        break;
                    }
                }
                if sink.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Turns a text frame into an action. Shape problems are protocol errors;
/// a known action with bad fields is a validation error.
fn parse_action(text: &str) -> ServiceResult<ClientAction> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| ServiceError::protocol("malformed request"))?;

    let name = value
        .as_object()
        .and_then(|obj| obj.get("action"))
        .and_then(|action| action.as_str())
        .ok_or_else(|| ServiceError::protocol("malformed request"))?;
    if !ClientAction::NAMES.contains(&name) {
        return Err(ServiceError::protocol("unknown action"));
    }

    let name = name.to_string();
    serde_json::from_value(value)
        .map_err(|e| ServiceError::validation(format!("invalid {} request: {}", name, e)))
}

struct Session {
    ctx: GatewayState,
    handle: ConnectionHandle,
    user: Option<UserProfile>,
    /// Set before `bind` is awaited, so a session dropped mid-login still
    /// releases its registry entry.
    bound: Option<UserId>,
}

impl Session {
    fn new(ctx: GatewayState, handle: ConnectionHandle) -> Self {
        Self {
            ctx,
            handle,
            user: None,
            bound: None,
        }
    }

    async fn read_loop(&mut self, stream: &mut SplitStream<WebSocket>, pong_received: &AtomicBool) {
        let idle_timeout = self.ctx.settings.idle_timeout;
        loop {
            let frame = match tokio::time::timeout(idle_timeout, stream.next()).await {
                Err(_) => {
                    warn!("Connection {} idle for {:?}, closing", self.conn_id(), idle_timeout);
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!("Connection {} read error: {}", self.conn_id(), e);
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Message::Text(text) => {
                    if self.handle_frame(text.as_str()).await == Flow::Close {
                        break;
                    }
                }
                Message::Binary(_) => {
                    self.reply_error(&ServiceError::protocol("binary frames are not supported"));
                }
                Message::Pong(_) => pong_received.store(true, Ordering::Release),
                Message::Close(_) => break,
                Message::Ping(_) => {}
            }
        }
    }

    fn conn_id(&self) -> Uuid {
        self.handle.conn_id()
    }

    async fn handle_frame(&mut self, text: &str) -> Flow {
        let action = match parse_action(text) {
            Ok(action) => action,
            Err(err) => {
                warn!(
                    "Connection {} bad frame: {} -- raw: {}",
                    self.conn_id(),
                    err,
                    text.chars().take(200).collect::<String>()
                );
                self.reply_error(&err);
                return Flow::Continue;
            }
        };

        debug!("Connection {} -> {}", self.conn_id(), action.name());
        match self.dispatch(action).await {
            Ok(flow) => flow,
            Err(err) => {
                self.reply_error(&err);
                Flow::Continue
            }
        }
    }

    fn push(&self, event: ServerEvent) {
        self.handle.push(event);
    }

    fn reply_error(&self, err: &ServiceError) {
        match err {
            ServiceError::Storage(e) => error!("Connection {}: {:#}", self.conn_id(), e),
            other => debug!("Connection {} error reply: {}", self.conn_id(), other),
        }
        self.push(err.to_event());
    }

    fn current(&self) -> ServiceResult<UserProfile> {
        self.user
            .clone()
            .ok_or_else(|| ServiceError::auth("not logged in"))
    }

    async fn dispatch(&mut self, action: ClientAction) -> ServiceResult<Flow> {
        if !action.is_public() && self.user.is_none() {
            return Err(ServiceError::auth("not logged in"));
        }

        match action {
            ClientAction::Login { username, password } => self.login(username, password).await?,
            ClientAction::Register {
                username,
                password,
                email,
            } => self.register(username, password, email).await?,
            ClientAction::WebOnline { token } => self.web_online(token).await?,
            ClientAction::Logout => {
                self.logout().await;
                return Ok(Flow::Close);
            }
            other => self.authenticated(other).await?,
        }
        Ok(Flow::Continue)
    }

    async fn register(
        &mut self,
        username: String,
        password: String,
        email: Option<String>,
    ) -> ServiceResult<()> {
        let credentials = self.ctx.credentials.clone();
        let profile =
            blocking(move || credentials.register(&username, &password, email.as_deref())).await?;

        self.push(ServerEvent::RegisterResponse {
            success: true,
            user_id: profile.user_id,
            username: profile.username,
        });
        Ok(())
    }

    async fn login(&mut self, username: String, password: String) -> ServiceResult<()> {
        if self.user.is_some() {
            return Err(ServiceError::conflict("already logged in"));
        }

        let credentials = self.ctx.credentials.clone();
        let profile = blocking(move || credentials.login(&username, &password)).await?;
        self.complete_login(profile, false).await
    }

    async fn web_online(&mut self, token: String) -> ServiceResult<()> {
        if self.user.is_some() {
            return Err(ServiceError::conflict("already logged in"));
        }

        let claims = self.ctx.tokens.verify(&token)?;
        let credentials = self.ctx.credentials.clone();
        let profile = blocking(move || credentials.profile(claims.sub)).await?;
        self.complete_login(profile, true).await
    }

    /// Bind, answer, subscribe, replay, then the friend/group/pending lists.
    async fn complete_login(&mut self, profile: UserProfile, takeover: bool) -> ServiceResult<()> {
        let ctx = self.ctx.clone();
        let user_id = profile.user_id;
        let token = ctx.tokens.issue(user_id, &profile.username)?;

        self.bound = Some(user_id);
        if let Err(e) = ctx
            .registry
            .bind(user_id, self.handle.clone(), takeover)
            .await
        {
            self.bound = None;
            return Err(match e {
                ServiceError::Conflict(_) => ServiceError::auth("user already online"),
                other => other,
            });
        }
        info!(
            "{} ({}) logged in on connection {}",
            profile.username,
            user_id,
            self.conn_id()
        );

        self.push(ServerEvent::LoginResponse {
            success: true,
            user_id,
            username: profile.username.clone(),
            token,
        });
        self.user = Some(profile);

        let groups = ctx.groups.clone();
        let group_ids = blocking(move || groups.group_ids_for_user(user_id)).await?;
        ctx.registry.subscribe(user_id, group_ids).await;

        ctx.router
            .replay(user_id, ctx.settings.replay_page_size)
            .await?;

        self.send_friend_list(user_id).await?;
        self.send_group_list(user_id).await?;
        self.send_pending_requests(user_id).await?;
        Ok(())
    }

    async fn logout(&mut self) {
        if let Some(user_id) = self.release().await {
            info!("User {} logged out", user_id);
        }
    }

    async fn teardown(&mut self) {
        if let Some(user_id) = self.release().await {
            info!("User {} disconnected", user_id);
        }
    }

    /// Unbinds whatever this connection bound, including a login that was
    /// cut short before it finished.
    async fn release(&mut self) -> Option<UserId> {
        let user_id = self.user.take().map(|u| u.user_id).or(self.bound)?;
        self.bound = None;
        self.ctx
            .registry
            .unbind_connection(user_id, self.conn_id())
            .await;
        Some(user_id)
    }

    async fn authenticated(&mut self, action: ClientAction) -> ServiceResult<()> {
        let me = self.current()?;
        let ctx = self.ctx.clone();

        match action {
            ClientAction::SendMessage {
                receiver_type,
                receiver_id,
                content,
                content_type,
            } => {
                let message = ctx
                    .router
                    .send(me.user_id, receiver_type, receiver_id, content, content_type)
                    .await?;
                self.push(ServerEvent::MessageSent {
                    message_id: message.message_id,
                    receiver_type,
                    receiver_id,
                });
            }

            ClientAction::GetMessages {
                receiver_type,
                receiver_id,
                page,
                page_size,
            } => {
                let messages = ctx
                    .router
                    .history(me.user_id, receiver_type, receiver_id, page, page_size)
                    .await?;
                self.push(ServerEvent::MessageHistory {
                    receiver_type,
                    receiver_id: Some(receiver_id),
                    messages,
                });
            }

            ClientAction::CreateGroup {
                group_name,
                initial_members,
            } => {
                let groups = ctx.groups.clone();
                let creator = me.user_id;
                let created =
                    blocking(move || groups.create(creator, &group_name, &initial_members)).await?;
                let group_id = created.group_id;

                ctx.registry.subscribe(creator, [group_id]).await;
                self.push(ServerEvent::GroupCreated {
                    group_id,
                    group_name: created.group_name.clone(),
                });

                for member in created.members {
                    ctx.registry.subscribe(member, [group_id]).await;
                    ctx.registry
                        .send(
                            member,
                            ServerEvent::AddedToGroup {
                                group_id,
                                group_name: created.group_name.clone(),
                            },
                        )
                        .await;
                }
            }

            ClientAction::AddGroupMember { group_id, user_id } => {
                let groups = ctx.groups.clone();
                let inviter = me.user_id;
                let added = blocking(move || groups.add_member(group_id, user_id, inviter)).await?;

                ctx.registry.subscribe(added.user_id, [group_id]).await;
                ctx.registry
                    .send(
                        added.user_id,
                        ServerEvent::AddedToGroup {
                            group_id,
                            group_name: added.group_name,
                        },
                    )
                    .await;

                let groups = ctx.groups.clone();
                let members = blocking(move || groups.member_ids(group_id)).await?;
                for member in members {
                    if member == added.user_id || !ctx.registry.is_subscribed(member, group_id).await
                    {
                        continue;
                    }
                    ctx.registry
                        .send(
                            member,
                            ServerEvent::GroupMemberAdded {
                                group_id,
                                user_id: added.user_id,
                            },
                        )
                        .await;
                }
            }

            ClientAction::UpdateNickname { nickname } => {
                let credentials = ctx.credentials.clone();
                let user_id = me.user_id;
                let profile =
                    blocking(move || credentials.rename(user_id, nickname.trim())).await?;

                self.push(ServerEvent::NicknameUpdated {
                    success: true,
                    new_nickname: profile.username.clone(),
                });
                self.user = Some(profile.clone());

                let friends = ctx.friends.clone();
                let friend_ids = blocking(move || friends.accepted_friend_ids(user_id)).await?;
                for friend_id in friend_ids {
                    ctx.registry
                        .send(
                            friend_id,
                            ServerEvent::FriendNicknameUpdated {
                                friend_id: user_id,
                                new_nickname: profile.username.clone(),
                            },
                        )
                        .await;
                }
                ctx.registry.broadcast_roster().await;
            }

            ClientAction::AddFriend { to_user_id } => {
                let friends = ctx.friends.clone();
                let from = me.user_id;
                let sent = blocking(move || friends.request(from, to_user_id)).await?;

                self.push(ServerEvent::FriendRequestSent {
                    request_id: sent.request_id,
                    to_user_id,
                });
                ctx.registry
                    .send(
                        to_user_id,
                        ServerEvent::FriendRequest {
                            request_id: sent.request_id,
                            from_user_id: sent.from.user_id,
                            from_username: sent.from.username,
                        },
                    )
                    .await;
            }

            ClientAction::RespondFriend {
                request_id,
                decision,
            } => {
                let friends = ctx.friends.clone();
                let actor = me.user_id;
                let resolution =
                    blocking(move || friends.respond(request_id, actor, decision)).await?;
                let other = resolution.counterparty;

                match decision {
                    FriendDecision::Accept => {
                        self.push(ServerEvent::FriendAdded {
                            friend_id: other.user_id,
                            friend_info: other.clone(),
                        });
                        self.push(ServerEvent::FriendStatus {
                            friend_id: other.user_id,
                            is_online: ctx.registry.is_online(other.user_id).await,
                        });
                        ctx.registry
                            .send(
                                other.user_id,
                                ServerEvent::FriendAdded {
                                    friend_id: me.user_id,
                                    friend_info: me.clone(),
                                },
                            )
                            .await;
                        ctx.registry
                            .send(
                                other.user_id,
                                ServerEvent::FriendStatus {
                                    friend_id: me.user_id,
                                    is_online: true,
                                },
                            )
                            .await;
                    }
                    FriendDecision::Reject => {
                        self.push(ServerEvent::FriendRequestRejected {
                            request_id,
                            user_id: other.user_id,
                        });
                        ctx.registry
                            .send(
                                other.user_id,
                                ServerEvent::FriendRequestRejected {
                                    request_id,
                                    user_id: me.user_id,
                                },
                            )
                            .await;
                    }
                }
            }

            ClientAction::RemoveFriend { friend_id } => {
                let friends = ctx.friends.clone();
                let user_id = me.user_id;
                blocking(move || friends.remove(user_id, friend_id)).await?;

                self.push(ServerEvent::FriendRemoved { friend_id });
                ctx.registry
                    .send(friend_id, ServerEvent::FriendRemoved { friend_id: user_id })
                    .await;
            }

            ClientAction::GetFriends => self.send_friend_list(me.user_id).await?,
            ClientAction::GetGroups => self.send_group_list(me.user_id).await?,
            ClientAction::GetPendingRequests => self.send_pending_requests(me.user_id).await?,

            ClientAction::Login { .. }
            | ClientAction::Register { .. }
            | ClientAction::WebOnline { .. }
            | ClientAction::Logout => {}
        }
        Ok(())
    }

    async fn send_friend_list(&self, user_id: UserId) -> ServiceResult<()> {
        let friends = self.ctx.friends.clone();
        let mut entries = blocking(move || friends.list(user_id)).await?;
        for entry in &mut entries {
            entry.is_online = entry.status == FriendStatus::Accepted
                && self.ctx.registry.is_online(entry.user_id).await;
        }
        self.push(ServerEvent::FriendList { friends: entries });
        Ok(())
    }

    async fn send_group_list(&self, user_id: UserId) -> ServiceResult<()> {
        let groups = self.ctx.groups.clone();
        let groups = blocking(move || groups.list_for_user(user_id)).await?;
        self.push(ServerEvent::GroupList { groups });
        Ok(())
    }

    async fn send_pending_requests(&self, user_id: UserId) -> ServiceResult<()> {
        let friends = self.ctx.friends.clone();
        let requests = blocking(move || friends.pending(user_id)).await?;
        self.push(ServerEvent::PendingRequests { requests });
        Ok(())
    }
}
