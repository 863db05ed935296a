use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use chime_api::{ServiceError, ServiceResult};
use chime_types::events::{ErrorKind, ServerEvent};
use chime_types::{GroupId, UserId};

use crate::presence::PresenceNotifier;

/// What a connection's writer task receives.
#[derive(Debug)]
pub enum Outbound {
    Event(ServerEvent),
    /// Close the socket after flushing what came before.
    Close,
}

/// Sending half of one connection's outbound queue, tagged with a
/// per-connection id so teardown of an old connection never touches a newer
/// binding for the same user.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            conn_id: Uuid::new_v4(),
            tx,
        };
        (handle, rx)
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// False once the writer side is gone.
    pub fn push(&self, event: ServerEvent) -> bool {
        self.tx.send(Outbound::Event(event)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Delivered,
    Offline,
    Failed(Uuid),
}

struct Session {
    handle: ConnectionHandle,
    groups: HashSet<GroupId>,
}

/// Who is online, and how to reach them. At most one session per user.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: RwLock<HashMap<UserId, Session>>,
    presence: PresenceNotifier,
}

impl ConnectionRegistry {
    pub fn new(presence: PresenceNotifier) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                presence,
            }),
        }
    }

    /// Binds `user_id` to `handle`. An existing live session is a Conflict
    /// unless `takeover` is set, in which case the old connection is told
    /// and closed.
    pub async fn bind(
        &self,
        user_id: UserId,
        handle: ConnectionHandle,
        takeover: bool,
    ) -> ServiceResult<()> {
        let conn_id = handle.conn_id();
        let displaced = {
            let mut sessions = self.inner.sessions.write().await;
            if let Some(existing) = sessions.get(&user_id) {
                if !takeover && existing.handle.is_open() {
                    return Err(ServiceError::conflict("user already online"));
                }
            }
            sessions
                .insert(
                    user_id,
                    Session {
                        handle,
                        groups: HashSet::new(),
                    },
                )
                .map(|old| old.handle)
        };

        if let Some(old) = displaced {
            if old.conn_id() != conn_id {
                info!("User {} taken over by connection {}", user_id, conn_id);
                old.push(ServerEvent::error(
                    ErrorKind::Conflict,
                    "signed in from another connection",
                ));
                old.close();
            }
        }

        info!("User {} online on connection {}", user_id, conn_id);
        let failed = self.inner.presence.announce(self, user_id, true).await;
        self.evict(failed).await;
        Ok(())
    }

    /// Drops whatever session `user_id` has. Returns false if there was none.
    pub async fn unbind(&self, user_id: UserId) -> bool {
        self.teardown(user_id, None).await
    }

    /// Drops the session only if it still belongs to `conn_id`.
    pub async fn unbind_connection(&self, user_id: UserId, conn_id: Uuid) -> bool {
        self.teardown(user_id, Some(conn_id)).await
    }

    /// Best-effort delivery. A closed connection is unbound on the spot.
    pub async fn send(&self, user_id: UserId, event: ServerEvent) -> bool {
        match self.try_send(user_id, event).await {
            SendOutcome::Delivered => true,
            SendOutcome::Offline => false,
            SendOutcome::Failed(conn_id) => {
                self.evict(vec![(user_id, conn_id)]).await;
                false
            }
        }
    }

    pub(crate) async fn try_send(&self, user_id: UserId, event: ServerEvent) -> SendOutcome {
        let handle = {
            let sessions = self.inner.sessions.read().await;
            sessions.get(&user_id).map(|s| s.handle.clone())
        };

        match handle {
            None => SendOutcome::Offline,
            Some(handle) if handle.push(event) => SendOutcome::Delivered,
            Some(handle) => SendOutcome::Failed(handle.conn_id()),
        }
    }

    pub async fn subscribe(&self, user_id: UserId, group_ids: impl IntoIterator<Item = GroupId>) {
        let mut sessions = self.inner.sessions.write().await;
        if let Some(session) = sessions.get_mut(&user_id) {
            session.groups.extend(group_ids);
        }
    }

    pub async fn is_subscribed(&self, user_id: UserId, group_id: GroupId) -> bool {
        let sessions = self.inner.sessions.read().await;
        sessions
            .get(&user_id)
            .is_some_and(|s| s.groups.contains(&group_id))
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.inner.sessions.read().await.contains_key(&user_id)
    }

    pub async fn online_ids(&self) -> HashSet<UserId> {
        self.inner.sessions.read().await.keys().copied().collect()
    }

    pub async fn online_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Re-sends the roster to every connection, e.g. after a rename.
    pub async fn broadcast_roster(&self) {
        let failed = self.inner.presence.broadcast_roster(self).await;
        self.evict(failed).await;
    }

    async fn teardown(&self, user_id: UserId, conn_id: Option<Uuid>) -> bool {
        if !self.remove_session(user_id, conn_id).await {
            return false;
        }
        info!("User {} offline", user_id);

        let failed = self.inner.presence.announce(self, user_id, false).await;
        self.evict(failed).await;
        true
    }

    /// Unbinds users whose delivery failed. Each eviction announces the user
    /// offline, which can fail further deliveries; those join the queue.
    async fn evict(&self, failed: Vec<(UserId, Uuid)>) {
        let mut queue: VecDeque<(UserId, Uuid)> = failed.into();
        while let Some((user_id, conn_id)) = queue.pop_front() {
            if !self.remove_session(user_id, Some(conn_id)).await {
                continue;
            }
            warn!("Evicted user {} after failed delivery", user_id);
            queue.extend(self.inner.presence.announce(self, user_id, false).await);
        }
    }

    async fn remove_session(&self, user_id: UserId, conn_id: Option<Uuid>) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        let owned = sessions
            .get(&user_id)
            .is_some_and(|s| conn_id.is_none_or(|id| id == s.handle.conn_id()));
        if owned {
            sessions.remove(&user_id);
        } else {
            debug!("No session of user {} to remove", user_id);
        }
        owned
    }
}
