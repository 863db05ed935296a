use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error};
use uuid::Uuid;

use chime_db::Database;
use chime_types::UserId;
use chime_types::events::ServerEvent;
use chime_types::models::RosterEntry;

use crate::registry::{ConnectionRegistry, SendOutcome};

/// Where presence data comes from. Calls may block.
pub trait PresenceSource: Send + Sync + 'static {
    /// Every known user as `(id, username)`.
    fn roster(&self) -> anyhow::Result<Vec<(UserId, String)>>;

    fn accepted_friend_ids(&self, user_id: UserId) -> anyhow::Result<Vec<UserId>>;
}

impl PresenceSource for Database {
    fn roster(&self) -> anyhow::Result<Vec<(UserId, String)>> {
        self.list_users()
    }

    fn accepted_friend_ids(&self, user_id: UserId) -> anyhow::Result<Vec<UserId>> {
        Database::accepted_friend_ids(self, user_id)
    }
}

/// Pushes online/offline changes and roster snapshots to live connections.
///
/// Sends go through `ConnectionRegistry::try_send`, so a failed delivery is
/// reported back to the caller instead of evicting mid-broadcast.
#[derive(Clone)]
pub struct PresenceNotifier {
    source: Arc<dyn PresenceSource>,
}

impl PresenceNotifier {
    pub fn new(source: Arc<dyn PresenceSource>) -> Self {
        Self { source }
    }

    pub async fn friends_of(&self, user_id: UserId) -> anyhow::Result<Vec<UserId>> {
        let source = self.source.clone();
        tokio::task::spawn_blocking(move || source.accepted_friend_ids(user_id)).await?
    }

    pub async fn roster(&self, online: &HashSet<UserId>) -> anyhow::Result<Vec<RosterEntry>> {
        let source = self.source.clone();
        let users = tokio::task::spawn_blocking(move || source.roster()).await??;

        Ok(users
            .into_iter()
            .map(|(user_id, username)| RosterEntry {
                user_id,
                username,
                is_online: online.contains(&user_id),
            })
            .collect())
    }

    /// Tells `user_id`'s online friends about the change, then refreshes
    /// everyone's roster. Returns the deliveries that failed.
    pub(crate) async fn announce(
        &self,
        registry: &ConnectionRegistry,
        user_id: UserId,
        online: bool,
    ) -> Vec<(UserId, Uuid)> {
        let mut failed = Vec::new();

        match self.friends_of(user_id).await {
            Ok(friends) => {
                for friend_id in friends {
                    let event = ServerEvent::FriendStatus {
                        friend_id: user_id,
                        is_online: online,
                    };
                    if let SendOutcome::Failed(conn_id) = registry.try_send(friend_id, event).await
                    {
                        failed.push((friend_id, conn_id));
                    }
                }
            }
            Err(e) => error!("Failed to load friends of {}: {:#}", user_id, e),
        }

        failed.extend(self.broadcast_roster(registry).await);
        failed
    }

    pub(crate) async fn broadcast_roster(&self, registry: &ConnectionRegistry) -> Vec<(UserId, Uuid)> {
        let online = registry.online_ids().await;
        let users = match self.roster(&online).await {
            Ok(users) => users,
            Err(e) => {
                error!("Failed to build roster: {:#}", e);
                return Vec::new();
            }
        };

        debug!("Broadcasting roster to {} connections", online.len());
        let mut failed = Vec::new();
        for user_id in online {
            let event = ServerEvent::AllUsers {
                users: users.clone(),
            };
            if let SendOutcome::Failed(conn_id) = registry.try_send(user_id, event).await {
                failed.push((user_id, conn_id));
            }
        }
        failed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory presence data for registry tests.
    #[derive(Default)]
    pub struct FakeSource {
        pub users: Vec<(UserId, String)>,
        pub friends: HashMap<UserId, Vec<UserId>>,
    }

    impl FakeSource {
        pub fn with_users(names: &[&str]) -> Self {
            Self {
                users: names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| (i as UserId + 1, name.to_string()))
                    .collect(),
                friends: HashMap::new(),
            }
        }

        pub fn befriend(mut self, a: UserId, b: UserId) -> Self {
            self.friends.entry(a).or_default().push(b);
            self.friends.entry(b).or_default().push(a);
            self
        }
    }

    impl PresenceSource for FakeSource {
        fn roster(&self) -> anyhow::Result<Vec<(UserId, String)>> {
            Ok(self.users.clone())
        }

        fn accepted_friend_ids(&self, user_id: UserId) -> anyhow::Result<Vec<UserId>> {
            Ok(self.friends.get(&user_id).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn roster_marks_online_users() {
        let notifier = PresenceNotifier::new(Arc::new(FakeSource::with_users(&["a", "b"])));
        let online = HashSet::from([2]);

        let roster = notifier.roster(&online).await.unwrap();
        assert_eq!(roster.len(), 2);
        assert!(!roster[0].is_online);
        assert!(roster[1].is_online);
        assert_eq!(roster[1].username, "b");
    }

    #[tokio::test]
    async fn database_is_a_presence_source() {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("alice", "s$d", None).unwrap();
        let source: Arc<dyn PresenceSource> = Arc::new(db);

        let notifier = PresenceNotifier::new(source);
        let roster = notifier.roster(&HashSet::from([a])).await.unwrap();
        assert_eq!(roster[0].username, "alice");
        assert!(roster[0].is_online);
        assert!(notifier.friends_of(a).await.unwrap().is_empty());
    }
}
