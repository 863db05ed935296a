use std::sync::Arc;
use std::time::Duration;

use chime_api::{
    Clock, CredentialService, FriendService, GroupService, LockoutPolicy, MessageService,
    TokenIssuer,
};
use chime_db::Database;

use crate::presence::PresenceNotifier;
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;

/// Per-connection timing and replay depth.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub replay_page_size: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(90),
            replay_page_size: 100,
        }
    }
}

pub type GatewayState = Arc<GatewayContext>;

/// Everything a session needs, wired once at startup.
pub struct GatewayContext {
    pub credentials: Arc<CredentialService>,
    pub tokens: Arc<TokenIssuer>,
    pub friends: Arc<FriendService>,
    pub groups: Arc<GroupService>,
    pub registry: ConnectionRegistry,
    pub router: MessageRouter,
    pub settings: SessionSettings,
}

impl GatewayContext {
    pub fn new(
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        lockout: LockoutPolicy,
        tokens: TokenIssuer,
        settings: SessionSettings,
    ) -> GatewayState {
        let registry = ConnectionRegistry::new(PresenceNotifier::new(db.clone()));
        let groups = Arc::new(GroupService::new(db.clone()));
        let router = MessageRouter::new(
            registry.clone(),
            Arc::new(MessageService::new(db.clone())),
            groups.clone(),
        );

        Arc::new(Self {
            credentials: Arc::new(CredentialService::new(db.clone(), clock, lockout)),
            tokens: Arc::new(tokens),
            friends: Arc::new(FriendService::new(db)),
            groups,
            registry,
            router,
            settings,
        })
    }
}
