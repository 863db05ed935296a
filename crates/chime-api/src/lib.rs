pub mod auth;
pub mod clock;
pub mod error;
pub mod friends;
pub mod groups;
pub mod messages;
pub mod tokens;

pub use auth::{CredentialService, LockoutPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ServiceError, ServiceResult};
pub use friends::FriendService;
pub use groups::GroupService;
pub use messages::MessageService;
pub use tokens::TokenIssuer;
