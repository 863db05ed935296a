use serde::{Deserialize, Serialize};

use crate::UserId;

// -- Session token claims --

/// Claims carried by the session token handed out in `login_response`.
/// A secondary connection presents the token via `web_online` to attach to
/// the same identity without re-entering the password.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub username: String,
    pub exp: usize,
}

// -- History paging --

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

pub fn default_page() -> u32 {
    DEFAULT_PAGE
}

pub fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}
