use std::sync::Arc;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use validator::ValidateEmail;

use chime_db::Database;
use chime_db::queries::is_unique_violation;
use chime_types::models::UserProfile;

use crate::clock::Clock;
use crate::error::{ServiceError, ServiceResult};

const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 20;
const SALT_LEN: usize = 8;

const INVALID_CREDENTIALS: &str = "invalid username or password";

/// Failed-login lockout: `threshold` failures inside `window_secs` lock the
/// username until the window has passed since the last failure.
#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    pub window_secs: i64,
    pub threshold: u32,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            window_secs: 300,
            threshold: 5,
        }
    }
}

/// Produces a `salt$digest` record for storage.
pub fn hash_password(password: &str) -> String {
    let salt = hex::encode(rand::random::<[u8; SALT_LEN]>());
    let digest = digest_with_salt(password, &salt);
    format!("{}${}", salt, digest)
}

/// Constant-time check of `password` against a stored `salt$digest` record.
/// A malformed record never verifies.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    let candidate = digest_with_salt(password, salt);
    candidate.as_bytes().ct_eq(digest.as_bytes()).into()
}

fn digest_with_salt(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn validate_username(username: &str) -> ServiceResult<()> {
    let len = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
        return Err(ServiceError::validation(format!(
            "username must be {}-{} characters",
            USERNAME_MIN, USERNAME_MAX
        )));
    }
    if !username.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ServiceError::validation(
            "username may only contain letters and digits",
        ));
    }
    Ok(())
}

pub struct CredentialService {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    policy: LockoutPolicy,
}

impl CredentialService {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>, policy: LockoutPolicy) -> Self {
        Self { db, clock, policy }
    }

    /// Creates the account. Does not authenticate anybody.
    pub fn register(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> ServiceResult<UserProfile> {
        validate_username(username)?;
        if password.is_empty() {
            return Err(ServiceError::validation("password must not be empty"));
        }

        let email = email.map(str::trim).filter(|e| !e.is_empty());
        if let Some(email) = email {
            if !email.validate_email() {
                return Err(ServiceError::validation("invalid email address"));
            }
        }

        if self.db.get_user_by_username(username)?.is_some() {
            return Err(ServiceError::conflict("username already taken"));
        }
        if let Some(email) = email {
            if self.db.get_user_by_email(email)?.is_some() {
                return Err(ServiceError::conflict("email already registered"));
            }
        }

        let password_hash = hash_password(password);
        let user_id = match self.db.create_user(username, &password_hash, email) {
            Ok(id) => id,
            Err(e) if is_unique_violation(&e) => {
                // Lost a race with a concurrent registration; report which key collided.
                let taken = self.db.get_user_by_username(username)?.is_some();
                return Err(ServiceError::conflict(if taken {
                    "username already taken"
                } else {
                    "email already registered"
                }));
            }
            Err(e) => return Err(e.into()),
        };

        info!("Registered user {} ({})", username, user_id);
        Ok(UserProfile {
            user_id,
            username: username.to_string(),
        })
    }

    pub fn login(&self, username: &str, password: &str) -> ServiceResult<UserProfile> {
        if username.is_empty() || password.is_empty() {
            return Err(ServiceError::validation(
                "username and password are required",
            ));
        }

        let now = self.clock.unix_now();
        self.db
            .purge_login_attempts(now - self.policy.window_secs)?;

        if let Some(attempt) = self.db.get_login_attempt(username)? {
            let elapsed = now - attempt.last_attempt;
            // Purge keeps rows with `elapsed == window_secs`, so they still lock.
            if attempt.count >= self.policy.threshold && elapsed <= self.policy.window_secs {
                let remaining = (self.policy.window_secs - elapsed).max(1);
                warn!("Login rejected for locked account {}", username);
                return Err(ServiceError::auth(format!(
                    "account locked, retry in {} seconds",
                    remaining
                )));
            }
        }

        let user = self.db.get_user_by_username(username)?;
        match user {
            Some(user) if verify_password(password, &user.password_hash) => {
                self.db.reset_login_attempts(username, now)?;
                Ok(UserProfile {
                    user_id: user.id,
                    username: user.username,
                })
            }
            _ => {
                self.db.record_failed_login(username, now)?;
                Err(ServiceError::auth(INVALID_CREDENTIALS))
            }
        }
    }

    /// Current public profile of `user_id`.
    pub fn profile(&self, user_id: i64) -> ServiceResult<UserProfile> {
        let user = self
            .db
            .get_user_by_id(user_id)?
            .ok_or_else(|| ServiceError::not_found("user not found"))?;
        Ok(UserProfile {
            user_id: user.id,
            username: user.username,
        })
    }

    /// Changes the username of an existing account.
    pub fn rename(&self, user_id: i64, new_username: &str) -> ServiceResult<UserProfile> {
        validate_username(new_username)?;

        if self.db.get_user_by_id(user_id)?.is_none() {
            return Err(ServiceError::not_found("user not found"));
        }
        if let Some(existing) = self.db.get_user_by_username(new_username)? {
            if existing.id != user_id {
                return Err(ServiceError::conflict("username already taken"));
            }
        }

        match self.db.rename_user(user_id, new_username) {
            Ok(0) => return Err(ServiceError::not_found("user not found")),
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(ServiceError::conflict("username already taken"));
            }
            Err(e) => return Err(e.into()),
        }

        info!("User {} renamed to {}", user_id, new_username);
        Ok(UserProfile {
            user_id,
            username: new_username.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    fn service() -> (CredentialService, Arc<ManualClock>, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let svc = CredentialService::new(db.clone(), clock.clone(), LockoutPolicy::default());
        (svc, clock, db)
    }

    #[test]
    fn hash_record_shape_and_verification() {
        let record = hash_password("hunter2");
        let (salt, digest) = record.split_once('$').unwrap();
        assert_eq!(salt.len(), SALT_LEN * 2);
        assert_eq!(digest.len(), 64);
        assert!(verify_password("hunter2", &record));
        assert!(!verify_password("hunter3", &record));
        assert!(!verify_password("hunter2", "no-separator"));
        assert_ne!(hash_password("hunter2"), record);
    }

    #[test]
    fn register_validates_input() {
        let (svc, _, _) = service();
        for bad in ["ab", "abcdefghijklmnopqrstu", "has space", "dash-ed"] {
            let err = svc.register(bad, "pw", None).unwrap_err();
            assert!(matches!(err, ServiceError::Validation(_)), "{}", bad);
        }
        assert!(matches!(
            svc.register("alice", "", None),
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            svc.register("alice", "pw", Some("not-an-email")),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn register_reports_colliding_field() {
        let (svc, _, db) = service();
        let alice = svc.register("alice", "pw", Some("a@example.com")).unwrap();
        assert_eq!(alice.username, "alice");

        let stored = db.get_user_by_id(alice.user_id).unwrap().unwrap();
        assert_ne!(stored.password_hash, "pw");

        let err = svc.register("alice", "pw", None).unwrap_err();
        assert_eq!(err.to_string(), "username already taken");
        let err = svc.register("alice2", "pw", Some("a@example.com")).unwrap_err();
        assert_eq!(err.to_string(), "email already registered");
    }

    #[test]
    fn login_is_generic_about_failures() {
        let (svc, _, _) = service();
        svc.register("alice", "secret", None).unwrap();

        let wrong = svc.login("alice", "nope").unwrap_err();
        let missing = svc.login("nobody", "nope").unwrap_err();
        assert_eq!(wrong.to_string(), INVALID_CREDENTIALS);
        assert_eq!(missing.to_string(), INVALID_CREDENTIALS);
        assert!(matches!(svc.login("", "x"), Err(ServiceError::Validation(_))));

        let profile = svc.login("alice", "secret").unwrap();
        assert_eq!(profile.username, "alice");
    }

    #[test]
    fn lockout_after_threshold_and_release_after_window() {
        let (svc, clock, db) = service();
        svc.register("alice", "secret", None).unwrap();

        for _ in 0..5 {
            clock.advance(Duration::seconds(1));
            assert!(svc.login("alice", "wrong").is_err());
        }

        clock.advance(Duration::seconds(10));
        let err = svc.login("alice", "secret").unwrap_err();
        assert!(matches!(err, ServiceError::Auth(_)));
        assert_eq!(err.to_string(), "account locked, retry in 290 seconds");

        clock.advance(Duration::seconds(300));
        svc.login("alice", "secret").unwrap();
        assert_eq!(db.get_login_attempt("alice").unwrap().unwrap().count, 0);
    }

    #[test]
    fn lock_holds_through_the_last_second_of_the_window() {
        let (svc, clock, db) = service();
        svc.register("alice", "secret", None).unwrap();
        for _ in 0..5 {
            assert!(svc.login("alice", "wrong").is_err());
        }

        clock.advance(Duration::seconds(300));
        let err = svc.login("alice", "secret").unwrap_err();
        assert_eq!(err.to_string(), "account locked, retry in 1 seconds");
        assert_eq!(db.get_login_attempt("alice").unwrap().unwrap().count, 5);

        clock.advance(Duration::seconds(1));
        svc.login("alice", "secret").unwrap();
    }

    #[test]
    fn empty_credentials_do_not_count_toward_lockout() {
        let (svc, _, db) = service();
        for _ in 0..10 {
            let _ = svc.login("alice", "");
        }
        assert!(db.get_login_attempt("alice").unwrap().is_none());
    }

    #[test]
    fn rename_rules() {
        let (svc, _, _) = service();
        let alice = svc.register("alice", "pw", None).unwrap();
        svc.register("bob", "pw", None).unwrap();

        assert!(matches!(
            svc.rename(alice.user_id, "bob"),
            Err(ServiceError::Conflict(_))
        ));
        assert!(matches!(
            svc.rename(alice.user_id + 100, "carol"),
            Err(ServiceError::NotFound(_))
        ));

        let renamed = svc.rename(alice.user_id, "alicia").unwrap();
        assert_eq!(renamed.username, "alicia");
        svc.login("alicia", "pw").unwrap();
    }
}
