use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub full_name: String,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Refresh tokens currently honoured for this user. Logout removes entries.
    #[serde(default)]
    pub refresh_tokens: Vec<String>,
    /// SHA-256 hex digest of the outstanding password-reset token.
    pub reset_token_hash: Option<String>,
    #[serde(default, with = "crate::models::timestamp::option")]
    pub reset_token_expires: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::models::timestamp::option")]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(with = "crate::models::timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "crate::models::timestamp")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl User {
    pub const COLLECTION: &'static str = "users";

    pub fn new(username: &str, email: &str, full_name: &str, password_hash: String) -> Self {
        let now = Utc::now();
        User {
            id: Uuid::new_v4().to_string(),
            username: username.trim().to_string(),
            email: email.trim().to_lowercase(),
            password_hash,
            full_name: full_name.trim().to_string(),
            avatar: None,
            bio: None,
            is_active: true,
            refresh_tokens: Vec::new(),
            reset_token_hash: None,
            reset_token_expires: None,
            last_login: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn reset_token_valid(&self, token_hash: &str, now: DateTime<Utc>) -> bool {
        match (&self.reset_token_hash, self.reset_token_expires) {
            (Some(stored), Some(expires)) => stored == token_hash && expires > now,
            _ => false,
        }
    }
}

/// What other clients get to see about a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicUser {
    pub id: String,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    #[serde(default, with = "crate::models::timestamp::option")]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(with = "crate::models::timestamp")]
    pub created_at: DateTime<Utc>,
}

impl From<User> for PublicUser {
    fn from(u: User) -> Self {
        PublicUser {
            id: u.id,
            username: u.username,
            email: u.email,
            full_name: u.full_name,
            avatar: u.avatar,
            bio: u.bio,
            last_login: u.last_login,
            created_at: u.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn new_user_normalizes_email() {
        let user = User::new(" jane ", " Jane@Example.COM ", "Jane Doe", "hash".into());
        assert_eq!(user.username, "jane");
        assert_eq!(user.email, "jane@example.com");
        assert!(user.is_active);
    }

    #[test]
    fn public_user_drops_secrets() {
        let mut user = User::new("jane", "jane@example.com", "Jane", "hash".into());
        user.refresh_tokens.push("rt".into());
        let json = serde_json::to_value(PublicUser::from(user)).unwrap();
        assert!(json.get("password_hash").is_none());
        assert!(json.get("refresh_tokens").is_none());
    }

    #[test]
    fn reset_token_expires() {
        let now = Utc::now();
        let mut user = User::new("jane", "jane@example.com", "Jane", "hash".into());
        assert!(!user.reset_token_valid("abc", now));
        user.reset_token_hash = Some("abc".into());
        user.reset_token_expires = Some(now + Duration::minutes(5));
        assert!(user.reset_token_valid("abc", now));
        assert!(!user.reset_token_valid("abd", now));
        assert!(!user.reset_token_valid("abc", now + Duration::minutes(6)));
    }
}
