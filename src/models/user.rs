use chrono::{DateTime, Utc};
use gotcha::Schematic;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// User (Database Model)
// ============================================================================

/// An operator account. `token` is the bearer token from the last login.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub uuid: Uuid,
    pub email: String,
    pub password_hash: String,
    pub token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// API Request/Response Types
// ============================================================================

/// Body of `POST /user/` and `POST /auth/`
#[derive(Debug, Clone, Deserialize, Schematic)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    /// Trimmed email, rejected unless it looks like an address
    pub fn normalized_email(&self) -> Option<String> {
        let email = self.email.trim();
        let (local, domain) = email.split_once('@')?;
        if local.is_empty() || domain.is_empty() || email.contains(char::is_whitespace) {
            return None;
        }
        Some(email.to_lowercase())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Schematic)]
pub struct UserResponse {
    pub uuid: String,
    pub email: String,
    pub updated_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            uuid: user.uuid.to_string(),
            email: user.email,
            updated_at: user.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Schematic)]
pub struct AuthTokenResponse {
    pub authorization_token: String,
}

#[derive(Debug, Clone, Serialize, Schematic)]
pub struct AuthCheckResponse {
    pub authorized: bool,
    /// Absent when authenticated with the configured service token
    pub user: Option<UserResponse>,
}
