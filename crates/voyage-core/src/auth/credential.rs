use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::AuthError;

pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Access token plus the absolute instant it stops being accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Build a credential issued at `now` that lives for `expires_in_secs`.
    ///
    /// The expiry is kept at millisecond precision, the resolution it is persisted with.
    /// Lifetimes that do not fit the calendar are rejected.
    pub fn issued(
        access_token: impl Into<String>,
        token_type: impl Into<String>,
        expires_in_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<Self, AuthError> {
        let expires_at = Duration::try_seconds(expires_in_secs)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or(AuthError::InvalidExpiry(expires_in_secs))?;
        Ok(Self {
            access_token: access_token.into(),
            token_type: token_type.into(),
            expires_at: expires_at.trunc_subsecs(3),
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Value for the `Authorization` header.
    pub fn authorization_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// Cached identity of the authenticated user as returned by `GET /me`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub login: String,
    pub role: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Fields the backend sends that this client does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserProfile {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_owned()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.role == role
    }
}
