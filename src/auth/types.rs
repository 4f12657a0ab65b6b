// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which stored token to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Username/password pair for the password grant
#[derive(Clone)]
pub struct LoginCredentials {
    pub username: String,
    pub password: String,
}

impl LoginCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Token pair returned by the login and refresh endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[allow(dead_code)]
    pub token_type: Option<String>,
}

/// Refresh endpoint request body
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Result of the "ensure valid credential" gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// A usable access token, possibly just renewed
    Authenticated { access_token: String },
    /// No session; the caller must log in
    Unauthenticated,
}

impl Freshness {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Freshness::Authenticated { .. })
    }
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
}

/// Diagnostic snapshot of the session
#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub state: SessionState,
    pub subject: Option<String>,
    pub username: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Seconds until the access token lapses
    #[serde(serialize_with = "serialize_secs")]
    pub expires_in: Option<Duration>,
    pub next_refresh_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_secs")]
    pub next_refresh_in: Option<Duration>,
    pub refresh_in_flight: bool,
}

fn serialize_secs<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(d) => serializer.serialize_some(&d.num_seconds()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_credentials_debug_redacts_password() {
        let creds = LoginCredentials::new("alice", "hunter2");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_token_response_without_refresh_token() {
        let parsed: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a.b.c","token_type":"bearer"}"#).unwrap();
        assert_eq!(parsed.access_token, "a.b.c");
        assert!(parsed.refresh_token.is_none());
    }

    #[test]
    fn test_status_serializes_seconds() {
        let status = AuthStatus {
            authenticated: true,
            state: SessionState::Authenticated,
            subject: Some("user-1".to_string()),
            username: None,
            expires_at: None,
            expires_in: Some(Duration::seconds(90)),
            next_refresh_at: None,
            next_refresh_in: None,
            refresh_in_flight: false,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["expires_in"], 90);
        assert_eq!(json["state"], "authenticated");
        assert!(json["next_refresh_in"].is_null());
    }
}
