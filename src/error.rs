// Error handling module
// Defines the session error taxonomy and the shareable refresh failure type

use thiserror::Error;

/// Errors surfaced by the session manager and the authenticated request gate
#[derive(Error, Debug)]
pub enum AuthError {
    /// Stored token failed structural decode
    #[error("Malformed credential: {0}")]
    MalformedCredential(String),

    /// Network or HTTP failure while renewing credentials
    #[error("Token refresh failed: {0}")]
    RefreshTransportFailure(String),

    /// Refresh attempted with no refresh token stored
    #[error("No refresh token available")]
    MissingRefreshToken,

    /// No valid session exists; the caller must log in again
    #[error("Not authenticated")]
    Unauthenticated,

    /// Identity endpoint refused the login
    #[error("Login rejected: {status} - {message}")]
    LoginRejected { status: u16, message: String },

    /// Identity endpoint answered with a payload we cannot use
    #[error("Invalid identity response: {0}")]
    InvalidResponse(String),

    /// Caller set the Authorization header on a gated request
    #[error("Authorization header must not be set on gated requests")]
    AuthorizationPreset,

    /// Transport failure on a non-refresh call
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// True for the outcomes that mean "log in again" rather than a fault
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            AuthError::Unauthenticated
                | AuthError::MissingRefreshToken
                | AuthError::RefreshTransportFailure(_)
                | AuthError::MalformedCredential(_)
        )
    }
}

/// Outcome of a failed renewal.
///
/// Cloneable so one result can be handed to every caller that joined the
/// same in-flight refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("No refresh token available")]
    MissingRefreshToken,

    #[error("{0}")]
    Transport(String),

    /// Logout or a new login replaced the session while the call was out
    #[error("Session changed during refresh")]
    Superseded,
}

impl From<RefreshFailure> for AuthError {
    fn from(failure: RefreshFailure) -> Self {
        match failure {
            RefreshFailure::MissingRefreshToken => AuthError::MissingRefreshToken,
            RefreshFailure::Transport(msg) => AuthError::RefreshTransportFailure(msg),
            RefreshFailure::Superseded => AuthError::Unauthenticated,
        }
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, AuthError>;
