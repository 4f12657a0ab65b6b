use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, IntoUrl, Method, Request, RequestBuilder, Response};

use crate::auth::{Freshness, SessionManager};
use crate::error::AuthError;

/// HTTP client that attaches the session's bearer token to every request
#[derive(Clone)]
pub struct AuthenticatedClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    session: SessionManager,
}

impl AuthenticatedClient {
    /// Create a gate sharing the session's HTTP client
    pub fn new(session: SessionManager) -> Self {
        Self {
            client: session.http().clone(),
            session,
        }
    }

    /// Start building a request; send it with [`AuthenticatedClient::fetch`]
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        self.client.request(method, url)
    }

    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Send `request` with a fresh access token.
    ///
    /// Fails with [`AuthError::Unauthenticated`] before any network I/O when
    /// no valid session exists. Non-2xx responses are returned as-is.
    pub async fn fetch(&self, mut request: Request) -> Result<Response, AuthError> {
        let method = request.method().clone();
        let url = request.url().clone();

        if request.headers().contains_key(AUTHORIZATION) {
            tracing::warn!(method = %method, url = %url, "Request already carries Authorization");
            return Err(AuthError::AuthorizationPreset);
        }

        let access_token = match self.session.ensure_fresh().await {
            Freshness::Authenticated { access_token } => access_token,
            Freshness::Unauthenticated => {
                tracing::debug!(method = %method, url = %url, "No valid session; request not sent");
                return Err(AuthError::Unauthenticated);
            }
        };

        let mut value = HeaderValue::from_str(&format!("Bearer {}", access_token)).map_err(|_| {
            AuthError::MalformedCredential("access token is not a valid header value".to_string())
        })?;
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);

        tracing::debug!(method = %method, url = %url, "Sending authenticated request");

        match self.client.execute(request).await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    tracing::debug!(status = %status, "Request successful");
                } else {
                    tracing::warn!(status = %status, url = %url, "Received error response");
                }
                Ok(response)
            }
            Err(e) => {
                let error_kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection_failed"
                } else if e.is_request() {
                    "request_error"
                } else if e.is_body() {
                    "body_error"
                } else {
                    "unknown"
                };

                tracing::warn!(
                    error_kind = error_kind,
                    error = %e,
                    url = %url,
                    "HTTP request error"
                );
                Err(AuthError::Transport(e))
            }
        }
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }
}

impl SessionManager {
    /// Send `request` through an [`AuthenticatedClient`] for this session
    pub async fn authenticated_fetch(&self, request: Request) -> Result<Response, AuthError> {
        AuthenticatedClient::new(self.clone()).fetch(request).await
    }
}
