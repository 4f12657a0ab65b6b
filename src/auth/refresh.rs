// Identity endpoint calls: login, refresh, logout and liveness

use anyhow::{Context, Result};
use reqwest::Client;

use super::codec;
use super::types::{LoginCredentials, RefreshRequest, TokenResponse};
use crate::error::AuthError;

/// Identity endpoint locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub base_url: String,
    pub login_path: String,
    pub refresh_path: String,
    pub logout_path: String,
    pub whoami_path: String,
}

impl Endpoints {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            login_path: "/api/v1/login".to_string(),
            refresh_path: "/api/v1/refresh".to_string(),
            logout_path: "/api/v1/logout".to_string(),
            whoami_path: "/api/v1/users/whoami".to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn login_url(&self) -> String {
        self.url(&self.login_path)
    }

    pub fn refresh_url(&self) -> String {
        self.url(&self.refresh_path)
    }

    pub fn logout_url(&self) -> String {
        self.url(&self.logout_path)
    }

    pub fn whoami_url(&self) -> String {
        self.url(&self.whoami_path)
    }
}

/// Server verdict on a locally unexpired token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Accepted,
    Rejected { status: u16 },
    /// No answer; the local expiry check stands
    Unreachable,
}

/// Thin client for the identity endpoint
#[derive(Clone)]
pub struct IdentityClient {
    client: Client,
    endpoints: Endpoints,
}

impl IdentityClient {
    pub fn new(client: Client, endpoints: Endpoints) -> Self {
        Self { client, endpoints }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Password grant, form-encoded
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<TokenResponse, AuthError> {
        let url = self.endpoints.login_url();
        tracing::info!(username = %credentials.username, "Logging in via {}", url);

        let form = [
            ("username", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
            ("grant_type", "password"),
        ];

        let response = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "Login rejected");
            return Err(AuthError::LoginRejected {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let data: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("login payload: {}", e)))?;

        if !codec::is_structurally_valid(&data.access_token) {
            return Err(AuthError::InvalidResponse(
                "login response does not contain a well-formed access_token".to_string(),
            ));
        }
        if data.refresh_token.as_deref().map_or(true, str::is_empty) {
            return Err(AuthError::InvalidResponse(
                "login response does not contain refresh_token".to_string(),
            ));
        }

        Ok(data)
    }

    /// Exchange the refresh token for a new pair
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let url = self.endpoints.refresh_url();
        tracing::info!("Refreshing access token via {}", url);

        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .context("Failed to send refresh request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                body = %error_text,
                "Refresh request rejected"
            );
            anyhow::bail!("refresh failed: {} - {}", status, error_text);
        }

        let data: TokenResponse = response
            .json()
            .await
            .context("Failed to parse refresh response")?;

        if !codec::is_structurally_valid(&data.access_token) {
            anyhow::bail!("refresh response does not contain a well-formed access_token");
        }

        Ok(data)
    }

    /// Tell the server the session is over
    pub async fn logout(&self, access_token: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoints.logout_url())
            .bearer_auth(access_token)
            .send()
            .await
            .context("Failed to send logout request")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("logout returned {}", status);
        }
        Ok(())
    }

    /// Ask the server whether it still honours `access_token`
    pub async fn whoami(&self, access_token: &str) -> Liveness {
        let result = self
            .client
            .get(self.endpoints.whoami_url())
            .bearer_auth(access_token)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => Liveness::Accepted,
            Ok(response) => Liveness::Rejected {
                status: response.status().as_u16(),
            },
            Err(e) => {
                tracing::warn!(error = %e, "Liveness check unreachable");
                Liveness::Unreachable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        let endpoints = Endpoints::new("http://localhost:7860/");
        assert_eq!(endpoints.login_url(), "http://localhost:7860/api/v1/login");
        assert_eq!(endpoints.refresh_url(), "http://localhost:7860/api/v1/refresh");
        assert_eq!(endpoints.logout_url(), "http://localhost:7860/api/v1/logout");
        assert_eq!(
            endpoints.whoami_url(),
            "http://localhost:7860/api/v1/users/whoami"
        );
    }

    #[test]
    fn test_custom_paths() {
        let mut endpoints = Endpoints::new("https://id.example.com");
        endpoints.refresh_path = "token/refresh".to_string();
        assert_eq!(
            endpoints.refresh_url(),
            "https://id.example.com/token/refresh"
        );
    }

    #[tokio::test]
    async fn test_login_posts_password_grant() {
        let mut server = mockito::Server::new_async().await;
        let access = codec::encode_unsigned(&serde_json::json!({ "sub": "u", "exp": 4102444800u64 }));
        let mock = server
            .mock("POST", "/api/v1/login")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("username".into(), "alice".into()),
                mockito::Matcher::UrlEncoded("password".into(), "secret".into()),
                mockito::Matcher::UrlEncoded("grant_type".into(), "password".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({ "access_token": access, "refresh_token": "r-1" }).to_string(),
            )
            .create_async()
            .await;

        let identity = IdentityClient::new(Client::new(), Endpoints::new(server.url()));
        let tokens = identity
            .login(&LoginCredentials::new("alice", "secret"))
            .await
            .unwrap();

        assert_eq!(tokens.refresh_token.as_deref(), Some("r-1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/login")
            .with_status(401)
            .with_body("Incorrect username or password")
            .create_async()
            .await;

        let identity = IdentityClient::new(Client::new(), Endpoints::new(server.url()));
        let err = identity
            .login(&LoginCredentials::new("alice", "wrong"))
            .await
            .unwrap_err();

        match err {
            AuthError::LoginRejected { status, message } => {
                assert_eq!(status, 401);
                assert!(message.contains("Incorrect"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_rejects_malformed_payload() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/refresh")
            .match_body(mockito::Matcher::Json(
                serde_json::json!({ "refresh_token": "r-1" }),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"not-a-jwt"}"#)
            .create_async()
            .await;

        let identity = IdentityClient::new(Client::new(), Endpoints::new(server.url()));
        assert!(identity.refresh("r-1").await.is_err());
    }

    #[tokio::test]
    async fn test_whoami_verdicts() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/users/whoami")
            .match_header("authorization", "Bearer good")
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("GET", "/api/v1/users/whoami")
            .match_header("authorization", "Bearer revoked")
            .with_status(401)
            .create_async()
            .await;

        let identity = IdentityClient::new(Client::new(), Endpoints::new(server.url()));
        assert_eq!(identity.whoami("good").await, Liveness::Accepted);
        assert_eq!(
            identity.whoami("revoked").await,
            Liveness::Rejected { status: 401 }
        );

        let offline = IdentityClient::new(Client::new(), Endpoints::new("http://127.0.0.1:9"));
        assert_eq!(offline.whoami("good").await, Liveness::Unreachable);
    }
}
