use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password};
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{Endpoints, LoginCredentials, SessionOptions};

/// Silent Auth - keeps a bearer-token session alive
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Identity server base URL
    #[arg(short = 'u', long, env = "SILENT_AUTH_BASE_URL", default_value = "http://localhost:7860")]
    pub base_url: String,

    /// Path to the credential database
    #[arg(short = 's', long, env = "SILENT_AUTH_STORE")]
    pub store_path: Option<String>,

    /// Seconds before expiry at which the token is renewed
    #[arg(long, env = "TOKEN_REFRESH_BUFFER", default_value = "300")]
    pub refresh_buffer: u64,

    /// Upper bound on one refresh round-trip, in seconds
    #[arg(long, env = "TOKEN_REFRESH_TIMEOUT", default_value = "30")]
    pub refresh_timeout: u64,

    /// Confirm locally valid tokens with the whoami endpoint
    #[arg(long, env = "LIVENESS_CHECK", default_value = "false")]
    pub liveness_check: bool,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "300")]
    pub http_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Log in with username and password
    Login {
        #[arg(short = 'U', long, env = "SILENT_AUTH_USERNAME")]
        username: Option<String>,

        #[arg(short = 'P', long, env = "SILENT_AUTH_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// End the session and forget stored credentials
    Logout,
    /// Print the local session snapshot as JSON
    Status,
    /// GET a URL with the session's bearer token
    Fetch { url: String },
    /// Keep the session fresh until interrupted
    Watch,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Identity server
    pub base_url: String,
    pub login_path: String,
    pub refresh_path: String,
    pub logout_path: String,
    pub whoami_path: String,

    // Storage
    pub store_path: PathBuf,

    // Refresh behaviour
    pub refresh_buffer_secs: u64,
    pub refresh_timeout_secs: u64,
    pub liveness_check: bool,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let command = args.command.clone();
        Ok((Self::from_args(args)?, command))
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let endpoints = Endpoints::new(args.base_url.clone());

        let store_path = match args.store_path {
            Some(path) => expand_tilde(&path),
            None => default_store_path()
                .context("No data directory found (use -s or set SILENT_AUTH_STORE)")?,
        };

        Ok(Config {
            base_url: args.base_url,

            login_path: env_or("AUTH_LOGIN_PATH", endpoints.login_path),
            refresh_path: env_or("AUTH_REFRESH_PATH", endpoints.refresh_path),
            logout_path: env_or("AUTH_LOGOUT_PATH", endpoints.logout_path),
            whoami_path: env_or("AUTH_WHOAMI_PATH", endpoints.whoami_path),

            store_path,

            refresh_buffer_secs: args.refresh_buffer,
            refresh_timeout_secs: args.refresh_timeout,
            liveness_check: args.liveness_check,

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),

            http_request_timeout: args.http_timeout,

            log_level: args.log_level,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            anyhow::bail!("SILENT_AUTH_BASE_URL must not be empty");
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            anyhow::bail!("SILENT_AUTH_BASE_URL must be an http(s) URL: {}", self.base_url);
        }
        if self.refresh_timeout_secs == 0 {
            anyhow::bail!("TOKEN_REFRESH_TIMEOUT must be greater than zero");
        }
        if self.http_connect_timeout == 0 || self.http_request_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be greater than zero");
        }
        Ok(())
    }

    /// Library-facing subset
    pub fn session_options(&self) -> SessionOptions {
        let mut endpoints = Endpoints::new(self.base_url.clone());
        endpoints.login_path = self.login_path.clone();
        endpoints.refresh_path = self.refresh_path.clone();
        endpoints.logout_path = self.logout_path.clone();
        endpoints.whoami_path = self.whoami_path.clone();

        SessionOptions {
            endpoints,
            refresh_buffer: chrono::Duration::seconds(self.refresh_buffer_secs as i64),
            refresh_timeout: Duration::from_secs(self.refresh_timeout_secs),
            liveness_check: self.liveness_check,
            connect_timeout: Duration::from_secs(self.http_connect_timeout),
            request_timeout: Duration::from_secs(self.http_request_timeout),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn default_store_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("silent-auth").join("credentials.sqlite3"))
}

// === Interactive Prompts ===

/// Fill in whatever the command line left out
pub fn prompt_credentials(
    username: Option<String>,
    password: Option<String>,
) -> Result<LoginCredentials> {
    let username = match username {
        Some(username) => username,
        None => Input::new()
            .with_prompt("Username")
            .interact_text()
            .context("Failed to read username")?,
    };

    let password = match password {
        Some(password) => password,
        None => Password::new()
            .with_prompt(format!("Password for {}", username))
            .interact()
            .context("Failed to read password")?,
    };

    if username.trim().is_empty() || password.is_empty() {
        anyhow::bail!("Username and password cannot be empty");
    }

    Ok(LoginCredentials::new(username, password))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("silent-auth").chain(args.iter().copied()))
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_relative_path() {
        let path = expand_tilde("relative/path");
        assert_eq!(path, PathBuf::from("relative/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_parse_subcommands() {
        let args = parse(&["-s", "/tmp/creds.db", "fetch", "http://localhost:7860/api/v1/flows"]);
        assert_eq!(
            args.command,
            Command::Fetch {
                url: "http://localhost:7860/api/v1/flows".to_string()
            }
        );
        assert_eq!(args.store_path.as_deref(), Some("/tmp/creds.db"));

        let args = parse(&["login", "-U", "alice"]);
        assert_eq!(
            args.command,
            Command::Login {
                username: Some("alice".to_string()),
                password: None,
            }
        );
    }

    #[test]
    fn test_session_options_from_config() {
        let config = Config::from_args(parse(&[
            "-u",
            "https://id.example.com",
            "-s",
            "/tmp/creds.db",
            "--refresh-buffer",
            "120",
            "--refresh-timeout",
            "10",
            "status",
        ]))
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.store_path, PathBuf::from("/tmp/creds.db"));

        let options = config.session_options();
        assert_eq!(options.refresh_buffer, chrono::Duration::seconds(120));
        assert_eq!(options.refresh_timeout, Duration::from_secs(10));
        assert!(!options.liveness_check);
        assert_eq!(
            options.endpoints.refresh_url(),
            "https://id.example.com/api/v1/refresh"
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::from_args(parse(&["-s", "/tmp/creds.db", "status"])).unwrap();
        config.validate().unwrap();

        config.refresh_timeout_secs = 0;
        assert!(config.validate().is_err());

        config.refresh_timeout_secs = 30;
        config.base_url = "  ".to_string();
        assert!(config.validate().is_err());

        config.base_url = "localhost:7860".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_store_path_location() {
        if let Some(path) = default_store_path() {
            assert!(path.ends_with("silent-auth/credentials.sqlite3"));
        }
    }
}
