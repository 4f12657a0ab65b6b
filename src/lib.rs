// Silent Auth - Library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod store;

pub use auth::{AuthEvent, Freshness, LoginCredentials, SessionManager, SessionOptions};
pub use error::{AuthError, RefreshFailure};
pub use http_client::AuthenticatedClient;
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
