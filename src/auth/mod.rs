// Authentication module
// Token lifecycle: storage, decoding, proactive and on-demand refresh

pub mod codec;
mod credentials;
mod manager;
mod notifier;
mod refresh;
mod scheduler;
mod single_flight;
mod types;

pub use credentials::{CredentialStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USERNAME_KEY};
pub use manager::{SessionManager, SessionOptions};
pub use notifier::{AuthEvent, AuthNotifier, AuthObserver, SubscriptionId};
pub use refresh::{Endpoints, IdentityClient, Liveness};
pub use scheduler::{refresh_delay, RefreshScheduler, Schedule, ScheduledTask, DEFAULT_REFRESH_BUFFER_SECS};
pub use single_flight::SingleFlight;
pub use types::{AuthStatus, Freshness, LoginCredentials, SessionState, TokenKind, TokenResponse};
