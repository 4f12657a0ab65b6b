use anyhow::{Context, Result};
use std::io::Write;
use std::sync::Arc;

mod auth;
mod config;
mod error;
mod http_client;
mod store;

use auth::{AuthEvent, Freshness, SessionManager};
use config::Command;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = config::Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!("Identity server: {}", config.base_url);
    tracing::debug!("Credential store: {}", config.store_path.display());

    let backend = store::SqliteStore::open(&config.store_path)?;
    let session = SessionManager::new(config.session_options(), Arc::new(backend))?;

    let outcome = match command {
        Command::Login { username, password } => login(&session, username, password).await,
        Command::Logout => {
            session.logout().await;
            println!("Logged out");
            Ok(())
        }
        Command::Status => status(&session),
        Command::Fetch { url } => fetch(&session, &url).await,
        Command::Watch => watch(&session).await,
    };

    session.shutdown();
    outcome
}

async fn login(
    session: &SessionManager,
    username: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let credentials = config::prompt_credentials(username, password)?;

    session
        .login(&credentials)
        .await
        .with_context(|| format!("Login as {} failed", credentials.username))?;

    tracing::info!("✅ Logged in as {}", credentials.username);
    Ok(())
}

fn status(session: &SessionManager) -> Result<()> {
    let snapshot = session.auth_status();
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("Failed to serialize status")?
    );
    Ok(())
}

async fn fetch(session: &SessionManager, url: &str) -> Result<()> {
    let gate = http_client::AuthenticatedClient::new(session.clone());
    let request = gate.get(url).build().context("Invalid request URL")?;

    let response = match gate.fetch(request).await {
        Ok(response) => response,
        Err(e) if e.is_unauthenticated() => {
            tracing::error!("❌ {}", e);
            anyhow::bail!("No valid session; run `silent-auth login` first");
        }
        Err(e) => return Err(e.into()),
    };

    let status = response.status();
    let body: bytes::Bytes = response
        .bytes()
        .await
        .context("Failed to read response body")?;

    tracing::info!(status = %status, bytes = body.len(), "Response received");

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&body).context("Failed to write response")?;
    stdout.write_all(b"\n").context("Failed to write response")?;

    if !status.is_success() {
        anyhow::bail!("Request failed with status {}", status);
    }
    Ok(())
}

async fn watch(session: &SessionManager) -> Result<()> {
    session.subscribe(Arc::new(|event: &AuthEvent| match event {
        AuthEvent::TokensUpdated => tracing::info!("🔄 Credentials updated"),
        AuthEvent::TokensCleared => tracing::warn!("Credentials cleared"),
        AuthEvent::RefreshFailed { reason } => {
            tracing::error!("❌ Refresh failed: {}", reason)
        }
    }));

    match session.ensure_fresh().await {
        Freshness::Authenticated { .. } => {
            let snapshot = session.auth_status();
            tracing::info!(
                "✅ Session active; next refresh at {}",
                snapshot
                    .next_refresh_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "on demand".to_string())
            );
        }
        Freshness::Unauthenticated => {
            anyhow::bail!("No valid session; run `silent-auth login` first");
        }
    }

    shutdown_signal().await;
    tracing::info!("👋 Watch stopped");
    Ok(())
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down...");
        },
    }
}
