// ABOUTME: Opens TLS-capable tokio-postgres connections with a bounded connect timeout
// ABOUTME: The TLS policy is set once at startup from the CLI

use anyhow::{Context, Result};
use postgres_native_tls::MakeTlsConnector;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_postgres::Client;

use crate::utils::{retry_with_backoff, sanitize_url};

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Record whether self-signed certificates are accepted. Later calls are ignored.
pub fn init_tls_policy(allow_self_signed_certs: bool) {
    if ALLOW_SELF_SIGNED.set(allow_self_signed_certs).is_err() {
        tracing::debug!("TLS policy already initialized");
    }
    if allow_self_signed_certs {
        tracing::warn!("TLS certificate verification is disabled; use only for testing");
    }
}

fn tls_connector() -> Result<MakeTlsConnector> {
    let allow_invalid = ALLOW_SELF_SIGNED.get().copied().unwrap_or(false);
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(allow_invalid)
        .build()
        .context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Open one connection. The connection task is spawned onto the runtime and ends
/// when the returned client is dropped.
pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Client> {
    let mut config: tokio_postgres::Config = url
        .parse()
        .with_context(|| format!("Invalid connection string: {}", sanitize_url(url)))?;
    config.connect_timeout(connect_timeout);

    let (client, connection) = config
        .connect(tls_connector()?)
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Connection error: {}", e);
        }
    });

    Ok(client)
}

/// Connect with a short bounded exponential backoff (3 retries from 1s).
pub async fn connect_with_retry(url: &str, connect_timeout: Duration) -> Result<Client> {
    retry_with_backoff(
        || connect(url, connect_timeout),
        3,
        Duration::from_secs(1),
    )
    .await
}
