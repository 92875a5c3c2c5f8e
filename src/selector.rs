//! Picks the durable adapter once per session.
//!
//! 1. force-local → local redb file
//! 2. backend URL configured → probe `/api/health`; healthy → networked, else local
//! 3. otherwise → local
//!
//! If the local file cannot be opened the session still starts on the
//! in-memory fallback. Selection never fails.

use crate::backend::{MemoryBackend, TaskBackend};
use crate::config::Config;
use crate::local::LocalBackend;
use crate::remote::RemoteBackend;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

/// True if `GET {base_url}/api/health` answers 2xx within `timeout`.
pub async fn probe(client: &Client, base_url: &str, timeout: Duration) -> bool {
    let url = format!("{}/api/health", base_url.trim_end_matches('/'));
    match tokio::time::timeout(timeout, client.get(&url).send()).await {
        Ok(Ok(response)) if response.status().is_success() => true,
        Ok(Ok(response)) => {
            tracing::warn!(%url, status = %response.status(), "backend health probe rejected");
            false
        }
        Ok(Err(e)) => {
            tracing::warn!(%url, error = %e, "backend health probe failed");
            false
        }
        Err(_) => {
            tracing::warn!(%url, timeout_ms = timeout.as_millis() as u64, "backend health probe timed out");
            false
        }
    }
}

pub async fn select_backend(config: &Config) -> Arc<dyn TaskBackend> {
    if config.force_local {
        tracing::info!("local-only mode forced by configuration");
        return local_or_memory(config);
    }

    if let Some(url) = config.backend_url.as_deref() {
        let client = Client::new();
        if probe(&client, url, config.probe_timeout()).await {
            tracing::info!(%url, "using networked backend");
            return Arc::new(RemoteBackend::with_client(client, url));
        }
        tracing::warn!(%url, "networked backend unavailable, falling back to local storage");
    }

    local_or_memory(config)
}

fn local_or_memory(config: &Config) -> Arc<dyn TaskBackend> {
    match LocalBackend::open(&config.data_path) {
        Ok(local) => {
            tracing::info!(path = %config.data_path.display(), "using local backend");
            Arc::new(local)
        }
        Err(e) => {
            tracing::error!(path = %config.data_path.display(), error = %e, "local storage unavailable, keeping tasks in memory");
            Arc::new(MemoryBackend::new())
        }
    }
}
