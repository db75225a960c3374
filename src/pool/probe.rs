//! Proxy liveness probing.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use super::{Probe, ProxyAddress};

/// Connect timeout ceiling for proxied clients.
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Build an HTTP client whose requests are all routed through `addr`.
///
/// `timeout`, when set, bounds each whole request including the body. The
/// connect phase gets at most `connect_timeout` and never more than `timeout`.
pub fn proxied_client(
    addr: &ProxyAddress,
    timeout: Option<Duration>,
    connect_timeout: Duration,
) -> reqwest::Result<Client> {
    let proxy = reqwest::Proxy::all(addr.to_url())?;
    let mut connect_timeout = connect_timeout.min(MAX_CONNECT_TIMEOUT);
    let mut builder = Client::builder().proxy(proxy);
    if let Some(timeout) = timeout {
        connect_timeout = connect_timeout.min(timeout);
        builder = builder.timeout(timeout);
    }
    builder.connect_timeout(connect_timeout).build()
}

/// Checks a proxy by fetching the upstream health-indicator endpoint through it.
#[derive(Debug, Clone)]
pub struct ProxyHealthProbe {
    target: String,
    timeout: Duration,
    connect_timeout: Duration,
}

impl ProxyHealthProbe {
    pub fn new(target: impl Into<String>, timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
            connect_timeout,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl Probe<ProxyAddress> for ProxyHealthProbe {
    async fn check(&self, addr: &ProxyAddress) -> bool {
        if addr.as_str().trim().is_empty() {
            return false;
        }

        let client = match proxied_client(addr, Some(self.timeout), self.connect_timeout) {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!(proxy = %addr, error = %e, "Unusable proxy address");
                return false;
            }
        };

        match client.get(&self.target).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                tracing::trace!(proxy = %addr, error = %e, "Probe failed");
                false
            }
        }
    }
}
