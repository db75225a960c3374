//! Request dispatch with proxy failover.
//!
//! One logical request is attempted through successive proxies from the pool
//! until one succeeds, the attempt ceiling is reached, or the overall deadline
//! passes. Every failed attempt evicts its proxy. A proxy is never tried twice
//! within one dispatch.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::pool::{ProxyAddress, ProxyPool};

/// Limits for one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPolicy {
    /// Loop iterations before giving up (empty-pool waits count too).
    pub max_attempts: u32,
    /// Overall deadline for the logical request.
    pub deadline: Duration,
    /// Timeout of a single upstream call.
    pub attempt_timeout: Duration,
    /// Longest wait for replenishment when the pool is empty.
    pub empty_backoff: Duration,
}

/// Why a single attempt through one proxy failed.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("relay error: {0}")]
    Relay(String),

    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),
}

/// Longest upstream body excerpt kept in a rejection.
const BODY_EXCERPT: usize = 200;

impl AttemptError {
    /// Build a rejection, keeping only the start of the upstream body.
    pub fn rejected(status: u16, body: &str) -> Self {
        let body = match body.char_indices().nth(BODY_EXCERPT) {
            Some((idx, _)) => format!("{}...", &body[..idx]),
            None => body.to_string(),
        };
        AttemptError::Rejected { status, body }
    }

    /// Transport error with the request URL stripped.
    pub fn transport(err: reqwest::Error) -> Self {
        AttemptError::Transport(err.without_url())
    }
}

/// A dispatch that produced no result.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Upstream request failed after {attempts} attempts: {}", .last_error.as_deref().unwrap_or("no proxies available"))]
    Exhausted {
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("Upstream request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Successful dispatch result.
#[derive(Debug)]
pub struct Dispatched<T> {
    pub value: T,
    /// Proxy the successful attempt went through.
    pub proxy: ProxyAddress,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Runs attempts through pool proxies according to a [`DispatchPolicy`].
#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<ProxyPool>,
}

impl Dispatcher {
    pub fn new(pool: Arc<ProxyPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// Dispatch one logical request.
    ///
    /// `send` performs one upstream attempt through the given proxy. The
    /// first `Ok` wins. An `Err`, or an attempt exceeding
    /// `policy.attempt_timeout`, evicts that proxy and moves on. When the
    /// overall deadline passes, the in-flight attempt is dropped and its
    /// proxy kept.
    pub async fn dispatch<T, F, Fut>(
        &self,
        policy: &DispatchPolicy,
        mut send: F,
    ) -> Result<Dispatched<T>, DispatchError>
    where
        F: FnMut(ProxyAddress) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let deadline = Instant::now() + policy.deadline;
        let timed_out = || DispatchError::Timeout(policy.deadline);

        let mut tried: HashSet<ProxyAddress> = HashSet::new();
        let mut last_error: Option<String> = None;
        let mut attempts = 0u32;

        while attempts < policy.max_attempts {
            if Instant::now() >= deadline {
                return Err(timed_out());
            }
            attempts += 1;

            let acquired = tokio::time::timeout_at(deadline, self.pool.acquire())
                .await
                .map_err(|_| timed_out())?;

            let Some(proxy) = acquired else {
                let wait = policy
                    .empty_backoff
                    .min(deadline.saturating_duration_since(Instant::now()));
                tracing::debug!(attempt = attempts, ?wait, "No proxy available, waiting");
                self.pool.wait_replenished(wait).await;
                continue;
            };

            if !tried.insert(proxy.clone()) {
                tracing::debug!(attempt = attempts, proxy = %proxy, "Proxy already tried");
                continue;
            }

            let attempt = tokio::time::timeout(policy.attempt_timeout, send(proxy.clone()));
            let outcome = match tokio::time::timeout_at(deadline, attempt).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(attempts, proxy = %proxy, "Dispatch deadline reached");
                    return Err(timed_out());
                }
            };

            let err = match outcome {
                Ok(Ok(value)) => {
                    tracing::debug!(attempts, proxy = %proxy, "Attempt succeeded");
                    return Ok(Dispatched {
                        value,
                        proxy,
                        attempts,
                    });
                }
                Ok(Err(err)) => err,
                Err(_) => AttemptError::TimedOut(policy.attempt_timeout),
            };

            tracing::info!(
                attempt = attempts,
                max_attempts = policy.max_attempts,
                proxy = %proxy,
                error = %err,
                "Attempt failed, evicting proxy"
            );
            self.pool.evict(&proxy);
            last_error = Some(err.to_string());
        }

        tracing::warn!(attempts, last_error = ?last_error, "Dispatch exhausted");
        Err(DispatchError::Exhausted {
            attempts,
            last_error,
        })
    }
}
