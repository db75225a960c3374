//! Catalog of models the upstream actually serves to us.
//!
//! The catalog is a [`Pool`] of model ids: the candidate list comes from the
//! upstream model listing and each candidate is kept only if a trial chat
//! completion succeeds. Both calls go through the proxy dispatcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dispatch::{DispatchPolicy, Dispatcher};
use crate::pool::{CandidateSource, Pool, PoolOptions, PoolStats, Probe, RefreshReport, SourceError};
use crate::upstream::UpstreamClient;

/// Lists model ids from the upstream, through a proxy.
pub struct UpstreamModelSource {
    dispatcher: Dispatcher,
    upstream: Arc<UpstreamClient>,
    policy: DispatchPolicy,
}

impl UpstreamModelSource {
    pub fn new(dispatcher: Dispatcher, upstream: Arc<UpstreamClient>, policy: DispatchPolicy) -> Self {
        Self {
            dispatcher,
            upstream,
            policy,
        }
    }
}

#[async_trait]
impl CandidateSource<String> for UpstreamModelSource {
    async fn fetch_candidates(&self) -> Result<Vec<String>, SourceError> {
        let timeout = self.policy.attempt_timeout;
        let listed = self
            .dispatcher
            .dispatch(&self.policy, |proxy| {
                let upstream = Arc::clone(&self.upstream);
                async move { upstream.list_models(&proxy, timeout).await }
            })
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        if listed.value.is_empty() {
            return Err(SourceError::EmptyList);
        }
        tracing::info!(models = listed.value.len(), "Retrieved upstream model list");
        Ok(listed.value)
    }
}

/// A model passes when a trial chat completion through some proxy succeeds.
pub struct TrialChatProbe {
    dispatcher: Dispatcher,
    upstream: Arc<UpstreamClient>,
    policy: DispatchPolicy,
}

impl TrialChatProbe {
    pub fn new(dispatcher: Dispatcher, upstream: Arc<UpstreamClient>, policy: DispatchPolicy) -> Self {
        Self {
            dispatcher,
            upstream,
            policy,
        }
    }
}

#[async_trait]
impl Probe<String> for TrialChatProbe {
    async fn check(&self, model: &String) -> bool {
        let timeout = self.policy.attempt_timeout;
        let result = self
            .dispatcher
            .dispatch(&self.policy, |proxy| {
                let upstream = Arc::clone(&self.upstream);
                let model = model.clone();
                async move { upstream.trial_chat(&proxy, &model, timeout).await }
            })
            .await;

        match result {
            Ok(outcome) => {
                tracing::debug!(model = %model, accessible = outcome.value, "Model checked");
                outcome.value
            }
            Err(e) => {
                tracing::debug!(model = %model, error = %e, "Model check failed");
                false
            }
        }
    }
}

/// The set of accessible models.
pub struct ModelCatalog {
    pool: Arc<Pool<String>>,
    enabled: bool,
    fail_open_after: Duration,
}

impl ModelCatalog {
    /// Catalog backed by the upstream, sharing the proxy dispatcher.
    pub fn new(config: &Config, dispatcher: Dispatcher, upstream: Arc<UpstreamClient>) -> Self {
        let empty_backoff = config.pool.empty_backoff();
        let source = UpstreamModelSource::new(
            dispatcher.clone(),
            Arc::clone(&upstream),
            config.dispatch.models.policy(empty_backoff),
        );
        let probe = TrialChatProbe::new(
            dispatcher,
            upstream,
            config.dispatch.model_probe.policy(empty_backoff),
        );
        let pool = Pool::new(
            Arc::new(source),
            Arc::new(probe),
            PoolOptions {
                label: "model",
                probe_concurrency: config.models.probe_concurrency,
                stale_after: config.models.refresh_interval(),
                keep_on_empty: true,
            },
        );
        Self::from_pool(
            Arc::new(pool),
            config.models.enabled,
            config.models.fail_open_after(),
        )
    }

    pub fn from_pool(pool: Arc<Pool<String>>, enabled: bool, fail_open_after: Duration) -> Self {
        Self {
            pool,
            enabled,
            fail_open_after,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether requests for `model` should be accepted.
    ///
    /// An empty catalog accepts everything and kicks off a background
    /// refresh, at most once per `fail_open_after`.
    pub fn is_supported(&self, model: &str) -> bool {
        if !self.enabled {
            return true;
        }

        if self.pool.is_empty() {
            if !self.pool.attempted_within(self.fail_open_after) {
                tracing::info!("Model catalog empty, refreshing in background");
                let pool = Arc::clone(&self.pool);
                tokio::spawn(async move {
                    let _ = pool.refresh().await;
                });
            }
            return true;
        }

        self.pool.contains(&model.to_string())
    }

    /// Accessible model ids, sorted.
    pub fn models(&self) -> Vec<String> {
        let mut models = self.pool.members();
        models.sort();
        models
    }

    pub async fn refresh(&self) -> Result<RefreshReport, SourceError> {
        self.pool.refresh().await
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Periodic refresh; `None` when the catalog is disabled.
    pub fn spawn_refresher(&self, every: Duration) -> Option<JoinHandle<()>> {
        self.enabled.then(|| self.pool.spawn_refresher(every))
    }
}
