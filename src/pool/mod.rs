//! Verified member pools.
//!
//! A [`Pool`] holds the subset of a candidate list that most recently passed
//! a [`Probe`]. The proxy pool is the main instantiation ([`ProxyPool`]); the
//! model catalog reuses the same machinery with a different source and probe.
//!
//! Lifecycle:
//! - **refresh**: fetch candidates, probe them concurrently (bounded), then
//!   swap the member list in one write. A failed fetch keeps the old members.
//! - **acquire**: round-robin over members. An empty pool whose last refresh
//!   attempt is stale triggers one synchronous refresh; otherwise `None`.
//! - **evict**: drop a member after an observed failure. Idempotent.
//!
//! The member list sits behind a single `RwLock` that is never held across
//! an `.await`; all network I/O happens outside the critical section.

mod address;
mod probe;
mod source;

pub use address::ProxyAddress;
pub use probe::{proxied_client, ProxyHealthProbe};
pub use source::{parse_candidates, HttpProxySource, SourceError};

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::Config;

/// Pool of verified forward proxies.
pub type ProxyPool = Pool<ProxyAddress>;

/// Anything a pool can hold.
pub trait Member: Clone + PartialEq + fmt::Display + Send + Sync + 'static {}

impl<T> Member for T where T: Clone + PartialEq + fmt::Display + Send + Sync + 'static {}

/// Produces the raw candidate list for a refresh.
#[async_trait]
pub trait CandidateSource<T: Member>: Send + Sync {
    async fn fetch_candidates(&self) -> Result<Vec<T>, SourceError>;
}

/// Decides whether one candidate is currently usable.
///
/// Implementations must not panic on malformed input; anything unusable is
/// simply `false`.
#[async_trait]
pub trait Probe<T: Member>: Send + Sync {
    async fn check(&self, candidate: &T) -> bool;
}

/// Tuning knobs for a pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Label used in log lines ("proxy", "model").
    pub label: &'static str,
    /// Maximum number of probes in flight during a refresh.
    pub probe_concurrency: usize,
    /// An empty pool refreshes on acquire only when the last attempt is older than this.
    pub stale_after: Duration,
    /// Keep the previous members when a refresh finds none healthy.
    pub keep_on_empty: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            label: "proxy",
            probe_concurrency: 50,
            stale_after: Duration::from_secs(120),
            keep_on_empty: false,
        }
    }
}

/// Outcome of a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    /// Candidates probed. Zero when the refresh was coalesced.
    pub candidates: usize,
    /// Members in the pool afterwards.
    pub healthy: usize,
    /// Another refresh finished while this one waited; no fan-out was run.
    pub coalesced: bool,
}

/// Point-in-time view of a pool for diagnostics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: usize,
    pub evictions: u64,
    /// Completed refreshes, including ones that found nothing healthy.
    pub refreshes: u64,
    /// Refreshes abandoned because the candidate fetch failed.
    pub refresh_failures: u64,
    pub last_refresh: Option<DateTime<Utc>>,
}

struct PoolState<T> {
    members: Vec<T>,
    /// Last successful refresh (members passed a probe at or after this).
    refreshed_at: Option<DateTime<Utc>>,
    /// Last refresh attempt, successful or not.
    attempted_at: Option<Instant>,
}

/// A set of verified members with refresh, acquire and evict operations.
pub struct Pool<T: Member> {
    state: RwLock<PoolState<T>>,
    cursor: AtomicUsize,
    source: Arc<dyn CandidateSource<T>>,
    probe: Arc<dyn Probe<T>>,
    options: PoolOptions,
    /// Serializes refreshes; the counter lets waiters detect one finished meanwhile.
    refresh_gate: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    replenished: Notify,
    evictions: AtomicU64,
    /// Refreshes that fetched and probed a candidate list.
    completed: AtomicU64,
    /// Refreshes whose candidate fetch failed.
    failed: AtomicU64,
}

impl<T: Member> Pool<T> {
    /// Create an empty pool. Nothing is fetched until the first refresh.
    pub fn new(
        source: Arc<dyn CandidateSource<T>>,
        probe: Arc<dyn Probe<T>>,
        options: PoolOptions,
    ) -> Self {
        Self {
            state: RwLock::new(PoolState {
                members: Vec::new(),
                refreshed_at: None,
                attempted_at: None,
            }),
            cursor: AtomicUsize::new(0),
            source,
            probe,
            options,
            refresh_gate: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            replenished: Notify::new(),
            evictions: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Re-populate the pool from the source.
    ///
    /// On a failed fetch the current members are kept and the error is
    /// returned for logging; callers should not treat it as fatal.
    pub async fn refresh(&self) -> Result<RefreshReport, SourceError> {
        let seen = self.generation.load(Ordering::Acquire);
        let _gate = self.refresh_gate.lock().await;

        if self.generation.load(Ordering::Acquire) != seen {
            let healthy = self.len();
            tracing::debug!(pool = self.options.label, healthy, "Refresh coalesced");
            return Ok(RefreshReport {
                candidates: 0,
                healthy,
                coalesced: true,
            });
        }

        let result = self.refresh_exclusive().await;
        let counter = if result.is_ok() {
            &self.completed
        } else {
            &self.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::AcqRel);
        result
    }

    async fn refresh_exclusive(&self) -> Result<RefreshReport, SourceError> {
        let label = self.options.label;

        let candidates = match self.source.fetch_candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                self.state.write().attempted_at = Some(Instant::now());
                tracing::warn!(
                    pool = label,
                    error = %e,
                    kept = self.len(),
                    "Candidate fetch failed, keeping current members"
                );
                return Err(e);
            }
        };

        let total = candidates.len();
        tracing::info!(pool = label, candidates = total, "Probing candidates");

        let probe = &*self.probe;
        let healthy: Vec<T> = futures::stream::iter(candidates)
            .map(|candidate| async move {
                let ok = probe.check(&candidate).await;
                (candidate, ok)
            })
            .buffer_unordered(self.options.probe_concurrency.max(1))
            .filter_map(|(candidate, ok)| async move { ok.then_some(candidate) })
            .collect()
            .await;

        let found = healthy.len();
        let now = Instant::now();
        let size = {
            let mut state = self.state.write();
            state.attempted_at = Some(now);
            if found == 0 && self.options.keep_on_empty && !state.members.is_empty() {
                tracing::warn!(
                    pool = label,
                    kept = state.members.len(),
                    "No healthy candidates, keeping previous members"
                );
            } else {
                state.members = healthy;
                state.refreshed_at = Some(Utc::now());
            }
            state.members.len()
        };
        self.cursor.store(0, Ordering::Relaxed);

        if size > 0 {
            self.replenished.notify_waiters();
        }

        if found == 0 {
            tracing::warn!(pool = label, tested = total, "No healthy candidates found");
        } else {
            tracing::info!(pool = label, healthy = found, tested = total, "Pool refreshed");
        }

        Ok(RefreshReport {
            candidates: total,
            healthy: size,
            coalesced: false,
        })
    }

    /// Take the next member in round-robin order.
    ///
    /// An empty pool is refreshed first when its last refresh attempt is
    /// older than `stale_after` (or it never ran). `None` means no member is
    /// available right now, which is a routine condition.
    pub async fn acquire(self: &Arc<Self>) -> Option<T> {
        if let Some(member) = self.next_member() {
            return Some(member);
        }

        if !self.is_stale() {
            tracing::debug!(pool = self.options.label, "Pool empty, refresh is recent");
            return None;
        }

        tracing::info!(pool = self.options.label, "Pool empty and stale, refreshing");
        // Detached so a caller giving up early does not cancel the refresh for everyone.
        let pool = Arc::clone(self);
        let refresh = tokio::spawn(async move { pool.refresh().await });
        let _ = refresh.await;

        self.next_member()
    }

    fn next_member(&self) -> Option<T> {
        let state = self.state.read();
        if state.members.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % state.members.len();
        Some(state.members[idx].clone())
    }

    /// Remove `member` from the pool. Returns whether it was present.
    pub fn evict(&self, member: &T) -> bool {
        let removed = {
            let mut state = self.state.write();
            let before = state.members.len();
            state.members.retain(|m| m != member);
            state.members.len() != before
        };

        if removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::info!(pool = self.options.label, member = %member, "Evicted member");
        }
        removed
    }

    /// Whether `member` is currently in the pool.
    pub fn contains(&self, member: &T) -> bool {
        self.state.read().members.iter().any(|m| m == member)
    }

    /// Snapshot of the current members.
    pub fn members(&self) -> Vec<T> {
        self.state.read().members.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().members.is_empty()
    }

    /// Whether the last refresh attempt is older than `stale_after`.
    pub fn is_stale(&self) -> bool {
        !self.attempted_within(self.options.stale_after)
    }

    /// Whether a refresh was attempted within `window`.
    pub fn attempted_within(&self, window: Duration) -> bool {
        match self.state.read().attempted_at {
            Some(at) => at.elapsed() <= window,
            None => false,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.read();
        PoolStats {
            size: state.members.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
            refreshes: self.completed.load(Ordering::Relaxed),
            refresh_failures: self.failed.load(Ordering::Relaxed),
            last_refresh: state.refreshed_at,
        }
    }

    /// Wait until a refresh makes the pool non-empty, for at most `max`.
    pub async fn wait_replenished(&self, max: Duration) {
        let notified = self.replenished.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if !self.is_empty() {
            return;
        }
        let _ = tokio::time::timeout(max, notified).await;
    }

    /// Refresh on a fixed interval for the lifetime of the process.
    ///
    /// The first refresh runs immediately.
    pub fn spawn_refresher(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Failures are logged inside refresh.
                if let Ok(report) = pool.refresh().await {
                    tracing::debug!(
                        pool = pool.options.label,
                        healthy = report.healthy,
                        "Scheduled refresh done"
                    );
                }
            }
        })
    }
}

impl Pool<ProxyAddress> {
    /// Build the proxy pool described by `config`: list provider source and
    /// upstream health probe.
    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        let source = HttpProxySource::new(&config.pool.source_url, config.pool.source_timeout())?;
        let probe = ProxyHealthProbe::new(
            config.upstream.models_url(),
            config.pool.probe_timeout(),
            config.pool.probe_connect_timeout(),
        );
        Ok(Self::new(
            Arc::new(source),
            Arc::new(probe),
            PoolOptions {
                label: "proxy",
                probe_concurrency: config.pool.probe_concurrency,
                stale_after: config.pool.stale_after(),
                keep_on_empty: false,
            },
        ))
    }
}
