//! Picks a reachable backend API mirror.
//!
//! Mirrors get blocked individually, so the client keeps a pool: an optional
//! remote list, the built-in fallbacks and the default. All are probed at
//! once and the first one to answer wins. Later failures walk the pool.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use futures_util::future::{select_ok, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::events::{AppEvent, EventBus, ResolverStatus};

/// Cheap unauthenticated endpoint every mirror serves.
const PROBE_PATH: &str = "/api/v1/guest/comm/config";

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub default_endpoint: String,
    pub remote_lists: Vec<String>,
    pub fallbacks: Vec<String>,
    pub probe_timeout: Duration,
    pub max_failover_attempts: usize,
}

impl From<&UpstreamConfig> for ResolverOptions {
    fn from(cfg: &UpstreamConfig) -> Self {
        Self {
            default_endpoint: cfg.default_endpoint.clone(),
            remote_lists: cfg.remote_lists.clone(),
            fallbacks: cfg.fallbacks.clone(),
            probe_timeout: Duration::from_millis(cfg.probe_timeout_ms),
            max_failover_attempts: cfg.max_failover_attempts.max(1),
        }
    }
}

#[derive(Debug)]
struct Pool {
    /// Every known endpoint, in preference order.
    candidates: Vec<String>,
    active: String,
    failed: HashSet<String>,
    overridden: bool,
}

impl Pool {
    fn insert(&mut self, url: String) {
        if !self.candidates.contains(&url) {
            self.candidates.push(url);
        }
    }
}

fn normalize(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Merge lists keeping the first occurrence of each endpoint.
fn union(lists: &[&[String]]) -> Vec<String> {
    let mut seen = HashSet::new();
    lists
        .iter()
        .flat_map(|list| list.iter())
        .map(|u| normalize(u))
        .filter(|u| !u.is_empty() && seen.insert(u.clone()))
        .collect()
}

pub struct EndpointResolver {
    http: reqwest::Client,
    options: ResolverOptions,
    events: EventBus,
    resolved: OnceCell<()>,
    pool: Mutex<Pool>,
}

impl EndpointResolver {
    pub fn new(options: ResolverOptions, events: EventBus) -> Self {
        let default = normalize(&options.default_endpoint);
        let candidates = union(&[std::slice::from_ref(&default), &options.fallbacks]);
        let http = reqwest::Client::builder()
            .timeout(options.probe_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            options,
            events,
            resolved: OnceCell::new(),
            pool: Mutex::new(Pool {
                candidates,
                active: default,
                failed: HashSet::new(),
                overridden: false,
            }),
        }
    }

    /// Currently active endpoint, without resolving.
    pub fn active(&self) -> String {
        self.pool.lock().active.clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.pool.lock().candidates.clone()
    }

    /// Active endpoint after the one-time race.
    ///
    /// The race runs at most once per resolver. It never fails: when nothing
    /// answers the default stays active and an `Unreachable` status is
    /// published, so login can still be attempted later.
    pub async fn resolve(&self) -> String {
        if self.pool.lock().overridden {
            return self.active();
        }
        self.resolved.get_or_init(|| self.run_resolution()).await;
        self.active()
    }

    async fn run_resolution(&self) {
        let remote = self.fetch_remote_list().await;
        let candidates = union(&[&remote, &self.options.fallbacks]);
        {
            let mut pool = self.pool.lock();
            for url in &candidates {
                pool.insert(url.clone());
            }
        }
        self.events.emit(AppEvent::Resolver(ResolverStatus::Probing {
            candidates: candidates.len(),
        }));

        let winner = if candidates.is_empty() {
            None
        } else {
            let probes: Vec<BoxFuture<'_, Result<String, UpstreamError>>> = candidates
                .iter()
                .map(|url| self.probe(url.clone()).boxed())
                .collect();
            select_ok(probes).await.ok().map(|(url, _rest)| url)
        };

        let mut pool = self.pool.lock();
        if pool.overridden {
            // A manual choice made while probing wins.
            return;
        }
        match winner {
            Some(url) => {
                tracing::info!("selected API endpoint {url}");
                pool.active = url.clone();
                drop(pool);
                self.events
                    .emit(AppEvent::Resolver(ResolverStatus::Selected { endpoint: url }));
            }
            None => {
                let fallback = pool.active.clone();
                drop(pool);
                tracing::warn!("no API endpoint reachable, keeping {fallback}");
                self.events
                    .emit(AppEvent::Resolver(ResolverStatus::Unreachable { fallback }));
            }
        }
    }

    async fn fetch_remote_list(&self) -> Vec<String> {
        for list_url in &self.options.remote_lists {
            let resp = match self.http.get(list_url).send().await {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    tracing::warn!("endpoint list {list_url} returned HTTP {}", r.status());
                    continue;
                }
                Err(e) => {
                    tracing::warn!("failed to fetch endpoint list {list_url}: {e}");
                    continue;
                }
            };
            match resp.json::<Vec<String>>().await {
                Ok(list) => {
                    tracing::debug!("endpoint list {list_url}: {} entries", list.len());
                    return list;
                }
                Err(e) => tracing::warn!("endpoint list {list_url} is not a JSON array: {e}"),
            }
        }
        Vec::new()
    }

    async fn probe(&self, url: String) -> Result<String, UpstreamError> {
        let probe_url = format!("{url}{PROBE_PATH}");
        let resp = self
            .http
            .get(&probe_url)
            .send()
            .await
            .map_err(|source| UpstreamError::Request {
                url: probe_url.clone(),
                source,
            })?;
        if !resp.status().is_success() {
            return Err(UpstreamError::Status {
                url: probe_url,
                status: resp.status().as_u16(),
                message: String::new(),
            });
        }
        tracing::debug!("{url} answered");
        Ok(url)
    }

    /// Pin `url` as the active endpoint, skipping the race.
    pub fn override_endpoint(&self, url: &str) {
        let url = normalize(url);
        let mut pool = self.pool.lock();
        pool.insert(url.clone());
        pool.failed.remove(&url);
        pool.active = url.clone();
        pool.overridden = true;
        tracing::info!("API endpoint pinned to {url}");
    }

    /// Remember that `url` failed during this session.
    pub fn mark_failed(&self, url: &str) {
        self.pool.lock().failed.insert(normalize(url));
    }

    /// Re-point to the next endpoint that has not failed yet.
    pub fn next_untried(&self) -> Option<String> {
        let mut pool = self.pool.lock();
        let next = pool
            .candidates
            .iter()
            .find(|c| !pool.failed.contains(*c) && **c != pool.active)
            .cloned()?;
        tracing::info!("failing over from {} to {next}", pool.active);
        pool.active = next.clone();
        Some(next)
    }

    /// Run `op` against the active endpoint, failing over on retryable errors.
    ///
    /// `op` receives the endpoint to use. Each failure marks that endpoint
    /// and moves to the next untried one, up to the configured attempt limit.
    /// Non-retryable errors are returned as-is.
    pub async fn with_failover<T, F, Fut>(&self, mut op: F) -> Result<T, UpstreamError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut endpoint = self.resolve().await;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op(endpoint.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    tracing::warn!("request via {endpoint} failed: {e}");
                    self.mark_failed(&endpoint);
                    if attempts >= self.options.max_failover_attempts {
                        return Err(UpstreamError::EndpointExhausted { attempts });
                    }
                    match self.next_untried() {
                        Some(next) => endpoint = next,
                        None => return Err(UpstreamError::EndpointExhausted { attempts }),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
