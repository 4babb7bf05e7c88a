//! REST side of the control API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use reqwest::Method;
use tracing::{debug, info, warn};

use crate::error::{ControlError, Result};
use crate::latency::InFlight;
use crate::types::{
    ConfigsResponse, DelayResponse, Latency, Mode, ProxiesResponse, ProxyEntry, ProxyGroup,
    VersionInfo,
};

/// Pseudo-nodes that are never latency-tested.
pub const SENTINEL_NODES: &[&str] = &["DIRECT", "REJECT", "GLOBAL"];

/// Only groups of this type are user-selectable.
const SELECTOR_KIND: &str = "Selector";

/// The core's built-in group; the one in use in Global mode.
pub const GLOBAL_GROUP: &str = "GLOBAL";

/// Default target for node latency probes (HTTP 204 on success).
const DEFAULT_PROBE_URL: &str = "http://www.gstatic.com/generate_204";

/// Extra slack on top of the core-side delay timeout before we give up locally.
const PROBE_GRACE: Duration = Duration::from_millis(500);

/// How `await_ready` polls `GET /version`.
#[derive(Debug, Clone)]
pub struct ReadyPolicy {
    /// Pause between a failed probe and the next one.
    pub poll_interval: Duration,
    pub max_attempts: u32,
    /// Timeout of each individual probe.
    pub request_timeout: Duration,
    /// Report progress every N failed attempts (0 disables).
    pub progress_every: u32,
}

impl Default for ReadyPolicy {
    fn default() -> Self {
        // The core may download geo data before opening its API, so the
        // budget is generous.
        Self {
            poll_interval: Duration::from_secs(1),
            max_attempts: 120,
            request_timeout: Duration::from_secs(1),
            progress_every: 2,
        }
    }
}

/// Parameters of node latency probes.
#[derive(Debug, Clone)]
pub struct LatencyPolicy {
    pub probe_url: String,
    /// Delay timeout handed to the core for each node.
    pub timeout: Duration,
}

impl Default for LatencyPolicy {
    fn default() -> Self {
        Self {
            probe_url: DEFAULT_PROBE_URL.to_string(),
            timeout: Duration::from_millis(2000),
        }
    }
}

/// Client for one proxy-core control endpoint.
///
/// Cheap to clone; clones share the mode mirror, the group cache and the
/// in-flight latency bookkeeping.
#[derive(Debug, Clone)]
pub struct ControlClient {
    base_url: String,
    secret: Option<String>,
    http: reqwest::Client,
    latency: LatencyPolicy,
    mode: Arc<Mutex<Option<Mode>>>,
    groups: Arc<Mutex<Vec<ProxyGroup>>>,
    inflight: InFlight,
}

impl ControlClient {
    /// Client for `base_url` (e.g. `http://127.0.0.1:9090`).
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: None,
            http,
            latency: LatencyPolicy::default(),
            mode: Arc::new(Mutex::new(None)),
            groups: Arc::new(Mutex::new(Vec::new())),
            inflight: InFlight::default(),
        }
    }

    /// Client for the loopback controller on `port`.
    pub fn local(port: u16) -> Self {
        Self::new(format!("http://127.0.0.1:{port}"))
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        self.secret = (!secret.is_empty()).then_some(secret);
        self
    }

    pub fn with_latency_policy(mut self, policy: LatencyPolicy) -> Self {
        self.latency = policy;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.http.request(method, format!("{}{path}", self.base_url));
        match self.secret.as_deref() {
            Some(secret) => req.bearer_auth(secret),
            None => req,
        }
    }

    async fn send(&self, path: &str, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = req.send().await.map_err(|source| ControlError::Request {
            path: path.to_string(),
            source,
        })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ControlError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        path: &str,
        resp: reqwest::Response,
    ) -> Result<T> {
        resp.json::<T>().await.map_err(|e| ControlError::Decode {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    /// Liveness probe: `GET /version`.
    pub async fn version(&self, timeout: Duration) -> Result<VersionInfo> {
        let path = "/version";
        let resp = self
            .send(path, self.request(Method::GET, path).timeout(timeout))
            .await?;
        Self::decode(path, resp).await
    }

    /// Poll `GET /version` until the core answers.
    ///
    /// Probes never overlap: the next one is issued only after the previous
    /// settled and `poll_interval` elapsed. `on_progress` receives the attempt
    /// number every `progress_every` failures. Returns the number of probes
    /// it took.
    pub async fn await_ready<F>(&self, policy: &ReadyPolicy, mut on_progress: F) -> Result<u32>
    where
        F: FnMut(u32),
    {
        let mut attempt = 0;
        while attempt < policy.max_attempts {
            attempt += 1;
            match self.version(policy.request_timeout).await {
                Ok(info) => {
                    info!(attempt, version = %info.version, "proxy core control API is ready");
                    return Ok(attempt);
                }
                Err(e) => {
                    debug!(attempt, "control API not ready yet: {e}");
                    if policy.progress_every > 0 && attempt % policy.progress_every == 0 {
                        on_progress(attempt);
                    }
                }
            }
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.poll_interval).await;
            }
        }
        warn!(attempts = attempt, "proxy core control API never became ready");
        Err(ControlError::ReadinessTimeout {
            endpoint: self.base_url.clone(),
            attempts: attempt,
        })
    }

    /// Switch the outbound mode. The local mirror follows only on success.
    pub async fn set_mode(&self, mode: Mode) -> Result<()> {
        let path = "/configs";
        self.send(
            path,
            self.request(Method::PATCH, path)
                .json(&serde_json::json!({ "mode": mode })),
        )
        .await?;
        *self.mode.lock() = Some(mode);
        debug!(%mode, "proxy core mode switched");
        Ok(())
    }

    /// Last mode acknowledged by the core, if any.
    pub fn mode(&self) -> Option<Mode> {
        *self.mode.lock()
    }

    /// Ask the core for its current mode (`GET /configs`) and mirror it.
    pub async fn fetch_mode(&self) -> Result<Mode> {
        let path = "/configs";
        let resp = self.send(path, self.request(Method::GET, path)).await?;
        let body: ConfigsResponse = Self::decode(path, resp).await?;
        let mode = body
            .mode
            .parse::<Mode>()
            .map_err(|reason| ControlError::Decode {
                path: path.to_string(),
                reason,
            })?;
        *self.mode.lock() = Some(mode);
        Ok(mode)
    }

    /// Selector groups, ordered by the configuration's declared group order.
    ///
    /// `order` is the list of group names as declared in the profile; an
    /// empty slice keeps retrieval order. `GLOBAL` leads in Global mode and
    /// trails otherwise.
    pub async fn list_proxy_groups(&self, order: &[String]) -> Result<Vec<ProxyGroup>> {
        let path = "/proxies";
        let resp = self.send(path, self.request(Method::GET, path)).await?;
        let body: ProxiesResponse = Self::decode(path, resp).await?;

        let groups: Vec<ProxyGroup> = body
            .proxies
            .into_iter()
            .filter_map(|(name, value)| {
                let entry: ProxyEntry = serde_json::from_value(value).ok()?;
                (entry.kind == SELECTOR_KIND).then(|| ProxyGroup {
                    name,
                    kind: entry.kind,
                    now: entry.now.unwrap_or_default(),
                    all: entry.all,
                })
            })
            .collect();

        let groups = place_global(order_groups(groups, order), self.mode());
        *self.groups.lock() = groups.clone();
        Ok(groups)
    }

    /// Groups from the last successful `list_proxy_groups`.
    pub fn cached_groups(&self) -> Vec<ProxyGroup> {
        self.groups.lock().clone()
    }

    /// Select `node` in `group`. The cache is updated only on success.
    pub async fn select_node(&self, group: &str, node: &str) -> Result<()> {
        let path = format!("/proxies/{}", urlencoding::encode(group));
        self.send(
            &path,
            self.request(Method::PUT, &path)
                .json(&serde_json::json!({ "name": node })),
        )
        .await?;
        if let Some(cached) = self.groups.lock().iter_mut().find(|g| g.name == group) {
            cached.now = node.to_string();
        }
        info!(group, node, "proxy node selected");
        Ok(())
    }

    /// Probe every node of `group` concurrently.
    ///
    /// Sentinel pseudo-nodes are skipped. A failed probe is recorded as
    /// [`Latency::Unreachable`] rather than failing the batch. Only one batch
    /// per group may be outstanding.
    pub async fn test_latency(&self, group: &str) -> Result<HashMap<String, Latency>> {
        let _guard = self
            .inflight
            .acquire(group)
            .ok_or_else(|| ControlError::LatencyTestInFlight(group.to_string()))?;

        let members = match self.cached_members(group) {
            Some(members) => members,
            None => self.fetch_members(group).await?,
        };

        let probes = members
            .into_iter()
            .filter(|node| !SENTINEL_NODES.contains(&node.as_str()))
            .map(|node| async move {
                let latency = self.probe_delay(&node).await;
                (node, latency)
            });
        let results: HashMap<String, Latency> = join_all(probes).await.into_iter().collect();

        let reachable = results.values().filter(|l| l.as_millis().is_some()).count();
        info!(group, nodes = results.len(), reachable, "latency test finished");
        Ok(results)
    }

    fn cached_members(&self, group: &str) -> Option<Vec<String>> {
        self.groups
            .lock()
            .iter()
            .find(|g| g.name == group)
            .map(|g| g.all.clone())
    }

    async fn fetch_members(&self, group: &str) -> Result<Vec<String>> {
        let path = format!("/proxies/{}", urlencoding::encode(group));
        let resp = match self.send(&path, self.request(Method::GET, &path)).await {
            Ok(resp) => resp,
            Err(ControlError::Status { status: 404, .. }) => {
                return Err(ControlError::GroupNotFound(group.to_string()))
            }
            Err(e) => return Err(e),
        };
        let entry: ProxyEntry = Self::decode(&path, resp).await?;
        if entry.all.is_empty() {
            return Err(ControlError::GroupNotFound(group.to_string()));
        }
        Ok(entry.all)
    }

    async fn probe_delay(&self, node: &str) -> Latency {
        let path = format!("/proxies/{}/delay", urlencoding::encode(node));
        let timeout_ms = self.latency.timeout.as_millis().to_string();
        let req = self.request(Method::GET, &path).query(&[
            ("timeout", timeout_ms.as_str()),
            ("url", self.latency.probe_url.as_str()),
        ]);

        let probe = async {
            let resp = self.send(&path, req).await?;
            Self::decode::<DelayResponse>(&path, resp).await
        };
        match tokio::time::timeout(self.latency.timeout + PROBE_GRACE, probe).await {
            Ok(Ok(body)) => Latency::Millis(body.delay),
            Ok(Err(e)) => {
                debug!(node, "latency probe failed: {e}");
                Latency::Unreachable
            }
            Err(_) => {
                debug!(node, "latency probe timed out");
                Latency::Unreachable
            }
        }
    }
}

/// Stable-sort `groups` by their position in `order`.
///
/// Groups named in `order` come first, in that order; the rest follow in
/// their original relative order.
pub fn order_groups(mut groups: Vec<ProxyGroup>, order: &[String]) -> Vec<ProxyGroup> {
    if order.is_empty() {
        return groups;
    }
    groups.sort_by_key(|g| {
        order
            .iter()
            .position(|name| name == &g.name)
            .unwrap_or(usize::MAX)
    });
    groups
}

/// Move `GLOBAL` to the front in Global mode, to the back otherwise.
pub fn place_global(mut groups: Vec<ProxyGroup>, mode: Option<Mode>) -> Vec<ProxyGroup> {
    if let Some(at) = groups.iter().position(|g| g.name == GLOBAL_GROUP) {
        let global = groups.remove(at);
        if mode == Some(Mode::Global) {
            groups.insert(0, global);
        } else {
            groups.push(global);
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str) -> ProxyGroup {
        ProxyGroup {
            name: name.to_string(),
            kind: SELECTOR_KIND.to_string(),
            now: String::new(),
            all: Vec::new(),
        }
    }

    fn names(groups: &[ProxyGroup]) -> Vec<&str> {
        groups.iter().map(|g| g.name.as_str()).collect()
    }

    #[test]
    fn captured_order_wins_and_unknown_groups_trail() {
        let order = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let sorted = order_groups(vec![group("C"), group("A"), group("D")], &order);
        assert_eq!(names(&sorted), ["A", "C", "D"]);
    }

    #[test]
    fn absent_groups_keep_retrieval_order() {
        let order = vec!["Proxy".to_string()];
        let sorted = order_groups(
            vec![group("Zeta"), group("Alpha"), group("Proxy"), group("Mid")],
            &order,
        );
        assert_eq!(names(&sorted), ["Proxy", "Zeta", "Alpha", "Mid"]);
    }

    #[test]
    fn global_group_follows_mode() {
        let groups = || vec![group("Proxy"), group(GLOBAL_GROUP), group("Streaming")];
        assert_eq!(
            names(&place_global(groups(), Some(Mode::Global))),
            ["GLOBAL", "Proxy", "Streaming"]
        );
        assert_eq!(
            names(&place_global(groups(), Some(Mode::Rule))),
            ["Proxy", "Streaming", "GLOBAL"]
        );
        assert_eq!(names(&place_global(groups(), None)), ["Proxy", "Streaming", "GLOBAL"]);
    }

    #[test]
    fn empty_order_is_identity() {
        let sorted = order_groups(vec![group("b"), group("a")], &[]);
        assert_eq!(names(&sorted), ["b", "a"]);
    }

    #[test]
    fn empty_secret_is_dropped() {
        let client = ControlClient::local(9090).with_secret("");
        assert!(client.secret().is_none());
        let client = ControlClient::local(9090).with_secret("s3cret");
        assert_eq!(client.secret(), Some("s3cret"));
    }

    #[test]
    fn base_url_is_normalized() {
        let client = ControlClient::new("http://127.0.0.1:9090/");
        assert_eq!(client.base_url(), "http://127.0.0.1:9090");
    }
}
