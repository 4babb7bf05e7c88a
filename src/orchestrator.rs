//! Application context.
//!
//! One [`Orchestrator`] is built at startup and owns every mutable resource:
//! the system proxy, the core process, the endpoint pool, persisted state and
//! the event bus. Front ends call its operations and listen on the bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ednovas_controller::{
    ControlClient, ControlError, Latency, LatencyPolicy, Mode, ProxyGroup, ReadyPolicy,
};
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{AppPaths, Config};
use crate::error::{AppError, AppResult, UpstreamError};
use crate::events::{AppEvent, EventBus, Subscription};
use crate::locator::Locator;
use crate::network::{LaunchTarget, ProxyEndpoint, SystemNetwork};
use crate::ports::resolve_control_port;
use crate::privilege;
use crate::profile::{group_order, inject_directives, Directives};
use crate::state::StateStore;
use crate::subscription::SubscriptionCache;
use crate::supervisor::{CoreState, Supervisor, SupervisorOptions};
use crate::upstream::{
    subscribe_url, AccountClient, EndpointResolver, ResolverOptions, SubscriptionInfo, UserInfo,
};

/// Snapshot for `status` output.
#[derive(Debug, Clone)]
pub struct Status {
    pub core: CoreState,
    pub pid: Option<u32>,
    pub system_proxy: bool,
    pub endpoint: String,
    pub logged_in: bool,
    pub tun: bool,
    pub controller_port: u16,
    pub mode: Option<Mode>,
    /// A core started by another session (a `run` in another terminal).
    pub external_pid: Option<u32>,
}

/// What a TUN change did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunApplied {
    /// Saved; the next start uses it.
    Saved,
    /// The core this session owns was restarted with it.
    Restarted,
    /// Another session's core is running and keeps its old setting until
    /// that session restarts it.
    NeedsRestart { pid: u32 },
}

pub struct Orchestrator {
    config: Config,
    paths: AppPaths,
    events: EventBus,
    net: Arc<SystemNetwork>,
    supervisor: Mutex<Supervisor>,
    resolver: EndpointResolver,
    account: AccountClient,
    control: ControlClient,
    state: StateStore,
    cache: SubscriptionCache,
    controller_port: u16,
    elevated: fn() -> bool,
}

impl Orchestrator {
    pub fn new(config: Config, paths: AppPaths, net: Arc<SystemNetwork>) -> AppResult<Self> {
        paths.ensure().map_err(|e| AppError::State(format!("{e:#}")))?;
        let events = EventBus::default();
        let state = StateStore::open(&paths.state_file());
        let controller_port = resolve_control_port(&config.core, &state)?;

        let locator = Locator::for_current_process(config.core.resources_dir.clone());
        let supervisor = Supervisor::new(
            locator,
            paths.pid_file(),
            SupervisorOptions {
                settle_delay: config.core.settle_delay(),
                kill_orphans_by_name: config.core.kill_orphans_by_name,
                controller_port,
                ..SupervisorOptions::default()
            },
            events.clone(),
        );

        let resolver =
            EndpointResolver::new(ResolverOptions::from(&config.upstream), events.clone());
        if let Some(pinned) = state.snapshot().endpoint_override {
            resolver.override_endpoint(&pinned);
        }

        let control = ControlClient::local(controller_port)
            .with_secret(config.core.controller_secret.clone())
            .with_latency_policy(LatencyPolicy {
                probe_url: config.latency.probe_url.clone(),
                timeout: Duration::from_millis(config.latency.timeout_ms),
            });
        let account = AccountClient::new(config.subscription.user_agent.clone());
        let cache = SubscriptionCache::new(
            paths.subscription_cache(),
            config.subscription.cache_ttl_hours,
        );

        Ok(Self {
            config,
            paths,
            events,
            net,
            supervisor: Mutex::new(supervisor),
            resolver,
            account,
            control,
            state,
            cache,
            controller_port,
            elevated: privilege::is_elevated,
        })
    }

    /// Replace the administrator-rights check used for TUN mode.
    pub fn with_elevation_check(mut self, check: fn() -> bool) -> Self {
        self.elevated = check;
        self
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn network(&self) -> &Arc<SystemNetwork> {
        &self.net
    }

    pub async fn resolve_endpoint(&self) -> String {
        self.resolver.resolve().await
    }

    /// Pin the API endpoint (persisted). `None` clears the pin.
    pub fn override_endpoint(&self, url: Option<&str>) -> AppResult<()> {
        if let Some(url) = url {
            self.resolver.override_endpoint(url);
        }
        self.state
            .update(|s| s.endpoint_override = url.map(str::to_string))?;
        Ok(())
    }

    pub async fn status(&self) -> Status {
        let mut supervisor = self.supervisor.lock().await;
        let snapshot = self.state.snapshot();
        let core = supervisor.state();
        let external_pid = match core {
            CoreState::Stopped => supervisor.foreign_core().await,
            _ => None,
        };
        Status {
            core,
            pid: supervisor.pid(),
            system_proxy: self.net.is_enabled(),
            endpoint: self.resolver.active(),
            logged_in: snapshot.token.is_some(),
            tun: snapshot.tun,
            controller_port: self.controller_port,
            mode: self.control.mode(),
            external_pid,
        }
    }

    // ── Account ─────────────────────────────────────────────────────

    pub async fn login(&self, email: &str, password: &str) -> AppResult<()> {
        let token = self
            .resolver
            .with_failover(|endpoint| async move {
                self.account.login(&endpoint, email, password).await
            })
            .await?;
        self.state.update(|s| s.token = Some(token))?;
        tracing::info!("logged in as {email}");
        Ok(())
    }

    /// Forget the account, stop the core and put the system proxy back.
    ///
    /// A core left by another session is stopped too; that session sees the
    /// exit and restores its own proxy setting.
    pub async fn logout(&self) -> AppResult<()> {
        self.shutdown().await;
        if let Some(pid) = self.supervisor.lock().await.stop_foreign().await {
            tracing::info!("stopped core {pid} of another session");
        }
        self.state.update(|s| {
            s.token = None;
            s.subscribe_url = None;
            s.group_order.clear();
        })?;
        if let Err(e) = self.cache.clear().await {
            tracing::warn!("could not clear subscription cache: {e:#}");
        }
        tracing::info!("logged out");
        Ok(())
    }

    fn token(&self) -> AppResult<String> {
        self.state
            .snapshot()
            .token
            .ok_or(AppError::Upstream(UpstreamError::NotLoggedIn))
    }

    pub async fn user_info(&self) -> AppResult<UserInfo> {
        let token = self.token()?;
        let token = token.as_str();
        Ok(self
            .resolver
            .with_failover(|endpoint| async move { self.account.user_info(&endpoint, token).await })
            .await?)
    }

    pub async fn subscription(&self) -> AppResult<SubscriptionInfo> {
        let token = self.token()?;
        let token = token.as_str();
        Ok(self
            .resolver
            .with_failover(|endpoint| async move {
                self.account.subscription(&endpoint, token).await
            })
            .await?)
    }

    // ── Core lifecycle ──────────────────────────────────────────────

    /// Verify the account has a plan, then start the core.
    pub async fn check_and_start(&self) -> AppResult<u32> {
        self.restore_pending_tun()?;
        let sub = self.subscription().await?;
        if !sub.has_plan() {
            return Err(UpstreamError::NoPlan.into());
        }
        self.start_core().await
    }

    /// Fetch (or reuse) the profile, start the core and wait for its API.
    ///
    /// Holds the supervisor lock for the whole sequence, so concurrent calls
    /// run one after the other. Returns the core PID.
    pub async fn start_core(&self) -> AppResult<u32> {
        let mut supervisor = self.supervisor.lock().await;

        let profile = self.load_profile().await?;
        let order = group_order(&profile);
        if !order.is_empty() {
            self.state.update(|s| s.group_order = order)?;
        }

        let directives = Directives {
            mixed_port: self.config.proxy.mixed_port,
            allow_lan: self.config.proxy.allow_lan,
            controller_port: self.controller_port,
            secret: self.config.core.controller_secret.clone(),
            mode: Mode::Rule,
            tun: self.tun_allowed(),
        };
        let config_path = self.paths.core_config();
        tokio::fs::write(&config_path, inject_directives(&profile, &directives)).await?;

        let locator = Locator::for_current_process(self.config.core.resources_dir.clone());
        if let Err(e) = locator.seed_geo_files(&self.paths.core_dir()) {
            tracing::warn!("could not seed geo databases: {e}");
        }

        let pid = supervisor.start(&config_path).await?;
        drop(supervisor);

        let policy = ReadyPolicy {
            poll_interval: Duration::from_millis(self.config.core.ready_poll_interval_ms),
            max_attempts: self.config.core.ready_max_attempts,
            ..ReadyPolicy::default()
        };
        let events = self.events.clone();
        self.control
            .await_ready(&policy, |attempt| events.emit(AppEvent::ReadyProgress(attempt)))
            .await?;
        self.control.set_mode(Mode::Rule).await?;
        Ok(pid)
    }

    /// Cached profile when fresh, otherwise a download through the mirror
    /// pool. A stale cache is the last resort.
    async fn load_profile(&self) -> AppResult<String> {
        let token = self.token()?;
        if let Some(profile) = self.cache.fresh(&token).await {
            tracing::info!("using cached profile");
            return Ok(profile);
        }

        let path = self.config.upstream.subscribe_path.as_str();
        let auth = token.as_str();
        let download = self
            .resolver
            .with_failover(|endpoint| async move {
                let sub = self.account.subscription(&endpoint, auth).await?;
                let url = subscribe_url(&endpoint, path, &sub.token);
                let profile = self.account.download_config(&url).await?;
                Ok::<_, UpstreamError>((url, profile))
            })
            .await;

        match download {
            Ok((url, profile)) => {
                if let Err(e) = self.cache.save(&token, &profile).await {
                    tracing::warn!("could not cache profile: {e:#}");
                }
                self.state.update(|s| s.subscribe_url = Some(url))?;
                Ok(profile)
            }
            Err(e) => match self.cache.load().await {
                Some(stale) if stale.source == token => {
                    tracing::warn!("profile download failed ({e}), using stale cache");
                    Ok(stale.content)
                }
                _ => Err(e.into()),
            },
        }
    }

    /// Same sequence as a start; the running core is replaced.
    pub async fn restart_core(&self) -> AppResult<u32> {
        self.start_core().await
    }

    pub async fn stop_core(&self) {
        self.supervisor.lock().await.stop().await;
    }

    /// Persist the TUN preference and restart a running core with it.
    ///
    /// Turning TUN on needs administrator rights. Without them the request is
    /// remembered for the next elevated start and `NotElevated` is returned.
    pub async fn set_tun_mode(&self, enabled: bool) -> AppResult<TunApplied> {
        if enabled && !(self.elevated)() {
            self.state.update(|s| s.pending_tun = true)?;
            return Err(AppError::NotElevated);
        }
        self.state.update(|s| {
            s.tun = enabled;
            s.pending_tun = false;
        })?;

        let mut supervisor = self.supervisor.lock().await;
        if supervisor.state() == CoreState::Running {
            drop(supervisor);
            self.restart_core().await?;
            return Ok(TunApplied::Restarted);
        }
        Ok(match supervisor.foreign_core().await {
            Some(pid) => TunApplied::NeedsRestart { pid },
            None => TunApplied::Saved,
        })
    }

    /// Apply a TUN request left by an unelevated session. The request is
    /// dropped either way; returns whether TUN was turned on.
    pub fn restore_pending_tun(&self) -> AppResult<bool> {
        if !self.state.snapshot().pending_tun {
            return Ok(false);
        }
        let elevated = (self.elevated)();
        self.state.update(|s| {
            s.pending_tun = false;
            if elevated {
                s.tun = true;
            }
        })?;
        if elevated {
            tracing::info!("enabling TUN mode requested by an earlier session");
        }
        Ok(elevated)
    }

    fn tun_allowed(&self) -> bool {
        if !self.state.snapshot().tun {
            return false;
        }
        if (self.elevated)() {
            return true;
        }
        tracing::warn!(
            "TUN mode is on but this session lacks administrator rights; starting without it"
        );
        false
    }

    // ── Control plane ───────────────────────────────────────────────

    /// A control API that does not answer means no core is listening.
    fn control_error(&self, e: ControlError) -> AppError {
        if e.is_unreachable() {
            AppError::CoreNotRunning { port: self.controller_port }
        } else {
            e.into()
        }
    }

    pub async fn set_mode(&self, mode: Mode) -> AppResult<()> {
        self.control.set_mode(mode).await.map_err(|e| self.control_error(e))
    }

    /// Selector groups in profile declaration order, GLOBAL placed by the
    /// core's mode.
    pub async fn groups(&self) -> AppResult<Vec<ProxyGroup>> {
        if self.control.mode().is_none() {
            match self.control.fetch_mode().await {
                Ok(_) => {}
                Err(e) if e.is_unreachable() => return Err(self.control_error(e)),
                Err(e) => tracing::debug!("could not read core mode: {e}"),
            }
        }
        let order = self.state.snapshot().group_order;
        self.control
            .list_proxy_groups(&order)
            .await
            .map_err(|e| self.control_error(e))
    }

    pub async fn select_node(&self, group: &str, node: &str) -> AppResult<()> {
        self.control
            .select_node(group, node)
            .await
            .map_err(|e| self.control_error(e))
    }

    pub async fn test_latency(&self, group: &str) -> AppResult<HashMap<String, Latency>> {
        self.control
            .test_latency(group)
            .await
            .map_err(|e| self.control_error(e))
    }

    /// Publish traffic samples on the bus until `cancel` fires or the stream
    /// ends.
    pub async fn watch_traffic(&self, cancel: CancellationToken) -> AppResult<()> {
        let mut stream = self.control.traffic().await.map_err(|e| self.control_error(e))?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                sample = stream.next() => match sample {
                    Some(Ok(t)) => self.events.emit(AppEvent::Traffic { up: t.up, down: t.down }),
                    Some(Err(e)) => {
                        tracing::warn!("traffic stream error: {e}");
                        break;
                    }
                    None => break,
                },
            }
        }
        Ok(())
    }

    // ── Host integration ────────────────────────────────────────────

    pub fn proxy_endpoint(&self) -> ProxyEndpoint {
        ProxyEndpoint::new(self.config.proxy.host.clone(), self.config.proxy.mixed_port)
    }

    /// Point the system proxy at the core (or restore the previous setting).
    /// Blocks while the OS commands run.
    pub fn set_system_proxy(&self, enable: bool) {
        let report = self.net.apply(enable, &self.proxy_endpoint());
        if !report.all_ok() {
            tracing::warn!(
                "{} of {} proxy commands failed",
                report.failures().count(),
                report.outcomes.len()
            );
        }
        self.events.emit(AppEvent::SystemProxy { enabled: enable });
    }

    pub fn set_auto_start(&self, enable: bool) -> AppResult<bool> {
        let target = LaunchTarget::current()?;
        Ok(self.net.set_auto_start(enable, &target))
    }

    pub fn auto_start_enabled(&self) -> bool {
        self.net.auto_start_enabled()
    }

    /// Restore the system proxy, then stop the core.
    pub async fn shutdown(&self) {
        if self.net.is_enabled() {
            self.set_system_proxy(false);
        }
        self.stop_core().await;
    }
}
