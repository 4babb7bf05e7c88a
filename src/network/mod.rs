//! System-wide proxy settings and login-item registration.
//!
//! Each OS family gets a [`NetworkEffector`] that knows which commands to run.
//! [`SystemNetwork`] executes them, remembers whether the proxy is on, and
//! makes sure it is switched back off when the process goes away.
//!
//! All calls here block the calling thread. They must have finished before the
//! process exits, so they are never moved onto a background task.

pub mod batch;
pub mod linux;
pub mod macos;
pub mod windows;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub use batch::{run_batch, BatchReport, CommandOutput, CommandRunner, SysCommand, SystemRunner};
pub use linux::LinuxEffector;
pub use macos::MacEffector;
pub use windows::WindowsEffector;

use crate::error::EffectorError;

/// Where the system proxy should point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What a login item launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTarget {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchTarget {
    /// The running executable started in the background.
    pub fn current() -> std::io::Result<Self> {
        let exe = std::env::current_exe()?;
        // Resolve symlinks so a login item survives e.g. a Homebrew shim.
        let program = std::fs::canonicalize(&exe).unwrap_or(exe);
        Ok(Self {
            program,
            args: vec!["run".into(), "--hidden".into()],
        })
    }

    /// Single-line form for the registry and `.desktop` files.
    pub fn command_line(&self) -> String {
        let program = self.program.display().to_string();
        let mut line = if program.contains(' ') {
            format!("\"{program}\"")
        } else {
            program
        };
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Per-OS knowledge of how to toggle the proxy and the login item.
pub trait NetworkEffector: Send + Sync {
    fn platform(&self) -> &'static str;

    /// Commands that route system traffic through `endpoint`.
    fn enable_commands(&self, endpoint: &ProxyEndpoint) -> Vec<SysCommand>;

    /// Commands that switch the system proxy off.
    fn disable_commands(&self) -> Vec<SysCommand>;

    /// Read the settings `enable_commands` would overwrite and return the
    /// commands that put them back.
    ///
    /// `None` when nothing could be read, or when the settings already point
    /// at `ours` (left over from an unclean exit); reverting then falls back
    /// to `disable_commands`.
    fn capture_restore(
        &self,
        runner: &dyn CommandRunner,
        ours: &ProxyEndpoint,
    ) -> Option<Vec<SysCommand>>;

    /// Register or unregister the login item. Idempotent.
    fn set_auto_start(
        &self,
        runner: &dyn CommandRunner,
        enable: bool,
        target: &LaunchTarget,
    ) -> Result<(), EffectorError>;

    fn auto_start_enabled(&self, runner: &dyn CommandRunner) -> bool;
}

/// Effector for the OS this binary was built for.
pub fn platform_effector() -> Box<dyn NetworkEffector> {
    #[cfg(target_os = "windows")]
    {
        Box::new(WindowsEffector::new())
    }
    #[cfg(target_os = "macos")]
    {
        let home = directories::BaseDirs::new()
            .map(|d| d.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        // SAFETY: getuid has no preconditions and cannot fail.
        let uid = unsafe { libc::getuid() };
        Box::new(MacEffector::new(home, uid))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let config_home = directories::BaseDirs::new()
            .map(|d| d.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".config"));
        Box::new(LinuxEffector::new(config_home))
    }
}

/// Last state this process applied. Never read back from the OS.
#[derive(Debug, Clone, Default)]
pub struct ProxyStateFlag(Arc<AtomicBool>);

impl ProxyStateFlag {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }
}

/// Owner of the system proxy state for this process.
pub struct SystemNetwork {
    effector: Box<dyn NetworkEffector>,
    runner: Arc<dyn CommandRunner>,
    state: ProxyStateFlag,
    snapshot: Mutex<Option<Vec<SysCommand>>>,
}

impl fmt::Debug for SystemNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemNetwork")
            .field("platform", &self.effector.platform())
            .field("enabled", &self.state.get())
            .finish()
    }
}

impl SystemNetwork {
    pub fn new(effector: Box<dyn NetworkEffector>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            effector,
            runner,
            state: ProxyStateFlag::default(),
            snapshot: Mutex::new(None),
        }
    }

    /// Host effector with real commands.
    pub fn for_host() -> Self {
        Self::new(platform_effector(), Arc::new(SystemRunner))
    }

    pub fn platform(&self) -> &'static str {
        self.effector.platform()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.get()
    }

    pub fn state(&self) -> ProxyStateFlag {
        self.state.clone()
    }

    /// Turn the system proxy on (pointing at `endpoint`) or off.
    ///
    /// Best effort: individual command failures are logged and reported, and
    /// the state flag follows the request either way.
    pub fn apply(&self, enable: bool, endpoint: &ProxyEndpoint) -> BatchReport {
        if enable {
            self.enable(endpoint)
        } else {
            self.revert()
        }
    }

    fn enable(&self, endpoint: &ProxyEndpoint) -> BatchReport {
        {
            let mut snapshot = self.snapshot.lock();
            // Enabling twice must not capture our own settings as "previous".
            if snapshot.is_none() && !self.state.get() {
                *snapshot = self.effector.capture_restore(self.runner.as_ref(), endpoint);
            }
        }
        let report = run_batch(self.runner.as_ref(), &self.effector.enable_commands(endpoint));
        self.state.set(true);
        tracing::info!(
            "system proxy on ({endpoint}, {}/{} commands ok)",
            report.succeeded(),
            report.outcomes.len()
        );
        report
    }

    /// Restore what was there before `apply(true, ..)`, or switch the proxy
    /// off when nothing was captured.
    pub fn revert(&self) -> BatchReport {
        let commands = self
            .snapshot
            .lock()
            .take()
            .unwrap_or_else(|| self.effector.disable_commands());
        let report = run_batch(self.runner.as_ref(), &commands);
        self.state.set(false);
        tracing::info!(
            "system proxy off ({}/{} commands ok)",
            report.succeeded(),
            report.outcomes.len()
        );
        report
    }

    /// Returns whether the registration change went through. Failures are logged.
    pub fn set_auto_start(&self, enable: bool, target: &LaunchTarget) -> bool {
        match self
            .effector
            .set_auto_start(self.runner.as_ref(), enable, target)
        {
            Ok(()) => {
                tracing::info!("auto-start {}", if enable { "enabled" } else { "disabled" });
                true
            }
            Err(e) => {
                tracing::error!("failed to change auto-start: {e}");
                false
            }
        }
    }

    pub fn auto_start_enabled(&self) -> bool {
        self.effector.auto_start_enabled(self.runner.as_ref())
    }
}

/// Reverts the system proxy when dropped, if this process turned it on.
pub struct ExitGuard {
    net: Arc<SystemNetwork>,
}

impl ExitGuard {
    pub fn new(net: Arc<SystemNetwork>) -> Self {
        Self { net }
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.net.is_enabled() {
            tracing::info!("restoring system proxy on exit");
            self.net.revert();
        }
    }
}

/// Chain a panic hook that records the panic to the log and reverts the
/// system proxy before the default hook runs.
pub fn install_panic_hook(net: Arc<SystemNetwork>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("fatal: {info}");
        if net.is_enabled() {
            net.revert();
        }
        previous(info);
    }));
}

#[cfg(test)]
pub(crate) mod fake;

#[cfg(test)]
mod tests {
    use super::fake::FakeHost;
    use super::*;

    fn ours() -> ProxyEndpoint {
        ProxyEndpoint::new("127.0.0.1", 7890)
    }

    fn round_trip(effector: Box<dyn NetworkEffector>, host: Arc<FakeHost>) {
        let before = host.values();
        let net = SystemNetwork::new(effector, host.clone());

        net.apply(true, &ours());
        assert!(net.is_enabled());
        assert_ne!(host.values(), before);

        // A second enable must not overwrite the captured original.
        net.apply(true, &ours());

        net.apply(false, &ours());
        assert!(!net.is_enabled());
        assert_eq!(host.values(), before);
    }

    #[test]
    fn linux_enable_then_disable_restores_previous_settings() {
        let host = Arc::new(FakeHost::gnome_with_proxy("'auto'", "'corp.proxy'", "3128"));
        round_trip(Box::new(LinuxEffector::new(PathBuf::from("/nonexistent"))), host);
    }

    #[test]
    fn windows_enable_then_disable_restores_previous_settings() {
        let host = Arc::new(FakeHost::windows_with_proxy(Some(("0x0", "corp.proxy:3128"))));
        round_trip(Box::new(WindowsEffector::new()), host);

        let pristine = Arc::new(FakeHost::windows_with_proxy(None));
        round_trip(Box::new(WindowsEffector::new()), pristine);
    }

    #[test]
    fn macos_enable_then_disable_restores_previous_settings() {
        let host = Arc::new(FakeHost::macos(&["Wi-Fi", "Ethernet"]));
        host.set("Wi-Fi|webproxy|enabled", "Yes");
        host.set("Wi-Fi|webproxy|server", "corp.proxy");
        host.set("Wi-Fi|webproxy|port", "3128");
        round_trip(Box::new(MacEffector::new(PathBuf::from("/nonexistent"), 501)), host);
    }

    #[test]
    fn missing_interfaces_do_not_abort_the_batch() {
        let host = Arc::new(FakeHost::macos(&["Wi-Fi"]));
        let net = SystemNetwork::new(
            Box::new(MacEffector::new(PathBuf::from("/nonexistent"), 501)),
            host.clone(),
        );
        let report = net.apply(true, &ours());
        // Wi-Fi's three kinds apply; the three absent services fail.
        assert_eq!(report.succeeded(), 3);
        assert_eq!(report.failures().count(), 9);
        assert_eq!(host.get("Wi-Fi|socksfirewallproxy|enabled").as_deref(), Some("Yes"));
    }

    #[test]
    fn leftover_proxy_from_crash_is_switched_off() {
        let host = Arc::new(FakeHost::gnome_with_proxy("'manual'", "'127.0.0.1'", "7890"));
        let net = SystemNetwork::new(
            Box::new(LinuxEffector::new(PathBuf::from("/nonexistent"))),
            host.clone(),
        );
        net.apply(true, &ours());
        net.apply(false, &ours());
        assert_eq!(host.get("org.gnome.system.proxy mode").as_deref(), Some("'none'"));
    }

    #[test]
    fn exit_guard_reverts_only_when_enabled() {
        let host = Arc::new(FakeHost::gnome_with_proxy("'none'", "''", "0"));
        let net = Arc::new(SystemNetwork::new(
            Box::new(LinuxEffector::new(PathBuf::from("/nonexistent"))),
            host.clone(),
        ));

        drop(ExitGuard::new(net.clone()));
        assert_eq!(host.commands_run(), 0);

        net.apply(true, &ours());
        drop(ExitGuard::new(net.clone()));
        assert!(!net.is_enabled());
        assert_eq!(host.get("org.gnome.system.proxy mode").as_deref(), Some("'none'"));
    }

    #[test]
    fn launch_target_quotes_spaced_program() {
        let target = LaunchTarget {
            program: PathBuf::from(r"C:\Program Files\EdNovas\ednovas.exe"),
            args: vec!["run".into(), "--hidden".into()],
        };
        assert_eq!(
            target.command_line(),
            r#""C:\Program Files\EdNovas\ednovas.exe" run --hidden"#
        );
    }
}
