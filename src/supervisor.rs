//! Proxy-core child process lifecycle.
//!
//! # Start sequence
//! ```text
//! Supervisor::start(config)
//!   → stop the handle we own (if any)
//!   → kill orphans: recorded PID (only if it still runs the core), then
//!     (optionally) by exact name / port
//!   → chmod 755 the binary
//!   → settle delay so the OS releases the ports
//!   → spawn `<bin> -d <dir> -f <config>` and record its PID
//!   → forward stdout/stderr lines to the event bus
//! ```
//! At most one child is owned at any time. Overlapping starts are prevented
//! by the caller holding the supervisor behind an async mutex.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::error::SupervisorError;
use crate::events::{AppEvent, CoreStream, EventBus};
use crate::locator::{Locator, CORE_BINARY_NAME};

/// Marker the core prints when its listen port is taken.
const PORT_CONFLICT_MARKER: &str = "address already in use";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Stopped,
    Starting,
    Running,
}

impl fmt::Display for CoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub settle_delay: Duration,
    /// How long the child must survive after spawn to count as started.
    pub startup_grace: Duration,
    pub kill_orphans_by_name: bool,
    /// Control port, freed with `fuser` during the orphan sweep.
    pub controller_port: u16,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(2000),
            startup_grace: Duration::from_millis(300),
            kill_orphans_by_name: true,
            controller_port: crate::config::DEFAULT_CONTROLLER_PORT,
        }
    }
}

pub struct Supervisor {
    locator: Locator,
    pid_file: PathBuf,
    options: SupervisorOptions,
    events: EventBus,
    child: Option<Child>,
    state: CoreState,
}

impl Supervisor {
    pub fn new(
        locator: Locator,
        pid_file: PathBuf,
        options: SupervisorOptions,
        events: EventBus,
    ) -> Self {
        Self {
            locator,
            pid_file,
            options,
            events,
            child: None,
            state: CoreState::Stopped,
        }
    }

    /// Current state, noticing a child that died on its own.
    pub fn state(&mut self) -> CoreState {
        if self.state == CoreState::Running {
            let exited = match self.child.as_mut() {
                Some(child) => child.try_wait().ok().flatten().map(|s| s.to_string()),
                None => Some("no process".to_string()),
            };
            if let Some(status) = exited {
                tracing::warn!("proxy core exited unexpectedly ({status})");
                self.events.emit(AppEvent::Core(format!("exited ({status})")));
                self.child = None;
                self.state = CoreState::Stopped;
                remove_pid_file(&self.pid_file);
            }
        }
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// PID of a core started by another session on this data directory.
    ///
    /// `None` while this supervisor owns a child, when no PID is recorded, or
    /// when the recorded process is gone or is not the core.
    pub async fn foreign_core(&self) -> Option<u32> {
        if self.child.is_some() {
            return None;
        }
        let pid = read_pid_file(&self.pid_file)?;
        is_core_process(pid).await.then_some(pid)
    }

    /// Kill a core owned by another session. Returns its PID if one was
    /// killed.
    pub async fn stop_foreign(&self) -> Option<u32> {
        let pid = self.foreign_core().await?;
        if !kill_pid(pid).await {
            return None;
        }
        tracing::info!("stopped proxy core of another session (pid {pid})");
        remove_pid_file(&self.pid_file);
        Some(pid)
    }

    /// (Re)start the core with `config_path`. Returns the new PID.
    ///
    /// On failure the supervisor is left `Stopped` and `start` may simply be
    /// called again.
    pub async fn start(&mut self, config_path: &Path) -> Result<u32, SupervisorError> {
        self.state = CoreState::Starting;
        match self.start_inner(config_path).await {
            Ok(pid) => {
                self.state = CoreState::Running;
                self.events.emit(AppEvent::Core(format!("running (pid {pid})")));
                Ok(pid)
            }
            Err(e) => {
                self.state = CoreState::Stopped;
                tracing::error!("proxy core failed to start: {e}");
                self.events.emit(AppEvent::Core(format!("start failed: {e}")));
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self, config_path: &Path) -> Result<u32, SupervisorError> {
        // 1. Our own handle.
        self.terminate_owned().await;

        // 2. Orphans from earlier runs or other instances.
        self.kill_orphans().await;

        // 3. Executable bit (archives and some updaters drop it).
        let binary = self.locator.locate_binary()?;
        ensure_executable(&binary).await;

        // 4. Let the OS release sockets held by killed processes.
        if !self.options.settle_delay.is_zero() {
            tokio::time::sleep(self.options.settle_delay).await;
        }

        // 5. Spawn.
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut command = Command::new(&binary);
        command
            .arg("-d")
            .arg(&config_dir)
            .arg("-f")
            .arg(config_path)
            .current_dir(&config_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        command.creation_flags(0x0800_0000);

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            binary: binary.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        tracing::info!("spawned proxy core {} (pid {pid})", binary.display());

        // 6. Output forwarding.
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, CoreStream::Stdout, self.events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, CoreStream::Stderr, self.events.clone()));
        }

        if !self.options.startup_grace.is_zero() {
            tokio::time::sleep(self.options.startup_grace).await;
        }
        if let Ok(Some(status)) = child.try_wait() {
            return Err(SupervisorError::ExitedEarly(status.to_string()));
        }

        if let Some(parent) = self.pid_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.pid_file, pid.to_string()).await?;

        self.child = Some(child);
        Ok(pid)
    }

    /// Stop the owned core. A child that already died is fine.
    pub async fn stop(&mut self) {
        self.terminate_owned().await;
        if self.state != CoreState::Stopped {
            self.events.emit(AppEvent::Core("stopped".into()));
        }
        self.state = CoreState::Stopped;
    }

    async fn terminate_owned(&mut self) {
        if let Some(mut child) = self.child.take() {
            let pid = child.id();
            child.kill().await.ok();
            let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
            tracing::debug!("terminated proxy core (pid {pid:?})");
            remove_pid_file(&self.pid_file);
        }
    }

    async fn kill_orphans(&self) {
        if let Some(pid) = read_pid_file(&self.pid_file) {
            // PIDs are reused after a crash or reboot.
            if is_core_process(pid).await {
                if kill_pid(pid).await {
                    tracing::info!("killed orphaned proxy core (pid {pid})");
                }
            } else {
                tracing::debug!("recorded pid {pid} is not a running proxy core, skipping");
            }
            remove_pid_file(&self.pid_file);
        }
        if self.options.kill_orphans_by_name {
            for cmd in name_kill_commands(self.options.controller_port) {
                run_quietly(&cmd).await;
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(ref mut child) = self.child {
            let _ = child.start_kill();
        }
    }
}

async fn forward_lines<R>(reader: R, stream: CoreStream, events: EventBus)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.contains(PORT_CONFLICT_MARKER) {
            tracing::error!("proxy core port conflict: {line}");
            events.emit(AppEvent::PortConflict(line.clone()));
        } else {
            tracing::debug!(target: "core", "{line}");
        }
        events.emit(AppEvent::CoreOutput {
            stream: stream.clone(),
            line,
        });
    }
}

async fn ensure_executable(binary: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        if let Err(e) = tokio::fs::set_permissions(binary, perms).await {
            tracing::warn!("could not chmod {}: {e}", binary.display());
        }
    }
    #[cfg(not(unix))]
    let _ = binary;
}

fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn remove_pid_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("could not remove {}: {e}", path.display()),
    }
}

/// Whether a process command line names the core executable, either as the
/// program itself or as the script handed to an interpreter.
fn command_names_core(command: &str) -> bool {
    command.match_indices(CORE_BINARY_NAME).any(|(at, _)| {
        let before = command[..at].chars().next_back();
        let after = command[at + CORE_BINARY_NAME.len()..].chars().next();
        let starts = matches!(before, None | Some('/' | '\\' | '"'));
        let ends = match after {
            None | Some('"') => true,
            Some(c) => c.is_whitespace(),
        };
        starts && ends
    })
}

/// Command line of a live process, `None` when it does not exist.
#[cfg(target_os = "linux")]
async fn process_command(pid: u32) -> Option<String> {
    let raw = tokio::fs::read(format!("/proc/{pid}/cmdline")).await.ok()?;
    let args: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect();
    (!args.is_empty()).then(|| args.join(" "))
}

#[cfg(all(unix, not(target_os = "linux")))]
async fn process_command(pid: u32) -> Option<String> {
    let pid = pid.to_string();
    let out = Command::new("ps")
        .args(["-p", pid.as_str(), "-o", "command="])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    let command = String::from_utf8_lossy(&out.stdout).trim().to_string();
    (out.status.success() && !command.is_empty()).then_some(command)
}

#[cfg(windows)]
async fn process_command(pid: u32) -> Option<String> {
    let filter = format!("PID eq {pid}");
    let mut command = Command::new("tasklist");
    command
        .args(["/FI", filter.as_str(), "/FO", "CSV", "/NH"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(0x0800_0000);
    let out = command.output().await.ok()?;
    let listing = String::from_utf8_lossy(&out.stdout).trim().to_string();
    // "INFO: No tasks are running..." when the PID is gone.
    listing.starts_with('"').then_some(listing)
}

/// The recorded PID is alive and still runs the core.
async fn is_core_process(pid: u32) -> bool {
    match process_command(pid).await {
        Some(command) if command_names_core(&command) => true,
        Some(command) => {
            tracing::warn!("pid {pid} is not the proxy core ({command}), leaving it alone");
            false
        }
        None => false,
    }
}

/// Kill `pid` if it is alive. Returns whether a signal was delivered.
#[cfg(unix)]
async fn kill_pid(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: plain syscalls on a positive PID; signal 0 only probes.
    unsafe {
        if libc::kill(pid, 0) != 0 {
            return false;
        }
        libc::kill(pid, libc::SIGKILL) == 0
    }
}

#[cfg(not(unix))]
async fn kill_pid(pid: u32) -> bool {
    let cmd = vec!["taskkill".to_string(), "/F".into(), "/PID".into(), pid.to_string()];
    run_quietly(&cmd).await
}

/// Exact-name and port sweeps, limited to tools present on this host.
fn name_kill_commands(controller_port: u16) -> Vec<Vec<String>> {
    let candidates: Vec<Vec<String>> = if cfg!(windows) {
        vec![vec![
            "taskkill".into(),
            "/F".into(),
            "/IM".into(),
            CORE_BINARY_NAME.into(),
        ]]
    } else {
        vec![
            vec!["pkill".into(), "-9".into(), "-x".into(), CORE_BINARY_NAME.into()],
            vec!["killall".into(), "-9".into(), CORE_BINARY_NAME.into()],
            vec!["fuser".into(), "-k".into(), format!("{controller_port}/tcp")],
        ]
    };
    candidates
        .into_iter()
        .filter(|cmd| which::which(&cmd[0]).is_ok())
        .collect()
}

/// Run a cleanup command, ignoring its outcome. Returns whether it exited 0.
async fn run_quietly(cmd: &[String]) -> bool {
    let Some((program, args)) = cmd.split_first() else {
        return false;
    };
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(windows)]
    command.creation_flags(0x0800_0000);
    match command.status().await {
        Ok(status) => status.success(),
        Err(e) => {
            tracing::debug!("{program} unavailable: {e}");
            false
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn fake_core(root: &Path, script: &str) {
        use std::os::unix::fs::PermissionsExt;
        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let path = bin.join(CORE_BINARY_NAME);
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        // Deliberately not executable: start must fix that.
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
    }

    fn supervisor(root: &Path, events: EventBus) -> Supervisor {
        Supervisor::new(
            Locator::with_roots(vec![root.to_path_buf()]),
            root.join("core.pid"),
            SupervisorOptions {
                settle_delay: Duration::from_millis(10),
                startup_grace: Duration::from_millis(100),
                kill_orphans_by_name: false,
                controller_port: 9090,
            },
            events,
        )
    }

    fn alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[tokio::test]
    async fn double_start_leaves_one_live_handle() {
        let dir = tempfile::tempdir().unwrap();
        fake_core(dir.path(), "exec sleep 30");
        let mut sup = supervisor(dir.path(), EventBus::default());
        let config = dir.path().join("config.yaml");

        let first = sup.start(&config).await.unwrap();
        assert_eq!(sup.state(), CoreState::Running);
        let second = sup.start(&config).await.unwrap();

        assert_ne!(first, second);
        assert!(!alive(first));
        assert!(alive(second));
        assert_eq!(sup.pid(), Some(second));
        assert_eq!(read_pid_file(&dir.path().join("core.pid")), Some(second));

        sup.stop().await;
        assert_eq!(sup.state(), CoreState::Stopped);
        assert!(!alive(second));
        assert!(!dir.path().join("core.pid").exists());
    }

    /// Run the fake core the way a previous session would have, outside any
    /// supervisor. No `exec`, so the shell keeps the core's command line.
    fn spawn_detached_core(root: &Path) -> std::process::Child {
        use std::os::unix::fs::PermissionsExt;
        let path = root.join("bin").join(CORE_BINARY_NAME);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::process::Command::new(&path).spawn().unwrap()
    }

    #[tokio::test]
    async fn recorded_orphan_core_is_killed_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        fake_core(dir.path(), "sleep 30");
        let mut orphan = spawn_detached_core(dir.path());
        std::fs::write(dir.path().join("core.pid"), orphan.id().to_string()).unwrap();

        let mut sup = supervisor(dir.path(), EventBus::default());
        sup.start(&dir.path().join("config.yaml")).await.unwrap();

        let status = orphan.wait().unwrap();
        assert!(!status.success());
        sup.stop().await;
    }

    #[tokio::test]
    async fn recorded_pid_of_another_program_survives() {
        let dir = tempfile::tempdir().unwrap();
        fake_core(dir.path(), "exec sleep 30");
        let mut bystander = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(dir.path().join("core.pid"), bystander.id().to_string()).unwrap();

        let mut sup = supervisor(dir.path(), EventBus::default());
        sup.start(&dir.path().join("config.yaml")).await.unwrap();

        assert!(bystander.try_wait().unwrap().is_none());
        assert!(alive(bystander.id()));
        sup.stop().await;
        bystander.kill().unwrap();
        bystander.wait().unwrap();
    }

    #[tokio::test]
    async fn core_of_another_session_is_found_and_stopped() {
        let dir = tempfile::tempdir().unwrap();
        fake_core(dir.path(), "sleep 30");
        let mut other = spawn_detached_core(dir.path());
        let pid_file = dir.path().join("core.pid");
        std::fs::write(&pid_file, other.id().to_string()).unwrap();

        let sup = supervisor(dir.path(), EventBus::default());
        assert_eq!(sup.foreign_core().await, Some(other.id()));
        assert_eq!(sup.stop_foreign().await, Some(other.id()));
        assert!(!other.wait().unwrap().success());
        assert!(!pid_file.exists());
        assert_eq!(sup.foreign_core().await, None);
    }

    #[test]
    fn core_is_recognised_by_command_line() {
        let name = CORE_BINARY_NAME;
        assert!(command_names_core(&format!(
            "/opt/ednovas/resources/bin/{name} -d /x -f /x/c.yaml"
        )));
        assert!(command_names_core(&format!("/bin/sh /tmp/a b/bin/{name} -d /x")));
        assert!(command_names_core(&format!("\"{name}\",\"4242\",\"Console\"")));
        assert!(command_names_core(name));
        assert!(!command_names_core("sleep 30"));
        assert!(!command_names_core(&format!("/usr/bin/vim /tmp/{name}.yaml")));
        assert!(!command_names_core(&format!("/usr/bin/My{name} -d /x")));
    }

    #[tokio::test]
    async fn missing_binary_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), EventBus::default());
        let err = sup.start(&dir.path().join("config.yaml")).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Locate(_)));
        assert_eq!(sup.state(), CoreState::Stopped);
    }

    #[tokio::test]
    async fn early_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fake_core(dir.path(), "exit 3");
        let mut sup = supervisor(dir.path(), EventBus::default());
        let err = sup.start(&dir.path().join("config.yaml")).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ExitedEarly(_)));
        assert_eq!(sup.state(), CoreState::Stopped);
        assert!(sup.pid().is_none());
    }

    #[tokio::test]
    async fn port_conflict_lines_are_flagged() {
        let dir = tempfile::tempdir().unwrap();
        fake_core(
            dir.path(),
            "echo 'listen tcp 127.0.0.1:9090: bind: address already in use' >&2\nexec sleep 30",
        );
        let events = EventBus::default();
        let mut sub = events.subscribe();
        let mut sup = supervisor(dir.path(), events);
        sup.start(&dir.path().join("config.yaml")).await.unwrap();

        let conflict = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(AppEvent::PortConflict(line)) = sub.recv().await {
                    return line;
                }
            }
        })
        .await
        .unwrap();
        assert!(conflict.contains("9090"));
        sup.stop().await;
    }

    #[tokio::test]
    async fn crash_is_noticed() {
        let dir = tempfile::tempdir().unwrap();
        fake_core(dir.path(), "sleep 0.3");
        let mut sup = supervisor(dir.path(), EventBus::default());
        sup.start(&dir.path().join("config.yaml")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(sup.state(), CoreState::Stopped);
    }

    #[test]
    fn name_sweep_targets_exact_binary_name() {
        for cmd in name_kill_commands(9090) {
            match cmd[0].as_str() {
                "pkill" => assert!(cmd.contains(&"-x".to_string())),
                "fuser" => assert_eq!(cmd[2], "9090/tcp"),
                _ => assert!(cmd.contains(&CORE_BINARY_NAME.to_string())),
            }
        }
    }
}
