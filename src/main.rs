use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ednovas::config::{AppPaths, Config};
use ednovas::events::AppEvent;
use ednovas::network::{install_panic_hook, ExitGuard, SystemNetwork};
use ednovas::signals::ShutdownSignals;
use ednovas::supervisor::CoreState;
use ednovas::{logging, AppError, Orchestrator, TunApplied};
use ednovas_controller::{Latency, Mode};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "ednovas",
    version,
    about = "EdNovas Cloud: run the proxy core and manage the system proxy",
    arg_required_else_help = true
)]
struct Cli {
    /// Keep config and data under this directory instead of the platform default.
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Log level when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy core and keep it running until Ctrl-C or a termination signal
    Run {
        /// Started by the OS at login: no event output on stdout
        #[arg(long)]
        hidden: bool,
        /// Enable TUN mode for this and later runs
        #[arg(long)]
        tun: bool,
        /// Leave the system proxy alone
        #[arg(long)]
        no_system_proxy: bool,
    },
    /// Sign in to the EdNovas account
    Login {
        email: String,
        /// Read from stdin when omitted
        #[arg(long)]
        password: Option<String>,
    },
    /// Forget the account and stop the core
    Logout,
    /// Show core, proxy and account status
    Status,
    /// Restore the system proxy left by a session that was killed.
    /// `run` is the only way to turn it on, so it never outlives the core.
    Proxy { action: ProxyAction },
    /// Persist the TUN preference
    Tun { state: Switch },
    /// Manage launch at login
    Autostart { action: AutostartAction },
    /// Pick the backend API endpoint
    Resolve {
        /// Pin this endpoint instead of racing the mirrors
        #[arg(long, conflicts_with = "unpin")]
        pin: Option<String>,
        /// Clear a pinned endpoint
        #[arg(long)]
        unpin: bool,
    },
    /// Set the outbound mode of the running core
    Mode { mode: ModeArg },
    /// List selector groups of the running core
    Groups,
    /// Select a node in a group
    Select { group: String, node: String },
    /// Probe the latency of every node in a group
    Latency { group: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn enabled(self) -> bool {
        matches!(self, Self::On)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ProxyAction {
    Off,
}

#[derive(Clone, Copy, ValueEnum)]
enum AutostartAction {
    On,
    Off,
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Rule,
    Global,
    Direct,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Rule => Mode::Rule,
            ModeArg::Global => Mode::Global,
            ModeArg::Direct => Mode::Direct,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let paths = match prepare(&cli) {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    // From here on failures go through tracing: stderr and the log file.
    match logging::record_failure(execute(cli, paths).await) {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

fn prepare(cli: &Cli) -> Result<AppPaths> {
    let paths = match &cli.home {
        Some(root) => AppPaths::rooted(root),
        None => AppPaths::discover()?,
    };
    paths.ensure()?;
    let log_file = logging::init(&paths.log_dir(), &cli.log_level)?;
    tracing::debug!("logging to {}", log_file.display());
    Ok(paths)
}

async fn execute(cli: Cli, paths: AppPaths) -> Result<()> {
    let config = Config::load_or_init(&paths.config_file())?;

    let net = Arc::new(SystemNetwork::for_host());
    install_panic_hook(Arc::clone(&net));
    let orch = Orchestrator::new(config, paths, net)?;

    match cli.command {
        Commands::Run {
            hidden,
            tun,
            no_system_proxy,
        } => {
            let _guard = ExitGuard::new(Arc::clone(orch.network()));
            run(&orch, hidden, tun, !no_system_proxy).await?;
        }
        Commands::Login { email, password } => {
            let password = match password {
                Some(p) => p,
                None => read_password()?,
            };
            orch.resolve_endpoint().await;
            orch.login(&email, &password).await?;
            println!("Logged in as {email}");
        }
        Commands::Logout => {
            orch.logout().await?;
            println!("Logged out");
        }
        Commands::Status => print_status(&orch).await,
        Commands::Proxy {
            action: ProxyAction::Off,
        } => {
            orch.set_system_proxy(false);
            println!("System proxy off");
        }
        Commands::Tun { state } => {
            let label = if state.enabled() { "on" } else { "off" };
            match orch.set_tun_mode(state.enabled()).await {
                Ok(TunApplied::Saved) => println!("TUN mode {label}, used from the next start"),
                Ok(TunApplied::Restarted) => println!("TUN mode {label}, core restarted"),
                Ok(TunApplied::NeedsRestart { pid }) => println!(
                    "TUN mode {label} saved; the core of another session (pid {pid}) \
                     keeps its setting until that session is restarted"
                ),
                Err(AppError::NotElevated) => {
                    println!("TUN request saved for the next elevated `ednovas run`");
                    return Err(AppError::NotElevated.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Autostart { action } => match action {
            AutostartAction::Status => {
                println!(
                    "Launch at login: {}",
                    if orch.auto_start_enabled() { "on" } else { "off" }
                );
            }
            AutostartAction::On | AutostartAction::Off => {
                let enable = matches!(action, AutostartAction::On);
                if !orch.set_auto_start(enable)? {
                    bail!("could not change launch at login, see the log for details");
                }
                println!("Launch at login {}", if enable { "on" } else { "off" });
            }
        },
        Commands::Resolve { pin, unpin } => {
            if unpin {
                orch.override_endpoint(None)?;
            }
            if let Some(url) = pin.as_deref() {
                orch.override_endpoint(Some(url))?;
            }
            let mut events = orch.subscribe();
            let endpoint = orch.resolve_endpoint().await;
            for event in events.drain() {
                println!("{event}");
            }
            println!("{endpoint}");
        }
        Commands::Mode { mode } => {
            let mode = Mode::from(mode);
            orch.set_mode(mode).await?;
            println!("Mode set to {mode}");
        }
        Commands::Groups => {
            for group in orch.groups().await? {
                println!("{} ({})", group.name, group.kind);
                for node in &group.all {
                    let marker = if *node == group.now { "*" } else { " " };
                    println!("  {marker} {node}");
                }
            }
        }
        Commands::Select { group, node } => {
            orch.select_node(&group, &node).await?;
            println!("{group} -> {node}");
        }
        Commands::Latency { group } => {
            let mut results: Vec<_> = orch.test_latency(&group).await?.into_iter().collect();
            results.sort_by_key(|(name, latency)| {
                (latency.as_millis().unwrap_or(u64::MAX), name.clone())
            });
            for (name, latency) in results {
                match latency {
                    Latency::Millis(ms) => println!("{ms:>6}ms  {name}"),
                    Latency::Unreachable => println!("     -    {name}"),
                }
            }
        }
    }
    Ok(())
}

/// Foreground session: start the core, turn the proxy on, stream traffic
/// until a termination signal or a core crash, then put everything back.
async fn run(orch: &Orchestrator, hidden: bool, tun: bool, system_proxy: bool) -> Result<()> {
    let mut signals = ShutdownSignals::install().context("failed to install signal handlers")?;
    if tun {
        orch.set_tun_mode(true).await?;
    }

    let mut events = orch.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if hidden || matches!(event, AppEvent::CoreOutput { .. }) {
                continue;
            }
            println!("{event}");
        }
    });

    orch.resolve_endpoint().await;
    let pid = orch.check_and_start().await?;
    tracing::info!("proxy core running (pid {pid})");
    if system_proxy {
        orch.set_system_proxy(true);
    }

    let cancel = CancellationToken::new();
    let traffic = async {
        if let Err(e) = orch.watch_traffic(cancel.clone()).await {
            tracing::warn!("traffic stream unavailable: {e}");
        }
        std::future::pending::<()>().await;
    };
    let crashed = async {
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tick.tick().await;
            if orch.status().await.core == CoreState::Stopped {
                break;
            }
        }
    };

    tokio::select! {
        _ = traffic => {}
        _ = crashed => tracing::error!("proxy core stopped unexpectedly"),
        name = signals.recv() => tracing::info!("received {name}, shutting down"),
    }
    cancel.cancel();
    orch.shutdown().await;
    printer.abort();
    Ok(())
}

async fn print_status(orch: &Orchestrator) {
    let status = orch.status().await;
    match status.external_pid {
        Some(pid) => println!("Core:          running in another session (pid {pid})"),
        None => println!("Core:          {}", status.core),
    }
    if let Some(pid) = status.pid {
        println!("PID:           {pid}");
    }
    println!("Controller:    127.0.0.1:{}", status.controller_port);
    if let Some(mode) = status.mode {
        println!("Mode:          {mode}");
    }
    println!("TUN:           {}", if status.tun { "on" } else { "off" });
    println!("System proxy:  {}", if status.system_proxy { "on" } else { "off" });
    println!("Launch at login: {}", if orch.auto_start_enabled() { "on" } else { "off" });
    println!("API endpoint:  {}", status.endpoint);

    if !status.logged_in {
        println!("Account:       not logged in");
        return;
    }
    match orch.subscription().await {
        Ok(sub) => {
            println!(
                "Plan:          {}",
                if sub.has_plan() { "active" } else { "none" }
            );
            println!(
                "Traffic:       {} used, {} left",
                human_bytes(sub.used_bytes()),
                human_bytes(sub.remaining_bytes())
            );
            if let Some(ts) = sub.expired_at {
                if let Some(at) = chrono::DateTime::from_timestamp(ts, 0) {
                    println!("Expires:       {}", at.format("%Y-%m-%d"));
                }
            }
        }
        Err(e) => println!("Account:       {e}"),
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

fn read_password() -> Result<String> {
    print!("Password: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("empty password");
    }
    Ok(password)
}
