//! `networksetup` proxies per network service and a per-user LaunchAgent.

use std::path::{Path, PathBuf};

use super::batch::{run_checked, CommandRunner, SysCommand};
use super::{LaunchTarget, NetworkEffector, ProxyEndpoint};
use crate::error::EffectorError;

/// Services configured on every apply. Absent ones simply fail in the batch.
pub const NETWORK_SERVICES: &[&str] = &[
    "Wi-Fi",
    "Ethernet",
    "Thunderbolt Ethernet",
    "USB 10/100/1000 LAN",
];

pub const LAUNCH_AGENT_LABEL: &str = "com.ednovas.cloud";

/// `networksetup` verb stems for the three proxy kinds.
const PROXY_KINDS: &[&str] = &["webproxy", "securewebproxy", "socksfirewallproxy"];

#[derive(Debug, Clone)]
pub struct MacEffector {
    home: PathBuf,
    uid: u32,
}

impl MacEffector {
    pub fn new(home: PathBuf, uid: u32) -> Self {
        Self { home, uid }
    }

    pub fn plist_path(&self) -> PathBuf {
        self.home
            .join("Library")
            .join("LaunchAgents")
            .join(format!("{LAUNCH_AGENT_LABEL}.plist"))
    }

    fn gui_domain(&self) -> String {
        format!("gui/{}", self.uid)
    }

    fn launchctl(&self, verb: &str, plist: &Path) -> SysCommand {
        SysCommand::new(
            "launchctl",
            [
                verb.to_string(),
                self.gui_domain(),
                plist.display().to_string(),
            ],
        )
    }
}

/// Current settings of one proxy kind on one service.
#[derive(Debug, Default, PartialEq, Eq)]
struct ServiceProxy {
    enabled: bool,
    server: String,
    port: String,
}

fn parse_get_output(stdout: &str) -> ServiceProxy {
    let mut proxy = ServiceProxy::default();
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Enabled" => proxy.enabled = value.eq_ignore_ascii_case("yes"),
            "Server" => proxy.server = value.to_string(),
            "Port" => proxy.port = value.to_string(),
            _ => {}
        }
    }
    proxy
}

/// Property list for a login item running `target`.
pub fn launch_agent_plist(target: &LaunchTarget) -> String {
    let mut args = String::new();
    let program = target.program.display().to_string();
    for arg in std::iter::once(program).chain(target.args.iter().cloned()) {
        args.push_str(&format!("        <string>{}</string>\n", xml_escape(&arg)));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{LAUNCH_AGENT_LABEL}</string>
    <key>ProgramArguments</key>
    <array>
{args}    </array>
    <key>RunAtLoad</key>
    <true/>
</dict>
</plist>
"#
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

impl NetworkEffector for MacEffector {
    fn platform(&self) -> &'static str {
        "macos"
    }

    fn enable_commands(&self, endpoint: &ProxyEndpoint) -> Vec<SysCommand> {
        let port = endpoint.port.to_string();
        let mut cmds = Vec::with_capacity(NETWORK_SERVICES.len() * PROXY_KINDS.len());
        for svc in NETWORK_SERVICES {
            for kind in PROXY_KINDS {
                cmds.push(SysCommand::new(
                    "networksetup",
                    [
                        format!("-set{kind}"),
                        svc.to_string(),
                        endpoint.host.clone(),
                        port.clone(),
                    ],
                ));
            }
        }
        cmds
    }

    fn disable_commands(&self) -> Vec<SysCommand> {
        NETWORK_SERVICES
            .iter()
            .flat_map(|svc| {
                PROXY_KINDS.iter().map(move |kind| {
                    SysCommand::new(
                        "networksetup",
                        [format!("-set{kind}state"), svc.to_string(), "off".into()],
                    )
                })
            })
            .collect()
    }

    fn capture_restore(
        &self,
        runner: &dyn CommandRunner,
        ours: &ProxyEndpoint,
    ) -> Option<Vec<SysCommand>> {
        let our_port = ours.port.to_string();
        let mut restore = Vec::new();
        for svc in NETWORK_SERVICES {
            for kind in PROXY_KINDS {
                let get = SysCommand::new("networksetup", [format!("-get{kind}"), svc.to_string()]);
                // Services missing on this machine have nothing to restore.
                let Ok(stdout) = run_checked(runner, &get) else {
                    continue;
                };
                let current = parse_get_output(&stdout);
                if current.enabled && current.server == ours.host && current.port == our_port {
                    return None;
                }
                // `-set<kind>` also switches the kind on, so a disabled entry
                // gets its server back and is then turned off again.
                if !current.server.is_empty() {
                    restore.push(SysCommand::new(
                        "networksetup",
                        [format!("-set{kind}"), svc.to_string(), current.server, current.port],
                    ));
                }
                if !current.enabled {
                    restore.push(SysCommand::new(
                        "networksetup",
                        [format!("-set{kind}state"), svc.to_string(), "off".into()],
                    ));
                }
            }
        }
        (!restore.is_empty()).then_some(restore)
    }

    fn set_auto_start(
        &self,
        runner: &dyn CommandRunner,
        enable: bool,
        target: &LaunchTarget,
    ) -> Result<(), EffectorError> {
        let plist = self.plist_path();
        if enable {
            if let Some(dir) = plist.parent() {
                std::fs::create_dir_all(dir).map_err(|source| EffectorError::Descriptor {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
            std::fs::write(&plist, launch_agent_plist(target)).map_err(|source| {
                EffectorError::Descriptor {
                    path: plist.clone(),
                    source,
                }
            })?;
            // Unload a previous registration first; failing here just means none was loaded.
            let _ = runner.run(&self.launchctl("bootout", &plist));
            run_checked(runner, &self.launchctl("bootstrap", &plist))?;
        } else {
            if let Err(e) = run_checked(runner, &self.launchctl("bootout", &plist)) {
                tracing::debug!("launch agent was not loaded: {e}");
            }
            match std::fs::remove_file(&plist) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(EffectorError::Descriptor { path: plist, source }),
            }
        }
        Ok(())
    }

    fn auto_start_enabled(&self, _runner: &dyn CommandRunner) -> bool {
        self.plist_path().exists()
    }
}
