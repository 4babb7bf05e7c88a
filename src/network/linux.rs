//! GNOME proxy settings through `gsettings` and an XDG autostart entry.

use std::path::PathBuf;

use super::batch::{run_checked, CommandRunner, SysCommand};
use super::{LaunchTarget, NetworkEffector, ProxyEndpoint};
use crate::error::EffectorError;

const PROXY_SCHEMA: &str = "org.gnome.system.proxy";
const DESKTOP_FILE: &str = "ednovas-cloud.desktop";

/// Sub-schemas that get host and port.
const PROTOCOLS: &[&str] = &["http", "https", "socks"];

#[derive(Debug, Clone)]
pub struct LinuxEffector {
    /// `$XDG_CONFIG_HOME`, usually `~/.config`.
    config_home: PathBuf,
}

impl LinuxEffector {
    pub fn new(config_home: PathBuf) -> Self {
        Self { config_home }
    }

    pub fn desktop_entry_path(&self) -> PathBuf {
        self.config_home.join("autostart").join(DESKTOP_FILE)
    }
}

fn gset(schema: &str, key: &str, value: &str) -> SysCommand {
    SysCommand::new("gsettings", ["set", schema, key, value])
}

fn gget(schema: &str, key: &str) -> SysCommand {
    SysCommand::new("gsettings", ["get", schema, key])
}

/// Every (schema, key) pair the proxy toggle touches, mode first.
fn managed_keys() -> Vec<(String, &'static str)> {
    let mut keys = vec![(PROXY_SCHEMA.to_string(), "mode")];
    for proto in PROTOCOLS {
        let schema = format!("{PROXY_SCHEMA}.{proto}");
        keys.push((schema.clone(), "host"));
        keys.push((schema, "port"));
    }
    keys
}

pub fn desktop_entry(target: &LaunchTarget) -> String {
    format!(
        "[Desktop Entry]\n\
         Type=Application\n\
         Name=EdNovas Cloud\n\
         Exec={}\n\
         Terminal=false\n\
         X-GNOME-Autostart-enabled=true\n",
        target.command_line()
    )
}

impl NetworkEffector for LinuxEffector {
    fn platform(&self) -> &'static str {
        "linux"
    }

    fn enable_commands(&self, endpoint: &ProxyEndpoint) -> Vec<SysCommand> {
        let host = format!("'{}'", endpoint.host);
        let port = endpoint.port.to_string();
        let mut cmds = vec![gset(PROXY_SCHEMA, "mode", "'manual'")];
        for proto in PROTOCOLS {
            let schema = format!("{PROXY_SCHEMA}.{proto}");
            cmds.push(gset(&schema, "host", &host));
            cmds.push(gset(&schema, "port", &port));
        }
        cmds
    }

    fn disable_commands(&self) -> Vec<SysCommand> {
        vec![gset(PROXY_SCHEMA, "mode", "'none'")]
    }

    fn capture_restore(
        &self,
        runner: &dyn CommandRunner,
        ours: &ProxyEndpoint,
    ) -> Option<Vec<SysCommand>> {
        let mut current = Vec::new();
        for (schema, key) in managed_keys() {
            // gsettings prints values in the same GVariant syntax `set` accepts.
            match run_checked(runner, &gget(&schema, key)) {
                Ok(out) => current.push((schema, key, out.trim().to_string())),
                Err(e) => {
                    tracing::debug!("cannot read {schema} {key}: {e}");
                }
            }
        }
        if current.is_empty() {
            return None;
        }

        let value_of = |schema: &str, key: &str| {
            current
                .iter()
                .find(|(s, k, _)| s == schema && *k == key)
                .map(|(_, _, v)| v.as_str())
        };
        let http = format!("{PROXY_SCHEMA}.http");
        let already_ours = value_of(PROXY_SCHEMA, "mode") == Some("'manual'")
            && value_of(&http, "host") == Some(format!("'{}'", ours.host).as_str())
            && value_of(&http, "port") == Some(ours.port.to_string().as_str());
        if already_ours {
            return None;
        }

        // Restore the host/port values before flipping the mode back.
        let mut restore: Vec<SysCommand> = current
            .iter()
            .filter(|(_, key, _)| *key != "mode")
            .map(|(schema, key, value)| gset(schema, key, value))
            .collect();
        if let Some(mode) = value_of(PROXY_SCHEMA, "mode") {
            restore.push(gset(PROXY_SCHEMA, "mode", mode));
        }
        Some(restore)
    }

    fn set_auto_start(
        &self,
        _runner: &dyn CommandRunner,
        enable: bool,
        target: &LaunchTarget,
    ) -> Result<(), EffectorError> {
        let path = self.desktop_entry_path();
        let io_err = |source| EffectorError::Descriptor {
            path: path.clone(),
            source,
        };
        if enable {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(io_err)?;
            }
            std::fs::write(&path, desktop_entry(target)).map_err(io_err)?;
        } else {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(e)),
            }
        }
        Ok(())
    }

    fn auto_start_enabled(&self, _runner: &dyn CommandRunner) -> bool {
        self.desktop_entry_path().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_sets_mode_and_every_protocol() {
        let effector = LinuxEffector::new(PathBuf::from("/tmp"));
        let cmds = effector.enable_commands(&ProxyEndpoint::new("127.0.0.1", 7890));
        assert_eq!(cmds.len(), 1 + PROTOCOLS.len() * 2);
        assert_eq!(cmds[0].args, ["set", "org.gnome.system.proxy", "mode", "'manual'"]);
        assert!(cmds
            .iter()
            .any(|c| c.args == ["set", "org.gnome.system.proxy.socks", "port", "7890"]));
    }

    #[test]
    fn autostart_entry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let effector = LinuxEffector::new(dir.path().to_path_buf());
        let runner = super::super::batch::SystemRunner;
        let target = LaunchTarget {
            program: PathBuf::from("/usr/bin/ednovas"),
            args: vec!["run".into(), "--hidden".into()],
        };

        assert!(!effector.auto_start_enabled(&runner));
        effector.set_auto_start(&runner, true, &target).unwrap();
        effector.set_auto_start(&runner, true, &target).unwrap();
        assert!(effector.auto_start_enabled(&runner));
        let entry = std::fs::read_to_string(effector.desktop_entry_path()).unwrap();
        assert!(entry.contains("Exec=/usr/bin/ednovas run --hidden"));

        effector.set_auto_start(&runner, false, &target).unwrap();
        effector.set_auto_start(&runner, false, &target).unwrap();
        assert!(!effector.auto_start_enabled(&runner));
    }
}
