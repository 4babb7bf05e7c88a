//! In-memory stand-in for `gsettings`, `reg` and `networksetup`.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::batch::{CommandOutput, CommandRunner, SysCommand};
use crate::error::EffectorError;

#[derive(Debug, Default)]
pub(crate) struct FakeHost {
    values: Mutex<BTreeMap<String, String>>,
    services: Vec<String>,
    log: Mutex<Vec<SysCommand>>,
}

const MAC_KINDS: &[&str] = &["webproxy", "securewebproxy", "socksfirewallproxy"];

impl FakeHost {
    pub(crate) fn gnome_with_proxy(mode: &str, host: &str, port: &str) -> Self {
        let fake = Self::default();
        fake.set("org.gnome.system.proxy mode", mode);
        for proto in ["http", "https", "socks"] {
            fake.set(&format!("org.gnome.system.proxy.{proto} host"), host);
            fake.set(&format!("org.gnome.system.proxy.{proto} port"), port);
        }
        fake
    }

    /// `existing` is `(ProxyEnable as printed by reg, ProxyServer)`.
    pub(crate) fn windows_with_proxy(existing: Option<(&str, &str)>) -> Self {
        let fake = Self::default();
        if let Some((enable, server)) = existing {
            fake.set("ProxyEnable", &format!("REG_DWORD {enable}"));
            fake.set("ProxyServer", &format!("REG_SZ {server}"));
        }
        fake
    }

    pub(crate) fn macos(services: &[&str]) -> Self {
        let fake = Self {
            services: services.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        };
        for svc in services {
            for kind in MAC_KINDS {
                fake.set(&format!("{svc}|{kind}|enabled"), "No");
            }
        }
        fake
    }

    pub(crate) fn set(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    /// Observable settings. Server and port of a disabled macOS proxy are
    /// inert and left out.
    pub(crate) fn values(&self) -> BTreeMap<String, String> {
        let values = self.values.lock();
        values
            .iter()
            .filter(|(key, _)| {
                let parts: Vec<&str> = key.split('|').collect();
                match parts.as_slice() {
                    [svc, kind, "server" | "port"] => {
                        values.get(&format!("{svc}|{kind}|enabled")).map(String::as_str) == Some("Yes")
                    }
                    _ => true,
                }
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub(crate) fn commands_run(&self) -> usize {
        self.log.lock().len()
    }

    fn gsettings(&self, args: &[String]) -> CommandOutput {
        match args {
            [verb, schema, key] if verb == "get" => match self.get(&format!("{schema} {key}")) {
                Some(v) => CommandOutput::ok(format!("{v}\n")),
                None => CommandOutput::failed("No such key"),
            },
            [verb, schema, key, value] if verb == "set" => {
                self.set(&format!("{schema} {key}"), value);
                CommandOutput::ok("")
            }
            _ => CommandOutput::failed("usage"),
        }
    }

    fn reg(&self, args: &[String]) -> CommandOutput {
        let flag = |name: &str| {
            args.iter()
                .position(|a| a == name)
                .and_then(|i| args.get(i + 1))
                .cloned()
        };
        let Some(name) = flag("/v") else {
            return CommandOutput::failed("missing /v");
        };
        // Run key values live alongside the proxy values under their own name.
        match args.first().map(String::as_str) {
            Some("query") => match self.get(&name) {
                Some(v) => {
                    let (kind, data) = v.split_once(' ').unwrap_or((v.as_str(), ""));
                    CommandOutput::ok(format!("\r\nHKEY_CURRENT_USER\\...\r\n    {name}    {kind}    {data}\r\n"))
                }
                None => CommandOutput::failed("ERROR: The system was unable to find the specified registry key or value."),
            },
            Some("add") => {
                let kind = flag("/t").unwrap_or_else(|| "REG_SZ".into());
                let data = flag("/d").unwrap_or_default();
                let data = if kind == "REG_DWORD" {
                    format!("0x{:x}", data.parse::<u32>().unwrap_or(0))
                } else {
                    data
                };
                self.set(&name, &format!("{kind} {data}"));
                CommandOutput::ok("The operation completed successfully.")
            }
            Some("delete") => match self.values.lock().remove(&name) {
                Some(_) => CommandOutput::ok("The operation completed successfully."),
                None => CommandOutput::failed("ERROR: The system was unable to find the specified registry key or value."),
            },
            _ => CommandOutput::failed("usage"),
        }
    }

    fn networksetup(&self, args: &[String]) -> CommandOutput {
        let Some(verb) = args.first() else {
            return CommandOutput::failed("usage");
        };
        let Some(svc) = args.get(1) else {
            return CommandOutput::failed("usage");
        };
        if !self.services.contains(svc) {
            return CommandOutput::failed(format!("{svc} is not a recognized network service."));
        }
        if let Some(kind) = verb.strip_prefix("-get") {
            let enabled = self.get(&format!("{svc}|{kind}|enabled")).unwrap_or_else(|| "No".into());
            let server = self.get(&format!("{svc}|{kind}|server")).unwrap_or_default();
            let port = self.get(&format!("{svc}|{kind}|port")).unwrap_or_else(|| "0".into());
            return CommandOutput::ok(format!(
                "Enabled: {enabled}\nServer: {server}\nPort: {port}\nAuthenticated Proxy Enabled: 0\n"
            ));
        }
        if let Some(kind) = verb.strip_prefix("-set").and_then(|k| k.strip_suffix("state")) {
            let on = args.get(2).map(String::as_str) == Some("on");
            self.set(&format!("{svc}|{kind}|enabled"), if on { "Yes" } else { "No" });
            return CommandOutput::ok("");
        }
        if let Some(kind) = verb.strip_prefix("-set") {
            let (Some(server), Some(port)) = (args.get(2), args.get(3)) else {
                return CommandOutput::failed("usage");
            };
            self.set(&format!("{svc}|{kind}|enabled"), "Yes");
            self.set(&format!("{svc}|{kind}|server"), server);
            self.set(&format!("{svc}|{kind}|port"), port);
            return CommandOutput::ok("");
        }
        CommandOutput::failed("usage")
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, cmd: &SysCommand) -> Result<CommandOutput, EffectorError> {
        self.log.lock().push(cmd.clone());
        Ok(match cmd.program.as_str() {
            "gsettings" => self.gsettings(&cmd.args),
            "reg" => self.reg(&cmd.args),
            "networksetup" => self.networksetup(&cmd.args),
            "launchctl" => CommandOutput::ok(""),
            other => {
                return Err(EffectorError::Launch {
                    command: other.to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                })
            }
        })
    }
}
