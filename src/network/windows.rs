//! WinINet proxy settings and the `Run` registry key, via `reg.exe`.

use super::batch::{run_checked, CommandRunner, SysCommand};
use super::{LaunchTarget, NetworkEffector, ProxyEndpoint};
use crate::error::EffectorError;

const INTERNET_SETTINGS: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";
const RUN_KEY: &str = r"HKCU\Software\Microsoft\Windows\CurrentVersion\Run";
const RUN_VALUE: &str = "EdNovasCloud";

#[derive(Debug, Default, Clone)]
pub struct WindowsEffector;

impl WindowsEffector {
    pub fn new() -> Self {
        Self
    }
}

/// A registry value as printed by `reg query`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RegValue {
    kind: String,
    data: String,
}

fn reg_add(key: &str, name: &str, kind: &str, data: &str) -> SysCommand {
    SysCommand::new("reg", ["add", key, "/v", name, "/t", kind, "/d", data, "/f"])
}

fn reg_delete(key: &str, name: &str) -> SysCommand {
    SysCommand::new("reg", ["delete", key, "/v", name, "/f"])
}

fn reg_query(key: &str, name: &str) -> SysCommand {
    SysCommand::new("reg", ["query", key, "/v", name])
}

/// Read one value; `None` when it does not exist.
fn query_value(runner: &dyn CommandRunner, key: &str, name: &str) -> Option<RegValue> {
    let stdout = run_checked(runner, &reg_query(key, name)).ok()?;
    parse_reg_value(&stdout, name)
}

fn parse_reg_value(stdout: &str, name: &str) -> Option<RegValue> {
    stdout.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? != name {
            return None;
        }
        let kind = parts.next()?.to_string();
        let data = parts.collect::<Vec<_>>().join(" ");
        // reg.exe prints DWORDs as hex but only accepts decimal back.
        let data = match data.strip_prefix("0x") {
            Some(hex) if kind == "REG_DWORD" => u32::from_str_radix(hex, 16)
                .map(|v| v.to_string())
                .unwrap_or(data),
            _ => data,
        };
        Some(RegValue { kind, data })
    })
}

fn restore_value(name: &str, value: Option<RegValue>) -> SysCommand {
    match value {
        Some(v) => reg_add(INTERNET_SETTINGS, name, &v.kind, &v.data),
        None => reg_delete(INTERNET_SETTINGS, name),
    }
}

impl NetworkEffector for WindowsEffector {
    fn platform(&self) -> &'static str {
        "windows"
    }

    fn enable_commands(&self, endpoint: &ProxyEndpoint) -> Vec<SysCommand> {
        vec![
            reg_add(INTERNET_SETTINGS, "ProxyEnable", "REG_DWORD", "1"),
            reg_add(INTERNET_SETTINGS, "ProxyServer", "REG_SZ", &endpoint.to_string()),
        ]
    }

    fn disable_commands(&self) -> Vec<SysCommand> {
        vec![reg_add(INTERNET_SETTINGS, "ProxyEnable", "REG_DWORD", "0")]
    }

    fn capture_restore(
        &self,
        runner: &dyn CommandRunner,
        ours: &ProxyEndpoint,
    ) -> Option<Vec<SysCommand>> {
        let enable = query_value(runner, INTERNET_SETTINGS, "ProxyEnable");
        let server = query_value(runner, INTERNET_SETTINGS, "ProxyServer");
        let already_ours = enable.as_ref().is_some_and(|v| v.data == "1")
            && server.as_ref().is_some_and(|v| v.data == ours.to_string());
        if already_ours {
            return None;
        }
        Some(vec![
            restore_value("ProxyServer", server),
            restore_value("ProxyEnable", enable),
        ])
    }

    fn set_auto_start(
        &self,
        runner: &dyn CommandRunner,
        enable: bool,
        target: &LaunchTarget,
    ) -> Result<(), EffectorError> {
        if enable {
            run_checked(
                runner,
                &reg_add(RUN_KEY, RUN_VALUE, "REG_SZ", &target.command_line()),
            )?;
        } else if self.auto_start_enabled(runner) {
            run_checked(runner, &reg_delete(RUN_KEY, RUN_VALUE))?;
        }
        Ok(())
    }

    fn auto_start_enabled(&self, runner: &dyn CommandRunner) -> bool {
        query_value(runner, RUN_KEY, RUN_VALUE).is_some()
    }
}
