//! Wire types of the Clash-compatible control API.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Outbound routing mode of the proxy core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Mode {
    #[default]
    Rule,
    Global,
    Direct,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rule => write!(f, "Rule"),
            Self::Global => write!(f, "Global"),
            Self::Direct => write!(f, "Direct"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rule" => Ok(Self::Rule),
            "global" => Ok(Self::Global),
            "direct" => Ok(Self::Direct),
            other => Err(format!("unknown mode '{other}' (expected rule, global or direct)")),
        }
    }
}

/// A selector group: a named set of interchangeable nodes with one active
/// member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyGroup {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub now: String,
    pub all: Vec<String>,
}

/// One entry of the `GET /proxies` mapping. Plain nodes carry no `now`/`all`.
#[derive(Debug, Deserialize)]
pub(crate) struct ProxyEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub now: Option<String>,
    #[serde(default)]
    pub all: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProxiesResponse {
    #[serde(default)]
    pub proxies: serde_json::Map<String, serde_json::Value>,
}

/// The part of `GET /configs` we read. The core reports the mode lowercase.
#[derive(Debug, Deserialize)]
pub(crate) struct ConfigsResponse {
    pub mode: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DelayResponse {
    pub delay: u64,
}

/// `GET /version` payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub meta: bool,
}

/// Result of a single node latency probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latency {
    Millis(u64),
    /// Probe failed or timed out.
    Unreachable,
}

impl Latency {
    pub fn as_millis(&self) -> Option<u64> {
        match self {
            Self::Millis(ms) => Some(*ms),
            Self::Unreachable => None,
        }
    }
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Millis(ms) => write!(f, "{ms}ms"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// One `/traffic` sample: bytes per second up and down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
pub struct Traffic {
    pub up: u64,
    pub down: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("rule".parse::<Mode>().unwrap(), Mode::Rule);
        assert_eq!("GLOBAL".parse::<Mode>().unwrap(), Mode::Global);
        assert_eq!(" Direct ".parse::<Mode>().unwrap(), Mode::Direct);
        assert!("tun".parse::<Mode>().is_err());
    }

    #[test]
    fn mode_serializes_capitalized() {
        assert_eq!(serde_json::to_string(&Mode::Rule).unwrap(), "\"Rule\"");
        assert_eq!(Mode::Global.to_string(), "Global");
    }

    #[test]
    fn latency_display() {
        assert_eq!(Latency::Millis(87).to_string(), "87ms");
        assert_eq!(Latency::Unreachable.to_string(), "unreachable");
        assert_eq!(Latency::Unreachable.as_millis(), None);
    }

    #[test]
    fn proxy_entry_without_members() {
        let entry: ProxyEntry =
            serde_json::from_str(r#"{"type":"Shadowsocks","name":"hk-01"}"#).unwrap();
        assert_eq!(entry.kind, "Shadowsocks");
        assert!(entry.now.is_none());
        assert!(entry.all.is_empty());
    }
}
