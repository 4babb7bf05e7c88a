//! Rewrites the downloaded proxy profile before the core sees it.
//!
//! Only a handful of top-level directives are managed: the listener, the LAN
//! switch, the control API address and secret, the mode, and optionally the
//! `tun` block. Everything else in the document is passed through untouched;
//! its schema belongs to the core.

use std::sync::OnceLock;

use ednovas_controller::Mode;
use regex::Regex;
use serde::Deserialize;

/// Values forced into the profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directives {
    pub mixed_port: u16,
    pub allow_lan: bool,
    pub controller_port: u16,
    pub secret: String,
    pub mode: Mode,
    pub tun: bool,
}

impl Default for Directives {
    fn default() -> Self {
        Self {
            mixed_port: crate::config::DEFAULT_MIXED_PORT,
            allow_lan: false,
            controller_port: crate::config::DEFAULT_CONTROLLER_PORT,
            secret: String::new(),
            mode: Mode::Rule,
            tun: false,
        }
    }
}

/// Single-protocol listeners dropped in favour of `mixed-port`; a
/// subscription's `port: 7890` would otherwise collide with it.
const SUPERSEDED_KEYS: &[&str] = &["port", "socks-port"];

const TUN_BLOCK: &str = "tun:
  enable: true
  stack: system
  auto-route: true
  auto-detect-interface: true
  dns-hijack:
    - any:53";

impl Directives {
    /// `(key, value)` pairs in the order missing ones are prepended.
    fn pairs(&self) -> Vec<(&'static str, String)> {
        let bind = if self.allow_lan { "'*'" } else { "'127.0.0.1'" };
        vec![
            ("mixed-port", self.mixed_port.to_string()),
            ("allow-lan", self.allow_lan.to_string()),
            ("bind-address", bind.to_string()),
            ("mode", self.mode.to_string()),
            (
                "external-controller",
                format!("'127.0.0.1:{}'", self.controller_port),
            ),
            ("secret", single_quote(&self.secret)),
        ]
    }
}

fn single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn top_level_key(line: &str) -> Option<&str> {
    static KEY: OnceLock<Regex> = OnceLock::new();
    let re = KEY.get_or_init(|| Regex::new(r"^([A-Za-z0-9_-]+):(?:\s|$)").expect("static regex"));
    re.captures(line).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// Force the managed directives into `profile`.
///
/// The first top-level occurrence of each key is rewritten in place and later
/// duplicates are dropped; keys that are missing are prepended. Top-level
/// `port` and `socks-port` are removed so `mixed-port` is the only listener. With TUN
/// requested, any top-level `tun:` block is replaced by the managed one at the
/// top of the document. Applying this to its own output changes nothing.
pub fn inject_directives(profile: &str, directives: &Directives) -> String {
    let pairs = directives.pairs();
    let mut seen = vec![false; pairs.len()];
    let mut body: Vec<String> = Vec::new();
    let mut in_tun_block = false;

    for line in profile.lines() {
        let line = line.trim_end_matches('\r');
        let key = top_level_key(line);

        if in_tun_block {
            // The block runs until the next non-indented, non-blank line.
            let continues = line.trim().is_empty()
                || line.starts_with([' ', '\t', '-']) && key.is_none();
            if continues {
                continue;
            }
            in_tun_block = false;
        }

        match key {
            Some("tun") if directives.tun => {
                in_tun_block = true;
            }
            Some(k) if SUPERSEDED_KEYS.contains(&k) => {}
            Some(k) => match pairs.iter().position(|(name, _)| *name == k) {
                Some(i) if !seen[i] => {
                    seen[i] = true;
                    body.push(format!("{}: {}", pairs[i].0, pairs[i].1));
                }
                Some(_) => {}
                None => body.push(line.to_string()),
            },
            None => body.push(line.to_string()),
        }
    }

    let mut out = String::with_capacity(profile.len() + 256);
    if directives.tun {
        out.push_str(TUN_BLOCK);
        out.push('\n');
    }
    for ((key, value), present) in pairs.iter().zip(&seen) {
        if !present {
            out.push_str(&format!("{key}: {value}\n"));
        }
    }
    for line in body {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

#[derive(Deserialize)]
struct ProfileGroups {
    #[serde(rename = "proxy-groups", default)]
    proxy_groups: Vec<NamedGroup>,
}

#[derive(Deserialize)]
struct NamedGroup {
    name: String,
}

/// Names under `proxy-groups`, in declaration order. Empty when the profile
/// does not parse.
pub fn group_order(profile: &str) -> Vec<String> {
    match serde_yaml::from_str::<ProfileGroups>(profile) {
        Ok(parsed) => parsed.proxy_groups.into_iter().map(|g| g.name).collect(),
        Err(e) => {
            tracing::warn!("could not read proxy-groups from profile: {e}");
            Vec::new()
        }
    }
}
