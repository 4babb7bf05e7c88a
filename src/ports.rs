//! Control API port selection.

use std::net::{Ipv4Addr, TcpListener};

use crate::config::CoreConfig;
use crate::state::StateStore;

/// Port the core's control API should listen on.
///
/// The configured port is used as-is unless randomization is on. Then the
/// port persisted by an earlier run is reused, or a free loopback port is
/// picked and persisted so later runs (and the CLI) find the same one.
pub fn resolve_control_port(core: &CoreConfig, state: &StateStore) -> std::io::Result<u16> {
    if !core.randomize_controller_port {
        return Ok(core.controller_port);
    }
    if let Some(port) = state.snapshot().controller_port {
        return Ok(port);
    }
    let port = free_loopback_port()?;
    state.update(|s| s.controller_port = Some(port))?;
    tracing::info!("picked control port {port}");
    Ok(port)
}

/// Ask the OS for an unused port on 127.0.0.1.
pub fn free_loopback_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}
