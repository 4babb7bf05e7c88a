//! EdNovas Cloud client core.
//!
//! Locates and supervises the bundled proxy core, drives its control API,
//! points the host's system proxy at it and keeps a reachable backend API
//! mirror selected. [`orchestrator::Orchestrator`] ties the pieces together.

pub mod config;
pub mod error;
pub mod events;
pub mod locator;
pub mod logging;
pub mod network;
pub mod orchestrator;
pub mod ports;
pub mod privilege;
pub mod profile;
pub mod signals;
pub mod state;
pub mod subscription;
pub mod supervisor;
pub mod upstream;

pub use config::{AppPaths, Config};
pub use error::{AppError, AppResult};
pub use events::{AppEvent, EventBus};
pub use orchestrator::{Orchestrator, Status, TunApplied};
