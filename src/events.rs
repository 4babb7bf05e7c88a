//! Typed status events fanned out to any number of listeners.
//!
//! A listener holds a [`Subscription`]; dropping it unsubscribes. Nothing is
//! registered globally, so repeated attach/detach cycles cannot leak.

use std::fmt;

use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Outcome of endpoint resolution. Emitted once per resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverStatus {
    Probing { candidates: usize },
    Selected { endpoint: String },
    /// Nothing answered; the default endpoint stays active.
    Unreachable { fallback: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    Resolver(ResolverStatus),
    /// Proxy core lifecycle change.
    Core(String),
    CoreOutput { stream: CoreStream, line: String },
    /// The core reported its port is taken.
    PortConflict(String),
    /// Readiness poll progress, by attempt number.
    ReadyProgress(u32),
    SystemProxy { enabled: bool },
    Traffic { up: u64, down: u64 },
}

impl fmt::Display for AppEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolver(ResolverStatus::Probing { candidates }) => {
                write!(f, "probing {candidates} API endpoints")
            }
            Self::Resolver(ResolverStatus::Selected { endpoint }) => {
                write!(f, "using API endpoint {endpoint}")
            }
            Self::Resolver(ResolverStatus::Unreachable { fallback }) => {
                write!(f, "no API endpoint reachable, keeping {fallback}")
            }
            Self::Core(msg) => write!(f, "core: {msg}"),
            Self::CoreOutput { line, .. } => write!(f, "core> {line}"),
            Self::PortConflict(line) => write!(f, "port conflict: {line}"),
            Self::ReadyProgress(n) => write!(f, "waiting for core API (attempt {n})"),
            Self::SystemProxy { enabled } => {
                write!(f, "system proxy {}", if *enabled { "on" } else { "off" })
            }
            Self::Traffic { up, down } => write!(f, "up {up} B/s, down {down} B/s"),
        }
    }
}

/// Cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to current subscribers. Dropped silently when nobody listens.
    pub fn emit(&self, event: AppEvent) {
        tracing::trace!(%event, "event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A live listener. Drop it to unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<AppEvent>,
}

impl Subscription {
    /// Next event, or `None` once every publisher is gone. Lagged events are
    /// skipped.
    pub async fn recv(&mut self) -> Option<AppEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("event listener lagged, skipped {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<AppEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<AppEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_each_event() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(AppEvent::ReadyProgress(2));
        assert_eq!(a.recv().await, Some(AppEvent::ReadyProgress(2)));
        assert_eq!(b.recv().await, Some(AppEvent::ReadyProgress(2)));
    }

    #[test]
    fn dropping_a_subscription_unsubscribes() {
        let bus = EventBus::default();
        for _ in 0..10 {
            let _sub = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn emit_without_listeners_is_fine() {
        let bus = EventBus::default();
        bus.emit(AppEvent::SystemProxy { enabled: true });
        let mut late = bus.subscribe();
        assert!(late.try_recv().is_none());
    }

    #[test]
    fn display_is_human_readable() {
        let event = AppEvent::Resolver(ResolverStatus::Unreachable {
            fallback: "https://new.ednovas.dev".into(),
        });
        assert_eq!(
            event.to_string(),
            "no API endpoint reachable, keeping https://new.ednovas.dev"
        );
    }
}
