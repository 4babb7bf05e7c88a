use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

/// Set of groups with a latency batch outstanding.
#[derive(Debug, Clone, Default)]
pub(crate) struct InFlight(Arc<Mutex<HashSet<String>>>);

impl InFlight {
    /// Claim `group`. Returns `None` while another batch holds it.
    pub(crate) fn acquire(&self, group: &str) -> Option<InFlightGuard> {
        if self.0.lock().insert(group.to_string()) {
            Some(InFlightGuard {
                set: Arc::clone(&self.0),
                group: group.to_string(),
            })
        } else {
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, group: &str) -> bool {
        self.0.lock().contains(group)
    }
}

/// Releases the group when the batch finishes, including on cancellation.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    group: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_is_rejected_until_release() {
        let inflight = InFlight::default();
        let guard = inflight.acquire("Proxy").unwrap();
        assert!(inflight.acquire("Proxy").is_none());
        assert!(inflight.acquire("Streaming").is_some());
        drop(guard);
        assert!(!inflight.contains("Proxy"));
        assert!(inflight.acquire("Proxy").is_some());
    }
}
