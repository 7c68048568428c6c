/// Direct requests that could not reach their target, replayed to the
/// target on its next handshake.
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct MissedRequestLog {
    /// Target username -> requesters, in first-attempt order.
    entries: DashMap<String, Vec<String>>,
}

impl MissedRequestLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that `requester` tried to reach `target`. Returns false if that
    /// pair is already recorded.
    pub fn record(&self, target: &str, requester: &str) -> bool {
        let mut requesters = self.entries.entry(target.to_owned()).or_default();
        if requesters.iter().any(|r| r == requester) {
            return false;
        }
        requesters.push(requester.to_owned());
        true
    }

    /// Remove and return everything recorded for `target`.
    pub fn take(&self, target: &str) -> Vec<String> {
        self.entries
            .remove(target)
            .map(|(_, requesters)| requesters)
            .unwrap_or_default()
    }

    /// Drop a single entry. Returns true if it existed.
    pub fn forget(&self, target: &str, requester: &str) -> bool {
        let removed = match self.entries.get_mut(target) {
            Some(mut requesters) => {
                let before = requesters.len();
                requesters.retain(|r| r != requester);
                before != requesters.len()
            }
            None => false,
        };
        self.entries.remove_if(target, |_, requesters| requesters.is_empty());
        removed
    }

    /// Requesters currently recorded for `target`, without clearing them.
    pub fn pending(&self, target: &str) -> Vec<String> {
        self.entries
            .get(target)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }
}
