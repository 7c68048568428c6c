/// Per-branch index of idle sessions.
///
/// Only routes new-request notifications. It never decides who wins a
/// request; that is the request's own atomic flag.
use std::collections::HashMap;

use dashmap::DashSet;

use super::types::Branch;

#[derive(Debug)]
pub struct IdleIndex {
    by_branch: HashMap<Branch, DashSet<String>>,
}

impl Default for IdleIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleIndex {
    pub fn new() -> Self {
        Self {
            by_branch: Branch::ALL
                .into_iter()
                .map(|b| (b, DashSet::new()))
                .collect(),
        }
    }

    fn set(&self, branch: Branch) -> &DashSet<String> {
        // Every branch gets a set at construction.
        &self.by_branch[&branch]
    }

    pub fn add(&self, branch: Branch, username: &str) -> bool {
        self.set(branch).insert(username.to_owned())
    }

    pub fn remove(&self, branch: Branch, username: &str) -> bool {
        self.set(branch).remove(username).is_some()
    }

    pub fn contains(&self, branch: Branch, username: &str) -> bool {
        self.set(branch).contains(username)
    }

    /// Point-in-time copy of one branch's idle usernames.
    pub fn snapshot(&self, branch: Branch) -> Vec<String> {
        self.set(branch).iter().map(|u| u.key().clone()).collect()
    }

    /// Idle usernames in every branch except `branch`.
    pub fn snapshot_except(&self, branch: Branch) -> Vec<String> {
        Branch::ALL
            .into_iter()
            .filter(|b| *b != branch)
            .flat_map(|b| self.snapshot(b))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_branch.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
