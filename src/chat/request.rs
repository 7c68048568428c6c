/// Open broadcast requests and the per-request acceptance race.
///
/// Each request carries a single atomic lifecycle word. `OPEN -> TAKEN` and
/// `OPEN -> CANCELLED` are compare-and-swaps, so exactly one acceptor (or one
/// canceller) ever wins, without any table-wide lock.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::error::{BrokerError, Result};
use super::message::Reply;
use super::session::Session;
use super::types::{Branch, RequestId};

const OPEN: u8 = 0;
const TAKEN: u8 = 1;
const CANCELLED: u8 = 2;

/// Attempts at finding an unused id before giving up.
const ID_ATTEMPTS: usize = 16;

/// Who may answer a broadcast request.
///
/// Direct requests to a named user pair immediately or land in the missed
/// log, so they never become open requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    AnyOtherBranch,
    Branch(Branch),
}

impl Target {
    /// Branch label for logs; `ANY_OTHER` for the cross-branch selector.
    pub fn label(self) -> &'static str {
        match self {
            Self::AnyOtherBranch => "ANY_OTHER",
            Self::Branch(b) => b.as_str(),
        }
    }
}

#[derive(Debug)]
pub struct BroadcastRequest {
    pub id: RequestId,
    pub requester: String,
    pub requester_branch: Branch,
    pub target: Target,
    requester_session: Weak<Session>,
    lifecycle: AtomicU8,
    /// Sessions told about this request, by username.
    notified: Mutex<HashMap<String, Weak<Session>>>,
}

impl BroadcastRequest {
    pub fn new(id: RequestId, requester: &Arc<Session>, target: Target) -> Self {
        Self {
            id,
            requester: requester.username.clone(),
            requester_branch: requester.branch,
            target,
            requester_session: Arc::downgrade(requester),
            lifecycle: AtomicU8::new(OPEN),
            notified: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == OPEN
    }

    pub fn is_taken(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == TAKEN
    }

    pub fn is_cancelled(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == CANCELLED
    }

    /// Whether a session from `branch` may answer. Says nothing about the
    /// requester itself; callers exclude it separately.
    pub fn is_eligible(&self, branch: Branch) -> bool {
        match self.target {
            Target::AnyOtherBranch => branch != self.requester_branch,
            Target::Branch(target) => branch == target,
        }
    }

    /// The requesting session, if it is still alive.
    pub fn requester_session(&self) -> Option<Arc<Session>> {
        self.requester_session.upgrade()
    }

    pub fn is_requester(&self, session: &Arc<Session>) -> bool {
        self.requester_session
            .upgrade()
            .is_some_and(|r| Arc::ptr_eq(&r, session))
            || session.username == self.requester
    }

    /// `OPEN -> TAKEN`. True for exactly one caller.
    pub fn try_take(&self) -> bool {
        self.lifecycle
            .compare_exchange(OPEN, TAKEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `OPEN -> CANCELLED`. False if already taken or cancelled.
    pub fn try_cancel(&self) -> bool {
        self.lifecycle
            .compare_exchange(OPEN, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Send `INCOMING_REQUEST` to `session` while the request is open and
    /// remember it for the closing notice.
    ///
    /// The check, the bookkeeping and the send happen under the notified
    /// lock, so a session can never see the closing notice before the
    /// incoming one. A session that becomes idle again is re-sent the
    /// request.
    pub fn notify_incoming(&self, session: &Arc<Session>) -> bool {
        let mut notified = self.notified.lock();
        if !self.is_open() {
            return false;
        }
        notified.insert(session.username.clone(), Arc::downgrade(session));
        session.send(Reply::IncomingRequest {
            id: self.id.clone(),
            from: self.requester.clone(),
            branch: self.requester_branch,
        });
        true
    }

    /// Drain the notified set, sending `closing` to every session still
    /// alive except `skip`. Returns how many were told.
    pub fn close_notified(&self, closing: &Reply, skip: Option<&Arc<Session>>) -> usize {
        let mut notified = self.notified.lock();
        let mut told = 0;
        for (_, weak) in notified.drain() {
            let Some(session) = weak.upgrade() else {
                continue;
            };
            if skip.is_some_and(|s| Arc::ptr_eq(s, &session)) {
                continue;
            }
            session.send(closing.clone());
            told += 1;
        }
        told
    }

}

/// Table of requests that are still open.
#[derive(Debug, Default)]
pub struct RequestTable {
    open: DashMap<RequestId, Arc<BroadcastRequest>>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and publish a new open request under a fresh id.
    pub fn open(&self, requester: &Arc<Session>, target: Target) -> Result<Arc<BroadcastRequest>> {
        for _ in 0..ID_ATTEMPTS {
            if let Entry::Vacant(slot) = self.open.entry(RequestId::generate()) {
                let request = Arc::new(BroadcastRequest::new(slot.key().clone(), requester, target));
                slot.insert(Arc::clone(&request));
                return Ok(request);
            }
        }
        Err(BrokerError::Internal("request id space exhausted".into()))
    }

    pub fn get(&self, id: &RequestId) -> Option<Arc<BroadcastRequest>> {
        self.open.get(id).map(|r| Arc::clone(r.value()))
    }

    pub fn remove(&self, id: &RequestId) -> Option<Arc<BroadcastRequest>> {
        self.open.remove(id).map(|(_, r)| r)
    }

    /// Point-in-time copy of every open request.
    pub fn snapshot(&self) -> Vec<Arc<BroadcastRequest>> {
        self.open.iter().map(|r| Arc::clone(r.value())).collect()
    }

    /// Open requests created by `session`.
    pub fn owned_by(&self, session: &Arc<Session>) -> Vec<Arc<BroadcastRequest>> {
        self.open
            .iter()
            .filter(|r| {
                r.value()
                    .requester_session()
                    .is_some_and(|s| Arc::ptr_eq(&s, session))
            })
            .map(|r| Arc::clone(r.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}
