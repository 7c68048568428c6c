/// Connected sessions and the registry enforcing one session per username.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use super::error::{BrokerError, Result};
use super::message::{Hello, Reply};
use super::types::{Branch, ConversationId, Role};

/// Mutable routing state of a session.
///
/// `busy` and `conversation` are only changed while the session lock is
/// held, together with the session's idle-index membership.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Handshake finished and the connection has not been torn down.
    pub active: bool,
    pub busy: bool,
    pub conversation: Option<ConversationId>,
}

impl SessionState {
    /// Eligible to be paired right now.
    pub fn available(&self) -> bool {
        self.active && !self.busy
    }
}

/// One connected, identified client.
pub struct Session {
    pub username: String,
    pub role: Role,
    pub branch: Branch,
    tx: mpsc::UnboundedSender<Reply>,
    state: Mutex<SessionState>,
    closed: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("username", &self.username)
            .field("role", &self.role)
            .field("branch", &self.branch)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Create an inactive session; it becomes pairable once the broker
    /// activates it after registration.
    pub fn new(hello: Hello, tx: mpsc::UnboundedSender<Reply>) -> Self {
        Self {
            username: hello.username,
            role: hello.role,
            branch: hello.branch,
            tx,
            state: Mutex::new(SessionState::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Push a line to this session's outbound channel. Best effort: a
    /// closed connection silently drops it.
    pub fn send(&self, reply: Reply) {
        let _ = self.tx.send(reply);
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    pub fn is_available(&self) -> bool {
        self.state.lock().available()
    }

    pub fn conversation(&self) -> Option<ConversationId> {
        self.state.lock().conversation.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flip the closed flag. Returns true for exactly one caller.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Live sessions keyed by username.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the session's username. Fails if another live session holds it.
    pub fn register(&self, session: Arc<Session>) -> Result<()> {
        match self.sessions.entry(session.username.clone()) {
            Entry::Occupied(_) => Err(BrokerError::DuplicateLogin),
            Entry::Vacant(slot) => {
                debug!(username = %session.username, "session registered");
                slot.insert(session);
                Ok(())
            }
        }
    }

    pub fn get(&self, username: &str) -> Option<Arc<Session>> {
        self.sessions.get(username).map(|s| Arc::clone(s.value()))
    }

    /// Release the username, but only if it still belongs to `session`.
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(&session.username, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn session(username: &str) -> Arc<Session> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Session::new(
            Hello {
                username: username.into(),
                role: Role::Cashier,
                branch: Branch::Holon,
            },
            tx,
        ))
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let registry = SessionRegistry::new();
        registry.register(session("dana")).unwrap();
        assert_eq!(
            registry.register(session("dana")),
            Err(BrokerError::DuplicateLogin)
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_only_releases_own_entry() {
        let registry = SessionRegistry::new();
        let first = session("dana");
        let impostor = session("dana");
        registry.register(Arc::clone(&first)).unwrap();

        assert!(!registry.remove(&impostor));
        assert!(registry.get("dana").is_some());
        assert!(registry.remove(&first));
        assert!(registry.is_empty());
    }

    #[test]
    fn close_flag_is_claimed_once() {
        let s = session("avi");
        assert!(s.begin_close());
        assert!(!s.begin_close());
        assert!(s.is_closed());
    }

    #[test]
    fn new_sessions_are_not_available_until_activated() {
        let s = session("avi");
        assert!(!s.is_available());
        s.state().active = true;
        assert!(s.is_available());
        s.state().busy = true;
        assert!(!s.is_available());
    }
}
