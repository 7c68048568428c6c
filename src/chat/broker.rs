/// The broker. One instance owns every registry and is shared by all
/// connection tasks.
///
/// Operations here combine the per-component primitives: the session
/// registry, the idle index, the open-request table, the conversation
/// manager and the missed-request log. Each component locks at its own
/// granularity; nothing serializes the whole broker.
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::audit;
use super::conversation::{ConversationManager, PairOutcome};
use super::error::{BrokerError, Result};
use super::idle::IdleIndex;
use super::message::{Hello, Reply};
use super::missed::MissedRequestLog;
use super::request::{BroadcastRequest, RequestTable, Target};
use super::session::{Session, SessionRegistry};
use super::types::{Branch, ConversationId, RequestId};

#[derive(Debug)]
pub struct Broker {
    sessions: SessionRegistry,
    idle: Arc<IdleIndex>,
    requests: RequestTable,
    conversations: ConversationManager,
    missed: MissedRequestLog,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        let idle = Arc::new(IdleIndex::new());
        Self {
            sessions: SessionRegistry::new(),
            conversations: ConversationManager::new(Arc::clone(&idle)),
            idle,
            requests: RequestTable::new(),
            missed: MissedRequestLog::new(),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn idle(&self) -> &IdleIndex {
        &self.idle
    }

    pub fn requests(&self) -> &RequestTable {
        &self.requests
    }

    pub fn conversations(&self) -> &ConversationManager {
        &self.conversations
    }

    pub fn missed(&self) -> &MissedRequestLog {
        &self.missed
    }

    // ── Session lifecycle ────────────────────────────────────────

    /// Register a session for a completed handshake.
    ///
    /// On success the client is sent `OK HELLO`, becomes idle, is offered
    /// every open request it is eligible for, and receives its missed
    /// requests.
    pub fn connect(&self, hello: Hello, tx: mpsc::UnboundedSender<Reply>) -> Result<Arc<Session>> {
        let session = Arc::new(Session::new(hello, tx));
        if let Err(e) = self.sessions.register(Arc::clone(&session)) {
            audit::duplicate_login(&session.username);
            return Err(e);
        }

        session.send(Reply::HelloOk);
        audit::user_connected(&session);

        {
            let mut state = session.state();
            state.active = true;
            self.idle.add(session.branch, &session.username);
        }
        self.offer_open_requests(&session);

        for requester in self.missed.take(&session.username) {
            session.send(Reply::MissedRequestFrom(requester));
        }

        Ok(session)
    }

    /// Tear a session down: cancel its open requests, leave its
    /// conversation, release its username. Safe to call more than once.
    pub fn disconnect(&self, session: &Arc<Session>) {
        if !session.begin_close() {
            return;
        }
        audit::user_disconnected(session);

        {
            let mut state = session.state();
            state.active = false;
            self.idle.remove(session.branch, &session.username);
        }

        for request in self.requests.owned_by(session) {
            self.cancel(&request, "requester disconnected");
        }

        if let Some(departure) = self.conversations.leave(session, false) {
            for member in &departure.released {
                self.offer_open_requests(member);
            }
        }

        self.sessions.remove(session);
        debug!(username = %session.username, "session cleaned up");
    }

    // ── Broadcast requests ───────────────────────────────────────

    pub fn request_any_other_branch(&self, requester: &Arc<Session>) -> Result<RequestId> {
        self.open_request(requester, Target::AnyOtherBranch)
    }

    pub fn request_branch(&self, requester: &Arc<Session>, branch: Branch) -> Result<RequestId> {
        if requester.is_busy() {
            return Err(BrokerError::AlreadyInConversation);
        }
        if branch == requester.branch {
            requester.send(Reply::TipSelectOtherBranch);
        }
        self.open_request(requester, Target::Branch(branch))
    }

    fn open_request(&self, requester: &Arc<Session>, target: Target) -> Result<RequestId> {
        // Publishing under the requester's lock keeps a busy session from
        // originating a request.
        let request = {
            let state = requester.state();
            if state.busy {
                return Err(BrokerError::AlreadyInConversation);
            }
            self.requests.open(requester, target)?
        };
        requester.send(Reply::RequestBroadcasted(request.id.clone()));
        audit::request_created(&request.id, &request.requester, request.requester_branch, target);

        let candidates = match target {
            Target::AnyOtherBranch => self.idle.snapshot_except(requester.branch),
            Target::Branch(branch) => self.idle.snapshot(branch),
        };
        let mut notified = 0;
        for username in candidates {
            if let Some(candidate) = self.sessions.get(&username) {
                if self.offer(&request, &candidate) {
                    notified += 1;
                }
            }
        }
        debug!(request = %request.id, notified, "request broadcast");

        Ok(request.id.clone())
    }

    /// Tell `session` about `request` if it may answer it right now.
    fn offer(&self, request: &BroadcastRequest, session: &Arc<Session>) -> bool {
        if request.is_requester(session) || !request.is_eligible(session.branch) {
            return false;
        }
        if !session.is_available() {
            return false;
        }
        request.notify_incoming(session)
    }

    /// Re-scan the open requests for a session that just became idle.
    fn offer_open_requests(&self, session: &Arc<Session>) {
        for request in self.requests.snapshot() {
            self.offer(&request, session);
        }
    }

    /// Try to take request `id` for `acceptor`. Exactly one of any number of
    /// concurrent acceptors succeeds.
    pub fn accept(&self, acceptor: &Arc<Session>, id: &RequestId) -> Result<ConversationId> {
        let request = self.requests.get(id).ok_or(BrokerError::NoSuchRequest)?;
        if request.is_cancelled() {
            return Err(BrokerError::NoSuchRequest);
        }
        if request.is_taken() {
            return Err(BrokerError::RequestAlreadyTaken);
        }
        if request.is_requester(acceptor) || !request.is_eligible(acceptor.branch) {
            return Err(BrokerError::NotEligible);
        }
        if acceptor.is_busy() {
            return Err(BrokerError::AlreadyInConversation);
        }

        let Some(requester) = request.requester_session() else {
            self.cancel(&request, "requester not available");
            return Err(BrokerError::RequesterNotAvailable);
        };

        match self
            .conversations
            .start_if(&requester, acceptor, || request.try_take())
        {
            PairOutcome::Paired(conversation) => {
                request.close_notified(&Reply::RequestTaken(request.id.clone()), Some(acceptor));
                self.requests.remove(&request.id);
                audit::request_accepted(&request.id, &request.requester, acceptor);
                Ok(conversation.id.clone())
            }
            PairOutcome::FirstUnavailable => {
                // The requester may be busy because another acceptor won.
                if self.cancel(&request, "requester not available") || request.is_cancelled() {
                    Err(BrokerError::RequesterNotAvailable)
                } else {
                    Err(BrokerError::RequestAlreadyTaken)
                }
            }
            PairOutcome::SecondUnavailable => Err(BrokerError::AlreadyInConversation),
            PairOutcome::Declined if request.is_cancelled() => Err(BrokerError::NoSuchRequest),
            PairOutcome::Declined => Err(BrokerError::RequestAlreadyTaken),
        }
    }

    /// Cancel `request` if it is still open, telling everyone who saw it.
    fn cancel(&self, request: &BroadcastRequest, reason: &str) -> bool {
        if !request.try_cancel() {
            return false;
        }
        request.close_notified(&Reply::RequestCancelled(request.id.clone()), None);
        self.requests.remove(&request.id);
        audit::request_cancelled(&request.id, &request.requester, reason);
        true
    }

    // ── Direct requests ──────────────────────────────────────────

    /// Pair with `target` right away, or leave a missed-request note.
    pub fn request_user(&self, requester: &Arc<Session>, target: &str) -> Result<()> {
        if requester.is_busy() {
            return Err(BrokerError::AlreadyInConversation);
        }
        if let Some(peer) = self.sessions.get(target) {
            if peer.username != requester.username {
                match self.conversations.start(requester, &peer) {
                    PairOutcome::Paired(_) => return Ok(()),
                    PairOutcome::FirstUnavailable => {
                        return Err(BrokerError::AlreadyInConversation)
                    }
                    PairOutcome::SecondUnavailable | PairOutcome::Declined => {}
                }
            }
        }

        if self.missed.record(target, &requester.username) {
            audit::direct_request_missed(target, &requester.username);
        }
        requester.send(Reply::UserBusyOrOffline);
        Ok(())
    }

    /// Answer a missed request: pair with `target` like a direct request
    /// and clear the missed bookkeeping between the two.
    pub fn callback(&self, caller: &Arc<Session>, target: &str) -> Result<()> {
        if caller.is_busy() {
            return Err(BrokerError::AlreadyInConversation);
        }
        if let Some(peer) = self.sessions.get(target) {
            if peer.username != caller.username {
                match self.conversations.start(caller, &peer) {
                    PairOutcome::Paired(_) => {
                        self.missed.forget(&caller.username, target);
                        self.missed.forget(target, &caller.username);
                        return Ok(());
                    }
                    PairOutcome::FirstUnavailable => {
                        return Err(BrokerError::AlreadyInConversation)
                    }
                    PairOutcome::SecondUnavailable | PairOutcome::Declined => {}
                }
            }
        }
        caller.send(Reply::TargetNotAvailable);
        Ok(())
    }

    // ── Conversations ────────────────────────────────────────────

    /// Stream the live conversations to a shift manager, closed by `OK END`.
    pub fn list_conversations(&self, manager: &Arc<Session>) -> Result<()> {
        let listing = self.conversations.list(manager)?;
        if listing.is_empty() {
            manager.send(Reply::NoActiveConversations);
        }
        for (id, participants) in listing {
            manager.send(Reply::Conversation { id, participants });
        }
        manager.send(Reply::EndOfList);
        Ok(())
    }

    pub fn join(&self, manager: &Arc<Session>, id: &ConversationId) -> Result<()> {
        self.conversations.join(manager, id)?;
        info!(manager = %manager.username, conversation = %id, "manager joined conversation");
        Ok(())
    }

    pub fn message(&self, sender: &Arc<Session>, text: &str) -> Result<()> {
        let conversation = self.conversations.message(sender, text)?;
        audit::message(&conversation, &sender.username, text);
        Ok(())
    }

    /// Leave the current conversation and go back to idle.
    pub fn end(&self, session: &Arc<Session>) {
        let Some(departure) = self.conversations.leave(session, true) else {
            session.send(Reply::NotInConversation);
            return;
        };
        self.offer_open_requests(session);
        for member in &departure.released {
            self.offer_open_requests(member);
        }
    }
}
