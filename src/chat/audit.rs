/// Chat audit trail of session, request, conversation and message events.
///
/// Everything here is a `tracing` event on the [`TARGET`] target. `main`
/// routes that target to a non-blocking file writer when an audit directory
/// is configured, so emitting an event never waits on disk.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use super::request::Target;
use super::session::Session;
use super::types::{Branch, ConversationId, RequestId};

pub const TARGET: &str = "branchchat::audit";

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn csv(participants: &[String]) -> String {
    participants.join(",")
}

pub fn server_start(addr: &str) {
    info!(target: TARGET, event = "SERVER_START", addr, "chat server started");
}

pub fn server_stop() {
    info!(target: TARGET, event = "SERVER_STOP", "chat server stopping");
}

pub fn user_connected(session: &Session) {
    info!(
        target: TARGET,
        event = "CONNECTED",
        username = %session.username,
        role = %session.role,
        branch = %session.branch,
        "user connected"
    );
}

pub fn user_disconnected(session: &Session) {
    info!(
        target: TARGET,
        event = "DISCONNECTED",
        username = %session.username,
        role = %session.role,
        branch = %session.branch,
        "user disconnected"
    );
}

pub fn duplicate_login(username: &str) {
    warn!(target: TARGET, event = "DUPLICATE_LOGIN", username, "duplicate login attempt");
}

pub fn request_created(id: &RequestId, requester: &str, branch: Branch, target: Target) {
    info!(
        target: TARGET,
        event = "CREATED",
        request = %id,
        requester,
        requester_branch = %branch,
        target_branch = target.label(),
        "request created"
    );
}

pub fn request_accepted(id: &RequestId, requester: &str, acceptor: &Session) {
    info!(
        target: TARGET,
        event = "ACCEPTED",
        request = %id,
        requester,
        acceptor = %acceptor.username,
        acceptor_branch = %acceptor.branch,
        "request accepted"
    );
}

pub fn request_cancelled(id: &RequestId, requester: &str, reason: &str) {
    info!(
        target: TARGET,
        event = "CANCELLED",
        request = %id,
        requester,
        reason,
        "request cancelled"
    );
}

pub fn direct_request_missed(target: &str, requester: &str) {
    info!(target: TARGET, event = "MISSED", target_user = target, requester, "direct request missed");
}

pub fn conversation_started(id: &ConversationId, participants: &[String]) {
    info!(
        target: TARGET,
        event = "STARTED",
        conversation = %id,
        participants = %csv(participants),
        "conversation started"
    );
}

pub fn conversation_joined(id: &ConversationId, username: &str, participants: &[String]) {
    info!(
        target: TARGET,
        event = "JOINED",
        conversation = %id,
        username,
        participants = %csv(participants),
        "user joined conversation"
    );
}

pub fn conversation_left(id: &ConversationId, username: &str, participants: &[String]) {
    info!(
        target: TARGET,
        event = "LEFT",
        conversation = %id,
        username,
        participants = %csv(participants),
        "user left conversation"
    );
}

pub fn conversation_ended(id: &ConversationId, participants: &[String], duration: Duration) {
    info!(
        target: TARGET,
        event = "ENDED",
        conversation = %id,
        participants = %csv(participants),
        duration_secs = duration.as_secs(),
        "conversation ended"
    );
}

/// Log a relayed chat line. Returns its process-wide sequence number.
pub fn message(conversation: &ConversationId, sender: &str, text: &str) -> u64 {
    let seq = MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    info!(
        target: TARGET,
        event = "CHAT",
        message_id = seq,
        conversation = %conversation,
        sender,
        text,
        "message relayed"
    );
    seq
}
