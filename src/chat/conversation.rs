/// Live conversations: pairing, manager joins, relay, and teardown.
///
/// Lock order is session state first (two at once only when pairing, in a
/// fixed order), then the conversation's member list. No lock is held while
/// waiting on anything but another in-memory lock.
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use super::audit;
use super::error::{BrokerError, Result};
use super::idle::IdleIndex;
use super::message::Reply;
use super::session::{Session, SessionState};
use super::types::ConversationId;

#[derive(Debug, Default)]
struct Members {
    sessions: Vec<Arc<Session>>,
    /// Set once, when membership drops below two.
    ended: bool,
}

impl Members {
    fn usernames(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.username.clone()).collect()
    }
}

#[derive(Debug)]
pub struct Conversation {
    pub id: ConversationId,
    started_at: Instant,
    members: Mutex<Members>,
}

impl Conversation {
    fn new(id: ConversationId, members: Vec<Arc<Session>>) -> Self {
        Self {
            id,
            started_at: Instant::now(),
            members: Mutex::new(Members {
                sessions: members,
                ended: false,
            }),
        }
    }

    pub fn participants(&self) -> Vec<String> {
        self.members.lock().usernames()
    }

    pub fn len(&self) -> usize {
        self.members.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_ended(&self) -> bool {
        self.members.lock().ended
    }

    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Result of trying to pair two sessions.
#[derive(Debug)]
pub enum PairOutcome {
    Paired(Arc<Conversation>),
    /// The first session is gone or busy.
    FirstUnavailable,
    /// The second session is gone, busy, or the same as the first.
    SecondUnavailable,
    /// Both were free but the caller's precondition refused.
    Declined,
}

/// What happened when a session left its conversation.
#[derive(Debug)]
pub struct Departure {
    /// The conversation was torn down by this departure.
    pub ended: bool,
    /// Members returned to idle because the conversation ended.
    pub released: Vec<Arc<Session>>,
}

/// Owns the conversation table.
#[derive(Debug)]
pub struct ConversationManager {
    conversations: DashMap<ConversationId, Arc<Conversation>>,
    idle: Arc<IdleIndex>,
}

/// Lock two distinct sessions in a stable global order and return the
/// guards as `(a, b)`.
fn lock_pair<'a>(
    a: &'a Arc<Session>,
    b: &'a Arc<Session>,
) -> (MutexGuard<'a, SessionState>, MutexGuard<'a, SessionState>) {
    let key = |s: &Arc<Session>| (s.username.clone(), Arc::as_ptr(s) as usize);
    if key(a) <= key(b) {
        let ga = a.state();
        let gb = b.state();
        (ga, gb)
    } else {
        let gb = b.state();
        let ga = a.state();
        (ga, gb)
    }
}

impl ConversationManager {
    pub fn new(idle: Arc<IdleIndex>) -> Self {
        Self {
            conversations: DashMap::new(),
            idle,
        }
    }

    pub fn get(&self, id: &ConversationId) -> Option<Arc<Conversation>> {
        self.conversations.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Pair `a` and `b` if both are free.
    pub fn start(&self, a: &Arc<Session>, b: &Arc<Session>) -> PairOutcome {
        self.start_if(a, b, || true)
    }

    /// Pair `a` and `b` if both are free and `precondition` agrees.
    ///
    /// `precondition` runs while both session locks are held, after both
    /// sessions were found free; if it returns true the pairing commits.
    pub fn start_if(
        &self,
        a: &Arc<Session>,
        b: &Arc<Session>,
        precondition: impl FnOnce() -> bool,
    ) -> PairOutcome {
        if Arc::ptr_eq(a, b) {
            return PairOutcome::SecondUnavailable;
        }

        let conversation = {
            let (mut sa, mut sb) = lock_pair(a, b);
            if !sa.available() {
                return PairOutcome::FirstUnavailable;
            }
            if !sb.available() {
                return PairOutcome::SecondUnavailable;
            }
            if !precondition() {
                return PairOutcome::Declined;
            }

            let mut id = ConversationId::generate();
            while self.conversations.contains_key(&id) {
                id = ConversationId::generate();
            }
            let conversation = Arc::new(Conversation::new(
                id.clone(),
                vec![Arc::clone(a), Arc::clone(b)],
            ));

            for (session, state) in [(a, &mut sa), (b, &mut sb)] {
                state.busy = true;
                state.conversation = Some(id.clone());
                self.idle.remove(session.branch, &session.username);
            }
            self.conversations.insert(id, Arc::clone(&conversation));
            conversation
        };

        let participants = conversation.participants();
        let paired = Reply::Paired {
            conversation: conversation.id.clone(),
            participants: participants.clone(),
        };
        a.send(paired.clone());
        b.send(paired);
        audit::conversation_started(&conversation.id, &participants);

        PairOutcome::Paired(conversation)
    }

    /// Add a shift manager to a live conversation.
    pub fn join(&self, manager: &Arc<Session>, id: &ConversationId) -> Result<Arc<Conversation>> {
        if !manager.role.is_manager() {
            return Err(BrokerError::NotAllowed);
        }
        let conversation = self.get(id).ok_or(BrokerError::NoSuchConversation)?;

        let (existing, participants) = {
            let mut state = manager.state();
            if state.conversation.as_ref().is_some_and(|current| current != id) {
                return Err(BrokerError::AlreadyInAnotherConversation);
            }

            let mut members = conversation.members.lock();
            if members.ended {
                return Err(BrokerError::NoSuchConversation);
            }
            let existing: Vec<_> = members
                .sessions
                .iter()
                .filter(|m| !Arc::ptr_eq(m, manager))
                .cloned()
                .collect();
            if existing.len() == members.sessions.len() {
                members.sessions.push(Arc::clone(manager));
            }

            state.busy = true;
            state.conversation = Some(id.clone());
            self.idle.remove(manager.branch, &manager.username);
            (existing, members.usernames())
        };

        for member in &existing {
            member.send(Reply::ManagerJoined(manager.username.clone()));
        }
        manager.send(Reply::Paired {
            conversation: id.clone(),
            participants: participants.clone(),
        });
        audit::conversation_joined(id, &manager.username, &participants);

        Ok(conversation)
    }

    /// Every live conversation with its participants, ordered by id.
    pub fn list(&self, manager: &Session) -> Result<Vec<(ConversationId, Vec<String>)>> {
        if !manager.role.is_manager() {
            return Err(BrokerError::NotAllowed);
        }
        let snapshot: Vec<_> = self
            .conversations
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect();
        let mut listing: Vec<_> = snapshot
            .into_iter()
            .filter(|c| !c.is_ended())
            .map(|c| (c.id.clone(), c.participants()))
            .collect();
        listing.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(listing)
    }

    /// Relay `text` from `sender` to every member, sender included.
    pub fn message(&self, sender: &Session, text: &str) -> Result<ConversationId> {
        let id = sender.conversation().ok_or(BrokerError::NotInConversation)?;
        let conversation = self.get(&id).ok_or(BrokerError::ConversationEnded)?;

        let members = conversation.members.lock();
        if members.ended {
            return Err(BrokerError::ConversationEnded);
        }
        let line = Reply::Chat {
            from: sender.username.clone(),
            text: text.to_owned(),
        };
        for member in &members.sessions {
            member.send(line.clone());
        }
        Ok(id)
    }

    /// Remove `session` from its conversation, if it has one.
    ///
    /// The leaver's busy flag and conversation reference are cleared and,
    /// if it is still connected, it goes back to idle. When fewer than two
    /// members remain the conversation is torn down and every survivor is
    /// released the same way and told it ended; otherwise survivors are told
    /// who left. With `announce`, the leaver is told `INFO LEFT_CONVERSATION`
    /// before it becomes visible as idle.
    pub fn leave(&self, session: &Arc<Session>, announce: bool) -> Option<Departure> {
        let (id, conversation, ended, remaining) = {
            let mut state = session.state();
            let id = state.conversation.take()?;
            state.busy = false;
            if announce {
                session.send(Reply::LeftConversation);
            }
            if state.active {
                self.idle.add(session.branch, &session.username);
            }

            let Some(conversation) = self.get(&id) else {
                // Torn down concurrently; whoever ended it releases the rest.
                return Some(Departure {
                    ended: false,
                    released: Vec::new(),
                });
            };

            let mut members = conversation.members.lock();
            members.sessions.retain(|m| !Arc::ptr_eq(m, session));
            if members.ended {
                (id, conversation.clone(), false, Vec::new())
            } else if members.sessions.len() < 2 {
                members.ended = true;
                let remaining = std::mem::take(&mut members.sessions);
                (id, conversation.clone(), true, remaining)
            } else {
                let remaining = members.sessions.clone();
                (id, conversation.clone(), false, remaining)
            }
        };

        if !ended {
            for survivor in &remaining {
                survivor.send(Reply::UserLeft(session.username.clone()));
            }
            if !remaining.is_empty() {
                audit::conversation_left(&id, &session.username, &conversation.participants());
            }
            return Some(Departure {
                ended: false,
                released: Vec::new(),
            });
        }

        self.conversations.remove(&id);
        let mut released = Vec::with_capacity(remaining.len());
        for member in remaining {
            {
                let mut state = member.state();
                if state.conversation.as_ref() != Some(&id) {
                    continue;
                }
                state.conversation = None;
                state.busy = false;
                member.send(Reply::ConversationEnded);
                if state.active {
                    self.idle.add(member.branch, &member.username);
                }
            }
            released.push(member);
        }

        let mut participants: Vec<String> = vec![session.username.clone()];
        participants.extend(released.iter().map(|m| m.username.clone()));
        audit::conversation_ended(&id, &participants, conversation.duration());
        debug!(conversation = %id, "conversation torn down");

        Some(Departure {
            ended: true,
            released,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::Hello;
    use crate::chat::types::{Branch, Role};
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    struct Peer {
        session: Arc<Session>,
        rx: mpsc::UnboundedReceiver<Reply>,
    }

    impl Peer {
        fn new(username: &str, role: Role, branch: Branch, idle: &IdleIndex) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let hello = Hello {
                username: username.into(),
                role,
                branch,
            };
            let session = Arc::new(Session::new(hello, tx));
            session.state().active = true;
            idle.add(branch, username);
            Self { session, rx }
        }

        fn drain(&mut self) -> Vec<String> {
            let mut lines = Vec::new();
            while let Ok(reply) = self.rx.try_recv() {
                lines.push(reply.to_wire());
            }
            lines
        }
    }

    fn manager() -> (ConversationManager, Arc<IdleIndex>) {
        let idle = Arc::new(IdleIndex::new());
        (ConversationManager::new(Arc::clone(&idle)), idle)
    }

    fn paired(outcome: PairOutcome) -> Arc<Conversation> {
        match outcome {
            PairOutcome::Paired(c) => c,
            other => panic!("expected pairing, got {other:?}"),
        }
    }

    #[test]
    fn start_pairs_and_removes_from_idle() {
        let (convs, idle) = manager();
        let mut dana = Peer::new("dana", Role::Cashier, Branch::Holon, &idle);
        let mut avi = Peer::new("avi", Role::Cashier, Branch::TelAviv, &idle);

        let conv = paired(convs.start(&dana.session, &avi.session));
        assert!(idle.is_empty());
        assert!(dana.session.is_busy());
        assert_eq!(avi.session.conversation(), Some(conv.id.clone()));

        let expected = format!("PAIRED {} dana,avi", conv.id);
        assert_eq!(dana.drain(), vec![expected.clone()]);
        assert_eq!(avi.drain(), vec![expected]);
    }

    #[test]
    fn start_refuses_busy_or_identical_sessions() {
        let (convs, idle) = manager();
        let dana = Peer::new("dana", Role::Cashier, Branch::Holon, &idle);
        let avi = Peer::new("avi", Role::Cashier, Branch::TelAviv, &idle);
        let noa = Peer::new("noa", Role::Cashier, Branch::Rishon, &idle);
        let lior = Peer::new("lior", Role::Cashier, Branch::Holon, &idle);

        assert!(matches!(
            convs.start(&dana.session, &dana.session),
            PairOutcome::SecondUnavailable
        ));
        paired(convs.start(&dana.session, &avi.session));
        assert!(matches!(
            convs.start(&noa.session, &avi.session),
            PairOutcome::SecondUnavailable
        ));
        assert!(matches!(
            convs.start(&dana.session, &noa.session),
            PairOutcome::FirstUnavailable
        ));
        assert!(matches!(
            convs.start_if(&noa.session, &lior.session, || false),
            PairOutcome::Declined
        ));
        assert_eq!(convs.len(), 1);
        assert!(!noa.session.is_busy());
    }

    #[test]
    fn leave_below_two_tears_down() {
        let (convs, idle) = manager();
        let mut dana = Peer::new("dana", Role::Cashier, Branch::Holon, &idle);
        let mut avi = Peer::new("avi", Role::Cashier, Branch::TelAviv, &idle);
        let conv = paired(convs.start(&dana.session, &avi.session));
        dana.drain();
        avi.drain();

        let departure = convs.leave(&dana.session, true).unwrap();
        assert!(departure.ended);
        assert_eq!(departure.released.len(), 1);
        assert!(convs.get(&conv.id).is_none());

        assert_eq!(dana.drain(), vec!["INFO LEFT_CONVERSATION".to_string()]);
        assert_eq!(avi.drain(), vec!["INFO CONVERSATION_ENDED".to_string()]);
        assert!(idle.contains(Branch::Holon, "dana"));
        assert!(idle.contains(Branch::TelAviv, "avi"));
        assert!(!avi.session.is_busy());
        assert_eq!(avi.session.conversation(), None);

        assert!(convs.leave(&dana.session, true).is_none());
    }

    #[test]
    fn manager_join_and_partial_leave() {
        let (convs, idle) = manager();
        let mut dana = Peer::new("dana", Role::Cashier, Branch::Holon, &idle);
        let mut avi = Peer::new("avi", Role::Salesperson, Branch::TelAviv, &idle);
        let mut boss = Peer::new("boss", Role::ShiftManager, Branch::Rishon, &idle);
        let conv = paired(convs.start(&dana.session, &avi.session));
        dana.drain();
        avi.drain();

        convs.join(&boss.session, &conv.id).unwrap();
        assert_eq!(dana.drain(), vec!["MANAGER_JOINED boss".to_string()]);
        assert_eq!(avi.drain(), vec!["MANAGER_JOINED boss".to_string()]);
        assert_eq!(
            boss.drain(),
            vec![format!("PAIRED {} dana,avi,boss", conv.id)]
        );
        assert!(!idle.contains(Branch::Rishon, "boss"));

        let listing = convs.list(&boss.session).unwrap();
        assert_eq!(
            listing,
            vec![(
                conv.id.clone(),
                vec!["dana".to_string(), "avi".to_string(), "boss".to_string()]
            )]
        );

        let departure = convs.leave(&avi.session, true).unwrap();
        assert!(!departure.ended);
        assert_eq!(dana.drain(), vec!["INFO avi_LEFT".to_string()]);
        assert_eq!(boss.drain(), vec!["INFO avi_LEFT".to_string()]);
        assert_eq!(conv.participants(), vec!["dana".to_string(), "boss".to_string()]);
    }

    #[test]
    fn join_rules() {
        let (convs, idle) = manager();
        let a = Peer::new("a", Role::Cashier, Branch::Holon, &idle);
        let b = Peer::new("b", Role::Cashier, Branch::TelAviv, &idle);
        let c = Peer::new("c", Role::Cashier, Branch::Holon, &idle);
        let boss = Peer::new("boss", Role::ShiftManager, Branch::Rishon, &idle);
        let first = paired(convs.start(&a.session, &b.session));
        let second = paired(convs.start(&c.session, &boss.session));

        assert_eq!(
            convs.join(&a.session, &second.id).unwrap_err(),
            BrokerError::NotAllowed
        );
        assert_eq!(
            convs.join(&boss.session, &ConversationId::from("nope")).unwrap_err(),
            BrokerError::NoSuchConversation
        );
        assert_eq!(
            convs.join(&boss.session, &first.id).unwrap_err(),
            BrokerError::AlreadyInAnotherConversation
        );
        // Re-joining the conversation it is already in is allowed.
        convs.join(&boss.session, &second.id).unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(convs.list(&a.session).unwrap_err(), BrokerError::NotAllowed);
    }

    #[test]
    fn message_relays_to_all_members() {
        let (convs, idle) = manager();
        let mut dana = Peer::new("dana", Role::Cashier, Branch::Holon, &idle);
        let mut avi = Peer::new("avi", Role::Cashier, Branch::TelAviv, &idle);
        let loner = Peer::new("loner", Role::Cashier, Branch::Rishon, &idle);

        assert_eq!(
            convs.message(&loner.session, "hi").unwrap_err(),
            BrokerError::NotInConversation
        );

        paired(convs.start(&dana.session, &avi.session));
        dana.drain();
        avi.drain();
        convs.message(&avi.session, "need a size 42").unwrap();
        assert_eq!(dana.drain(), vec!["MSG from avi : need a size 42".to_string()]);
        assert_eq!(avi.drain(), vec!["MSG from avi : need a size 42".to_string()]);
    }

    #[test]
    fn disconnected_leaver_is_not_re_idled() {
        let (convs, idle) = manager();
        let dana = Peer::new("dana", Role::Cashier, Branch::Holon, &idle);
        let avi = Peer::new("avi", Role::Cashier, Branch::TelAviv, &idle);
        paired(convs.start(&dana.session, &avi.session));

        dana.session.state().active = false;
        convs.leave(&dana.session, false).unwrap();
        assert!(!idle.contains(Branch::Holon, "dana"));
        assert!(idle.contains(Branch::TelAviv, "avi"));
    }
}
