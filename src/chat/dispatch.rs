/// Maps protocol lines onto broker operations.
///
/// Everything here is synchronous: a line is parsed, the broker call runs to
/// completion, and any reply has already been queued on the session's
/// outbound channel when the function returns.
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use super::broker::Broker;
use super::error::{BrokerError, Result};
use super::message::{Command, Hello, ParseError, Reply};
use super::session::Session;

/// What the connection loop should do after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Handle the first line of a connection.
///
/// On success the session is registered and `OK HELLO` is queued. On
/// failure nothing is registered; the caller reports the error and closes.
pub fn handshake(broker: &Broker, line: &str, tx: mpsc::UnboundedSender<Reply>) -> Result<Arc<Session>> {
    let hello = Hello::parse(line)?;
    broker.connect(hello, tx)
}

/// Handle one line from an identified session.
pub fn dispatch(broker: &Broker, session: &Arc<Session>, line: &str) -> Flow {
    let command = match Command::parse(line) {
        Ok(command) => command,
        Err(ParseError::Empty) => return Flow::Continue,
        Err(e) => {
            debug!(username = %session.username, "rejected line: {e}");
            session.send(BrokerError::from(e).into());
            return Flow::Continue;
        }
    };

    if command == Command::Quit {
        session.send(Reply::Bye);
        broker.disconnect(session);
        return Flow::Quit;
    }

    if let Err(e) = execute(broker, session, command) {
        session.send(e.into());
    }
    Flow::Continue
}

fn execute(broker: &Broker, session: &Arc<Session>, command: Command) -> Result<()> {
    match command {
        Command::RequestAnyOtherBranch => {
            broker.request_any_other_branch(session)?;
        }
        Command::RequestBranch(branch) => {
            broker.request_branch(session, branch)?;
        }
        Command::RequestUser(target) => broker.request_user(session, &target)?,
        Command::Accept(id) => {
            broker.accept(session, &id)?;
        }
        Command::ListConversations => broker.list_conversations(session)?,
        Command::Join(id) => broker.join(session, &id)?,
        Command::Callback(target) => broker.callback(session, &target)?,
        Command::Msg(text) => broker.message(session, &text)?,
        Command::End => broker.end(session),
        Command::Quit => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn connect(broker: &Broker, line: &str) -> (Arc<Session>, mpsc::UnboundedReceiver<Reply>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = handshake(broker, line, tx).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Reply::HelloOk);
        (session, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Reply>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(reply) = rx.try_recv() {
            lines.push(reply.to_wire());
        }
        lines
    }

    #[test]
    fn handshake_errors() {
        let broker = Broker::new();
        let cases = [
            ("REQUEST_ANY_OTHER_BRANCH", BrokerError::HelloRequired),
            ("HELLO dana", BrokerError::BadHello),
            ("HELLO dana JANITOR HOLON", BrokerError::BadHello),
            ("HELLO dana cashier EILAT", BrokerError::BadBranch),
        ];
        for (line, expected) in cases {
            let (tx, _rx) = mpsc::unbounded_channel();
            assert_eq!(handshake(&broker, line, tx).unwrap_err(), expected, "{line}");
        }
        assert!(broker.sessions().is_empty());

        let (_dana, _rx) = connect(&broker, "hello dana cashier holon");
        let (tx, _rx2) = mpsc::unbounded_channel();
        assert_eq!(
            handshake(&broker, "HELLO dana SALESPERSON RISHON", tx).unwrap_err(),
            BrokerError::DuplicateLogin
        );
    }

    #[test]
    fn protocol_errors_keep_the_connection() {
        let broker = Broker::new();
        let (dana, mut rx) = connect(&broker, "HELLO dana CASHIER HOLON");

        assert_eq!(dispatch(&broker, &dana, ""), Flow::Continue);
        assert_eq!(dispatch(&broker, &dana, "DANCE"), Flow::Continue);
        assert_eq!(dispatch(&broker, &dana, "ACCEPT"), Flow::Continue);
        assert_eq!(dispatch(&broker, &dana, "REQUEST_BRANCH EILAT"), Flow::Continue);
        assert_eq!(dispatch(&broker, &dana, "ACCEPT deadbeef"), Flow::Continue);
        assert_eq!(dispatch(&broker, &dana, "MSG hi"), Flow::Continue);
        assert_eq!(dispatch(&broker, &dana, "LIST_CONVS"), Flow::Continue);
        assert_eq!(
            drain(&mut rx),
            vec![
                "ERR UNKNOWN_CMD",
                "ERR BAD_ARGS",
                "ERR BAD_BRANCH",
                "ERR NO_SUCH_REQUEST",
                "ERR NOT_IN_CONVERSATION",
                "ERR NOT_ALLOWED",
            ]
        );
        assert!(!dana.is_closed());
    }

    #[test]
    fn chat_round_trip_and_quit() {
        let broker = Broker::new();
        let (dana, mut dana_rx) = connect(&broker, "HELLO dana CASHIER HOLON");
        let (avi, mut avi_rx) = connect(&broker, "HELLO avi SALESPERSON TEL_AVIV");

        dispatch(&broker, &dana, "request_branch tel_aviv");
        let broadcast = drain(&mut dana_rx);
        let id = broadcast[0]
            .strip_prefix("INFO REQUEST_BROADCASTED ")
            .unwrap()
            .to_string();
        assert_eq!(
            drain(&mut avi_rx),
            vec![format!("INCOMING_REQUEST {id} dana HOLON")]
        );

        dispatch(&broker, &avi, &format!("ACCEPT {id}"));
        let conv = avi.conversation().unwrap();
        assert_eq!(drain(&mut dana_rx), vec![format!("PAIRED {conv} dana,avi")]);
        drain(&mut avi_rx);

        dispatch(&broker, &dana, "MSG  do you have size 42?");
        assert_eq!(
            drain(&mut avi_rx),
            vec!["MSG from dana :  do you have size 42?".to_string()]
        );

        assert_eq!(dispatch(&broker, &avi, "QUIT"), Flow::Quit);
        assert_eq!(drain(&mut avi_rx), vec!["BYE".to_string()]);
        assert_eq!(
            drain(&mut dana_rx),
            vec![
                "MSG from dana :  do you have size 42?".to_string(),
                "INFO CONVERSATION_ENDED".to_string(),
            ]
        );
        assert!(broker.sessions().get("avi").is_none());
    }
}
