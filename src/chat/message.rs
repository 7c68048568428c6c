/// Line protocol parsing and serialization.
///
/// Clients send one command per line:
///   VERB [SPACE argument...]
///
/// The verb is case-insensitive. Everything after the first space is the
/// argument; `MSG` keeps it verbatim, every other command trims it.
/// Server lines are rendered by [`Reply::to_wire`] without the terminator.
use std::fmt;

use super::types::{Branch, ConversationId, RequestId, Role};

/// Identity declared by a client on its first line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub username: String,
    pub role: Role,
    pub branch: Branch,
}

/// A parsed post-handshake command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    RequestAnyOtherBranch,
    RequestBranch(Branch),
    RequestUser(String),
    Accept(RequestId),
    ListConversations,
    Join(ConversationId),
    Callback(String),
    Msg(String),
    End,
    Quit,
}

/// Errors that can occur while parsing a client line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("first line must be HELLO")]
    HelloRequired,
    #[error("malformed HELLO")]
    BadHello,
    #[error("unknown branch: {0}")]
    BadBranch(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{0} requires an argument")]
    MissingArgument(&'static str),
}

impl Hello {
    /// Parse `HELLO <username> <role> <branch>`. Extra tokens are ignored.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let mut tokens = input.split_whitespace();

        match tokens.next() {
            Some(verb) if verb.eq_ignore_ascii_case("HELLO") => {}
            _ => return Err(ParseError::HelloRequired),
        }

        let (Some(username), Some(role), Some(branch)) =
            (tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(ParseError::BadHello);
        };

        let role = role.parse::<Role>().map_err(|_| ParseError::BadHello)?;
        let branch = branch
            .parse::<Branch>()
            .map_err(|e| ParseError::BadBranch(e.0))?;

        Ok(Hello {
            username: username.to_owned(),
            role,
            branch,
        })
    }
}

impl Command {
    /// Parse a single command line (without the trailing newline).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ParseError::Empty);
        }

        let (verb, rest) = match input.split_once(' ') {
            Some((verb, rest)) => (verb, rest),
            None => (input, ""),
        };
        let arg = rest.trim();

        let required = |name: &'static str| {
            if arg.is_empty() {
                Err(ParseError::MissingArgument(name))
            } else {
                Ok(arg.to_owned())
            }
        };

        let command = match verb.to_ascii_uppercase().as_str() {
            "REQUEST_ANY_OTHER_BRANCH" => Command::RequestAnyOtherBranch,
            "REQUEST_BRANCH" => {
                let name = required("REQUEST_BRANCH")?;
                let branch = name
                    .parse::<Branch>()
                    .map_err(|e| ParseError::BadBranch(e.0))?;
                Command::RequestBranch(branch)
            }
            "REQUEST_USER" => Command::RequestUser(required("REQUEST_USER")?),
            "ACCEPT" => Command::Accept(RequestId::from(required("ACCEPT")?.as_str())),
            "LIST_CONVS" => Command::ListConversations,
            "JOIN" => Command::Join(ConversationId::from(required("JOIN")?.as_str())),
            "CALLBACK" => Command::Callback(required("CALLBACK")?),
            "MSG" => Command::Msg(rest.to_owned()),
            "END" => Command::End,
            "QUIT" => Command::Quit,
            other => return Err(ParseError::UnknownCommand(other.to_owned())),
        };

        Ok(command)
    }
}

/// A line sent from the server to one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    HelloOk,
    /// Closes a `LIST_CONVS` stream.
    EndOfList,
    IncomingRequest {
        id: RequestId,
        from: String,
        branch: Branch,
    },
    RequestTaken(RequestId),
    RequestCancelled(RequestId),
    RequestBroadcasted(RequestId),
    TipSelectOtherBranch,
    UserBusyOrOffline,
    TargetNotAvailable,
    Paired {
        conversation: ConversationId,
        participants: Vec<String>,
    },
    ManagerJoined(String),
    Chat {
        from: String,
        text: String,
    },
    UserLeft(String),
    ConversationEnded,
    LeftConversation,
    NotInConversation,
    NoActiveConversations,
    MissedRequestFrom(String),
    Conversation {
        id: ConversationId,
        participants: Vec<String>,
    },
    Bye,
    /// `ERR <token>`.
    Error(String),
}

impl Reply {
    /// Serialize to the wire format (without trailing `\r\n`).
    pub fn to_wire(&self) -> String {
        match self {
            Self::HelloOk => "OK HELLO".into(),
            Self::EndOfList => "OK END".into(),
            Self::IncomingRequest { id, from, branch } => {
                format!("INCOMING_REQUEST {id} {from} {branch}")
            }
            Self::RequestTaken(id) => format!("REQUEST_TAKEN {id}"),
            Self::RequestCancelled(id) => format!("REQUEST_CANCELLED {id}"),
            Self::RequestBroadcasted(id) => format!("INFO REQUEST_BROADCASTED {id}"),
            Self::TipSelectOtherBranch => "INFO TIP_SELECT_OTHER_BRANCH".into(),
            Self::UserBusyOrOffline => "INFO USER_BUSY_OR_OFFLINE".into(),
            Self::TargetNotAvailable => "INFO TARGET_NOT_AVAILABLE".into(),
            Self::Paired {
                conversation,
                participants,
            } => format!("PAIRED {conversation} {}", participants.join(",")),
            Self::ManagerJoined(user) => format!("MANAGER_JOINED {user}"),
            Self::Chat { from, text } => format!("MSG from {from} : {text}"),
            Self::UserLeft(user) => format!("INFO {user}_LEFT"),
            Self::ConversationEnded => "INFO CONVERSATION_ENDED".into(),
            Self::LeftConversation => "INFO LEFT_CONVERSATION".into(),
            Self::NotInConversation => "INFO NOT_IN_CONVERSATION".into(),
            Self::NoActiveConversations => "INFO NO_ACTIVE_CONVERSATIONS".into(),
            Self::MissedRequestFrom(user) => format!("MISSED_REQUEST_FROM {user}"),
            Self::Conversation { id, participants } => {
                format!("CONV {id} {}", participants.join(","))
            }
            Self::Bye => "BYE".into(),
            Self::Error(token) => format!("ERR {token}"),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ── Handshake ────────────────────────────────────────────────

    #[test]
    fn parse_hello() {
        let hello = Hello::parse("HELLO dana SALESPERSON TEL_AVIV").unwrap();
        assert_eq!(
            hello,
            Hello {
                username: "dana".into(),
                role: Role::Salesperson,
                branch: Branch::TelAviv,
            }
        );
    }

    #[test]
    fn parse_hello_is_case_insensitive_for_role_and_branch() {
        let hello = Hello::parse("hello Avi shift_manager holon").unwrap();
        assert_eq!(hello.username, "Avi");
        assert_eq!(hello.role, Role::ShiftManager);
        assert_eq!(hello.branch, Branch::Holon);
    }

    #[test]
    fn hello_rejections_are_distinct() {
        assert_eq!(Hello::parse("REQUEST_USER x"), Err(ParseError::HelloRequired));
        assert_eq!(Hello::parse(""), Err(ParseError::HelloRequired));
        assert_eq!(Hello::parse("HELLO dana CASHIER"), Err(ParseError::BadHello));
        assert_eq!(
            Hello::parse("HELLO dana JANITOR HOLON"),
            Err(ParseError::BadHello)
        );
        assert_eq!(
            Hello::parse("HELLO dana CASHIER EILAT"),
            Err(ParseError::BadBranch("EILAT".into()))
        );
    }

    // ── Commands ─────────────────────────────────────────────────

    #[test]
    fn parse_bare_commands() {
        assert_eq!(
            Command::parse("REQUEST_ANY_OTHER_BRANCH").unwrap(),
            Command::RequestAnyOtherBranch
        );
        assert_eq!(Command::parse("list_convs").unwrap(), Command::ListConversations);
        assert_eq!(Command::parse("End").unwrap(), Command::End);
        assert_eq!(Command::parse("  QUIT  ").unwrap(), Command::Quit);
    }

    #[test]
    fn parse_commands_with_arguments() {
        assert_eq!(
            Command::parse("REQUEST_BRANCH rishon").unwrap(),
            Command::RequestBranch(Branch::Rishon)
        );
        assert_eq!(
            Command::parse("ACCEPT  1a2b3c4d ").unwrap(),
            Command::Accept(RequestId::from("1a2b3c4d"))
        );
        assert_eq!(
            Command::parse("join ff00ff00").unwrap(),
            Command::Join(ConversationId::from("ff00ff00"))
        );
        assert_eq!(
            Command::parse("CALLBACK dana").unwrap(),
            Command::Callback("dana".into())
        );
    }

    #[test]
    fn msg_keeps_text_verbatim() {
        assert_eq!(
            Command::parse("MSG hello,  is anyone there? ").unwrap(),
            Command::Msg("hello,  is anyone there?".into())
        );
        assert_eq!(Command::parse("MSG").unwrap(), Command::Msg(String::new()));
    }

    #[test]
    fn parse_errors() {
        assert_eq!(Command::parse("   "), Err(ParseError::Empty));
        assert_eq!(
            Command::parse("DANCE now"),
            Err(ParseError::UnknownCommand("DANCE".into()))
        );
        assert_eq!(
            Command::parse("ACCEPT"),
            Err(ParseError::MissingArgument("ACCEPT"))
        );
        assert_eq!(
            Command::parse("REQUEST_BRANCH EILAT"),
            Err(ParseError::BadBranch("EILAT".into()))
        );
    }

    // ── Serialization ────────────────────────────────────────────

    #[test]
    fn wire_format_of_notifications() {
        let incoming = Reply::IncomingRequest {
            id: RequestId::from("abcd1234"),
            from: "dana".into(),
            branch: Branch::Holon,
        };
        assert_eq!(incoming.to_wire(), "INCOMING_REQUEST abcd1234 dana HOLON");

        let paired = Reply::Paired {
            conversation: ConversationId::from("c0ffee00"),
            participants: vec!["dana".into(), "avi".into()],
        };
        assert_eq!(paired.to_wire(), "PAIRED c0ffee00 dana,avi");

        let chat = Reply::Chat {
            from: "avi".into(),
            text: "on my way".into(),
        };
        assert_eq!(chat.to_string(), "MSG from avi : on my way");
        assert_eq!(Reply::UserLeft("avi".into()).to_wire(), "INFO avi_LEFT");
        assert_eq!(Reply::Error("BAD_ARGS".into()).to_wire(), "ERR BAD_ARGS");
    }
}
