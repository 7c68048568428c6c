/// Broker errors and their wire tokens.
use std::borrow::Cow;

use super::message::{ParseError, Reply};

/// Every failure a client can be told about.
///
/// State errors are returned before any shared state is touched, so a
/// failed operation never leaves a half-created request or conversation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("first line must be HELLO")]
    HelloRequired,
    #[error("malformed HELLO")]
    BadHello,
    #[error("unknown branch")]
    BadBranch,
    #[error("username already connected")]
    DuplicateLogin,
    #[error("unknown command")]
    UnknownCommand,
    #[error("missing or malformed arguments")]
    BadArgs,
    #[error("no such request")]
    NoSuchRequest,
    #[error("request already taken")]
    RequestAlreadyTaken,
    #[error("not eligible for this request")]
    NotEligible,
    #[error("requester not available")]
    RequesterNotAvailable,
    #[error("not allowed")]
    NotAllowed,
    #[error("no such conversation")]
    NoSuchConversation,
    #[error("already in another conversation")]
    AlreadyInAnotherConversation,
    #[error("not in conversation")]
    NotInConversation,
    #[error("conversation ended")]
    ConversationEnded,
    #[error("already in conversation")]
    AlreadyInConversation,
    #[error("{0}")]
    Internal(String),
}

impl BrokerError {
    /// The token sent after `ERR `.
    pub fn token(&self) -> Cow<'static, str> {
        let token = match self {
            Self::HelloRequired => "HELLO_REQUIRED",
            Self::BadHello => "BAD_HELLO",
            Self::BadBranch => "BAD_BRANCH",
            Self::DuplicateLogin => "DUPLICATE_LOGIN",
            Self::UnknownCommand => "UNKNOWN_CMD",
            Self::BadArgs => "BAD_ARGS",
            Self::NoSuchRequest => "NO_SUCH_REQUEST",
            Self::RequestAlreadyTaken => "REQUEST_ALREADY_TAKEN",
            Self::NotEligible => "NOT_ELIGIBLE_FOR_THIS_REQUEST",
            Self::RequesterNotAvailable => "REQUESTER_NOT_AVAILABLE",
            Self::NotAllowed => "NOT_ALLOWED",
            Self::NoSuchConversation => "NO_SUCH_CONVERSATION",
            Self::AlreadyInAnotherConversation => "ALREADY_IN_ANOTHER_CONVERSATION",
            Self::NotInConversation => "NOT_IN_CONVERSATION",
            Self::ConversationEnded => "CONVERSATION_ENDED",
            Self::AlreadyInConversation => "ALREADY_IN_CONVERSATION",
            Self::Internal(message) => {
                return Cow::Owned(
                    message
                        .split_whitespace()
                        .collect::<Vec<_>>()
                        .join("_")
                        .to_ascii_uppercase(),
                );
            }
        };
        Cow::Borrowed(token)
    }
}

impl From<ParseError> for BrokerError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::HelloRequired => Self::HelloRequired,
            ParseError::BadHello => Self::BadHello,
            ParseError::BadBranch(_) => Self::BadBranch,
            ParseError::UnknownCommand(_) => Self::UnknownCommand,
            ParseError::Empty | ParseError::MissingArgument(_) => Self::BadArgs,
        }
    }
}

impl From<BrokerError> for Reply {
    fn from(e: BrokerError) -> Self {
        Reply::Error(e.token().into_owned())
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
