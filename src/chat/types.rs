/// Identity vocabulary shared across the broker: branches, roles, and the
/// short opaque ids handed out for requests and conversations.
use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Store location an employee belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Branch {
    Holon,
    TelAviv,
    Rishon,
}

impl Branch {
    pub const ALL: [Branch; 3] = [Branch::Holon, Branch::TelAviv, Branch::Rishon];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Holon => "HOLON",
            Self::TelAviv => "TEL_AVIV",
            Self::Rishon => "RISHON",
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown branch: {0}")]
pub struct UnknownBranch(pub String);

impl FromStr for Branch {
    type Err = UnknownBranch;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Branch::ALL
            .into_iter()
            .find(|b| b.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownBranch(s.to_owned()))
    }
}

/// Employee role declared at handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Salesperson,
    Cashier,
    ShiftManager,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Salesperson => "SALESPERSON",
            Self::Cashier => "CASHIER",
            Self::ShiftManager => "SHIFT_MANAGER",
        }
    }

    /// Shift managers may list and join live conversations.
    pub fn is_manager(self) -> bool {
        matches!(self, Self::ShiftManager)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Role::Salesperson, Role::Cashier, Role::ShiftManager]
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownRole(s.to_owned()))
    }
}

/// First eight hex digits of a random UUID.
fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Id of an open broadcast request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(short_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Id of a live conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn generate() -> Self {
        Self(short_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
