use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Driver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Driver => "driver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "driver" => Ok(Self::Driver),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// The verified caller of a dispatch operation.
///
/// Identity and role arrive pre-authenticated from the gateway; guards in
/// the state machine match on the variant instead of comparing role strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Client(UserId),
    Driver(UserId),
}

impl Actor {
    pub fn new(id: UserId, role: Role) -> Self {
        match role {
            Role::Client => Self::Client(id),
            Role::Driver => Self::Driver(id),
        }
    }

    pub fn id(&self) -> UserId {
        match self {
            Self::Client(id) | Self::Driver(id) => *id,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::Client(_) => Role::Client,
            Self::Driver(_) => Role::Driver,
        }
    }
}
