//! Deputy and command identity types.
//!
//! A deputy is addressed by a fleet-unique string id (hostname by
//! default). A command is addressed by a string id unique within one
//! deputy; the pair (deputy id, command id) is fleet-unique.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fleet-unique deputy identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeputyId(pub String);

impl fmt::Display for DeputyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeputyId {
    fn from(s: &str) -> Self {
        DeputyId(s.to_string())
    }
}

impl From<String> for DeputyId {
    fn from(s: String) -> Self {
        DeputyId(s)
    }
}

/// Command identifier, unique within one deputy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub String);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CommandId {
    fn from(s: &str) -> Self {
        CommandId(s.to_string())
    }
}

impl From<String> for CommandId {
    fn from(s: String) -> Self {
        CommandId(s)
    }
}
