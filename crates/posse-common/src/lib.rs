//! Posse common types, IDs, and errors.
//!
//! This crate provides the foundational types shared between the deputy
//! agent and anything that speaks its message-bus protocol:
//! - Deputy and command identity newtypes
//! - Bus channel names and message payload types
//! - The common error taxonomy

pub mod error;
pub mod id;
pub mod messages;

pub use error::{Error, ErrorCategory, Result};
pub use id::{CommandId, DeputyId};
pub use messages::{
    CommandConfig, CommandOutput, CommandStatus, DesiredCommand, DeputyInfoMsg, DiscoverMsg,
    OrdersMsg, OutputMsg, DISCOVER_CHANNEL, INFO_CHANNEL, ORDERS_CHANNEL, OUTPUT_CHANNEL,
};
