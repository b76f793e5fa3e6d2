//! Topology errors
//!
//! These are apparatus-configuration bugs raised at the authoring call site.
//! Runtime stepping never produces an error.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TopologyError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("apparatus cannot be attached to anything")]
    NotAttachable,
    #[error("topology cannot change while the experiment is running")]
    ExperimentRunning,
    #[error("output `{0}` is not declared on the parent apparatus")]
    UndeclaredOutput(String),
    #[error("output `{0}` is already occupied")]
    OutputOccupied(String),
    #[error("multi-input apparatus needs a parent with several outputs")]
    MultiInputOnSingleOutput,
    #[error("apparatus is already attached; detach it first")]
    AlreadyAttached,
    #[error("attachment would create a cycle")]
    WouldCycle,
    #[error("unknown apparatus handle")]
    UnknownNode,
}
