//! Error types for each layer of the stack.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::message::Role;
use crate::wire::WireError;

/// Errors raised while building or validating configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("missing required setting {0}")]
    Missing(&'static str),

    /// A setting could not be parsed.
    #[error("invalid value {value:?} for {name}")]
    Invalid {
        /// Setting name.
        name: &'static str,
        /// Raw value.
        value: String,
    },

    /// The role name is not one of scheduler, worker or server.
    #[error("invalid role {0:?}")]
    InvalidRole(String),

    /// Neither workers nor servers were configured.
    #[error("job has no workers and no servers")]
    NoNodes,

    /// The scheduler must listen on a fixed, known port.
    #[error("scheduler port must be non-zero")]
    InvalidSchedulerPort,
}

/// Errors raised by the van.
#[derive(Error, Debug)]
pub enum VanError {
    /// Binding the listener failed on every attempt.
    #[error("failed to bind {addr} after {attempts} attempts: {source}")]
    Bind {
        /// Last address tried.
        addr: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last error.
        #[source]
        source: io::Error,
    },

    /// Connecting to a peer failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Peer address.
        addr: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// There is no open connection to the receiving node.
    #[error("no connection to node {id}")]
    NoConnection {
        /// Receiver id.
        id: i32,
    },

    /// The connection to the receiving node has gone away.
    #[error("connection to node {id} closed")]
    ConnectionClosed {
        /// Receiver id.
        id: i32,
    },

    /// Framing or envelope encoding failed.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The node did not become ready in time.
    #[error("node not ready after {0:?}")]
    StartTimeout(Duration),

    /// The van is not running.
    #[error("van is not started")]
    NotStarted,

    /// A peer broke the cluster protocol; the receive loop stopped.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

/// Errors raised by the postoffice.
#[derive(Error, Debug)]
pub enum PostofficeError {
    /// Transport failure.
    #[error(transparent)]
    Van(#[from] VanError),

    /// A customer with this id is already registered.
    #[error("customer {0} is already registered")]
    DuplicateCustomer(i32),

    /// No customer with this id registered in time.
    #[error("customer {0} not found")]
    CustomerNotFound(i32),

    /// This node is not a member of the barrier group.
    #[error("{role} is not a member of group {group}")]
    NotInGroup {
        /// Group mask.
        group: i32,
        /// Own role.
        role: Role,
    },

    /// The barrier was not released in time.
    #[error("barrier on group {group} timed out")]
    BarrierTimeout {
        /// Group mask.
        group: i32,
    },
}

/// Errors raised by a customer's request tracker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CustomerError {
    /// The timestamp was never returned by `new_request`.
    #[error("unknown request {0}")]
    UnknownRequest(i32),

    /// Responses did not arrive in time.
    #[error("request {timestamp} timed out")]
    Timeout {
        /// Request timestamp.
        timestamp: i32,
    },
}

/// Result type for van operations.
pub type VanResult<T> = Result<T, VanError>;

/// Result type for postoffice operations.
pub type PostofficeResult<T> = Result<T, PostofficeError>;
