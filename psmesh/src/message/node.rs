//! Cluster participants and their roles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Sentinel for node ids, timestamps and customer ids that are not assigned.
pub const EMPTY: i32 = -1;

/// The part a process plays in the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Holds a slice of the model and answers requests.
    Server,
    /// Computes updates and talks to servers.
    Worker,
    /// Coordinates membership, barriers and heartbeats.
    Scheduler,
}

impl Role {
    /// Group flag of this role, as used in node-group masks.
    pub fn group_flag(self) -> i32 {
        match self {
            Role::Scheduler => crate::SCHEDULER_GROUP,
            Role::Worker => crate::WORKER_GROUP,
            Role::Server => crate::SERVER_GROUP,
        }
    }

    /// Numeric form used on the wire.
    pub fn as_i32(self) -> i32 {
        match self {
            Role::Server => 0,
            Role::Worker => 1,
            Role::Scheduler => 2,
        }
    }

    /// Inverse of [`Role::as_i32`].
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Role::Server),
            1 => Some(Role::Worker),
            2 => Some(Role::Scheduler),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Server => "server",
            Role::Worker => "worker",
            Role::Scheduler => "scheduler",
        };
        f.write_str(name)
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Role::Server),
            "worker" => Ok(Role::Worker),
            "scheduler" => Ok(Role::Scheduler),
            other => Err(ConfigError::InvalidRole(other.to_string())),
        }
    }
}

/// Identity of a cluster participant.
///
/// The scheduler assigns `id`; until then it is [`EMPTY`]. Two nodes refer to
/// the same process when their `(hostname, port)` match, see
/// [`Node::same_address`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Assigned node id, or [`EMPTY`].
    pub id: i32,
    /// Role of the node.
    pub role: Role,
    /// Host name or IP other nodes use to reach this node.
    pub hostname: String,
    /// Listening port.
    pub port: u16,
    /// Set when the node took over the id of a dead node.
    pub is_recovery: bool,
}

impl Node {
    /// A node with no id yet.
    pub fn new(role: Role, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            id: EMPTY,
            role,
            hostname: hostname.into(),
            port,
            is_recovery: false,
        }
    }

    /// Same node with `id` assigned.
    pub fn with_id(mut self, id: i32) -> Self {
        self.id = id;
        self
    }

    /// `host:port` string handed to the network provider.
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Whether both nodes listen on the same endpoint.
    pub fn same_address(&self, other: &Node) -> bool {
        self.hostname == other.hostname && self.port == other.port
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id == EMPTY {
            write!(f, "{}[-]@{}", self.role, self.address())?;
        } else {
            write!(f, "{}[{}]@{}", self.role, self.id, self.address())?;
        }
        if self.is_recovery {
            f.write_str(" (recovery)")?;
        }
        Ok(())
    }
}
