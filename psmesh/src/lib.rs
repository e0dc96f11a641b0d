//! # psmesh
//!
//! Messaging and cluster coordination for parameter-server jobs.
//!
//! A job is made of one scheduler, some workers and some servers. Each
//! process builds a [`Postoffice`] from its [`PostofficeConfig`] and starts
//! it; the scheduler assigns node ids, and from then on nodes exchange
//! [`Message`]s routed to application [`Customer`]s.
//!
//! ```text
//!  application ── Customer ◄── Postoffice ──► Van ──► peers
//!                    ▲             │           │
//!                    └─ dispatch ──┴─ receive ─┘
//! ```
//!
//! - **Van**: connections, handshake, receive loop, barriers, heartbeats
//! - **Resender**: optional retransmission and duplicate suppression
//! - **Postoffice**: membership, customer registry, liveness, key ranges
//! - **Customer**: request accounting and ordered delivery to one application
//!
//! The network is pluggable through [`NetworkProvider`]: real TCP with
//! [`TokioNetworkProvider`], or in-process pipes with
//! [`MemoryNetworkProvider`] for running a whole job inside one test.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Node configuration and environment loading.
pub mod config;

/// Per-application request tracker.
pub mod customer;

/// Error types.
pub mod error;

/// Node and message model.
pub mod message;

/// Pluggable byte-stream networking.
pub mod network;

/// Cluster registry.
pub mod postoffice;

/// Retransmission and duplicate suppression.
pub mod resender;

/// Per-node transport and protocol engine.
pub mod van;

/// Frame format.
pub mod wire;

// =============================================================================
// Node groups and ids
// =============================================================================

/// Group flag of the scheduler.
pub const SCHEDULER_GROUP: i32 = 1;

/// Group flag of the servers.
pub const SERVER_GROUP: i32 = 4;

/// Group flag of the workers.
pub const WORKER_GROUP: i32 = 2;

/// Every node of the job.
pub const ALL_GROUPS: i32 = SCHEDULER_GROUP | WORKER_GROUP | SERVER_GROUP;

/// Id of the scheduler.
pub const SCHEDULER_ID: i32 = 1;

/// Upper bound of the key space partitioned across servers.
pub const MAX_KEY: u64 = u64::MAX;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{PostofficeConfig, ResendConfig, VanConfig};
pub use customer::{Customer, RecvHandle};
pub use error::{ConfigError, CustomerError, PostofficeError, VanError};
pub use message::{Command, Control, DataType, Message, Meta, Node, Role, EMPTY};
pub use network::{MemoryNetworkProvider, NetworkProvider, TcpListenerTrait, TokioNetworkProvider};
pub use postoffice::{
    id_to_rank, server_rank_to_id, worker_rank_to_id, KeyRange, Membership, Postoffice,
};
pub use resender::Resender;
pub use van::{MetricsSnapshot, Van};
pub use wire::WireError;
