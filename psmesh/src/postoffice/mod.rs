//! Cluster registry.
//!
//! A [`Postoffice`] is the per-process context every other part hangs off:
//! it owns the van, the membership table, the customer registry, the
//! heartbeat table and the local side of barriers. It is an ordinary value
//! behind an `Arc`, so a test can run a whole job of postoffices in one
//! process.
//!
//! ```text
//! let po = Postoffice::new(config, network)?;
//! po.start(true).await?;          // join, then barrier on every node
//! let app = po.new_customer(0, handle)?;
//! ...
//! po.finalize(true).await?;       // barrier, then leave
//! ```

mod barrier;
mod customers;
mod heartbeat;
mod membership;
mod ranges;

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::PostofficeConfig;
use crate::customer::Customer;
use crate::error::{ConfigError, PostofficeError, PostofficeResult};
use crate::message::{Command, Message, Role};
use crate::network::NetworkProvider;
use crate::van::Van;
use crate::{ALL_GROUPS, SCHEDULER_GROUP, SCHEDULER_ID, SERVER_GROUP, WORKER_GROUP};

pub(crate) use barrier::BarrierCounter;
use barrier::BarrierLatch;
use customers::CustomerRegistry;
use heartbeat::HeartbeatTable;
pub use membership::{id_to_rank, server_rank_to_id, worker_rank_to_id, Membership};
pub use ranges::KeyRange;

type ExitCallback = Box<dyn FnOnce() + Send>;

/// Cluster registry of one node.
pub struct Postoffice<N: NetworkProvider> {
    config: PostofficeConfig,
    membership: Arc<Membership>,
    van: Arc<Van<N>>,
    customers: CustomerRegistry,
    heartbeats: HeartbeatTable,
    barrier: BarrierLatch,
    key_ranges: OnceLock<Vec<KeyRange>>,
    exit_callback: Mutex<Option<ExitCallback>>,
}

impl<N: NetworkProvider> Postoffice<N> {
    /// Build the registry for the node described by `config`.
    pub fn new(config: PostofficeConfig, network: N) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let membership = Arc::new(Membership::new(config.num_workers, config.num_servers));
        let van = Arc::new(Van::new(network, &config));
        Ok(Arc::new(Self {
            config,
            membership,
            van,
            customers: CustomerRegistry::default(),
            heartbeats: HeartbeatTable::new(Instant::now()),
            barrier: BarrierLatch::default(),
            key_ranges: OnceLock::new(),
            exit_callback: Mutex::new(None),
        }))
    }

    /// Join the job.
    ///
    /// With `do_barrier`, also waits until every node of the job has
    /// started. Recovery nodes skip that barrier: the rest of the job passed
    /// it long ago.
    pub async fn start(self: &Arc<Self>, do_barrier: bool) -> PostofficeResult<()> {
        self.van.start(self).await?;
        self.heartbeats.mark_started(Instant::now());
        info!(node = %self.van.my_node(), rank = self.my_rank(), "postoffice started");
        if do_barrier {
            if self.is_recovery() {
                info!("recovery node, skipping start barrier");
            } else {
                self.barrier(ALL_GROUPS).await?;
            }
        }
        Ok(())
    }

    /// Leave the job.
    ///
    /// With `do_barrier`, first waits until every node is finalizing. Runs
    /// the exit callback after the van stopped.
    pub async fn finalize(&self, do_barrier: bool) -> PostofficeResult<()> {
        if do_barrier {
            self.barrier(ALL_GROUPS).await?;
        }
        let stopped = self.van.stop().await;
        let callback = self
            .exit_callback
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(callback) = callback {
            callback();
        }
        info!(node = %self.van.my_node(), "postoffice finalized");
        stopped.map_err(PostofficeError::from)
    }

    /// Run `callback` at the end of [`Postoffice::finalize`].
    pub fn set_exit_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.exit_callback.lock().unwrap_or_else(|p| p.into_inner()) = Some(Box::new(callback));
    }

    /// Block until every node of `group` called `barrier` for it.
    ///
    /// Returns at once for groups of one node or fewer. Only one barrier per
    /// group may be outstanding at a time.
    pub async fn barrier(&self, group: i32) -> PostofficeResult<()> {
        if self.membership.node_ids(group).len() <= 1 {
            return Ok(());
        }
        let role = self.config.role;
        if !Membership::role_in_group(role, group) {
            return Err(PostofficeError::NotInGroup { group, role });
        }

        self.barrier.arm();
        let mut req = Message::control(SCHEDULER_ID, Command::Barrier);
        req.meta.request = true;
        req.meta.control.barrier_group = group;
        req.meta.timestamp = self.van.next_timestamp();
        self.van.send(req)?;
        self.barrier.wait().await;
        Ok(())
    }

    /// [`Postoffice::barrier`] bounded by `timeout`.
    pub async fn barrier_timeout(&self, group: i32, timeout: Duration) -> PostofficeResult<()> {
        tokio::time::timeout(timeout, self.barrier(group))
            .await
            .map_err(|_| PostofficeError::BarrierTimeout { group })?
    }

    /// Handle a control message addressed to the registry.
    ///
    /// A barrier release wakes the local barrier caller.
    pub fn manage(&self, msg: &Message) {
        let ctrl = &msg.meta.control;
        if ctrl.cmd == Command::Barrier && !msg.meta.request {
            self.barrier.release();
        }
    }

    /// Ids of the nodes in `group`, a role mask or a node id.
    pub fn get_node_ids(&self, group: i32) -> &[i32] {
        self.membership.node_ids(group)
    }

    /// Register a customer.
    pub fn add_customer(&self, customer: Arc<Customer>) -> PostofficeResult<()> {
        self.customers.add(customer)
    }

    /// Unregister a customer.
    pub fn remove_customer(&self, id: i32) -> Option<Arc<Customer>> {
        self.customers.remove(id)
    }

    /// Wait up to `timeout` for customer `id` to be registered.
    pub async fn get_customer(&self, id: i32, timeout: Duration) -> PostofficeResult<Arc<Customer>> {
        self.customers
            .get(id, timeout)
            .await
            .ok_or(PostofficeError::CustomerNotFound(id))
    }

    /// Create and register a customer sharing this node's timestamps.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new_customer<F>(&self, id: i32, handle: F) -> PostofficeResult<Arc<Customer>>
    where
        F: Fn(&Customer, Message) + Send + Sync + 'static,
    {
        let customer = Customer::with_timestamps(
            id,
            Arc::clone(&self.membership),
            self.van.timestamps(),
            Box::new(handle),
        );
        self.add_customer(Arc::clone(&customer))?;
        Ok(customer)
    }

    /// Record that node `id` was alive at `at`.
    pub fn update_heartbeat(&self, id: i32, at: Instant) {
        self.heartbeats.update(id, at);
    }

    /// Last heartbeat recorded for node `id`.
    pub fn last_heartbeat(&self, id: i32) -> Option<Instant> {
        self.heartbeats.last_seen(id)
    }

    /// Nodes silent for longer than `threshold`.
    ///
    /// The scheduler watches workers and servers; every other node watches
    /// the scheduler. Nothing is dead before the van is ready or when the
    /// threshold is zero.
    pub fn get_dead_nodes(&self, threshold: Duration) -> Vec<i32> {
        if !self.van.is_ready() || threshold.is_zero() {
            return Vec::new();
        }
        let watched = if self.is_scheduler() {
            self.membership.node_ids(WORKER_GROUP | SERVER_GROUP)
        } else {
            self.membership.node_ids(SCHEDULER_GROUP)
        };
        self.heartbeats.dead_nodes(watched, threshold, Instant::now())
    }

    /// Key range owned by each server, in server rank order.
    pub fn get_server_key_ranges(&self) -> &[KeyRange] {
        self.key_ranges
            .get_or_init(|| ranges::server_key_ranges(self.config.num_servers))
    }

    /// The van.
    pub fn van(&self) -> &Arc<Van<N>> {
        &self.van
    }

    /// The membership table.
    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    /// The configuration.
    pub fn config(&self) -> &PostofficeConfig {
        &self.config
    }

    /// Own role.
    pub fn role(&self) -> Role {
        self.config.role
    }

    /// Whether this node is a worker.
    pub fn is_worker(&self) -> bool {
        self.config.role == Role::Worker
    }

    /// Whether this node is a server.
    pub fn is_server(&self) -> bool {
        self.config.role == Role::Server
    }

    /// Whether this node is the scheduler.
    pub fn is_scheduler(&self) -> bool {
        self.config.role == Role::Scheduler
    }

    /// Configured number of workers.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Configured number of servers.
    pub fn num_servers(&self) -> usize {
        self.config.num_servers
    }

    /// Rank of this node within its role. Valid once started.
    pub fn my_rank(&self) -> usize {
        id_to_rank(self.van.my_node().id)
    }

    /// Whether this node replaced a dead node.
    pub fn is_recovery(&self) -> bool {
        self.van.my_node().is_recovery
    }
}

impl<N: NetworkProvider> fmt::Debug for Postoffice<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Postoffice")
            .field("role", &self.config.role)
            .field("node", &self.van.my_node())
            .field("num_workers", &self.config.num_workers)
            .field("num_servers", &self.config.num_servers)
            .finish_non_exhaustive()
    }
}
