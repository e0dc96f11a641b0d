//! Per-node transport and protocol engine.
//!
//! The van owns the node's network identity. It binds a listener, connects
//! to the scheduler, announces itself and waits until the scheduler's roster
//! broadcast makes it ready. From then on a single receive loop consumes
//! every inbound message: control messages are handled in place (see
//! [`control`]) and data messages are routed to customers.
//!
//! ## Tasks
//!
//! ```text
//! accept ──► reader (one per inbound stream) ──┐
//!                                              ├──► receive loop ──► customers
//! send() ── loopback (recver == self) ─────────┘         │
//!   │                                                    └── control handling
//!   └──► writer (one per outbound stream)
//! heartbeat timer (non-scheduler), resend timer (when enabled)
//! ```
//!
//! Retransmission covers the join as well: the scheduler's roster and the
//! first barrier requests are acknowledged like any other message.

mod connection;
mod control;
mod metrics;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{PostofficeConfig, VanConfig};
use crate::error::{VanError, VanResult};
use crate::message::{Command, Message, Node, Role, EMPTY};
use crate::network::{port_of, NetworkProvider, TcpListenerTrait};
use crate::postoffice::Postoffice;
use crate::resender::{Incoming, Resender};
use crate::{wire, SCHEDULER_ID};

use connection::{accept_loop, Connection};
use control::ControlState;
pub use metrics::{MetricsSnapshot, VanMetrics};

/// Time a closing connection gets to flush its queue.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Range of ports tried after a failed bind.
const RANDOM_PORTS: std::ops::Range<u16> = 10000..50000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Default)]
struct Tasks {
    receive: Option<JoinHandle<VanResult<()>>>,
    background: Vec<JoinHandle<()>>,
}

/// Transport of one node.
#[derive(Debug)]
pub struct Van<N: NetworkProvider> {
    network: N,
    config: VanConfig,
    role: Role,
    scheduler: Node,
    my_node: RwLock<Node>,
    ready: watch::Sender<bool>,
    timestamps: Arc<AtomicI32>,
    connections: Mutex<HashMap<i32, Connection>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    resender: Mutex<Option<Resender>>,
    tasks: Mutex<Tasks>,
    metrics: Arc<VanMetrics>,
}

impl<N: NetworkProvider> Van<N> {
    /// Create a stopped van for the node described by `config`.
    pub fn new(network: N, config: &PostofficeConfig) -> Self {
        let scheduler = config.scheduler_node();
        let my_node = match config.role {
            Role::Scheduler => scheduler.clone(),
            role => Node::new(role, config.van.hostname.clone(), config.van.port),
        };
        let (ready, _) = watch::channel(false);
        Self {
            network,
            config: config.van.clone(),
            role: config.role,
            scheduler,
            my_node: RwLock::new(my_node),
            ready,
            timestamps: Arc::new(AtomicI32::new(0)),
            connections: Mutex::new(HashMap::new()),
            inbound: Mutex::new(None),
            resender: Mutex::new(None),
            tasks: Mutex::new(Tasks::default()),
            metrics: Arc::new(VanMetrics::default()),
        }
    }

    /// Own node entry. The id is [`EMPTY`] until the scheduler assigns one.
    pub fn my_node(&self) -> Node {
        self.my_node.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn my_id(&self) -> i32 {
        self.my_node.read().unwrap_or_else(|p| p.into_inner()).id
    }

    fn set_my_node(&self, node: Node) {
        *self.my_node.write().unwrap_or_else(|p| p.into_inner()) = node;
    }

    fn is_scheduler(&self) -> bool {
        self.role == Role::Scheduler
    }

    /// Role of this node.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the node received its roster and may talk to peers.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Next value of this node's timestamp sequence.
    pub fn next_timestamp(&self) -> i32 {
        self.timestamps.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn timestamps(&self) -> Arc<AtomicI32> {
        Arc::clone(&self.timestamps)
    }

    /// Transport settings in use.
    pub fn config(&self) -> &VanConfig {
        &self.config
    }

    /// Traffic counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Messages still waiting for an acknowledgement. Always zero without
    /// retransmission.
    pub fn unacked(&self) -> usize {
        lock(&self.resender).as_ref().map_or(0, Resender::pending)
    }

    /// Ids of the peers this node holds an outbound connection to.
    pub fn connected_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = lock(&self.connections).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Join the job.
    ///
    /// Binds, connects to the scheduler, announces this node and waits for
    /// the roster broadcast. Retransmission is on before the receive loop
    /// starts; heartbeats begin once ready.
    pub async fn start(self: &Arc<Self>, office: &Arc<Postoffice<N>>) -> VanResult<()> {
        let is_scheduler = self.is_scheduler();
        let retries = if is_scheduler {
            0
        } else {
            self.config.max_bind_retries
        };
        let listener = self.bind(retries).await?;

        let (inbound, queue) = mpsc::unbounded_channel();
        *lock(&self.inbound) = Some(inbound.clone());

        {
            let mut tasks = lock(&self.tasks);
            if let Some(resend) = self.config.resend.clone() {
                let period = resend.timeout;
                *lock(&self.resender) = Some(Resender::new(resend));
                tasks
                    .background
                    .push(tokio::spawn(Arc::clone(self).resend_loop(period)));
            }
            tasks.background.push(tokio::spawn(accept_loop(
                listener,
                inbound,
                Arc::clone(&self.metrics),
            )));
            tasks.receive = Some(tokio::spawn(
                Arc::clone(self).receive_loop(Arc::downgrade(office), queue),
            ));
        }

        if let Err(e) = self.join().await {
            self.stop_tasks().await;
            return Err(e);
        }

        if !is_scheduler && !self.config.heartbeat_interval.is_zero() {
            let interval = self.config.heartbeat_interval;
            let task = tokio::spawn(Arc::clone(self).heartbeat_loop(interval));
            lock(&self.tasks).background.push(task);
        }

        info!(node = %self.my_node(), "van ready");
        Ok(())
    }

    async fn join(&self) -> VanResult<()> {
        if !self.is_scheduler() {
            self.connect(self.scheduler.clone()).await?;
            let mut msg = Message::control(SCHEDULER_ID, Command::AddNode);
            msg.meta.control.node.push(self.my_node());
            msg.meta.timestamp = self.next_timestamp();
            self.send(msg)?;
        }

        let mut ready = self.ready.subscribe();
        let timeout = self.config.ready_timeout;
        let became_ready = async { ready.wait_for(|r| *r).await.map(|_| ()) };
        match tokio::time::timeout(timeout, became_ready).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(VanError::NotStarted),
            Err(_) => {
                error!(node = %self.my_node(), ?timeout, "no roster from the scheduler");
                Err(VanError::StartTimeout(timeout))
            }
        }
    }

    async fn bind(&self, retries: u32) -> VanResult<N::TcpListener> {
        let my = self.my_node();
        let mut port = my.port;
        let mut attempt = 0;
        loop {
            let addr = format!("{}:{}", my.hostname, port);
            match self.network.bind(&addr).await {
                Ok(listener) => {
                    let bound = listener
                        .local_addr()
                        .ok()
                        .and_then(|a| port_of(&a))
                        .unwrap_or(port);
                    let mut node = self.my_node();
                    node.port = bound;
                    info!(node = %node, "bound listener");
                    self.set_my_node(node);
                    return Ok(listener);
                }
                Err(source) if attempt >= retries => {
                    return Err(VanError::Bind {
                        addr,
                        attempts: attempt + 1,
                        source,
                    });
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "bind failed, trying another port");
                    attempt += 1;
                    port = rand::thread_rng().gen_range(RANDOM_PORTS);
                }
            }
        }
    }

    /// Open a connection to `node`.
    ///
    /// Nothing happens for this node itself or for other nodes of its role.
    /// A live connection to the same id and address is kept; anything else
    /// registered under the id is replaced.
    async fn connect(&self, node: Node) -> VanResult<()> {
        let my = self.my_node();
        if node.same_address(&my) || node.role == my.role {
            return Ok(());
        }
        let live = lock(&self.connections)
            .get(&node.id)
            .is_some_and(|c| c.node().same_address(&node) && !c.is_closed());
        if live {
            return Ok(());
        }

        let id = node.id;
        let conn = Connection::open(&self.network, node, Arc::clone(&self.metrics)).await?;
        debug!(node = %conn.node(), "connected");
        if let Some(old) = lock(&self.connections).insert(id, conn) {
            info!(id, old = %old.node(), "replaced connection");
            old.abort();
        }
        Ok(())
    }

    /// Send a message, returning the frame size.
    ///
    /// The sender field is overwritten with this node's id. Returns once the
    /// frame is queued; with retransmission enabled the message is retried
    /// until acknowledged.
    pub fn send(&self, mut msg: Message) -> VanResult<usize> {
        msg.meta.sender = self.my_id();
        // Tracked before queuing so an early ACK finds its entry.
        let tracked = lock(&self.resender)
            .as_mut()
            .is_some_and(|r| r.add_outgoing(&msg, Instant::now()));
        let bytes = match self.send_raw(&msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                if tracked {
                    if let Some(resender) = lock(&self.resender).as_mut() {
                        resender.cancel_outgoing(&msg);
                    }
                }
                return Err(e);
            }
        };
        if self.config.verbose >= 2 {
            trace!(msg = %msg, "sent");
        }
        Ok(bytes)
    }

    fn send_raw(&self, msg: &Message) -> VanResult<usize> {
        let frame = wire::serialize_frame(msg)?;
        let bytes = frame.len();
        let recver = msg.meta.recver;
        if recver != EMPTY && recver == self.my_id() {
            let inbound = lock(&self.inbound);
            let tx = inbound.as_ref().ok_or(VanError::NotStarted)?;
            tx.send(msg.clone()).map_err(|_| VanError::NotStarted)?;
        } else {
            let connections = lock(&self.connections);
            let conn = connections
                .get(&recver)
                .ok_or(VanError::NoConnection { id: recver })?;
            conn.send(frame)?;
        }
        self.metrics.record_send(bytes);
        Ok(bytes)
    }

    /// Leave the job.
    ///
    /// Stops the receive loop, then every other task, and drops all
    /// connections. Returns the receive loop's outcome, which carries any
    /// protocol violation that stopped it early.
    pub async fn stop(&self) -> VanResult<()> {
        if let Some(inbound) = lock(&self.inbound).take() {
            let _ = inbound.send(Message::control(EMPTY, Command::Terminate));
        }
        let receive = lock(&self.tasks).receive.take();
        let result = match receive {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(VanError::TaskFailed(e.to_string())),
            },
            None => Err(VanError::NotStarted),
        };
        self.stop_tasks().await;
        info!(node = %self.my_node(), "van stopped");
        result
    }

    async fn stop_tasks(&self) {
        let (receive, background) = {
            let mut tasks = lock(&self.tasks);
            (tasks.receive.take(), std::mem::take(&mut tasks.background))
        };
        if let Some(handle) = receive {
            handle.abort();
            let _ = handle.await;
        }
        for handle in background {
            handle.abort();
            let _ = handle.await;
        }
        let connections: Vec<Connection> = lock(&self.connections)
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            conn.close(CLOSE_GRACE).await;
        }
        lock(&self.inbound).take();
        lock(&self.resender).take();
        self.ready.send_replace(false);
    }

    async fn receive_loop(
        self: Arc<Self>,
        postoffice: Weak<Postoffice<N>>,
        mut queue: mpsc::UnboundedReceiver<Message>,
    ) -> VanResult<()> {
        let mut state = ControlState::default();
        while let Some(msg) = queue.recv().await {
            if self.should_drop(&msg) {
                warn!(msg = %msg, "dropping message");
                self.metrics.record_drop();
                continue;
            }
            if self.config.verbose >= 2 {
                trace!(msg = %msg, "received");
            }
            if !self.filter_incoming(&msg) {
                continue;
            }
            if msg.meta.control.cmd == Command::Terminate {
                info!(node = %self.my_node(), "receive loop stopped");
                self.ready.send_replace(false);
                return Ok(());
            }
            let Some(office) = postoffice.upgrade() else {
                break;
            };

            let result = if msg.is_control() {
                self.process_control(&office, &mut state, msg).await
            } else {
                self.process_data(&office, msg).await
            };
            if let Err(e) = result {
                error!(node = %self.my_node(), error = %e, "receive loop failed");
                self.ready.send_replace(false);
                return Err(e);
            }
        }
        Ok(())
    }

    fn should_drop(&self, msg: &Message) -> bool {
        let rate = self.config.drop_rate;
        rate > 0
            && self.is_ready()
            && msg.meta.control.cmd != Command::Terminate
            && rand::thread_rng().gen_range(0..100u8) < rate
    }

    /// Acknowledge and de-duplicate. Returns false for messages to skip.
    fn filter_incoming(&self, msg: &Message) -> bool {
        let verdict = match lock(&self.resender).as_mut() {
            Some(resender) => resender.add_incoming(msg),
            None => return true,
        };
        match verdict {
            Incoming::Fresh { ack } => {
                if let Some(ack) = ack {
                    self.send_ack(ack);
                }
                true
            }
            Incoming::Duplicate { ack } => {
                debug!(msg = %msg, "duplicate message");
                self.metrics.record_duplicate();
                self.send_ack(ack);
                false
            }
            Incoming::Acked => false,
        }
    }

    fn send_ack(&self, ack: Message) {
        if let Err(e) = self.send(ack) {
            warn!(error = %e, "failed to send ack");
        }
    }

    async fn process_data(&self, office: &Postoffice<N>, msg: Message) -> VanResult<()> {
        let meta = &msg.meta;
        if meta.sender == EMPTY || meta.recver == EMPTY || meta.customer_id == EMPTY {
            return Err(VanError::Protocol(format!(
                "data message with unassigned routing fields: {meta}"
            )));
        }
        let id = meta.customer_id;
        match office.get_customer(id, self.config.customer_wait).await {
            Ok(customer) => customer.accept(msg),
            Err(e) => error!(customer = id, error = %e, "dropping message"),
        }
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !self.is_ready() {
                continue;
            }
            let mut msg = Message::control(SCHEDULER_ID, Command::Heartbeat);
            msg.meta.control.node.push(self.my_node());
            msg.meta.timestamp = self.next_timestamp();
            if let Err(e) = self.send(msg) {
                warn!(error = %e, "failed to send heartbeat");
            }
        }
    }

    async fn resend_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let due = match lock(&self.resender).as_mut() {
                Some(resender) => resender.collect_due(Instant::now()),
                None => return,
            };
            for msg in due.resend {
                warn!(msg = %msg, "resending");
                self.metrics.record_resend();
                if let Err(e) = self.send_raw(&msg) {
                    warn!(error = %e, "resend failed");
                }
            }
            for msg in due.exhausted {
                error!(msg = %msg, "no ack after the last retry, giving up");
                self.metrics.record_send_failure();
            }
        }
    }
}
