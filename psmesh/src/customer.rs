//! Per-application request tracker.
//!
//! A [`Customer`] stands for one application instance on one node. It
//! numbers outgoing requests, counts the responses each of them got, and
//! feeds inbound messages to the application's handle one at a time, in
//! arrival order.
//!
//! ```text
//! new_request(group) ──► ts, expect |group| responses
//!                          │
//! handle(response) ── add_response(ts) ──► wait_request(ts) returns
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CustomerError;
use crate::message::{Command, Message};
use crate::postoffice::Membership;

/// Callback receiving every message routed to a customer.
///
/// Runs on the customer's dispatch task; it must not block.
pub type RecvHandle = Box<dyn Fn(&Customer, Message) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Tracker {
    expected: usize,
    received: usize,
}

/// Request tracker and inbound queue of one application.
pub struct Customer {
    id: i32,
    membership: Arc<Membership>,
    timestamps: Arc<AtomicI32>,
    tracker: Mutex<HashMap<i32, Tracker>>,
    responded: Notify,
    queue: mpsc::UnboundedSender<Message>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Customer {
    /// Create a customer with its own timestamp sequence.
    ///
    /// Must be called from within a tokio runtime: the dispatch task is
    /// spawned right away.
    pub fn new<F>(id: i32, membership: Arc<Membership>, handle: F) -> Arc<Self>
    where
        F: Fn(&Customer, Message) + Send + Sync + 'static,
    {
        Self::with_timestamps(id, membership, Arc::new(AtomicI32::new(0)), Box::new(handle))
    }

    /// Create a customer drawing timestamps from a shared sequence.
    pub(crate) fn with_timestamps(
        id: i32,
        membership: Arc<Membership>,
        timestamps: Arc<AtomicI32>,
        handle: RecvHandle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Customer>| {
            let (queue, inbox) = mpsc::unbounded_channel();
            let dispatcher = tokio::spawn(dispatch(weak.clone(), inbox, handle));
            Customer {
                id,
                membership,
                timestamps,
                tracker: Mutex::new(HashMap::new()),
                responded: Notify::new(),
                queue,
                dispatcher: Mutex::new(Some(dispatcher)),
            }
        })
    }

    /// Customer id.
    pub fn id(&self) -> i32 {
        self.id
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, HashMap<i32, Tracker>> {
        self.tracker.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start tracking a request sent to `recver_group`.
    ///
    /// Returns the timestamp to put in the request. One response is expected
    /// from every node of the group.
    pub fn new_request(&self, recver_group: i32) -> i32 {
        let timestamp = self.timestamps.fetch_add(1, Ordering::SeqCst);
        let expected = self.membership.node_ids(recver_group).len();
        self.tracker().insert(
            timestamp,
            Tracker {
                expected,
                received: 0,
            },
        );
        timestamp
    }

    /// Count `n` more responses for `timestamp` and wake its waiters.
    pub fn add_response(&self, timestamp: i32, n: usize) -> Result<(), CustomerError> {
        {
            let mut tracker = self.tracker();
            let entry = tracker
                .get_mut(&timestamp)
                .ok_or(CustomerError::UnknownRequest(timestamp))?;
            entry.received += n;
        }
        self.responded.notify_waiters();
        Ok(())
    }

    /// Responses counted so far for `timestamp`.
    pub fn num_response(&self, timestamp: i32) -> Result<usize, CustomerError> {
        self.tracker()
            .get(&timestamp)
            .map(|t| t.received)
            .ok_or(CustomerError::UnknownRequest(timestamp))
    }

    fn is_complete(&self, timestamp: i32) -> Result<bool, CustomerError> {
        self.tracker()
            .get(&timestamp)
            .map(|t| t.received >= t.expected)
            .ok_or(CustomerError::UnknownRequest(timestamp))
    }

    /// Wait until every expected response for `timestamp` arrived.
    pub async fn wait_request(&self, timestamp: i32) -> Result<(), CustomerError> {
        loop {
            let notified = self.responded.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_complete(timestamp)? {
                return Ok(());
            }
            notified.await;
        }
    }

    /// [`Customer::wait_request`] bounded by `timeout`.
    pub async fn wait_request_timeout(
        &self,
        timestamp: i32,
        timeout: Duration,
    ) -> Result<(), CustomerError> {
        tokio::time::timeout(timeout, self.wait_request(timestamp))
            .await
            .map_err(|_| CustomerError::Timeout { timestamp })?
    }

    /// Queue a message for the handle.
    pub fn accept(&self, msg: Message) {
        if self.queue.send(msg).is_err() {
            warn!(customer = self.id, "customer stopped, dropping message");
        }
    }

    /// Stop the dispatch task after the messages already queued.
    ///
    /// Must not be called from the handle itself.
    pub async fn shutdown(&self) {
        let _ = self.queue.send(Message::control(crate::message::EMPTY, Command::Terminate));
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                warn!(customer = self.id, error = %e, "dispatch task failed");
            }
        }
    }
}

impl fmt::Debug for Customer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Customer")
            .field("id", &self.id)
            .field("outstanding", &self.tracker().len())
            .finish_non_exhaustive()
    }
}

async fn dispatch(
    customer: Weak<Customer>,
    mut inbox: mpsc::UnboundedReceiver<Message>,
    handle: RecvHandle,
) {
    while let Some(msg) = inbox.recv().await {
        if msg.meta.control.cmd == Command::Terminate {
            break;
        }
        let Some(customer) = customer.upgrade() else {
            break;
        };
        handle(&customer, msg);
    }
    debug!("customer dispatch stopped");
}
