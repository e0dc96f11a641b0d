//! Shared helpers for in-process cluster tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use psmesh::{
    Customer, DataType, MemoryNetworkProvider, Message, NetworkProvider, Postoffice,
    PostofficeConfig, Role, VanConfig,
};

pub type Office = Arc<Postoffice<MemoryNetworkProvider>>;

/// Request timestamps handled by a server, per sender.
pub type Seen = Arc<Mutex<HashMap<i32, Vec<i32>>>>;

/// Payloads of the responses a worker received.
pub type Replies = Arc<Mutex<Vec<Bytes>>>;

pub const SCHEDULER_HOST: &str = "scheduler";
pub const SCHEDULER_PORT: u16 = 9000;

/// Application id used by every test customer.
pub const APP_ID: i32 = 0;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn node_config(role: Role, workers: usize, servers: usize, van: &VanConfig) -> PostofficeConfig {
    PostofficeConfig::new(role, workers, servers, SCHEDULER_HOST, SCHEDULER_PORT)
        .with_van(van.clone().with_address("127.0.0.1", 0))
}

pub fn office(
    network: &MemoryNetworkProvider,
    role: Role,
    workers: usize,
    servers: usize,
    van: &VanConfig,
) -> Office {
    Postoffice::new(node_config(role, workers, servers, van), network.clone())
        .expect("valid config")
}

/// Wait until the scheduler's listener shows up in the address table.
pub async fn wait_for_scheduler(network: &MemoryNetworkProvider) {
    let addr = format!("{SCHEDULER_HOST}:{SCHEDULER_PORT}");
    tokio::time::timeout(Duration::from_secs(5), async {
        while !network.bound_addresses().contains(&addr) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("scheduler bound in time");
}

/// A job running inside one process.
pub struct Cluster {
    pub network: MemoryNetworkProvider,
    pub van: VanConfig,
    pub scheduler: Office,
    pub workers: Vec<Office>,
    pub servers: Vec<Office>,
}

impl Cluster {
    /// Start a scheduler plus `workers` workers and `servers` servers and
    /// wait for every start barrier.
    pub async fn start(num_workers: usize, num_servers: usize, van: VanConfig) -> Self {
        init_tracing();
        let network = MemoryNetworkProvider::new();
        let new_office = |role| office(&network, role, num_workers, num_servers, &van);
        let scheduler = new_office(Role::Scheduler);
        let workers: Vec<Office> = (0..num_workers).map(|_| new_office(Role::Worker)).collect();
        let servers: Vec<Office> = (0..num_servers).map(|_| new_office(Role::Server)).collect();

        let mut starts = Vec::new();
        starts.push(tokio::spawn({
            let po = Arc::clone(&scheduler);
            async move { po.start(true).await }
        }));
        wait_for_scheduler(&network).await;
        for po in workers.iter().chain(servers.iter()) {
            let po = Arc::clone(po);
            starts.push(tokio::spawn(async move { po.start(true).await }));
        }
        for start in starts {
            tokio::time::timeout(Duration::from_secs(10), start)
                .await
                .expect("started in time")
                .expect("start task")
                .expect("start");
        }

        Self {
            network,
            van,
            scheduler,
            workers,
            servers,
        }
    }

    pub fn all(&self) -> Vec<Office> {
        std::iter::once(&self.scheduler)
            .chain(self.workers.iter())
            .chain(self.servers.iter())
            .cloned()
            .collect()
    }

    /// Finalize every node with the closing barrier.
    pub async fn finalize(self) {
        let mut stops = Vec::new();
        for po in self.all() {
            stops.push(tokio::spawn(async move { po.finalize(true).await }));
        }
        for stop in stops {
            tokio::time::timeout(Duration::from_secs(10), stop)
                .await
                .expect("finalized in time")
                .expect("finalize task")
                .expect("finalize");
        }
    }

    /// Stop every node without the closing barrier.
    pub async fn stop(self) {
        for po in self.all() {
            let _ = po.finalize(false).await;
        }
    }
}

/// Register a server application that echoes every request back.
pub fn echo_server<N: NetworkProvider>(po: &Arc<Postoffice<N>>) -> Seen {
    let seen = Seen::default();
    let van = Arc::clone(po.van());
    po.new_customer(APP_ID, {
        let seen = Arc::clone(&seen);
        move |_: &Customer, msg: Message| {
            if !msg.meta.request {
                return;
            }
            seen.lock()
                .expect("lock")
                .entry(msg.meta.sender)
                .or_default()
                .push(msg.meta.timestamp);

            let mut reply = Message::default();
            reply.meta.recver = msg.meta.sender;
            reply.meta.customer_id = msg.meta.customer_id;
            reply.meta.timestamp = msg.meta.timestamp;
            reply.meta.request = false;
            for (segment, data_type) in msg.data.iter().zip(&msg.meta.data_type) {
                reply.add_data(segment.clone(), *data_type);
            }
            let _ = van.send(reply);
        }
    })
    .expect("register echo server");
    seen
}

/// Register a worker application counting responses.
pub fn client<N: NetworkProvider>(po: &Arc<Postoffice<N>>) -> (Arc<Customer>, Replies) {
    let replies = Replies::default();
    let customer = po
        .new_customer(APP_ID, {
            let replies = Arc::clone(&replies);
            move |c: &Customer, msg: Message| {
                if msg.meta.request {
                    return;
                }
                replies.lock().expect("lock").extend(msg.data.iter().cloned());
                c.add_response(msg.meta.timestamp, 1).expect("known request");
            }
        })
        .expect("register client");
    (customer, replies)
}

/// Send one request carrying `payload` to every node of `group`.
pub fn request<N: NetworkProvider>(
    po: &Arc<Postoffice<N>>,
    customer: &Customer,
    group: i32,
    payload: &'static [u8],
) -> i32 {
    let timestamp = customer.new_request(group);
    for &id in po.get_node_ids(group) {
        let mut msg = Message::default();
        msg.meta.recver = id;
        msg.meta.customer_id = customer.id();
        msg.meta.timestamp = timestamp;
        msg.meta.request = true;
        msg.add_data(Bytes::from_static(payload), DataType::Char);
        po.van().send(msg).expect("send request");
    }
    timestamp
}
