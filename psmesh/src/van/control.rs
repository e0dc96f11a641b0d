//! Control message handling.
//!
//! ## Join protocol
//!
//! ```text
//! node                                scheduler
//!  │── ADD_NODE {me, id: -} ─────────────►│ roster += me
//!  │                                      │ ... until workers + servers joined
//!  │                                      │ sort by (host, port), assign ids
//!  │◄── ADD_NODE {roster + scheduler} ────│ to every worker and server
//!  ready                                  ready
//! ```
//!
//! A join arriving after the roster is complete replaces a dead node of the
//! same role: the newcomer inherits the dead node's id and is flagged as a
//! recovery node. It receives the whole roster; live peers only learn about
//! the newcomer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{lock, Van};
use crate::error::{VanError, VanResult};
use crate::message::{Command, Message, Node, Role, EMPTY};
use crate::network::NetworkProvider;
use crate::postoffice::{
    id_to_rank, server_rank_to_id, worker_rank_to_id, BarrierCounter, Postoffice,
};
use crate::{SERVER_GROUP, WORKER_GROUP};

/// State the receive loop keeps between control messages.
#[derive(Debug, Default)]
pub(super) struct ControlState {
    /// Scheduler only: joined nodes, plus the scheduler once complete.
    roster: Vec<Node>,
    /// Scheduler only: the roster was assigned ids and broadcast.
    roster_sent: bool,
    /// Scheduler only: barrier arrivals.
    barrier: BarrierCounter,
}

fn add_node_message(recver: i32, nodes: Vec<Node>) -> Message {
    let mut msg = Message::control(recver, Command::AddNode);
    msg.meta.control.node = nodes;
    msg
}

/// Deterministic rank order.
fn sort_roster(roster: &mut [Node]) {
    roster.sort_by(|a, b| {
        a.hostname
            .cmp(&b.hostname)
            .then_with(|| a.port.cmp(&b.port))
    });
}

/// Assign server and worker ids in roster order.
fn assign_ids(roster: &mut [Node]) -> VanResult<(usize, usize)> {
    let (mut servers, mut workers) = (0, 0);
    for node in roster.iter_mut() {
        if node.id != EMPTY {
            return Err(VanError::Protocol(format!("joining node already has an id: {node}")));
        }
        node.id = match node.role {
            Role::Server => {
                servers += 1;
                server_rank_to_id(servers - 1)
            }
            Role::Worker => {
                workers += 1;
                worker_rank_to_id(workers - 1)
            }
            Role::Scheduler => {
                return Err(VanError::Protocol(format!("scheduler tried to join: {node}")));
            }
        };
        info!(node = %node, rank = id_to_rank(node.id), "assigned id");
    }
    Ok((servers, workers))
}

/// ADD_NODE payload per recipient after `node` replaced a dead node.
///
/// The newcomer gets the whole roster, live peers get the newcomer alone and
/// dead peers get nothing.
fn recovery_notices(
    roster: &[Node],
    node: &Node,
    recipients: &[i32],
    dead: &HashSet<i32>,
) -> Vec<(i32, Vec<Node>)> {
    recipients
        .iter()
        .filter(|&&id| id == node.id || !dead.contains(&id))
        .map(|&id| {
            let nodes = if id == node.id {
                roster.to_vec()
            } else {
                vec![node.clone()]
            };
            (id, nodes)
        })
        .collect()
}

/// Put `candidate` in place of the first dead roster entry of its role.
fn substitute(roster: &mut [Node], mut candidate: Node, dead: &HashSet<i32>) -> Option<Node> {
    let slot = roster.iter_mut().find(|n| {
        n.role != Role::Scheduler && n.role == candidate.role && dead.contains(&n.id)
    })?;
    info!(dead = %slot, node = %candidate, "replacing dead node");
    candidate.id = slot.id;
    candidate.is_recovery = true;
    *slot = candidate.clone();
    Some(candidate)
}

impl<N: NetworkProvider> Van<N> {
    pub(super) async fn process_control(
        &self,
        office: &Arc<Postoffice<N>>,
        state: &mut ControlState,
        msg: Message,
    ) -> VanResult<()> {
        match msg.meta.control.cmd {
            Command::AddNode => self.process_add_node(office, state, msg).await,
            Command::Barrier => self.process_barrier(office, state, msg),
            Command::Heartbeat => {
                self.process_heartbeat(office, msg);
                Ok(())
            }
            Command::Ack => {
                debug!(msg = %msg, "ack without retransmission enabled");
                Ok(())
            }
            Command::Terminate | Command::Empty => Ok(()),
        }
    }

    async fn process_add_node(
        &self,
        office: &Arc<Postoffice<N>>,
        state: &mut ControlState,
        msg: Message,
    ) -> VanResult<()> {
        let nodes = msg.meta.control.node;
        let expected = office.membership().num_nodes();
        let dead: HashSet<i32> = office
            .get_dead_nodes(self.config.heartbeat_timeout)
            .into_iter()
            .collect();

        let mut recovered = None;
        if msg.meta.sender == EMPTY {
            if !self.is_scheduler() {
                return Err(VanError::Protocol(
                    "join request delivered to a non-scheduler node".to_string(),
                ));
            }
            let [candidate] = <[Node; 1]>::try_from(nodes.clone()).map_err(|n| {
                VanError::Protocol(format!("join request with {} nodes", n.len()))
            })?;

            if state.roster.len() < expected {
                if state.roster.iter().any(|n| n.same_address(&candidate)) {
                    debug!(node = %candidate, "repeated join ignored");
                } else {
                    info!(node = %candidate, joined = state.roster.len() + 1, expected, "node joined");
                    state.roster.push(candidate);
                }
            } else {
                recovered = substitute(&mut state.roster, candidate.clone(), &dead);
                if recovered.is_none() {
                    warn!(node = %candidate, "job is full and no dead node to replace, ignoring join");
                }
            }
        }

        self.adopt_identity(&nodes);

        if self.is_scheduler() {
            if state.roster.len() == expected && !state.roster_sent {
                self.broadcast_roster(office, state).await?;
            } else if let Some(node) = recovered {
                self.announce_recovery(office, state, node, &dead).await?;
            }
            return Ok(());
        }

        let (mut servers, mut workers) = (0, 0);
        for node in &nodes {
            // A recovering node's roster may still list other dead peers.
            if let Err(e) = self.connect(node.clone()).await {
                warn!(node = %node, error = %e, "peer unreachable, skipping");
                continue;
            }
            if node.is_recovery {
                if let Some(resender) = lock(&self.resender).as_mut() {
                    resender.forget_sender(node.id);
                }
                continue;
            }
            match node.role {
                Role::Server => servers += 1,
                Role::Worker => workers += 1,
                Role::Scheduler => {}
            }
        }
        info!(node = %self.my_node(), servers, workers, "connected to peers");
        self.ready.send_replace(true);
        Ok(())
    }

    /// Take over the id assigned to this node's address, if listed.
    fn adopt_identity(&self, nodes: &[Node]) {
        let my = self.my_node();
        if let Some(me) = nodes.iter().find(|n| n.same_address(&my)) {
            if me.id != my.id || me.is_recovery != my.is_recovery {
                info!(node = %me, rank = id_to_rank(me.id), "adopted id");
                self.set_my_node(me.clone());
            }
        }
    }

    async fn broadcast_roster(
        &self,
        office: &Arc<Postoffice<N>>,
        state: &mut ControlState,
    ) -> VanResult<()> {
        sort_roster(&mut state.roster);
        let (servers, workers) = assign_ids(&mut state.roster)?;

        let now = Instant::now();
        for node in state.roster.clone() {
            let id = node.id;
            self.connect(node).await?;
            office.update_heartbeat(id, now);
        }
        state.roster.push(self.my_node());
        state.roster_sent = true;

        for &id in office.get_node_ids(WORKER_GROUP | SERVER_GROUP) {
            let mut back = add_node_message(id, state.roster.clone());
            back.meta.timestamp = self.next_timestamp();
            self.send(back)?;
        }
        info!(servers, workers, "scheduler connected to all nodes");
        self.ready.send_replace(true);
        Ok(())
    }

    async fn announce_recovery(
        &self,
        office: &Arc<Postoffice<N>>,
        state: &ControlState,
        node: Node,
        dead: &HashSet<i32>,
    ) -> VanResult<()> {
        self.connect(node.clone()).await?;
        office.update_heartbeat(node.id, Instant::now());
        if let Some(resender) = lock(&self.resender).as_mut() {
            resender.forget_sender(node.id);
        }

        let recipients = office.get_node_ids(WORKER_GROUP | SERVER_GROUP);
        for (id, nodes) in recovery_notices(&state.roster, &node, recipients, dead) {
            let mut back = add_node_message(id, nodes);
            back.meta.timestamp = self.next_timestamp();
            if let Err(e) = self.send(back) {
                warn!(id, error = %e, "failed to announce recovery");
            }
        }
        info!(node = %node, "recovery node admitted");
        Ok(())
    }

    fn process_barrier(
        &self,
        office: &Arc<Postoffice<N>>,
        state: &mut ControlState,
        msg: Message,
    ) -> VanResult<()> {
        if !msg.meta.request {
            office.manage(&msg);
            return Ok(());
        }
        if !self.is_scheduler() {
            return Err(VanError::Protocol(
                "barrier request delivered to a non-scheduler node".to_string(),
            ));
        }

        let group = msg.meta.control.barrier_group;
        let members = office.get_node_ids(group);
        let released = state.barrier.arrive(group, members.len()).ok_or_else(|| {
            VanError::Protocol(format!("barrier request for invalid group {group}"))
        })?;
        if !released {
            debug!(group, from = msg.meta.sender, "barrier arrival");
            return Ok(());
        }

        debug!(group, members = members.len(), "barrier released");
        for &id in members {
            let mut res = Message::control(id, Command::Barrier);
            res.meta.request = false;
            res.meta.control.barrier_group = group;
            res.meta.timestamp = self.next_timestamp();
            self.send(res)?;
        }
        Ok(())
    }

    fn process_heartbeat(&self, office: &Arc<Postoffice<N>>, msg: Message) {
        let now = Instant::now();
        for node in &msg.meta.control.node {
            office.update_heartbeat(node.id, now);
            if self.is_scheduler() {
                let mut ack = Message::control(node.id, Command::Heartbeat);
                ack.meta.control.node.push(self.my_node());
                ack.meta.timestamp = self.next_timestamp();
                if let Err(e) = self.send(ack) {
                    warn!(id = node.id, error = %e, "failed to answer heartbeat");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joiner(role: Role, host: &str, port: u16) -> Node {
        Node::new(role, host, port)
    }

    #[test]
    fn test_rank_assignment_is_order_independent() {
        let nodes = vec![
            joiner(Role::Worker, "10.0.0.2", 9000),
            joiner(Role::Server, "10.0.0.1", 9001),
            joiner(Role::Worker, "10.0.0.1", 9000),
            joiner(Role::Server, "10.0.0.3", 8000),
        ];

        let mut first = nodes.clone();
        sort_roster(&mut first);
        assign_ids(&mut first).expect("assign");

        let mut reversed: Vec<Node> = nodes.into_iter().rev().collect();
        sort_roster(&mut reversed);
        let counts = assign_ids(&mut reversed).expect("assign");

        assert_eq!(first, reversed);
        assert_eq!(counts, (2, 2));
        let ids: Vec<(String, i32)> = first
            .iter()
            .map(|n| (n.address(), n.id))
            .collect();
        assert_eq!(
            ids,
            vec![
                ("10.0.0.1:9000".to_string(), 9),
                ("10.0.0.1:9001".to_string(), 8),
                ("10.0.0.2:9000".to_string(), 11),
                ("10.0.0.3:8000".to_string(), 10),
            ]
        );
    }

    #[test]
    fn test_assign_rejects_preassigned_ids() {
        let mut roster = vec![joiner(Role::Worker, "h", 1).with_id(9)];
        assert!(matches!(assign_ids(&mut roster), Err(VanError::Protocol(_))));
    }

    #[test]
    fn test_substitute_takes_dead_id_of_same_role() {
        let mut roster = vec![
            joiner(Role::Server, "h", 1).with_id(8),
            joiner(Role::Worker, "h", 2).with_id(9),
            joiner(Role::Worker, "h", 3).with_id(11),
            Node::new(Role::Scheduler, "s", 7).with_id(1),
        ];
        let dead: HashSet<i32> = [8, 11].into_iter().collect();

        let recovered = substitute(&mut roster, joiner(Role::Worker, "h", 4), &dead)
            .expect("dead worker available");
        assert_eq!(recovered.id, 11);
        assert!(recovered.is_recovery);
        assert_eq!(roster[2], recovered);
        assert_eq!(roster[0].port, 1, "dead server stays");

        let none = substitute(&mut roster, joiner(Role::Worker, "h", 5), &HashSet::new());
        assert!(none.is_none());
    }

    #[test]
    fn test_recovery_notices_per_recipient() {
        let mut newcomer = joiner(Role::Worker, "h", 4).with_id(9);
        newcomer.is_recovery = true;
        let roster = vec![
            joiner(Role::Server, "h", 1).with_id(8),
            newcomer.clone(),
            joiner(Role::Server, "h", 2).with_id(10),
            joiner(Role::Worker, "h", 3).with_id(11),
            Node::new(Role::Scheduler, "s", 7).with_id(1),
        ];
        let dead: HashSet<i32> = [9, 10].into_iter().collect();

        let notices = recovery_notices(&roster, &newcomer, &[8, 9, 10, 11], &dead);

        let ids: Vec<i32> = notices.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![8, 9, 11], "dead server 10 is skipped");
        for (id, nodes) in &notices {
            if *id == newcomer.id {
                assert_eq!(nodes, &roster);
            } else {
                assert_eq!(nodes, &vec![newcomer.clone()]);
            }
        }
    }
}
