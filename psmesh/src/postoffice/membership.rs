//! Group membership table and id arithmetic.
//!
//! Ids are fixed by rank: the scheduler is `1`, server rank `r` is `8 + 2r`
//! and worker rank `r` is `9 + 2r`. Ids below 8 are reserved for group
//! masks, so every individual id can double as a single-member group.

use std::collections::HashMap;

use crate::message::Role;
use crate::{ALL_GROUPS, SCHEDULER_GROUP, SCHEDULER_ID, SERVER_GROUP, WORKER_GROUP};

/// Id of the server with rank `rank`.
pub fn server_rank_to_id(rank: usize) -> i32 {
    rank as i32 * 2 + 8
}

/// Id of the worker with rank `rank`.
pub fn worker_rank_to_id(rank: usize) -> i32 {
    rank as i32 * 2 + 9
}

/// Rank of a server or worker id. The scheduler has rank 0.
pub fn id_to_rank(id: i32) -> usize {
    ((id - 8) / 2).max(0) as usize
}

/// Node ids of every group mask and every individual node.
///
/// Computed once from the configured counts. Recovery reuses the dead
/// node's id, so the table never changes during a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    num_workers: usize,
    num_servers: usize,
    groups: HashMap<i32, Vec<i32>>,
}

impl Membership {
    /// Build the table for a job of `num_workers` workers and `num_servers`
    /// servers.
    pub fn new(num_workers: usize, num_servers: usize) -> Self {
        let mut groups: HashMap<i32, Vec<i32>> = HashMap::new();
        let mut add = |keys: &[i32], id: i32| {
            for key in keys {
                groups.entry(*key).or_default().push(id);
            }
        };

        for rank in 0..num_workers {
            let id = worker_rank_to_id(rank);
            add(
                &[
                    id,
                    WORKER_GROUP,
                    WORKER_GROUP | SERVER_GROUP,
                    WORKER_GROUP | SCHEDULER_GROUP,
                    ALL_GROUPS,
                ],
                id,
            );
        }
        for rank in 0..num_servers {
            let id = server_rank_to_id(rank);
            add(
                &[
                    id,
                    SERVER_GROUP,
                    WORKER_GROUP | SERVER_GROUP,
                    SERVER_GROUP | SCHEDULER_GROUP,
                    ALL_GROUPS,
                ],
                id,
            );
        }
        add(
            &[
                SCHEDULER_GROUP,
                ALL_GROUPS,
                SCHEDULER_GROUP | WORKER_GROUP,
                SCHEDULER_GROUP | SERVER_GROUP,
            ],
            SCHEDULER_ID,
        );

        Self {
            num_workers,
            num_servers,
            groups,
        }
    }

    /// Ids in `group`, a role mask or an individual node id. Unknown groups
    /// are empty.
    pub fn node_ids(&self, group: i32) -> &[i32] {
        self.groups.get(&group).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `role` is part of the role mask `group`.
    pub fn role_in_group(role: Role, group: i32) -> bool {
        role.group_flag() & group != 0
    }

    /// Configured number of workers.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Configured number of servers.
    pub fn num_servers(&self) -> usize {
        self.num_servers
    }

    /// Workers plus servers, the size of a complete roster.
    pub fn num_nodes(&self) -> usize {
        self.num_workers + self.num_servers
    }
}
