//! Last-seen table for liveness approximation.
//!
//! A node is dead once it has been silent for longer than the threshold.
//! Nodes never heard from get a grace period of one threshold after start,
//! so a job is not declared broken before the first heartbeat had a chance.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Inner {
    started: Instant,
    last_seen: HashMap<i32, Instant>,
}

/// Heartbeat table of one node.
#[derive(Debug)]
pub(crate) struct HeartbeatTable {
    inner: Mutex<Inner>,
}

impl HeartbeatTable {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            inner: Mutex::new(Inner {
                started: now,
                last_seen: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Restart the grace period.
    pub(crate) fn mark_started(&self, now: Instant) {
        self.lock().started = now;
    }

    pub(crate) fn update(&self, id: i32, at: Instant) {
        self.lock().last_seen.insert(id, at);
    }

    pub(crate) fn last_seen(&self, id: i32) -> Option<Instant> {
        self.lock().last_seen.get(&id).copied()
    }

    /// Members of `candidates` silent for longer than `threshold` at `now`.
    pub(crate) fn dead_nodes(&self, candidates: &[i32], threshold: Duration, now: Instant) -> Vec<i32> {
        let inner = self.lock();
        if inner.started + threshold >= now {
            return Vec::new();
        }
        candidates
            .iter()
            .copied()
            .filter(|id| match inner.last_seen.get(id) {
                Some(last) => *last + threshold < now,
                None => true,
            })
            .collect()
    }
}
