//! Retransmission and duplicate suppression.
//!
//! Every outgoing message is remembered under its signature until the
//! receiver acknowledges it. Every incoming message is acknowledged and
//! compared against a bounded window of recently seen signatures, so a
//! message that arrives twice reaches its customer once.
//!
//! ```text
//! sender                              receiver
//!   │── msg (sig) ─────────────────────>│  seen? no  → deliver
//!   │<──────────────────── ACK (sig) ───│
//!   │   (ACK lost, timeout elapses)     │
//!   │── msg (sig) ─────────────────────>│  seen? yes → drop
//!   │<──────────────────── ACK (sig) ───│
//! ```
//!
//! The resender is a plain state machine; the van owns the timer that calls
//! [`Resender::collect_due`] and the sockets that carry the results.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use crate::config::ResendConfig;
use crate::message::{Command, Message, EMPTY};

/// Signature identifying one logical message across retransmissions.
///
/// Layout, high to low: customer id (16 bits), sender (8 bits),
/// receiver (8 bits), timestamp (31 bits), request flag (1 bit). The copies
/// of a group request share a timestamp and differ in the receiver.
pub fn signature(msg: &Message) -> u64 {
    let meta = &msg.meta;
    (u64::from(meta.customer_id as u16) << 48)
        | (u64::from(meta.sender as u8) << 40)
        | (u64::from(meta.recver as u8) << 32)
        | ((u64::from(meta.timestamp as u32) & 0x7fff_ffff) << 1)
        | u64::from(meta.request)
}

fn sender_of(sig: u64) -> u8 {
    (sig >> 40) as u8
}

/// What to do with a received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// First sighting. Send `ack` back (when present) and process the message.
    Fresh {
        /// Acknowledgement for the sender.
        ack: Option<Message>,
    },
    /// Seen before. Send `ack` back and drop the message.
    Duplicate {
        /// Acknowledgement for the sender.
        ack: Message,
    },
    /// An acknowledgement of one of our own messages; nothing to deliver.
    Acked,
}

/// Messages whose acknowledgement is overdue.
#[derive(Debug, Default)]
pub struct Due {
    /// Messages to send again.
    pub resend: Vec<Message>,
    /// Messages that ran out of retries and are given up.
    pub exhausted: Vec<Message>,
}

#[derive(Debug)]
struct Pending {
    msg: Message,
    sent_at: Instant,
    retries: u32,
}

/// Outgoing retransmission table plus incoming duplicate filter.
#[derive(Debug)]
pub struct Resender {
    config: ResendConfig,
    outgoing: HashMap<u64, Pending>,
    seen: HashSet<u64>,
    seen_order: VecDeque<u64>,
}

impl Resender {
    /// Create an empty resender.
    pub fn new(config: ResendConfig) -> Self {
        Self {
            config,
            outgoing: HashMap::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Settings in use.
    pub fn config(&self) -> &ResendConfig {
        &self.config
    }

    /// Remember `msg` until it is acknowledged. Returns whether a new entry
    /// was created.
    ///
    /// ACK and TERMINATE messages are never tracked, nor are messages whose
    /// sender or receiver is not assigned yet. Re-adding a tracked signature
    /// keeps the original entry.
    pub fn add_outgoing(&mut self, msg: &Message, now: Instant) -> bool {
        let cmd = msg.meta.control.cmd;
        if cmd == Command::Ack || cmd == Command::Terminate {
            return false;
        }
        if msg.meta.sender == EMPTY || msg.meta.recver == EMPTY {
            return false;
        }
        match self.outgoing.entry(signature(msg)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Pending {
                    msg: msg.clone(),
                    sent_at: now,
                    retries: 0,
                });
                true
            }
        }
    }

    /// Stop tracking `msg`, for a send that never left this node.
    pub fn cancel_outgoing(&mut self, msg: &Message) {
        self.outgoing.remove(&signature(msg));
    }

    /// Classify a received message.
    ///
    /// ACKs are matched before anything else: a node acknowledging the
    /// roster has not adopted its id yet and sends them unassigned.
    pub fn add_incoming(&mut self, msg: &Message) -> Incoming {
        let cmd = msg.meta.control.cmd;
        if cmd == Command::Ack {
            self.outgoing.remove(&msg.meta.control.msg_sig);
            return Incoming::Acked;
        }
        if cmd == Command::Terminate || msg.meta.sender == EMPTY {
            return Incoming::Fresh { ack: None };
        }

        let sig = signature(msg);
        let mut ack = Message::control(msg.meta.sender, Command::Ack);
        ack.meta.sender = msg.meta.recver;
        ack.meta.control.msg_sig = sig;

        if self.seen.contains(&sig) {
            return Incoming::Duplicate { ack };
        }
        self.remember(sig);
        Incoming::Fresh { ack: Some(ack) }
    }

    fn remember(&mut self, sig: u64) {
        self.seen.insert(sig);
        self.seen_order.push_back(sig);
        while self.seen_order.len() > self.config.dedup_window {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }

    /// Forget every signature seen from `sender`.
    ///
    /// A node that takes over a dead node's id restarts its timestamps, so
    /// its messages must not be mistaken for the dead node's.
    pub fn forget_sender(&mut self, sender: i32) {
        let id = sender as u8;
        self.seen_order.retain(|sig| sender_of(*sig) != id);
        self.seen.retain(|sig| sender_of(*sig) != id);
        self.outgoing.retain(|_, p| p.msg.meta.recver != sender);
    }

    /// Collect overdue messages.
    ///
    /// An entry is overdue once `timeout * (retries + 1)` has passed since it
    /// was first sent. Overdue entries below the retry limit are returned for
    /// retransmission and their retry count grows; the others are removed.
    pub fn collect_due(&mut self, now: Instant) -> Due {
        let mut due = Due::default();
        let timeout = self.config.timeout;
        let max_retries = self.config.max_retries;

        self.outgoing.retain(|_, pending| {
            let deadline = pending.sent_at + timeout * (pending.retries + 1);
            if deadline >= now {
                return true;
            }
            if pending.retries >= max_retries {
                due.exhausted.push(pending.msg.clone());
                return false;
            }
            pending.retries += 1;
            due.resend.push(pending.msg.clone());
            true
        });
        due
    }

    /// Number of messages waiting for an ACK.
    pub fn pending(&self) -> usize {
        self.outgoing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> ResendConfig {
        ResendConfig {
            timeout: Duration::from_millis(100),
            max_retries: 2,
            dedup_window: 4,
        }
    }

    fn data(sender: i32, recver: i32, timestamp: i32) -> Message {
        let mut msg = Message::default();
        msg.meta.sender = sender;
        msg.meta.recver = recver;
        msg.meta.timestamp = timestamp;
        msg.meta.customer_id = 0;
        msg.meta.request = true;
        msg
    }

    fn ack_for(msg: &Message, resender: &mut Resender) -> Message {
        match resender.add_incoming(msg) {
            Incoming::Fresh { ack: Some(ack) } | Incoming::Duplicate { ack } => ack,
            other => panic!("expected an ack, got {other:?}"),
        }
    }

    #[test]
    fn test_signature_distinguishes_fields() {
        let base = data(9, 8, 5);
        let mut response = base.clone();
        response.meta.request = false;
        let mut other_customer = base.clone();
        other_customer.meta.customer_id = 1;
        let later = data(9, 8, 6);
        let other_recver = data(9, 10, 5);
        let other_sender = data(11, 8, 5);

        let sigs: HashSet<u64> = [
            &base,
            &response,
            &other_customer,
            &later,
            &other_recver,
            &other_sender,
        ]
        .iter()
        .map(|m| signature(m))
        .collect();
        assert_eq!(sigs.len(), 6);
        assert_eq!(sender_of(signature(&base)), 9);
    }

    #[test]
    fn test_group_request_tracks_every_copy() {
        let mut worker = Resender::new(config());
        let mut first_server = Resender::new(config());
        let start = Instant::now();
        let to_first = data(9, 8, 3);
        let to_second = data(9, 10, 3);

        assert!(worker.add_outgoing(&to_first, start));
        assert!(worker.add_outgoing(&to_second, start));
        assert_eq!(worker.pending(), 2);

        let ack = ack_for(&to_first, &mut first_server);
        assert_eq!(worker.add_incoming(&ack), Incoming::Acked);
        assert_eq!(worker.pending(), 1);

        let due = worker.collect_due(start + Duration::from_millis(150));
        assert_eq!(due.resend, vec![to_second]);
    }

    #[test]
    fn test_unassigned_ack_still_clears_outgoing() {
        let mut scheduler = Resender::new(config());
        let roster = data(1, 9, 0);
        scheduler.add_outgoing(&roster, Instant::now());

        let mut ack = Message::control(1, Command::Ack);
        ack.meta.sender = EMPTY;
        ack.meta.control.msg_sig = signature(&roster);
        assert_eq!(scheduler.add_incoming(&ack), Incoming::Acked);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_cancel_outgoing() {
        let mut resender = Resender::new(config());
        let now = Instant::now();
        let kept = data(9, 8, 1);
        let failed = data(9, 10, 1);
        resender.add_outgoing(&kept, now);
        resender.add_outgoing(&failed, now);

        resender.cancel_outgoing(&failed);
        assert_eq!(resender.pending(), 1);
        let due = resender.collect_due(now + Duration::from_millis(150));
        assert_eq!(due.resend, vec![kept]);
    }

    #[test]
    fn test_duplicate_is_suppressed_but_acked() {
        let mut receiver = Resender::new(config());
        let msg = data(9, 8, 1);

        let first = receiver.add_incoming(&msg);
        let Incoming::Fresh { ack: Some(ack) } = first else {
            panic!("first sighting should be fresh");
        };
        assert_eq!(ack.meta.recver, 9);
        assert_eq!(ack.meta.sender, 8);
        assert_eq!(ack.meta.control.msg_sig, signature(&msg));

        assert!(matches!(
            receiver.add_incoming(&msg),
            Incoming::Duplicate { .. }
        ));
    }

    #[test]
    fn test_ack_clears_outgoing() {
        let mut sender = Resender::new(config());
        let mut receiver = Resender::new(config());
        let msg = data(9, 8, 1);
        let now = Instant::now();

        sender.add_outgoing(&msg, now);
        assert_eq!(sender.pending(), 1);

        let ack = ack_for(&msg, &mut receiver);
        assert_eq!(sender.add_incoming(&ack), Incoming::Acked);
        assert_eq!(sender.pending(), 0);
        assert!(sender.collect_due(now + Duration::from_secs(10)).resend.is_empty());
    }

    #[test]
    fn test_untracked_messages() {
        let mut resender = Resender::new(config());
        let now = Instant::now();

        resender.add_outgoing(&Message::control(8, Command::Ack), now);
        resender.add_outgoing(&Message::control(8, Command::Terminate), now);
        let mut join = Message::control(1, Command::AddNode);
        join.meta.timestamp = 0;
        resender.add_outgoing(&join, now);
        assert_eq!(resender.pending(), 0);

        assert_eq!(
            resender.add_incoming(&join),
            Incoming::Fresh { ack: None }
        );
    }

    #[test]
    fn test_add_outgoing_is_idempotent() {
        let mut resender = Resender::new(config());
        let now = Instant::now();
        let msg = data(9, 8, 1);
        assert!(resender.add_outgoing(&msg, now));
        assert!(!resender.add_outgoing(&msg, now + Duration::from_millis(90)));
        assert_eq!(resender.pending(), 1);

        let due = resender.collect_due(now + Duration::from_millis(101));
        assert_eq!(due.resend.len(), 1);
    }

    #[test]
    fn test_retry_schedule_and_exhaustion() {
        let mut resender = Resender::new(config());
        let start = Instant::now();
        resender.add_outgoing(&data(9, 8, 1), start);

        assert!(resender.collect_due(start + Duration::from_millis(50)).resend.is_empty());

        let due = resender.collect_due(start + Duration::from_millis(150));
        assert_eq!(due.resend.len(), 1);

        // Second deadline is two timeouts after the first send.
        assert!(resender.collect_due(start + Duration::from_millis(190)).resend.is_empty());
        let due = resender.collect_due(start + Duration::from_millis(250));
        assert_eq!(due.resend.len(), 1);

        let due = resender.collect_due(start + Duration::from_millis(350));
        assert!(due.resend.is_empty());
        assert_eq!(due.exhausted.len(), 1);
        assert_eq!(resender.pending(), 0);
    }

    #[test]
    fn test_dedup_window_is_bounded() {
        let mut resender = Resender::new(config());
        for ts in 0..6 {
            assert!(matches!(
                resender.add_incoming(&data(9, 8, ts)),
                Incoming::Fresh { .. }
            ));
        }
        // Oldest two fell out of the window of four.
        assert!(matches!(
            resender.add_incoming(&data(9, 8, 0)),
            Incoming::Fresh { .. }
        ));
        assert!(matches!(
            resender.add_incoming(&data(9, 8, 5)),
            Incoming::Duplicate { .. }
        ));
    }

    #[test]
    fn test_forget_sender() {
        let mut resender = Resender::new(config());
        resender.add_incoming(&data(9, 8, 0));
        resender.add_incoming(&data(11, 8, 0));
        resender.forget_sender(9);

        assert!(matches!(
            resender.add_incoming(&data(9, 8, 0)),
            Incoming::Fresh { .. }
        ));
        assert!(matches!(
            resender.add_incoming(&data(11, 8, 0)),
            Incoming::Duplicate { .. }
        ));
    }
}
