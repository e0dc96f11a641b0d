//! Node and message model.
//!
//! A [`Message`] is a [`Meta`] envelope plus zero or more opaque data
//! segments. A meta carrying a non-empty [`Control`] is a management
//! message: the van consumes it and it never reaches a customer.
//!
//! ```text
//! Message
//! ├── Meta
//! │   ├── sender / recver / timestamp / customer_id
//! │   ├── request / push / head / simple_app
//! │   ├── body, data_type[]
//! │   └── Control { cmd, node[], barrier_group, msg_sig }
//! └── data: [Bytes; n]
//! ```

mod codec;
mod node;

use std::fmt;

use bytes::Bytes;

pub use codec::{pack_meta, unpack_meta};
pub use node::{Node, Role, EMPTY};

/// Control commands understood by the van.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Command {
    /// Not a control message.
    #[default]
    Empty,
    /// Stop the receive loop of the node it is sent to.
    Terminate,
    /// Join request, or roster broadcast from the scheduler.
    AddNode,
    /// Barrier request (to the scheduler) or release (from it).
    Barrier,
    /// Delivery acknowledgement used by the resender.
    Ack,
    /// Liveness beacon.
    Heartbeat,
}

impl Command {
    /// Numeric form used on the wire.
    pub fn as_i32(self) -> i32 {
        match self {
            Command::Empty => 0,
            Command::Terminate => 1,
            Command::AddNode => 2,
            Command::Barrier => 3,
            Command::Ack => 4,
            Command::Heartbeat => 5,
        }
    }

    /// Inverse of [`Command::as_i32`].
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Command::Empty),
            1 => Some(Command::Terminate),
            2 => Some(Command::AddNode),
            3 => Some(Command::Barrier),
            4 => Some(Command::Ack),
            5 => Some(Command::Heartbeat),
            _ => None,
        }
    }
}

/// Element type of a data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum DataType {
    Char,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    Other,
}

impl DataType {
    /// Numeric form used on the wire.
    pub fn as_i32(self) -> i32 {
        match self {
            DataType::Char => 0,
            DataType::Int8 => 1,
            DataType::Int16 => 2,
            DataType::Int32 => 3,
            DataType::Int64 => 4,
            DataType::UInt8 => 5,
            DataType::UInt16 => 6,
            DataType::UInt32 => 7,
            DataType::UInt64 => 8,
            DataType::Float => 9,
            DataType::Double => 10,
            DataType::Other => 11,
        }
    }

    /// Inverse of [`DataType::as_i32`]. Unknown tags map to [`DataType::Other`].
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => DataType::Char,
            1 => DataType::Int8,
            2 => DataType::Int16,
            3 => DataType::Int32,
            4 => DataType::Int64,
            5 => DataType::UInt8,
            6 => DataType::UInt16,
            7 => DataType::UInt32,
            8 => DataType::UInt64,
            9 => DataType::Float,
            10 => DataType::Double,
            _ => DataType::Other,
        }
    }
}

/// Control sub-message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Control {
    /// The command.
    pub cmd: Command,
    /// Node entries, used by `AddNode` and `Heartbeat`.
    pub node: Vec<Node>,
    /// Group mask, meaningful for `Barrier` only.
    pub barrier_group: i32,
    /// Signature of the acknowledged message, meaningful for `Ack` only.
    pub msg_sig: u64,
}

impl Control {
    /// A control block for `cmd` with no payload.
    pub fn new(cmd: Command) -> Self {
        Self {
            cmd,
            ..Self::default()
        }
    }

    /// True when this is not a control message.
    pub fn is_empty(&self) -> bool {
        self.cmd == Command::Empty
    }
}

/// Message envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    /// Application-defined command, [`EMPTY`] when unused.
    pub head: i32,
    /// Sending node id. The van stamps it on send.
    pub sender: i32,
    /// Receiving node id.
    pub recver: i32,
    /// Per-sender timestamp used for correlation and de-duplication.
    pub timestamp: i32,
    /// Customer the message is routed to.
    pub customer_id: i32,
    /// Request (true) or response (false).
    pub request: bool,
    /// Push (true) or pull (false).
    pub push: bool,
    /// Set by simple request/response applications.
    pub simple_app: bool,
    /// Small opaque payload carried inside the envelope.
    pub body: Vec<u8>,
    /// Element types of the data segments, one per segment.
    pub data_type: Vec<DataType>,
    /// Control block; [`Command::Empty`] for application messages.
    pub control: Control,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            head: EMPTY,
            sender: EMPTY,
            recver: EMPTY,
            timestamp: EMPTY,
            customer_id: EMPTY,
            request: false,
            push: false,
            simple_app: false,
            body: Vec::new(),
            data_type: Vec::new(),
            control: Control::default(),
        }
    }
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}->{}]", self.sender, self.recver)?;
        if self.timestamp != EMPTY {
            write!(f, " ts={}", self.timestamp)?;
        }
        if self.customer_id != EMPTY {
            write!(f, " customer={}", self.customer_id)?;
        }
        if self.head != EMPTY {
            write!(f, " head={}", self.head)?;
        }
        write!(
            f,
            " {}",
            if self.request { "request" } else { "response" }
        )?;
        if self.push {
            f.write_str(" push")?;
        }
        if !self.control.is_empty() {
            write!(f, " cmd={:?}", self.control.cmd)?;
            match self.control.cmd {
                Command::Barrier => write!(f, " group={}", self.control.barrier_group)?,
                Command::Ack => write!(f, " sig={:#x}", self.control.msg_sig)?,
                _ => {}
            }
            for node in &self.control.node {
                write!(f, " {{{}}}", node)?;
            }
        }
        if !self.body.is_empty() {
            write!(f, " body={}B", self.body.len())?;
        }
        Ok(())
    }
}

/// A meta plus opaque data segments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Envelope.
    pub meta: Meta,
    /// Payload segments, moved intact.
    pub data: Vec<Bytes>,
}

impl Message {
    /// A control message for `recver` with `cmd`.
    pub fn control(recver: i32, cmd: Command) -> Self {
        Self {
            meta: Meta {
                recver,
                control: Control::new(cmd),
                ..Meta::default()
            },
            data: Vec::new(),
        }
    }

    /// Append a data segment and record its element type.
    pub fn add_data(&mut self, data: impl Into<Bytes>, data_type: DataType) {
        self.data.push(data.into());
        self.meta.data_type.push(data_type);
    }

    /// True for messages the van handles itself.
    pub fn is_control(&self) -> bool {
        !self.meta.control.is_empty()
    }

    /// Total size of the data segments in bytes.
    pub fn data_len(&self) -> usize {
        self.data.iter().map(Bytes::len).sum()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.meta)?;
        if !self.data.is_empty() {
            write!(f, " data={}x{}B", self.data.len(), self.data_len())?;
        }
        Ok(())
    }
}
