//! Sparse protobuf encoding of [`Meta`].
//!
//! Sentinel values ([`EMPTY`] ids and timestamps, empty bodies) are left out
//! of the encoded form and restored on decode, which keeps heartbeats and
//! acks to a handful of bytes.

use prost::Message as ProstMessage;

use super::{Command, Control, DataType, Meta, Node, Role, EMPTY};
use crate::wire::WireError;

#[derive(Clone, PartialEq, prost::Message)]
struct PbNode {
    #[prost(int32, tag = "1")]
    role: i32,
    #[prost(int32, optional, tag = "2")]
    id: Option<i32>,
    #[prost(string, tag = "3")]
    hostname: String,
    #[prost(uint32, tag = "4")]
    port: u32,
    #[prost(bool, tag = "5")]
    is_recovery: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
struct PbControl {
    #[prost(int32, tag = "1")]
    cmd: i32,
    #[prost(message, repeated, tag = "2")]
    node: Vec<PbNode>,
    #[prost(int32, optional, tag = "3")]
    barrier_group: Option<i32>,
    #[prost(uint64, optional, tag = "4")]
    msg_sig: Option<u64>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct PbMeta {
    #[prost(int32, optional, tag = "1")]
    head: Option<i32>,
    #[prost(bytes = "vec", tag = "2")]
    body: Vec<u8>,
    #[prost(int32, repeated, tag = "3")]
    data_type: Vec<i32>,
    #[prost(message, optional, tag = "4")]
    control: Option<PbControl>,
    #[prost(bool, tag = "5")]
    request: bool,
    #[prost(int32, optional, tag = "6")]
    customer_id: Option<i32>,
    #[prost(int32, optional, tag = "7")]
    timestamp: Option<i32>,
    #[prost(bool, tag = "8")]
    push: bool,
    #[prost(bool, tag = "9")]
    simple_app: bool,
    #[prost(int32, optional, tag = "10")]
    sender: Option<i32>,
    #[prost(int32, optional, tag = "11")]
    recver: Option<i32>,
}

fn present(value: i32) -> Option<i32> {
    (value != EMPTY).then_some(value)
}

fn pack_node(node: &Node) -> PbNode {
    PbNode {
        role: node.role.as_i32(),
        id: present(node.id),
        hostname: node.hostname.clone(),
        port: u32::from(node.port),
        is_recovery: node.is_recovery,
    }
}

fn unpack_node(pb: PbNode) -> Result<Node, WireError> {
    let role = Role::from_i32(pb.role).ok_or(WireError::InvalidField {
        field: "node.role",
        value: i64::from(pb.role),
    })?;
    let port = u16::try_from(pb.port).map_err(|_| WireError::InvalidField {
        field: "node.port",
        value: i64::from(pb.port),
    })?;
    Ok(Node {
        id: pb.id.unwrap_or(EMPTY),
        role,
        hostname: pb.hostname,
        port,
        is_recovery: pb.is_recovery,
    })
}

/// Encode a meta into its sparse protobuf form.
pub fn pack_meta(meta: &Meta) -> Vec<u8> {
    let control = (!meta.control.is_empty()).then(|| {
        let ctrl = &meta.control;
        PbControl {
            cmd: ctrl.cmd.as_i32(),
            node: ctrl.node.iter().map(pack_node).collect(),
            barrier_group: (ctrl.cmd == Command::Barrier).then_some(ctrl.barrier_group),
            msg_sig: (ctrl.cmd == Command::Ack).then_some(ctrl.msg_sig),
        }
    });

    let pb = PbMeta {
        head: present(meta.head),
        body: meta.body.clone(),
        data_type: meta.data_type.iter().map(|d| d.as_i32()).collect(),
        control,
        request: meta.request,
        customer_id: present(meta.customer_id),
        timestamp: present(meta.timestamp),
        push: meta.push,
        simple_app: meta.simple_app,
        sender: present(meta.sender),
        recver: present(meta.recver),
    };
    pb.encode_to_vec()
}

/// Decode a meta, restoring sentinels for absent fields.
///
/// # Errors
///
/// Returns [`WireError::MalformedMeta`] when the bytes are not a valid
/// encoding and [`WireError::InvalidField`] for unknown roles or commands.
pub fn unpack_meta(buf: &[u8]) -> Result<Meta, WireError> {
    let pb = PbMeta::decode(buf).map_err(|e| WireError::MalformedMeta {
        message: e.to_string(),
    })?;

    let control = match pb.control {
        Some(ctrl) => {
            let cmd = Command::from_i32(ctrl.cmd).ok_or(WireError::InvalidField {
                field: "control.cmd",
                value: i64::from(ctrl.cmd),
            })?;
            Control {
                cmd,
                node: ctrl
                    .node
                    .into_iter()
                    .map(unpack_node)
                    .collect::<Result<_, _>>()?,
                barrier_group: ctrl.barrier_group.unwrap_or(0),
                msg_sig: ctrl.msg_sig.unwrap_or(0),
            }
        }
        None => Control::default(),
    };

    Ok(Meta {
        head: pb.head.unwrap_or(EMPTY),
        sender: pb.sender.unwrap_or(EMPTY),
        recver: pb.recver.unwrap_or(EMPTY),
        timestamp: pb.timestamp.unwrap_or(EMPTY),
        customer_id: pb.customer_id.unwrap_or(EMPTY),
        request: pb.request,
        push: pb.push,
        simple_app: pb.simple_app,
        body: pb.body,
        data_type: pb.data_type.into_iter().map(DataType::from_i32).collect(),
        control,
    })
}
