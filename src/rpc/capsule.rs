//! Fixed-size wire message exchanged by requests and replies.
//!
//! Layout (byte order chosen by the sender, detected by the receiver from the
//! magic):
//!
//! ```text
//!  0  magic    u32
//!  4  version  u32
//!  8  type     u32
//! 12  request: reply_id u64 | bulk_id u64 | payload[32]
//!     reply:   status u32   | payload[32]
//! ```
use crate::rpc::rpc_common::{RpcError, Result, SERVICE_PING};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

pub const MSG_MAGIC: u32 = 0xeeb0f00d;
pub const MSG_VERSION: u32 = 1;
pub const MSG_SIZE: usize = 64;
pub const PAYLOAD_SIZE: usize = 32;

const HEADER_SIZE: usize = 12;
const REQUEST_PAYLOAD_OFFSET: usize = HEADER_SIZE + 16;
const REPLY_PAYLOAD_OFFSET: usize = HEADER_SIZE + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireOrder {
    #[default]
    Native,
    Little,
    Big,
}

impl WireOrder {
    /// Collapses `Native` into the concrete order of this host.
    pub fn resolve(self) -> WireOrder {
        match self {
            WireOrder::Native if cfg!(target_endian = "little") => WireOrder::Little,
            WireOrder::Native => WireOrder::Big,
            other => other,
        }
    }

    pub fn is_foreign(self) -> bool {
        self.resolve() != WireOrder::Native.resolve()
    }
}

#[inline]
pub fn service_request_type(service: u32) -> u32 {
    service * 2
}

#[inline]
pub fn service_reply_type(service: u32) -> u32 {
    service * 2 + 1
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Empty,
    PingRequest {
        magic: u32,
        seq: u32,
        time_sec: u64,
        time_usec: u64,
    },
    PingReply {
        magic: u32,
        seq: u32,
    },
    /// Opaque service bytes, never swapped.
    Raw([u8; PAYLOAD_SIZE]),
}

impl Payload {
    fn encode<B: ByteOrder>(&self, buf: &mut [u8]) {
        buf.fill(0);
        match self {
            Payload::Empty => {}
            Payload::PingRequest { magic, seq, time_sec, time_usec } => {
                B::write_u32(&mut buf[0..4], *magic);
                B::write_u32(&mut buf[4..8], *seq);
                B::write_u64(&mut buf[8..16], *time_sec);
                B::write_u64(&mut buf[16..24], *time_usec);
            }
            Payload::PingReply { magic, seq } => {
                B::write_u32(&mut buf[0..4], *magic);
                B::write_u32(&mut buf[4..8], *seq);
            }
            Payload::Raw(raw) => buf.copy_from_slice(raw),
        }
    }

    fn decode<B: ByteOrder>(msg_type: u32, buf: &[u8]) -> Payload {
        if msg_type == service_request_type(SERVICE_PING) {
            return Payload::PingRequest {
                magic: B::read_u32(&buf[0..4]),
                seq: B::read_u32(&buf[4..8]),
                time_sec: B::read_u64(&buf[8..16]),
                time_usec: B::read_u64(&buf[16..24]),
            };
        }
        if msg_type == service_reply_type(SERVICE_PING) {
            return Payload::PingReply {
                magic: B::read_u32(&buf[0..4]),
                seq: B::read_u32(&buf[4..8]),
            };
        }
        if buf.iter().all(|b| *b == 0) {
            return Payload::Empty;
        }
        let mut raw = [0u8; PAYLOAD_SIZE];
        raw.copy_from_slice(buf);
        Payload::Raw(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgBody {
    Request {
        reply_id: u64,
        bulk_id: u64,
        payload: Payload,
    },
    Reply {
        status: u32,
        payload: Payload,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrpcMsg {
    pub magic: u32,
    pub version: u32,
    pub msg_type: u32,
    pub body: MsgBody,
}

/// Framing fields of an inbound message, already in host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub version: u32,
    pub msg_type: u32,
    pub order: WireOrder,
}

impl MsgHeader {
    pub fn swapped(&self) -> bool {
        self.order.is_foreign()
    }
}

pub fn decode_header(buf: &[u8]) -> Result<MsgHeader> {
    if buf.len() < HEADER_SIZE {
        return Err(RpcError::Protocol(format!("short message: {} bytes", buf.len())));
    }
    let order = if LittleEndian::read_u32(&buf[0..4]) == MSG_MAGIC {
        WireOrder::Little
    } else if BigEndian::read_u32(&buf[0..4]) == MSG_MAGIC {
        WireOrder::Big
    } else {
        return Err(RpcError::Protocol(format!(
            "bad magic {:#x}",
            LittleEndian::read_u32(&buf[0..4])
        )));
    };
    let (version, msg_type) = match order {
        WireOrder::Big => (BigEndian::read_u32(&buf[4..8]), BigEndian::read_u32(&buf[8..12])),
        _ => (LittleEndian::read_u32(&buf[4..8]), LittleEndian::read_u32(&buf[8..12])),
    };
    Ok(MsgHeader { version, msg_type, order })
}

impl SrpcMsg {
    pub fn request(service: u32, payload: Payload) -> Self {
        SrpcMsg {
            magic: MSG_MAGIC,
            version: MSG_VERSION,
            msg_type: service_request_type(service),
            body: MsgBody::Request { reply_id: 0, bulk_id: 0, payload },
        }
    }

    pub fn reply(service: u32, status: u32, payload: Payload) -> Self {
        SrpcMsg {
            magic: MSG_MAGIC,
            version: MSG_VERSION,
            msg_type: service_reply_type(service),
            body: MsgBody::Reply { status, payload },
        }
    }

    pub fn payload(&self) -> &Payload {
        match &self.body {
            MsgBody::Request { payload, .. } | MsgBody::Reply { payload, .. } => payload,
        }
    }

    pub fn encode(&self, order: WireOrder, buf: &mut [u8]) -> Result<()> {
        if buf.len() < MSG_SIZE {
            return Err(RpcError::InvalidArgument(format!(
                "message buffer of {} bytes, need {}",
                buf.len(),
                MSG_SIZE
            )));
        }
        match order.resolve() {
            WireOrder::Big => self.encode_with::<BigEndian>(&mut buf[..MSG_SIZE]),
            _ => self.encode_with::<LittleEndian>(&mut buf[..MSG_SIZE]),
        }
        Ok(())
    }

    fn encode_with<B: ByteOrder>(&self, buf: &mut [u8]) {
        buf.fill(0);
        B::write_u32(&mut buf[0..4], self.magic);
        B::write_u32(&mut buf[4..8], self.version);
        B::write_u32(&mut buf[8..12], self.msg_type);
        match &self.body {
            MsgBody::Request { reply_id, bulk_id, payload } => {
                B::write_u64(&mut buf[12..20], *reply_id);
                B::write_u64(&mut buf[20..28], *bulk_id);
                payload.encode::<B>(&mut buf[REQUEST_PAYLOAD_OFFSET..REQUEST_PAYLOAD_OFFSET + PAYLOAD_SIZE]);
            }
            MsgBody::Reply { status, payload } => {
                B::write_u32(&mut buf[12..16], *status);
                payload.encode::<B>(&mut buf[REPLY_PAYLOAD_OFFSET..REPLY_PAYLOAD_OFFSET + PAYLOAD_SIZE]);
            }
        }
    }

    /// Decodes a message in whichever byte order its magic reveals. Every
    /// field of the result is in host order.
    pub fn decode(buf: &[u8]) -> Result<SrpcMsg> {
        if buf.len() < MSG_SIZE {
            return Err(RpcError::Protocol(format!("short message: {} bytes", buf.len())));
        }
        let header = decode_header(buf)?;
        let msg = match header.order {
            WireOrder::Big => Self::decode_with::<BigEndian>(&header, buf),
            _ => Self::decode_with::<LittleEndian>(&header, buf),
        };
        Ok(msg)
    }

    fn decode_with<B: ByteOrder>(header: &MsgHeader, buf: &[u8]) -> SrpcMsg {
        // even types are requests
        let body = if header.msg_type % 2 == 0 {
            MsgBody::Request {
                reply_id: B::read_u64(&buf[12..20]),
                bulk_id: B::read_u64(&buf[20..28]),
                payload: Payload::decode::<B>(
                    header.msg_type,
                    &buf[REQUEST_PAYLOAD_OFFSET..REQUEST_PAYLOAD_OFFSET + PAYLOAD_SIZE],
                ),
            }
        } else {
            MsgBody::Reply {
                status: B::read_u32(&buf[12..16]),
                payload: Payload::decode::<B>(
                    header.msg_type,
                    &buf[REPLY_PAYLOAD_OFFSET..REPLY_PAYLOAD_OFFSET + PAYLOAD_SIZE],
                ),
            }
        };
        SrpcMsg {
            magic: MSG_MAGIC,
            version: header.version,
            msg_type: header.msg_type,
            body,
        }
    }
}
