use std::fmt::{Debug, Formatter};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::messaging::correlation_id::CorrelationId;

/// Outcome reported by a peer in a response packet.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    GeneralError = 1,
    NoDataFound = 2,
    InvalidPacket = 3,
    InvalidHashcash = 4,
    InsufficientHashcash = 5,
    NoDiskSpace = 6,
}

#[derive(Clone, Eq, PartialEq, Hash)]
pub enum PacketKind {
    /// A plain data packet. The type code is opaque here, it is interpreted by the application.
    Data {
        type_code: u8,
        payload: Bytes,
    },
    /// A response to a request. The response's correlation id is the id of the request it
    ///  answers.
    Response {
        status: StatusCode,
        payload: Bytes,
    },
}

/// A [Packet] is an immutable, already verified unit of application data. The messaging layer
///  only looks at its correlation id, its serialized size and whether it is a response.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Packet {
    pub id: CorrelationId,
    pub kind: PacketKind,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PacketKind::Data { type_code, payload } => write!(f, "Data{{id:{:?},type:{},len:{}}}", self.id, type_code, payload.len()),
            PacketKind::Response { status, payload } => write!(f, "Response{{id:{:?},status:{:?},len:{}}}", self.id, status, payload.len()),
        }
    }
}

impl Packet {
    const KIND_DATA: u8 = b'D';
    const KIND_RESPONSE: u8 = b'N';
    const HEADER_LEN: usize = 1 + CorrelationId::LEN + 1;

    pub fn data(id: CorrelationId, type_code: u8, payload: impl Into<Bytes>) -> Packet {
        Packet {
            id,
            kind: PacketKind::Data { type_code, payload: payload.into() },
        }
    }

    pub fn response(request_id: CorrelationId, status: StatusCode, payload: impl Into<Bytes>) -> Packet {
        Packet {
            id: request_id,
            kind: PacketKind::Response { status, payload: payload.into() },
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self.kind, PacketKind::Response { .. })
    }

    pub fn status(&self) -> Option<StatusCode> {
        match &self.kind {
            PacketKind::Data { .. } => None,
            PacketKind::Response { status, .. } => Some(*status),
        }
    }

    pub fn payload(&self) -> &Bytes {
        match &self.kind {
            PacketKind::Data { payload, .. } => payload,
            PacketKind::Response { payload, .. } => payload,
        }
    }

    /// the number of bytes [Packet::ser] writes
    pub fn size(&self) -> usize {
        Self::HEADER_LEN + self.payload().len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match &self.kind {
            PacketKind::Data { type_code, payload } => {
                buf.put_u8(Self::KIND_DATA);
                buf.put_slice(self.id.as_bytes());
                buf.put_u8(*type_code);
                buf.put_slice(payload);
            }
            PacketKind::Response { status, payload } => {
                buf.put_u8(Self::KIND_RESPONSE);
                buf.put_slice(self.id.as_bytes());
                buf.put_u8((*status).into());
                buf.put_slice(payload);
            }
        }
    }

    /// The payload extends to the end of the buffer, so this consumes the entire buffer
    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        if buf.remaining() < Self::HEADER_LEN {
            bail!("packet is shorter than packet header: {} < {} bytes", buf.remaining(), Self::HEADER_LEN);
        }

        let kind = buf.get_u8();

        let mut raw_id = [0u8; CorrelationId::LEN];
        buf.copy_to_slice(&mut raw_id);
        let id = CorrelationId::from_raw(raw_id);

        match kind {
            Self::KIND_DATA => {
                let type_code = buf.get_u8();
                let payload = buf.copy_to_bytes(buf.remaining());
                Ok(Packet::data(id, type_code, payload))
            }
            Self::KIND_RESPONSE => {
                let raw_status = buf.get_u8();
                let status = StatusCode::try_from(raw_status)
                    .map_err(|_| anyhow!("invalid status code {}", raw_status))?;
                let payload = buf.copy_to_bytes(buf.remaining());
                Ok(Packet::response(id, status, payload))
            }
            other => Err(anyhow!("unknown packet kind {:?}", other as char)),
        }
    }
}
