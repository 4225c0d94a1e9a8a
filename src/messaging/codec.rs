use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use crc::Crc;

use crate::messaging::packet::Packet;

/// A [PacketCodec] turns packets into the raw bytes handed to the transport and back. It is the
///  place for integrity checks and signatures: `decode` must only return packets that passed
///  verification.
///
/// NB: Decoding is done on untrusted input from arbitrary peers. Implementations must fail
///      gracefully on garbage rather than panic.
pub trait PacketCodec: Send + Sync + 'static {
    fn encode(&self, packet: &Packet) -> BytesMut;

    fn decode(&self, buf: &[u8]) -> anyhow::Result<Packet>;
}


#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u64);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}
impl Checksum {
    pub fn new(packet_buf: &[u8]) -> Checksum {
        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        let mut digest = hasher.digest();
        digest.update(packet_buf);
        Checksum(digest.finalize())
    }
}


/// The default codec protects packets against corruption on the wire (but not against tampering,
///  which is the transport's business):
///
/// ```ascii
/// 0: protocol version (u8)
/// 1: CRC-64 checksum of the serialized packet (u64 BE)
/// 9: serialized packet
/// ```
#[derive(Debug, Default)]
pub struct ChecksumCodec {}

impl ChecksumCodec {
    pub const PROTOCOL_VERSION: u8 = 4;
    const ENVELOPE_LEN: usize = size_of::<u8>() + size_of::<u64>();
}

impl PacketCodec for ChecksumCodec {
    fn encode(&self, packet: &Packet) -> BytesMut {
        let mut packet_buf = BytesMut::with_capacity(packet.size());
        packet.ser(&mut packet_buf);

        let mut buf = BytesMut::with_capacity(Self::ENVELOPE_LEN + packet_buf.len());
        buf.put_u8(Self::PROTOCOL_VERSION);
        buf.put_u64(Checksum::new(&packet_buf).0);
        buf.extend_from_slice(&packet_buf);
        buf
    }

    fn decode(&self, buf: &[u8]) -> anyhow::Result<Packet> {
        let mut buf = buf;
        if buf.remaining() < Self::ENVELOPE_LEN {
            bail!("datagram is shorter than envelope size: {} < {} bytes", buf.remaining(), Self::ENVELOPE_LEN);
        }

        let version = buf.get_u8();
        if version != Self::PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", version);
        }

        let checksum = Checksum(buf.get_u64());
        let actual_checksum = Checksum::new(buf);
        if checksum != actual_checksum {
            bail!("checksum error: expected {:?}, was {:?}", checksum, actual_checksum);
        }

        Packet::try_deser(&mut buf)
    }
}
