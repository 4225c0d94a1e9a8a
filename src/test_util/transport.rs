use std::fmt::{Debug, Formatter};

use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashSet;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::messaging::codec::{ChecksumCodec, PacketCodec};
use crate::messaging::packet::Packet;
use crate::messaging::peer_addr::PeerAddr;
use crate::messaging::transport::Transport;

#[derive(Clone, Debug)]
pub struct SentDatagram {
    pub at: Instant,
    pub to: PeerAddr,
    pub packet: Packet,
}

/// A [Transport] that decodes and records every datagram it is asked to send, and fails sending
///  to peers that were marked as unreachable.
#[derive(Default)]
pub struct RecordingTransport {
    codec: ChecksumCodec,
    sent: RwLock<Vec<SentDatagram>>,
    failed: RwLock<Vec<SentDatagram>>,
    unreachable: RwLock<FxHashSet<PeerAddr>>,
}
impl Debug for RecordingTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecordingTransport")
    }
}

impl RecordingTransport {
    pub fn new() -> RecordingTransport {
        Default::default()
    }

    /// sending to this peer fails from now on
    pub async fn fail_for(&self, peer: PeerAddr) {
        self.unreachable.write().await.insert(peer);
    }

    pub async fn sent(&self) -> Vec<SentDatagram> {
        self.sent.read().await.clone()
    }

    pub async fn sent_packets(&self) -> Vec<(PeerAddr, Packet)> {
        self.sent.read().await
            .iter()
            .map(|d| (d.to.clone(), d.packet.clone()))
            .collect()
    }

    pub async fn failed(&self) -> Vec<SentDatagram> {
        self.failed.read().await.clone()
    }

    /// checks and removes the oldest recorded datagram
    pub async fn assert_packet_sent(&self, to: &PeerAddr, packet: &Packet) {
        let mut sent = self.sent.write().await;
        if sent.is_empty() {
            panic!("no packet was sent");
        }

        let actual = sent.remove(0);
        assert_eq!(&actual.to, to);
        assert_eq!(&actual.packet, packet);
    }

    pub async fn assert_no_remaining_packets(&self) {
        let sent = self.sent.read().await;
        assert!(sent.is_empty(), "unexpected packets: {:?}", sent);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, to: &PeerAddr, buf: &[u8]) -> anyhow::Result<()> {
        let datagram = SentDatagram {
            at: Instant::now(),
            to: to.clone(),
            packet: self.codec.decode(buf)?,
        };

        if self.unreachable.read().await.contains(to) {
            self.failed.write().await.push(datagram);
            bail!("peer {:?} is unreachable", to);
        }

        self.sent.write().await.push(datagram);
        Ok(())
    }
}
