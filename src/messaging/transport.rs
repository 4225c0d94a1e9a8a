use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::time::Instant;

use crate::messaging::peer_addr::PeerAddr;

/// The raw datagram transport (e.g. an anonymous overlay network session) that this crate sits
///  on. Datagrams may be lost, duplicated or reordered, so `Ok` only means that the transport
///  accepted the datagram.
///
/// Only the send queue's drain loop calls `send`, so implementations never see concurrent sends.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, to: &PeerAddr, buf: &[u8]) -> anyhow::Result<()>;
}


/// This trait decouples the transport (different strategies) from the handling of a datagram
///  once it is received.
///
/// It is passed to transports as an `Arc<dyn ...>`, and transports may call it from their own
///  tasks, concurrently with everything else.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, buf: &[u8], sender: PeerAddr, receive_time: Instant);
}
