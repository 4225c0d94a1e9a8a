use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::messaging::codec::PacketCodec;
use crate::messaging::packet::Packet;
use crate::messaging::peer_addr::PeerAddr;
use crate::messaging::transport::MessageHandler;
use crate::util::listener_registry::{ListenerId, ListenerRegistry};

/// Datagrams of this size or bigger are dropped without looking at them
pub const MAX_DATAGRAM_SIZE: usize = 31 * 1024;

/// Application code registers [PacketListener]s with a [PacketDispatcher] to be notified of
///  every packet that is received.
///
/// This is a blocking call, holding up the dispatching task (and all listeners after this
///  one). Non-trivial work should be offloaded to some asynchronous processing, but it is up to
///  the listener implementation to decide and do this.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketListener: Send + Sync + 'static {
    async fn packet_received(&self, packet: &Packet, sender: &PeerAddr, receive_time: Instant);
}


/// The [PacketDispatcher] is the inbound side of the messaging layer: transports hand it raw
///  datagrams, it verifies and parses them, and passes the resulting packets to all registered
///  listeners.
///
/// Received garbage is logged and dropped. The network is unreliable and potentially hostile,
///  so there is no one to report it to.
pub struct PacketDispatcher {
    codec: Arc<dyn PacketCodec>,
    listeners: ListenerRegistry<dyn PacketListener>,
}
impl Debug for PacketDispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PacketDispatcher{{listeners:{}}}", self.listeners.len())
    }
}

impl PacketDispatcher {
    pub fn new(codec: Arc<dyn PacketCodec>) -> PacketDispatcher {
        PacketDispatcher {
            codec,
            listeners: Default::default(),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn PacketListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let was_registered = self.listeners.remove(id);
        if !was_registered {
            debug!("removing packet listener {:?} that is not registered - ignoring", id);
        }
        was_registered
    }

    /// passes an already decoded packet to all listeners, in registration order
    pub async fn dispatch(&self, packet: &Packet, sender: &PeerAddr, receive_time: Instant) {
        trace!(?packet, ?sender, "dispatching packet");

        for listener in self.listeners.snapshot() {
            listener.packet_received(packet, sender, receive_time).await;
        }
    }
}

#[async_trait]
impl MessageHandler for PacketDispatcher {
    async fn handle_message(&self, buf: &[u8], sender: PeerAddr, receive_time: Instant) {
        trace!("received datagram from {:?}: {} bytes", sender, buf.len());

        if buf.len() >= MAX_DATAGRAM_SIZE {
            warn!("received a datagram exceeding max datagram size of {} bytes from {:?} - skipping", MAX_DATAGRAM_SIZE, sender);
            return;
        }

        match self.codec.decode(buf) {
            Ok(packet) => self.dispatch(&packet, &sender, receive_time).await,
            Err(e) => {
                warn!("received an invalid datagram from {:?} - discarding: {}", sender, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use mockall::predicate::eq;
    use crate::messaging::codec::ChecksumCodec;
    use crate::messaging::correlation_id::CorrelationId;
    use crate::test_util::peer::test_peer_addr;
    use super::*;

    struct RecordingListener {
        name: &'static str,
        log: Arc<Mutex<Vec<(&'static str, Packet, PeerAddr)>>>,
    }
    #[async_trait]
    impl PacketListener for RecordingListener {
        async fn packet_received(&self, packet: &Packet, sender: &PeerAddr, _receive_time: Instant) {
            self.log.lock().unwrap()
                .push((self.name, packet.clone(), sender.clone()));
        }
    }

    fn dispatcher() -> PacketDispatcher {
        PacketDispatcher::new(Arc::new(ChecksumCodec::default()))
    }

    fn encoded(packet: &Packet) -> Vec<u8> {
        ChecksumCodec::default().encode(packet).to_vec()
    }

    #[tokio::test]
    async fn test_listeners_are_called_in_registration_order() {
        let dispatcher = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            dispatcher.add_listener(Arc::new(RecordingListener { name, log: log.clone() }));
        }

        let packet = Packet::data(CorrelationId::from_u8(1), 3, &b"abc"[..]);
        dispatcher.handle_message(&encoded(&packet), test_peer_addr(5), Instant::now()).await;

        let log = log.lock().unwrap();
        assert_eq!(log.iter().map(|(name, _, _)| *name).collect::<Vec<_>>(), vec!["a", "b", "c"]);
        for (_, p, sender) in log.iter() {
            assert_eq!(p, &packet);
            assert_eq!(sender, &test_peer_addr(5));
        }
    }

    #[tokio::test]
    async fn test_removed_listener_is_not_called() {
        let dispatcher = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = dispatcher.add_listener(Arc::new(RecordingListener { name: "a", log: log.clone() }));
        dispatcher.add_listener(Arc::new(RecordingListener { name: "b", log: log.clone() }));

        assert!(dispatcher.remove_listener(a));
        assert!(!dispatcher.remove_listener(a));

        let packet = Packet::data(CorrelationId::from_u8(1), 3, &b""[..]);
        dispatcher.dispatch(&packet, &test_peer_addr(1), Instant::now()).await;

        assert_eq!(log.lock().unwrap().iter().map(|(name, _, _)| *name).collect::<Vec<_>>(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_listener_receives_sender_and_receive_time() {
        let dispatcher = dispatcher();
        let packet = Packet::data(CorrelationId::from_u8(9), 1, &b"x"[..]);
        let receive_time = Instant::now();

        let mut listener = MockPacketListener::new();
        listener.expect_packet_received()
            .once()
            .with(eq(packet.clone()), eq(test_peer_addr(3)), eq(receive_time))
            .return_const(());
        dispatcher.add_listener(Arc::new(listener));

        dispatcher.handle_message(&encoded(&packet), test_peer_addr(3), receive_time).await;
    }

    #[tokio::test]
    async fn test_malformed_datagrams_are_dropped() {
        let dispatcher = dispatcher();

        let mut listener = MockPacketListener::new();
        listener.expect_packet_received()
            .never();
        dispatcher.add_listener(Arc::new(listener));

        let mut corrupted = encoded(&Packet::data(CorrelationId::from_u8(1), 1, &b"abc"[..]));
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;

        dispatcher.handle_message(&corrupted, test_peer_addr(1), Instant::now()).await;
        dispatcher.handle_message(b"", test_peer_addr(1), Instant::now()).await;
        dispatcher.handle_message(b"garbage", test_peer_addr(1), Instant::now()).await;
        dispatcher.handle_message(&vec![0u8; MAX_DATAGRAM_SIZE], test_peer_addr(1), Instant::now()).await;
    }
}
