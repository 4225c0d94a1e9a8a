use std::fmt::{Debug, Formatter};
use std::sync::{OnceLock, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::messaging::packet::Packet;
use crate::messaging::packet_batch::PacketBatch;
use crate::messaging::peer_addr::PeerAddr;
use crate::util::latch::{CountDownLatch, WaitOutcome};

/// Ordering key of the send queue's pending set. The sequence number is unique per queue, so
///  entries with the same earliest send time are distinct and are sent in submission order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct PendingKey {
    pub earliest_send_time: Instant,
    pub seq: u64,
}

/// A [ScheduledEntry] is created for every packet submitted to the send queue, and it tracks the
///  packet until it was sent and (for `send_and_wait`) until a response arrived.
///
/// The entry does not own its batch: it only holds a weak reference for signalling send
///  progress, and the batch may be gone by the time the entry is sent.
pub struct ScheduledEntry {
    pub packet: Packet,
    pub destination: PeerAddr,
    pub earliest_send_time: Instant,
    batch: Option<Weak<PacketBatch>>,
    awaits_response: bool,
    abandoned: AtomicBool,
    sent_at: OnceLock<Instant>,
    response_at: OnceLock<Instant>,
    response: OnceLock<Packet>,
    sent_signal: CountDownLatch,
    response_signal: CountDownLatch,
}
impl Debug for ScheduledEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScheduledEntry{{packet:{:?},to:{:?}}}", self.packet, self.destination)
    }
}

impl ScheduledEntry {
    pub fn new(packet: Packet, destination: PeerAddr, earliest_send_time: Instant) -> ScheduledEntry {
        ScheduledEntry {
            packet,
            destination,
            earliest_send_time,
            batch: None,
            awaits_response: false,
            abandoned: AtomicBool::new(false),
            sent_at: OnceLock::new(),
            response_at: OnceLock::new(),
            response: OnceLock::new(),
            sent_signal: CountDownLatch::new(1),
            response_signal: CountDownLatch::new(1),
        }
    }

    pub fn for_batch(packet: Packet, destination: PeerAddr, earliest_send_time: Instant, batch: Weak<PacketBatch>) -> ScheduledEntry {
        ScheduledEntry {
            batch: Some(batch),
            ..Self::new(packet, destination, earliest_send_time)
        }
    }

    /// an entry for `send_and_wait`: the send queue registers it for response correlation when
    ///  it is sent
    pub fn awaiting_response(packet: Packet, destination: PeerAddr, earliest_send_time: Instant) -> ScheduledEntry {
        ScheduledEntry {
            awaits_response: true,
            ..Self::new(packet, destination, earliest_send_time)
        }
    }

    pub fn batch(&self) -> Option<&Weak<PacketBatch>> {
        self.batch.as_ref()
    }

    /// `true` if a response should be correlated to this entry once it is sent, i.e. it was
    ///  submitted by `send_and_wait` and the caller did not give up waiting
    pub fn is_awaiting_response(&self) -> bool {
        self.awaits_response && !self.is_abandoned()
    }

    pub fn awaits_response(&self) -> bool {
        self.awaits_response
    }

    /// the submitter stopped waiting, so the entry should not be sent any more
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    /// stamps the time at which the packet is handed to the transport
    pub fn mark_sent(&self, now: Instant) {
        let _ = self.sent_at.set(now);
    }

    pub fn on_sent(&self) {
        self.sent_signal.count_down();
    }

    /// the entry will never be sent (transport failure or shutdown)
    pub fn on_dropped(&self) {
        self.sent_signal.abort();
        self.response_signal.abort();
    }

    /// releases response waiters without a response
    pub fn abort_response(&self) {
        self.response_signal.abort();
    }

    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at.get().copied()
    }

    pub fn response_at(&self) -> Option<Instant> {
        self.response_at.get().copied()
    }

    pub fn response(&self) -> Option<&Packet> {
        self.response.get()
    }

    /// Attaches a response and releases the response signal. This happens at most once per
    ///  entry and only after the entry was sent; the return value indicates whether the response
    ///  was accepted.
    pub fn set_response(&self, response: Packet, now: Instant) -> bool {
        if self.sent_at.get().is_none() {
            return false;
        }
        if self.response.set(response).is_err() {
            return false;
        }
        let _ = self.response_at.set(now);
        self.response_signal.count_down();
        true
    }

    pub async fn await_sending(&self, timeout: Duration) -> WaitOutcome {
        self.sent_signal.wait_timeout(timeout).await
    }

    pub async fn await_response(&self, timeout: Duration) -> WaitOutcome {
        self.response_signal.wait_timeout(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use crate::messaging::correlation_id::CorrelationId;
    use crate::messaging::packet::StatusCode;
    use crate::test_util::peer::test_peer_addr;
    use super::*;

    fn entry() -> ScheduledEntry {
        ScheduledEntry::awaiting_response(
            Packet::data(CorrelationId::from_u8(1), 0, &b"req"[..]),
            test_peer_addr(1),
            Instant::now(),
        )
    }

    fn response() -> Packet {
        Packet::response(CorrelationId::from_u8(1), StatusCode::Ok, &b"resp"[..])
    }

    #[test]
    fn test_pending_key_order() {
        let now = Instant::now();
        let a = PendingKey { earliest_send_time: now, seq: 5 };
        let b = PendingKey { earliest_send_time: now, seq: 6 };
        let c = PendingKey { earliest_send_time: now + Duration::from_millis(1), seq: 1 };
        assert!(a < b);
        assert!(b < c);
        assert_ne!(a, b);
    }

    #[test]
    fn test_response_requires_sent() {
        let entry = entry();
        assert!(!entry.set_response(response(), Instant::now()));
        assert!(entry.response().is_none());
        assert!(entry.response_at().is_none());

        entry.mark_sent(Instant::now());
        assert!(entry.set_response(response(), Instant::now()));
        assert_eq!(entry.response(), Some(&response()));
        assert!(entry.response_at().is_some());
    }

    #[test]
    fn test_response_is_set_at_most_once() {
        let entry = entry();
        entry.mark_sent(Instant::now());

        assert!(entry.set_response(response(), Instant::now()));
        let other = Packet::response(CorrelationId::from_u8(1), StatusCode::GeneralError, &b""[..]);
        assert!(!entry.set_response(other, Instant::now()));
        assert_eq!(entry.response(), Some(&response()));
    }

    #[test]
    fn test_abandon() {
        let entry = entry();
        assert!(entry.is_awaiting_response());
        entry.abandon();
        assert!(!entry.is_awaiting_response());
        assert!(entry.is_abandoned());
        assert!(entry.awaits_response());

        let fire_and_forget = ScheduledEntry::new(response(), test_peer_addr(2), Instant::now());
        assert!(!fire_and_forget.is_awaiting_response());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signals() {
        let entry = entry();
        assert_eq!(entry.await_sending(Duration::from_millis(10)).await, WaitOutcome::TimedOut);

        entry.mark_sent(Instant::now());
        entry.on_sent();
        assert_eq!(entry.await_sending(Duration::from_millis(10)).await, WaitOutcome::Released);

        entry.set_response(response(), Instant::now());
        assert_eq!(entry.await_response(Duration::from_millis(10)).await, WaitOutcome::Released);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_entry_releases_waiters() {
        let entry = entry();
        entry.on_dropped();
        assert_eq!(entry.await_sending(Duration::from_secs(10)).await, WaitOutcome::Aborted);
        assert_eq!(entry.await_response(Duration::from_secs(10)).await, WaitOutcome::Aborted);
    }
}
