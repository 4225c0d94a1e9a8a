use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::messaging::correlation_id::CorrelationId;
use crate::messaging::packet::Packet;
use crate::messaging::peer_addr::PeerAddr;
use crate::util::latch::{CountDownLatch, WaitOutcome};

pub const DEFAULT_SEND_COMPLETION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BatchId(u64);
impl BatchId {
    fn next() -> BatchId {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        BatchId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchMember {
    pub packet: Packet,
    pub destination: PeerAddr,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BatchState {
    /// members can be added
    Created,
    /// handed to the send queue, nothing sent yet
    Submitted,
    /// some but not all members have left the send queue
    Draining,
    /// all members have left the send queue (successfully or not)
    FullySent,
}

struct BatchInner {
    outgoing: FxHashMap<CorrelationId, BatchMember>,
    responses: Vec<(PeerAddr, Packet)>,
    submitted: bool,
}


/// A [PacketBatch] groups the requests of one logical fan-out operation (e.g. "ask these k peers
///  for a value"): it is filled with packets, handed to the send queue as a whole, and provides
///  aggregate signals for "all packets were sent" and "at least one response arrived".
///
/// Responses are attributed to the batch until the caller removes the batch from the send
///  queue. The batch does not retry, and it does not cancel anything: removing it just stops
///  collecting responses.
pub struct PacketBatch {
    id: BatchId,
    send_completion_timeout: Duration,
    inner: RwLock<BatchInner>,
    num_sent: AtomicUsize,
    num_failed: AtomicUsize,
    sent_signal: CountDownLatch,
    first_reply_signal: CountDownLatch,
}
impl Debug for PacketBatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PacketBatch{{id:{:?}}}", self.id)
    }
}
impl Default for PacketBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketBatch {
    pub fn new() -> PacketBatch {
        Self::with_send_completion_timeout(DEFAULT_SEND_COMPLETION_TIMEOUT)
    }

    pub fn with_send_completion_timeout(send_completion_timeout: Duration) -> PacketBatch {
        PacketBatch {
            id: BatchId::next(),
            send_completion_timeout,
            inner: RwLock::new(BatchInner {
                outgoing: Default::default(),
                responses: Vec::new(),
                submitted: false,
            }),
            num_sent: AtomicUsize::new(0),
            num_failed: AtomicUsize::new(0),
            // re-armed with the number of members on submission
            sent_signal: CountDownLatch::new(1),
            first_reply_signal: CountDownLatch::new(1),
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub async fn put_packet(&self, packet: Packet, destination: PeerAddr) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if inner.submitted {
            bail!("batch {:?} was already submitted - cannot add packet {:?}", self.id, packet.id);
        }

        match inner.outgoing.entry(packet.id) {
            Entry::Occupied(_) => {
                bail!("batch {:?} already contains a packet with id {:?}", self.id, packet.id);
            }
            Entry::Vacant(e) => {
                e.insert(BatchMember { packet, destination });
                Ok(())
            }
        }
    }

    pub async fn packet_count(&self) -> usize {
        self.inner.read().await.outgoing.len()
    }

    pub async fn contains(&self, id: &CorrelationId) -> bool {
        self.inner.read().await.outgoing.contains_key(id)
    }

    pub async fn members(&self) -> Vec<BatchMember> {
        self.inner.read().await.outgoing
            .values()
            .cloned()
            .collect()
    }

    /// Freezes the batch and arms the "all sent" signal, returning the members to enqueue.
    ///  A batch can be submitted only once.
    pub(crate) async fn mark_submitted(&self) -> anyhow::Result<Vec<BatchMember>> {
        let mut inner = self.inner.write().await;
        if inner.submitted {
            bail!("batch {:?} was already submitted", self.id);
        }
        inner.submitted = true;

        self.sent_signal.reset(inner.outgoing.len());
        Ok(inner.outgoing.values().cloned().collect())
    }

    pub(crate) fn on_member_sent(&self) {
        self.num_sent.fetch_add(1, Ordering::AcqRel);
        self.sent_signal.count_down();
    }

    /// a member will never be sent - it still counts towards send completion so that waiters
    ///  are not held up until the timeout
    pub(crate) fn on_member_failed(&self) {
        self.num_failed.fetch_add(1, Ordering::AcqRel);
        self.sent_signal.count_down();
    }

    /// releases all waiters without signalling completion
    pub(crate) fn abort(&self) {
        debug!("aborting batch {:?}", self.id);
        self.sent_signal.abort();
        self.first_reply_signal.abort();
    }

    /// Records a response for one of this batch's requests, returning `false` if the response's
    ///  id does not belong to this batch. Duplicates of an already recorded response (same
    ///  packet from the same sender) are ignored.
    pub(crate) async fn add_response_packet(&self, packet: Packet, sender: PeerAddr) -> bool {
        let mut inner = self.inner.write().await;
        if !inner.outgoing.contains_key(&packet.id) {
            return false;
        }

        if inner.responses.iter().any(|(s, p)| s == &sender && p == &packet) {
            trace!("duplicate response {:?} from {:?} for batch {:?} - ignoring", packet, sender, self.id);
            return true;
        }

        trace!("batch {:?} received response {:?} from {:?}", self.id, packet, sender);
        inner.responses.push((sender, packet));
        self.first_reply_signal.count_down();
        true
    }

    pub async fn state(&self) -> BatchState {
        let inner = self.inner.read().await;
        if !inner.submitted {
            return BatchState::Created;
        }

        let num_done = self.num_sent() + self.num_failed();
        if num_done >= inner.outgoing.len() {
            BatchState::FullySent
        }
        else if num_done == 0 {
            BatchState::Submitted
        }
        else {
            BatchState::Draining
        }
    }

    pub fn num_sent(&self) -> usize {
        self.num_sent.load(Ordering::Acquire)
    }

    pub fn num_failed(&self) -> usize {
        self.num_failed.load(Ordering::Acquire)
    }

    /// waits until every member has left the send queue, bounded by the batch's send
    ///  completion timeout. Returns `true` if that happened in time.
    pub async fn await_send_completion(&self) -> bool {
        self.await_send_completion_within(self.send_completion_timeout).await
    }

    pub async fn await_send_completion_within(&self, timeout: Duration) -> bool {
        self.sent_signal.wait_timeout(timeout).await == WaitOutcome::Released
    }

    /// waits until at least one response arrived, returning `true` if that happened in time
    pub async fn await_first_reply(&self, timeout: Duration) -> bool {
        self.first_reply_signal.wait_timeout(timeout).await == WaitOutcome::Released
    }

    pub async fn has_reply(&self) -> bool {
        !self.inner.read().await.responses.is_empty()
    }

    /// snapshot of the responses received so far, in order of arrival
    pub async fn response_packets(&self) -> Vec<Packet> {
        self.inner.read().await.responses
            .iter()
            .map(|(_, packet)| packet.clone())
            .collect()
    }

    /// like [PacketBatch::response_packets], with each response's sender
    pub async fn responses(&self) -> Vec<(PeerAddr, Packet)> {
        self.inner.read().await.responses.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use rstest::rstest;
    use tokio::time;
    use tokio::time::Instant;
    use crate::messaging::packet::StatusCode;
    use crate::test_util::packet::{test_request, test_response};
    use crate::test_util::peer::test_peer_addr;
    use super::*;

    async fn batch_with(ids: &[u8]) -> PacketBatch {
        let batch = PacketBatch::new();
        for &id in ids {
            batch.put_packet(test_request(id), test_peer_addr(id.into())).await.unwrap();
        }
        batch
    }

    #[tokio::test]
    async fn test_put_packet() {
        let batch = batch_with(&[1, 2, 3]).await;

        assert_eq!(batch.packet_count().await, 3);
        assert!(batch.contains(&CorrelationId::from_u8(2)).await);
        assert!(!batch.contains(&CorrelationId::from_u8(4)).await);

        let mut destinations = batch.members().await.into_iter()
            .map(|m| m.destination)
            .collect::<Vec<_>>();
        destinations.sort();
        assert_eq!(destinations, vec![test_peer_addr(1), test_peer_addr(2), test_peer_addr(3)]);
    }

    #[tokio::test]
    async fn test_put_duplicate_id_fails() {
        let batch = batch_with(&[1]).await;
        assert!(batch.put_packet(test_request(1), test_peer_addr(9)).await.is_err());
        assert_eq!(batch.packet_count().await, 1);
    }

    #[tokio::test]
    async fn test_no_changes_after_submission() {
        let batch = batch_with(&[1, 2]).await;
        assert_eq!(batch.mark_submitted().await.unwrap().len(), 2);

        assert!(batch.put_packet(test_request(3), test_peer_addr(3)).await.is_err());
        assert!(batch.mark_submitted().await.is_err());
    }

    #[rstest]
    #[case::known_id(1, true)]
    #[case::unknown_id(7, false)]
    #[tokio::test]
    async fn test_add_response_packet(#[case] id: u8, #[case] expected: bool) {
        let batch = batch_with(&[1, 2]).await;

        assert_eq!(batch.add_response_packet(test_response(id), test_peer_addr(id.into())).await, expected);
        assert_eq!(batch.has_reply().await, expected);
        assert_eq!(batch.response_packets().await.len(), if expected { 1 } else { 0 });
    }

    #[tokio::test]
    async fn test_duplicate_responses_are_recorded_once() {
        let batch = batch_with(&[1]).await;

        assert!(batch.add_response_packet(test_response(1), test_peer_addr(1)).await);
        assert!(batch.add_response_packet(test_response(1), test_peer_addr(1)).await);

        let other = Packet::response(CorrelationId::from_u8(1), StatusCode::NoDataFound, &b""[..]);
        assert!(batch.add_response_packet(other.clone(), test_peer_addr(1)).await);

        assert_eq!(batch.response_packets().await, vec![test_response(1), other]);
        assert_eq!(batch.responses().await[0].0, test_peer_addr(1));
    }

    #[tokio::test]
    async fn test_state_machine() {
        let batch = batch_with(&[1, 2]).await;
        assert_eq!(batch.state().await, BatchState::Created);

        batch.mark_submitted().await.unwrap();
        assert_eq!(batch.state().await, BatchState::Submitted);

        batch.on_member_sent();
        assert_eq!(batch.state().await, BatchState::Draining);

        batch.on_member_failed();
        assert_eq!(batch.state().await, BatchState::FullySent);
        assert_eq!(batch.num_sent(), 1);
        assert_eq!(batch.num_failed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_send_completion() {
        let batch = Arc::new(batch_with(&[1, 2]).await);
        batch.mark_submitted().await.unwrap();

        let batch2 = batch.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(10)).await;
            batch2.on_member_sent();
            time::sleep(Duration::from_millis(10)).await;
            batch2.on_member_sent();
        });

        let start = Instant::now();
        assert!(batch.await_send_completion().await);
        assert_eq!(start.elapsed(), Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_send_completion_times_out() {
        let batch = PacketBatch::with_send_completion_timeout(Duration::from_secs(2));
        batch.put_packet(test_request(1), test_peer_addr(1)).await.unwrap();

        // not submitted yet
        let start = Instant::now();
        assert!(!batch.await_send_completion().await);
        assert_eq!(start.elapsed(), Duration::from_secs(2));

        batch.mark_submitted().await.unwrap();
        assert!(!batch.await_send_completion_within(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batch_is_sent_on_submission() {
        let batch = PacketBatch::new();
        batch.mark_submitted().await.unwrap();
        assert!(batch.await_send_completion_within(Duration::ZERO).await);
        assert_eq!(batch.state().await, BatchState::FullySent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_first_reply() {
        let batch = Arc::new(batch_with(&[1, 2, 3]).await);

        let batch2 = batch.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(100)).await;
            batch2.add_response_packet(test_response(2), test_peer_addr(2)).await;
        });

        let start = Instant::now();
        assert!(batch.await_first_reply(Duration::from_secs(5)).await);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_releases_waiters() {
        let batch = batch_with(&[1]).await;
        batch.mark_submitted().await.unwrap();
        batch.abort();

        let start = Instant::now();
        assert!(!batch.await_first_reply(Duration::from_secs(5)).await);
        assert!(!batch.await_send_completion().await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
