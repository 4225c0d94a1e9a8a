use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{Mutex, Notify, RwLock, watch};
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, error, info, trace, warn};

use crate::messaging::codec::PacketCodec;
use crate::messaging::config::SendQueueConfig;
use crate::messaging::correlation_id::CorrelationId;
use crate::messaging::dispatcher::{PacketDispatcher, PacketListener};
use crate::messaging::packet::{Packet, StatusCode};
use crate::messaging::packet_batch::{BatchId, PacketBatch};
use crate::messaging::peer_addr::PeerAddr;
use crate::messaging::scheduled_entry::{PendingKey, ScheduledEntry};
use crate::messaging::transport::Transport;
use crate::util::latch::WaitOutcome;
use crate::util::listener_registry::{ListenerId, ListenerRegistry};

/// Notified whenever a packet was handed to the transport. Like [PacketListener], this is
///  called on the sending task and holds up sending until it returns.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSentListener: Send + Sync + 'static {
    async fn packet_sent(&self, packet: &Packet, destination: &PeerAddr, sent_at: Instant);
}

struct OutstandingRequest {
    entry: Arc<ScheduledEntry>,
    registered_at: Instant,
}

struct RunningBatch {
    batch: Arc<PacketBatch>,
    registered_at: Instant,
}

enum NextEntry {
    Due(Arc<ScheduledEntry>),
    NotBefore(Instant),
    Idle,
}


/// The [SendQueue] is the single outbound path of the messaging layer. Packets are submitted
///  from any task and sent by one drain task (see [SendQueue::run]) in order of their earliest
///  send time, paced to the configured bandwidth cap.
///
/// The send queue also correlates responses to requests: it registers itself as a
///  [PacketListener] with the [PacketDispatcher], and received response packets are matched
///  purely by correlation id against
/// * requests of pending [SendQueue::send_and_wait] calls, and
/// * requests of batches that were submitted via [SendQueue::send_batch] and not removed yet.
///
/// Nothing is retried. A packet the transport fails to send is logged and dropped, and waiting
///  callers are released without a result.
pub struct SendQueue {
    config: SendQueueConfig,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn PacketCodec>,
    max_bandwidth_kbits: AtomicU32,
    pending: Mutex<BTreeMap<PendingKey, Arc<ScheduledEntry>>>,
    next_seq: AtomicU64,
    outstanding: RwLock<FxHashMap<CorrelationId, OutstandingRequest>>,
    running_batches: RwLock<FxHashMap<BatchId, RunningBatch>>,
    send_listeners: ListenerRegistry<dyn PacketSentListener>,
    new_entry: Notify,
    shutdown: watch::Sender<bool>,
    is_running: AtomicBool,
}
impl Debug for SendQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SendQueue{{max_bandwidth:{}kbit/s}}", self.max_bandwidth())
    }
}

impl SendQueue {
    /// Creates a send queue and registers it with the dispatcher for response correlation.
    ///  Packets are only sent once [SendQueue::run] is called.
    pub fn new(config: SendQueueConfig, transport: Arc<dyn Transport>, codec: Arc<dyn PacketCodec>, dispatcher: &PacketDispatcher) -> anyhow::Result<Arc<SendQueue>> {
        config.validate()?;

        let (shutdown, _) = watch::channel(false);
        let send_queue = Arc::new(SendQueue {
            max_bandwidth_kbits: AtomicU32::new(config.max_bandwidth_kbits),
            config,
            transport,
            codec,
            pending: Default::default(),
            next_seq: AtomicU64::new(0),
            outstanding: Default::default(),
            running_batches: Default::default(),
            send_listeners: Default::default(),
            new_entry: Notify::new(),
            shutdown,
            is_running: AtomicBool::new(false),
        });

        dispatcher.add_listener(send_queue.clone());
        Ok(send_queue)
    }

    /// 0 means 'no cap'
    pub fn set_max_bandwidth(&self, kbits_per_second: u32) {
        debug!("setting max bandwidth to {} kbit/s", kbits_per_second);
        self.max_bandwidth_kbits.store(kbits_per_second, Ordering::Release);
    }

    pub fn max_bandwidth(&self) -> u32 {
        self.max_bandwidth_kbits.load(Ordering::Acquire)
    }

    pub async fn queue_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn add_send_listener(&self, listener: Arc<dyn PacketSentListener>, expiry: Option<Duration>) -> ListenerId {
        match expiry {
            Some(expiry) => self.send_listeners.add_with_expiry(listener, expiry),
            None => self.send_listeners.add(listener),
        }
    }

    pub fn remove_send_listener(&self, id: ListenerId) -> bool {
        self.send_listeners.remove(id)
    }

    /// fire-and-forget: the packet is sent as soon as the queue gets to it
    pub async fn send(&self, packet: Packet, destination: PeerAddr) {
        self.send_at(packet, destination, Instant::now()).await
    }

    /// fire-and-forget: the packet is not sent before `earliest_send_time`
    pub async fn send_at(&self, packet: Packet, destination: PeerAddr, earliest_send_time: Instant) {
        self.enqueue(Arc::new(ScheduledEntry::new(packet, destination, earliest_send_time))).await;
    }

    pub async fn send_response(&self, payload: impl Into<Bytes>, destination: PeerAddr, request_id: CorrelationId) {
        self.send_response_with_status(StatusCode::Ok, payload, destination, request_id).await
    }

    pub async fn send_response_with_status(&self, status: StatusCode, payload: impl Into<Bytes>, destination: PeerAddr, request_id: CorrelationId) {
        self.send(Packet::response(request_id, status, payload), destination).await
    }

    /// Sends a request and waits for its response. `timeout` bounds the entire call, i.e. the
    ///  time the request spends in the queue plus the wait for the response. A request that is
    ///  still queued when the timeout expires is not sent at all.
    ///
    /// Returns `None` if the packet could not be sent, if no response arrived in time, or if
    ///  the send queue was shut down. There is no way to tell these cases apart: `None` means
    ///  'unknown', and the request may well have been processed by the peer.
    #[tracing::instrument(skip(self, packet), fields(id = ?packet.id))]
    pub async fn send_and_wait(&self, packet: Packet, destination: PeerAddr, timeout: Duration) -> Option<Packet> {
        let submitted_at = Instant::now();
        let deadline = submitted_at + timeout;

        let entry = Arc::new(ScheduledEntry::awaiting_response(packet, destination, submitted_at));
        let Some(key) = self.enqueue(entry.clone()).await else {
            return None;
        };

        let result = self.await_response(&entry, deadline).await;
        if result.is_none() {
            entry.abandon();
            if self.pending.lock().await.remove(&key).is_some() {
                debug!("request was still queued - removed it");
            }
            self.remove_outstanding(&entry).await;
        }
        result
    }

    async fn await_response(&self, entry: &ScheduledEntry, deadline: Instant) -> Option<Packet> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match entry.await_sending(timeout).await {
            WaitOutcome::Released => {}
            WaitOutcome::Aborted => {
                debug!("request was dropped without being sent");
                return None;
            }
            WaitOutcome::TimedOut => {
                debug!("request was not sent within {:?}", timeout);
                return None;
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match entry.await_response(remaining).await {
            WaitOutcome::Released => entry.response().cloned(),
            WaitOutcome::Aborted => {
                debug!("stopped waiting for response");
                None
            }
            WaitOutcome::TimedOut => {
                debug!("no response before the deadline");
                None
            }
        }
    }

    /// Submits all packets of a batch and registers the batch for response attribution. The
    ///  batch receives responses until it is removed via [SendQueue::remove_batch].
    pub async fn send_batch(&self, batch: &Arc<PacketBatch>) -> anyhow::Result<()> {
        let members = batch.mark_submitted().await?;

        {
            let mut running_batches = self.running_batches.write().await;
            if self.is_shut_down() {
                warn!("submitting batch {:?} after shutdown - dropping", batch.id());
                batch.abort();
                return Ok(());
            }
            running_batches.insert(batch.id(), RunningBatch {
                batch: batch.clone(),
                registered_at: Instant::now(),
            });
        }

        debug!("submitting batch {:?} with {} packets", batch.id(), members.len());
        let now = Instant::now();
        for member in members {
            let entry = ScheduledEntry::for_batch(member.packet, member.destination, now, Arc::downgrade(batch));
            self.enqueue(Arc::new(entry)).await;
        }
        Ok(())
    }

    /// Stops attributing responses to the batch, returning `false` if it was not registered.
    ///  Pending packets of the batch are still sent.
    pub async fn remove_batch(&self, batch: &PacketBatch) -> bool {
        self.running_batches.write().await
            .remove(&batch.id())
            .is_some()
    }

    /// returns the entry's key in the pending set, or `None` if the send queue was shut down
    async fn enqueue(&self, entry: Arc<ScheduledEntry>) -> Option<PendingKey> {
        let key = {
            let mut pending = self.pending.lock().await;
            if self.is_shut_down() {
                warn!("submitting {:?} after shutdown - dropping", entry);
                drop(pending);
                Self::drop_entry(&entry);
                return None;
            }

            trace!("enqueueing {:?}", entry);
            let key = PendingKey {
                earliest_send_time: entry.earliest_send_time,
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            };
            pending.insert(key, entry);
            key
        };
        self.new_entry.notify_one();
        Some(key)
    }

    /// Runs the drain loop until [SendQueue::shut_down] is called. This is meant to be spawned
    ///  once per send queue, and calling it while it is running fails.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> anyhow::Result<()> {
        if self.is_running.swap(true, Ordering::AcqRel) {
            bail!("send queue is already running");
        }

        info!("starting send queue");
        let mut next_sweep = Instant::now() + self.config.sweep_interval;

        while !self.is_shut_down() {
            let now = Instant::now();
            if now >= next_sweep {
                self.sweep().await;
                next_sweep = now + self.config.sweep_interval;
            }

            let entry = match self.take_due_entry(now).await {
                NextEntry::Due(entry) => entry,
                NextEntry::NotBefore(due) => {
                    self.idle_until(due.min(next_sweep)).await;
                    continue;
                }
                NextEntry::Idle => {
                    self.idle_until(next_sweep).await;
                    continue;
                }
            };

            if let Some(delay) = self.pacing_delay(entry.packet.size()) {
                trace!("pacing: waiting {:?} before sending {:?}", delay, entry);
                select! {
                    _ = sleep(delay) => {}
                    _ = self.shutdown_requested() => {}
                }
            }

            if self.is_shut_down() {
                Self::drop_entry(&entry);
                break;
            }
            self.do_send(entry).await;
        }

        info!("send queue terminated");
        Ok(())
    }

    /// waits until `deadline`, a new entry is submitted, or shutdown
    async fn idle_until(&self, deadline: Instant) {
        select! {
            _ = sleep_until(deadline) => {}
            _ = self.new_entry.notified() => {}
            _ = self.shutdown_requested() => {}
        }
    }

    async fn shutdown_requested(&self) {
        let mut receiver = self.shutdown.subscribe();
        let _ = receiver.wait_for(|is_shut_down| *is_shut_down).await;
    }

    /// Removes and returns the pending entry with the smallest earliest send time if it is due.
    ///  Entries with the same time are taken in submission order.
    async fn take_due_entry(&self, now: Instant) -> NextEntry {
        let mut pending = self.pending.lock().await;

        let earliest = pending.first_key_value()
            .map(|(key, _)| key.earliest_send_time);
        match earliest {
            None => NextEntry::Idle,
            Some(t) if t > now => NextEntry::NotBefore(t),
            Some(_) => match pending.pop_first() {
                Some((_, entry)) => NextEntry::Due(entry),
                None => NextEntry::Idle,
            },
        }
    }

    /// the time it takes to send a packet of the given size at the current bandwidth cap
    fn pacing_delay(&self, packet_size: usize) -> Option<Duration> {
        let max_bandwidth_kbits = self.max_bandwidth() as u64;
        if max_bandwidth_kbits == 0 {
            return None;
        }

        let size_bits = packet_size as u64 * 8;
        Some(Duration::from_micros(size_bits * 1_000_000 / (max_bandwidth_kbits * 1024)))
    }

    async fn do_send(&self, entry: Arc<ScheduledEntry>) {
        if entry.is_abandoned() {
            debug!("nobody is waiting for {:?} any more - not sending it", entry);
            Self::drop_entry(&entry);
            return;
        }

        let buf = self.codec.encode(&entry.packet);

        // registered before sending so that even an immediate response finds its request
        if entry.awaits_response() && !self.register_outstanding(&entry).await {
            Self::drop_entry(&entry);
            return;
        }

        let sent_at = Instant::now();
        entry.mark_sent(sent_at);

        match self.transport.send(&entry.destination, &buf).await {
            Ok(()) => {
                trace!("sent {:?} to {:?}", entry.packet, entry.destination);
                entry.on_sent();
                if let Some(batch) = entry.batch().and_then(Weak::upgrade) {
                    batch.on_member_sent();
                }

                for listener in self.send_listeners.snapshot() {
                    listener.packet_sent(&entry.packet, &entry.destination, sent_at).await;
                }
            }
            Err(e) => {
                error!("error sending {:?} to {:?} - dropping: {}", entry.packet, entry.destination, e);
                self.remove_outstanding(&entry).await;
                Self::drop_entry(&entry);
            }
        }
    }

    /// Returns `false` if the send queue was shut down or the submitter stopped waiting. The
    ///  check happens under the lock: a submitter that gives up afterwards removes the
    ///  registration itself.
    async fn register_outstanding(&self, entry: &Arc<ScheduledEntry>) -> bool {
        let mut outstanding = self.outstanding.write().await;
        if self.is_shut_down() || !entry.is_awaiting_response() {
            return false;
        }

        let previous = outstanding.insert(entry.packet.id, OutstandingRequest {
            entry: entry.clone(),
            registered_at: Instant::now(),
        });
        if let Some(previous) = previous {
            warn!("correlation id {:?} is already in use by an outstanding request - the previous request will not receive a response", entry.packet.id);
            previous.entry.abort_response();
        }
        true
    }

    /// removes an entry's registration unless the id was registered by some other entry since
    async fn remove_outstanding(&self, entry: &Arc<ScheduledEntry>) {
        let mut outstanding = self.outstanding.write().await;
        let is_registered = outstanding.get(&entry.packet.id)
            .map(|o| Arc::ptr_eq(&o.entry, entry))
            .unwrap_or(false);
        if is_registered {
            outstanding.remove(&entry.packet.id);
        }
    }

    fn drop_entry(entry: &ScheduledEntry) {
        entry.on_dropped();
        if let Some(batch) = entry.batch().and_then(Weak::upgrade) {
            batch.on_member_failed();
        }
    }

    /// evicts outstanding requests and batches that outlived their TTL, and expired send
    ///  listeners
    #[tracing::instrument(skip(self))]
    async fn sweep(&self) {
        let now = Instant::now();

        let mut expired_requests = Vec::new();
        self.outstanding.write().await.retain(|_, o| {
            let is_alive = now.saturating_duration_since(o.registered_at) < self.config.request_ttl;
            if !is_alive {
                expired_requests.push(o.entry.clone());
            }
            is_alive
        });
        for entry in expired_requests {
            warn!("evicting stale outstanding request {:?} to {:?}", entry.packet, entry.destination);
            entry.abort_response();
        }

        let mut expired_batches = Vec::new();
        self.running_batches.write().await.retain(|_, b| {
            let is_alive = now.saturating_duration_since(b.registered_at) < self.config.batch_ttl;
            if !is_alive {
                expired_batches.push(b.batch.clone());
            }
            is_alive
        });
        for batch in expired_batches {
            warn!("evicting batch {:?} that was never removed", batch.id());
            batch.abort();
        }

        let num_expired_listeners = self.send_listeners.remove_expired();
        if num_expired_listeners > 0 {
            debug!("removed {} expired send listeners", num_expired_listeners);
        }
    }

    /// Stops the drain loop and releases everybody waiting: pending packets are dropped, and
    ///  pending `send_and_wait` calls and batch waiters return without a result. Packets
    ///  submitted after shutdown are dropped immediately.
    #[tracing::instrument(skip(self))]
    pub async fn shut_down(&self) {
        if self.shutdown.send_replace(true) {
            debug!("send queue was already shut down");
            return;
        }
        info!("shutting down send queue");

        let pending = std::mem::take(&mut *self.pending.lock().await);
        if !pending.is_empty() {
            debug!("dropping {} pending packets", pending.len());
        }
        for entry in pending.into_values() {
            Self::drop_entry(&entry);
        }

        let outstanding = std::mem::take(&mut *self.outstanding.write().await);
        for request in outstanding.into_values() {
            request.entry.abort_response();
        }

        let running_batches = std::mem::take(&mut *self.running_batches.write().await);
        for running in running_batches.into_values() {
            running.batch.abort();
        }
    }

    #[cfg(test)]
    async fn num_outstanding(&self) -> usize {
        self.outstanding.read().await.len()
    }

    #[cfg(test)]
    async fn num_running_batches(&self) -> usize {
        self.running_batches.read().await.len()
    }
}

#[async_trait]
impl PacketListener for SendQueue {
    async fn packet_received(&self, packet: &Packet, sender: &PeerAddr, _receive_time: Instant) {
        if !packet.is_response() {
            return;
        }

        let batches = self.running_batches.read().await
            .values()
            .map(|running| running.batch.clone())
            .collect::<Vec<_>>();
        for batch in batches {
            batch.add_response_packet(packet.clone(), sender.clone()).await;
        }

        let request = self.outstanding.write().await
            .remove(&packet.id);
        if let Some(request) = request {
            if &request.entry.destination != sender {
                debug!("response {:?} from {:?} to a request sent to {:?}", packet, sender, request.entry.destination);
            }
            if !request.entry.set_response(packet.clone(), Instant::now()) {
                debug!("request {:?} was already resolved - ignoring response", packet.id);
            }
        }
    }
}
