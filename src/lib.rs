//! Request / response messaging on top of an unreliable, unordered datagram transport.
//!
//! The transport underneath may lose, reorder or duplicate datagrams, and every round trip is
//!  slow. This crate adds the abstractions an application needs on top of that:
//!
//! * fire-and-forget sending through a single [SendQueue](messaging::send_queue::SendQueue),
//!    paced to a configurable bandwidth cap and honoring per-packet earliest send times
//! * call / response via [send_and_wait](messaging::send_queue::SendQueue::send_and_wait),
//!    correlating responses purely by correlation id
//! * fan-out requests to several peers via [PacketBatch](messaging::packet_batch::PacketBatch),
//!    with an early exit on the first reply
//! * fan-out of received packets to registered listeners via
//!    [PacketDispatcher](messaging::dispatcher::PacketDispatcher)
//!
//! Nothing here retries: callers decide whether and how to re-send, and every waiting operation
//!  takes a timeout.

pub mod messaging;
pub mod util;
pub mod test_util;
