//! This module contains utilities for testing code based on the messaging layer: deterministic
//!  peer addresses and packets, and a transport that records what is sent instead of putting
//!  it on the wire. They are used for testing the messaging layer itself, but they are also
//!  exported for application testing.
//!
//! Making test utilities part of the crate's regular (non-#[cfg(test)]) code is a compromise:
//!  `#[cfg(test)]` code is not visible to other crates' tests.

pub mod packet;
pub mod peer;
pub mod transport;
