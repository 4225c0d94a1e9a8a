pub mod codec;
pub mod config;
pub mod correlation_id;
pub mod dispatcher;
pub mod packet;
pub mod packet_batch;
pub mod peer_addr;
pub mod scheduled_entry;
pub mod send_queue;
pub mod transport;
