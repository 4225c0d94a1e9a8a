pub mod latch;
pub mod listener_registry;
