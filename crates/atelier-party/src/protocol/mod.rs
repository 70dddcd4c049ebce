pub mod frame;
pub mod replication;
pub mod signaling;
