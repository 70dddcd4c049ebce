pub mod jitter;
pub mod party;
