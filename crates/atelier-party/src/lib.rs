//! Real-time multiplayer synchronization for the atelier scene editor.
//!
//! The crate owns three concerns and nothing else: glare-safe WebRTC peer
//! negotiation ([`transport::link::PeerLink`]), a flow-controlled reliable
//! channel carrying discrete scene mutations and chunked project transfers,
//! and a jitter-buffered stream of avatar/controller pose frames
//! ([`session::jitter::JitterBuffer`]). The scene graph itself, the project
//! file format, and the rendezvous server live in the embedding application
//! and are reached through the [`protocol::replication::SceneDelegate`] and
//! [`transport::SignalingTransport`] traits.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::PartyConfig;
pub use protocol::replication::{ReplicationMessage, SceneDelegate};
pub use protocol::signaling::SignalEnvelope;
pub use session::party::PartyCoordinator;
pub use transport::SignalingTransport;

/// Opaque identity of a remote participant, assigned by the rendezvous
/// service (or generated locally for the local side).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
