use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::protocol::signaling::SignalEnvelope;

pub mod chunk;
pub mod link;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport channel closed")]
    ChannelClosed,
}

/// Payload kinds carried by the reliable data channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelPayload {
    /// JSON replication messages.
    Text(String),
    /// Project chunks and pose frames.
    Binary(Bytes),
}

impl ChannelPayload {
    pub fn len(&self) -> usize {
        match self {
            ChannelPayload::Text(text) => text.len(),
            ChannelPayload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Send side of the rendezvous service connection.
///
/// The core only ever pushes envelopes out through this capability; inbound
/// envelopes are delivered by the embedding application via
/// [`crate::session::party::PartyCoordinator::handle_signal`].
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, envelope: &SignalEnvelope) -> Result<(), TransportError>;
}

/// Seam over the reliable channel used by the flow-controlled drain loop, so
/// the backpressure logic is testable without a live peer connection.
#[async_trait]
pub trait FlowChannel: Send + Sync + 'static {
    /// Bytes currently queued inside the channel.
    async fn buffered_amount(&self) -> usize;
    /// Parks until the channel signals it drained below the low watermark.
    async fn wait_buffered_low(&self);
    async fn send(&self, payload: &ChannelPayload) -> Result<(), TransportError>;
}
