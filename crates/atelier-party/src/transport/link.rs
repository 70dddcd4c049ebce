//! Glare-safe peer connection wrapper around one WebRTC peer.
//!
//! Negotiation follows the polite/impolite split: when two offers collide,
//! the polite side abandons its own offer and accepts the remote one, the
//! impolite side ignores the remote offer and keeps its own. Which side is
//! polite is decided by the rendezvous service in the `initiate` envelope,
//! so the pair always disagrees and exactly one offer survives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::config::PartyConfig;
use crate::protocol::signaling::{CandidatePayload, DescriptionPayload, SignalEnvelope};
use crate::transport::{ChannelPayload, FlowChannel, SignalingTransport, TransportError};
use crate::PeerId;

pub(crate) fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|err| TransportError::Setup(err.to_string()))?;
    let mut registry = webrtc::interceptor::registry::Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|err| TransportError::Setup(err.to_string()))?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// What a link reports up to the coordinator.
#[derive(Debug)]
pub enum LinkEvent {
    /// The reliable channel opened; the peer can now receive messages.
    ChannelOpen,
    /// A message arrived on the reliable channel.
    Reliable(ChannelPayload),
    /// ICE reached the connected state.
    Connected,
    /// The impolite-side connect deadline expired before ICE connected.
    ConnectTimeout,
    /// Connection failed, closed, or the channel went away.
    Disconnected,
}

/// Where the local side currently is in the offer/answer dance. Replaces the
/// classic `makingOffer` / `isSettingRemoteAnswerPending` boolean pair: the
/// two were always mutually exclusive, so one enum holds the same state
/// without the impossible both-true combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum LocalSdp {
    #[default]
    Idle,
    MakingOffer,
    SettingRemoteAnswer,
}

#[derive(Debug, Default)]
struct NegotiationState {
    local: LocalSdp,
    /// Set while the impolite side is discarding a colliding remote offer;
    /// ICE errors for candidates of that offer are expected and silenced.
    ignore_offer: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum RemoteDescDecision {
    Ignore,
    /// `rollback` means the polite side must first discard its own pending
    /// local offer before the remote one can be applied.
    Apply { is_answer: bool, rollback: bool },
}

impl NegotiationState {
    fn decide_remote(&mut self, polite: bool, is_offer: bool, signaling_stable: bool) -> RemoteDescDecision {
        let ready_for_offer = self.local != LocalSdp::MakingOffer
            && (signaling_stable || self.local == LocalSdp::SettingRemoteAnswer);
        let collision = is_offer && !ready_for_offer;
        self.ignore_offer = !polite && collision;
        if self.ignore_offer {
            return RemoteDescDecision::Ignore;
        }
        let rollback = polite && collision;
        if rollback {
            // our in-flight offer is dead; whoever was making it must not
            // treat its completion as still pending
            self.local = LocalSdp::Idle;
        }
        if !is_offer {
            self.local = LocalSdp::SettingRemoteAnswer;
        }
        RemoteDescDecision::Apply {
            is_answer: !is_offer,
            rollback,
        }
    }

    fn finish_remote_answer(&mut self) {
        if self.local == LocalSdp::SettingRemoteAnswer {
            self.local = LocalSdp::Idle;
        }
    }
}

/// One negotiated connection to a remote participant, carrying the single
/// reliable channel plus best-effort pose sends.
pub struct PeerLink {
    local: PeerId,
    remote: PeerId,
    polite: bool,
    pc: Arc<RTCPeerConnection>,
    signaling: Arc<dyn SignalingTransport>,
    events: UnboundedSender<(PeerId, LinkEvent)>,
    negotiation: Mutex<NegotiationState>,
    outbound_tx: UnboundedSender<ChannelPayload>,
    outbound_rx: Mutex<Option<UnboundedReceiver<ChannelPayload>>>,
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
    channel_open: Arc<AtomicBool>,
    open_notify: Arc<Notify>,
    closed: AtomicBool,
    connect_timer: Mutex<Option<JoinHandle<()>>>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    low_watermark: usize,
}

impl PeerLink {
    /// Builds the peer connection, wires its callbacks, and (on the impolite
    /// side) creates the reliable channel and arms the connect deadline.
    pub async fn spawn(
        api: &API,
        local: PeerId,
        remote: PeerId,
        polite: bool,
        config: &PartyConfig,
        signaling: Arc<dyn SignalingTransport>,
        events: UnboundedSender<(PeerId, LinkEvent)>,
    ) -> Result<Arc<Self>, TransportError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|err| TransportError::Setup(err.to_string()))?,
        );
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            local,
            remote,
            polite,
            pc: pc.clone(),
            signaling,
            events,
            negotiation: Mutex::new(NegotiationState::default()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            channel: Mutex::new(None),
            channel_open: Arc::new(AtomicBool::new(false)),
            open_notify: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
            connect_timer: Mutex::new(None),
            drain_task: Mutex::new(None),
            low_watermark: config.reliable_low_watermark,
        });

        link.register_pc_callbacks();

        if !polite {
            // one audio line is negotiated up front; the polite side gets
            // its transceiver from the offer, so only the offering side adds
            // one and negotiation-needed never fires over there
            pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
                .await
                .map_err(|err| TransportError::Setup(err.to_string()))?;
            let dc_init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let dc = pc
                .create_data_channel(&config.channel_label, Some(dc_init))
                .await
                .map_err(|err| TransportError::Setup(err.to_string()))?;
            link.wire_channel(dc).await;
            link.arm_connect_timer(config.connect_timeout).await;
        }

        Ok(link)
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel_open.load(Ordering::SeqCst)
    }

    fn register_pc_callbacks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc.on_negotiation_needed(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(link) = weak.upgrade() {
                    link.kick_negotiation().await;
                }
            })
        }));

        let weak = Arc::downgrade(self);
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let weak = weak.clone();
            Box::pin(async move {
                let (Some(link), Some(candidate)) = (weak.upgrade(), candidate) else {
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(err) => {
                        warn!(target: "party::link", peer = %link.remote, error = %err, "failed to serialize local candidate");
                        return;
                    }
                };
                let envelope = SignalEnvelope::Candidate {
                    peer_id: link.local.clone(),
                    to: link.remote.clone(),
                    candidate: CandidatePayload {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                    },
                };
                if let Err(err) = link.signaling.send(&envelope).await {
                    warn!(target: "party::link", peer = %link.remote, error = %err, "candidate send failed");
                }
            })
        }));

        let weak = Arc::downgrade(self);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(link) = weak.upgrade() else {
                        return;
                    };
                    match state {
                        RTCPeerConnectionState::Connected => {
                            link.cancel_connect_timer().await;
                            link.emit(LinkEvent::Connected);
                        }
                        RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Closed => {
                            link.emit(LinkEvent::Disconnected);
                        }
                        _ => {}
                    }
                })
            }));

        let weak = Arc::downgrade(self);
        self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(link) = weak.upgrade() {
                    link.wire_channel(dc).await;
                }
            })
        }));
    }

    async fn wire_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        let low_notify = Arc::new(Notify::new());
        dc.set_buffered_amount_low_threshold(self.low_watermark).await;
        {
            let low_notify = low_notify.clone();
            dc.on_buffered_amount_low(Box::new(move || {
                let low_notify = low_notify.clone();
                Box::pin(async move {
                    low_notify.notify_one();
                })
            }))
            .await;
        }

        {
            let open = self.channel_open.clone();
            let open_notify = self.open_notify.clone();
            let events = self.events.clone();
            let remote = self.remote.clone();
            dc.on_open(Box::new(move || {
                open.store(true, Ordering::SeqCst);
                open_notify.notify_waiters();
                open_notify.notify_one();
                let _ = events.send((remote.clone(), LinkEvent::ChannelOpen));
                Box::pin(async {})
            }));
        }

        {
            let events = self.events.clone();
            let remote = self.remote.clone();
            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                let payload = if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => ChannelPayload::Text(text),
                        Err(err) => {
                            warn!(target: "party::link", peer = %remote, error = %err, "non-utf8 text message dropped");
                            return Box::pin(async {});
                        }
                    }
                } else {
                    ChannelPayload::Binary(msg.data.clone())
                };
                let _ = events.send((remote.clone(), LinkEvent::Reliable(payload)));
                Box::pin(async {})
            }));
        }

        {
            let open = self.channel_open.clone();
            let events = self.events.clone();
            let remote = self.remote.clone();
            dc.on_close(Box::new(move || {
                open.store(false, Ordering::SeqCst);
                let _ = events.send((remote.clone(), LinkEvent::Disconnected));
                Box::pin(async {})
            }));
        }

        *self.channel.lock().await = Some(dc.clone());

        if let Some(outbound_rx) = self.outbound_rx.lock().await.take() {
            let flow = WebRtcFlowChannel { dc, low_notify };
            let open = self.channel_open.clone();
            let open_notify = self.open_notify.clone();
            let remote = self.remote.clone();
            let low_watermark = self.low_watermark;
            let handle = tokio::spawn(async move {
                // nothing may hit the wire before the channel opens
                if !open.load(Ordering::SeqCst) {
                    open_notify.notified().await;
                }
                debug!(target: "party::link", peer = %remote, "reliable drain started");
                drain_outbound(flow, outbound_rx, low_watermark).await;
                debug!(target: "party::link", peer = %remote, "reliable drain stopped");
            });
            *self.drain_task.lock().await = Some(handle);
        }
    }

    async fn arm_connect_timer(self: &Arc<Self>, timeout: std::time::Duration) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(link) = weak.upgrade() {
                if !link.closed.load(Ordering::SeqCst) {
                    warn!(target: "party::link", peer = %link.remote, "connect deadline expired");
                    link.emit(LinkEvent::ConnectTimeout);
                }
            }
        });
        *self.connect_timer.lock().await = Some(handle);
    }

    async fn cancel_connect_timer(&self) {
        if let Some(handle) = self.connect_timer.lock().await.take() {
            handle.abort();
        }
    }

    /// Runs one offer round. The making-offer flag is restored on every exit
    /// path, including failure.
    async fn kick_negotiation(self: &Arc<Self>) {
        {
            self.negotiation.lock().await.local = LocalSdp::MakingOffer;
        }
        let result = self.send_local_offer().await;
        {
            let mut state = self.negotiation.lock().await;
            if state.local == LocalSdp::MakingOffer {
                state.local = LocalSdp::Idle;
            }
        }
        if let Err(err) = result {
            warn!(target: "party::link", peer = %self.remote, error = %err, "offer round failed");
        }
    }

    async fn send_local_offer(&self) -> Result<(), TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Setup("local description missing after set".into()))?;
        self.signaling
            .send(&SignalEnvelope::Description {
                peer_id: self.local.clone(),
                to: self.remote.clone(),
                description: DescriptionPayload::from_description(&local),
            })
            .await
    }

    /// Applies a remote offer or answer per the politeness rules, answering
    /// offers that survive collision handling.
    pub async fn handle_remote_description(
        self: &Arc<Self>,
        payload: DescriptionPayload,
    ) -> Result<(), TransportError> {
        let is_offer = payload.is_offer();
        let signaling_stable = self.pc.signaling_state() == RTCSignalingState::Stable;
        let decision = self
            .negotiation
            .lock()
            .await
            .decide_remote(self.polite, is_offer, signaling_stable);
        match decision {
            RemoteDescDecision::Ignore => {
                debug!(target: "party::link", peer = %self.remote, "ignoring colliding remote offer");
                Ok(())
            }
            RemoteDescDecision::Apply { is_answer, rollback } => {
                if rollback {
                    // no implicit rollback in this stack: explicitly discard
                    // our pending local offer (empty SDP per the WebRTC
                    // spec), then the colliding remote offer applies cleanly
                    debug!(target: "party::link", peer = %self.remote, "rolling back local offer");
                    let mut discard = RTCSessionDescription::default();
                    discard.sdp_type = RTCSdpType::Rollback;
                    self.pc
                        .set_local_description(discard)
                        .await
                        .map_err(|err| TransportError::Setup(err.to_string()))?;
                }
                let desc = payload.into_description()?;
                let applied = self.pc.set_remote_description(desc).await;
                if is_answer {
                    self.negotiation.lock().await.finish_remote_answer();
                }
                applied.map_err(|err| TransportError::Setup(err.to_string()))?;
                if is_offer {
                    let answer = self
                        .pc
                        .create_answer(None)
                        .await
                        .map_err(|err| TransportError::Setup(err.to_string()))?;
                    self.pc
                        .set_local_description(answer)
                        .await
                        .map_err(|err| TransportError::Setup(err.to_string()))?;
                    let local = self.pc.local_description().await.ok_or_else(|| {
                        TransportError::Setup("local description missing after answer".into())
                    })?;
                    self.signaling
                        .send(&SignalEnvelope::Description {
                            peer_id: self.local.clone(),
                            to: self.remote.clone(),
                            description: DescriptionPayload::from_description(&local),
                        })
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// Feeds a trickled remote candidate into ICE. Failures while a
    /// colliding offer is being ignored belong to the discarded offer and
    /// are expected.
    pub async fn handle_remote_candidate(&self, payload: CandidatePayload) {
        let ignoring = self.negotiation.lock().await.ignore_offer;
        if let Err(err) = self.pc.add_ice_candidate(payload.into_init()).await {
            if ignoring {
                debug!(target: "party::link", peer = %self.remote, error = %err, "candidate for ignored offer");
            } else {
                warn!(target: "party::link", peer = %self.remote, error = %err, "failed to add remote candidate");
            }
        }
    }

    /// Queues a payload for ordered, flow-controlled delivery. Queued data
    /// waits until the channel opens.
    pub fn send(&self, payload: ChannelPayload) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.outbound_tx
            .send(payload)
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Best-effort pose frame send: dropped outright when the channel is not
    /// open or already buffering past the watermark. Returns whether the
    /// frame was handed to the channel.
    pub async fn send_pose(&self, frame: &Bytes) -> bool {
        if !self.channel_open.load(Ordering::SeqCst) {
            return false;
        }
        let Some(dc) = self.channel.lock().await.clone() else {
            return false;
        };
        if dc.buffered_amount().await > self.low_watermark {
            return false;
        }
        dc.send(frame).await.is_ok()
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send((self.remote.clone(), event));
    }

    /// Tears the link down: cancels the pending connect deadline and the
    /// drain task, then closes the peer connection. Safe to call twice.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_connect_timer().await;
        if let Some(handle) = self.drain_task.lock().await.take() {
            handle.abort();
        }
        self.channel_open.store(false, Ordering::SeqCst);
        if let Err(err) = self.pc.close().await {
            debug!(target: "party::link", peer = %self.remote, error = %err, "peer connection close");
        }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        if let Ok(mut timer) = self.connect_timer.try_lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
        if let Ok(mut drain) = self.drain_task.try_lock() {
            if let Some(handle) = drain.take() {
                handle.abort();
            }
        }
    }
}

/// FIFO drain of queued payloads: parks whenever the channel buffers past
/// the low watermark, resumes on the buffered-amount-low signal.
async fn drain_outbound<C: FlowChannel>(
    channel: C,
    mut outbound: UnboundedReceiver<ChannelPayload>,
    low_watermark: usize,
) {
    while let Some(payload) = outbound.recv().await {
        while channel.buffered_amount().await > low_watermark {
            channel.wait_buffered_low().await;
        }
        if let Err(err) = channel.send(&payload).await {
            warn!(target: "party::link", error = %err, "reliable send failed, stopping drain");
            break;
        }
    }
}

struct WebRtcFlowChannel {
    dc: Arc<RTCDataChannel>,
    low_notify: Arc<Notify>,
}

#[async_trait::async_trait]
impl FlowChannel for WebRtcFlowChannel {
    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn wait_buffered_low(&self) {
        self.low_notify.notified().await;
    }

    async fn send(&self, payload: &ChannelPayload) -> Result<(), TransportError> {
        let result = match payload {
            ChannelPayload::Text(text) => self.dc.send_text(text.clone()).await,
            ChannelPayload::Binary(bytes) => self.dc.send(bytes).await,
        };
        result.map(|_| ()).map_err(|_| TransportError::ChannelClosed)
    }
}
