//! JSON envelopes exchanged with the rendezvous service.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::transport::TransportError;
use crate::PeerId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "topic", rename_all = "camelCase")]
pub enum SignalEnvelope {
    /// Announces ourselves to the rendezvous room.
    #[serde(rename_all = "camelCase")]
    Identify {
        room_id: String,
        peer_id: PeerId,
        is_host: bool,
    },
    /// The rendezvous service introduces a peer already in the room.
    #[serde(rename_all = "camelCase")]
    Initiate {
        peer_id: PeerId,
        polite: bool,
        is_host: bool,
    },
    /// Trickle ICE candidate, routed point to point.
    #[serde(rename_all = "camelCase")]
    Candidate {
        peer_id: PeerId,
        to: PeerId,
        candidate: CandidatePayload,
    },
    /// SDP offer or answer, routed point to point.
    #[serde(rename_all = "camelCase")]
    Description {
        peer_id: PeerId,
        to: PeerId,
        description: DescriptionPayload,
    },
}

impl SignalEnvelope {
    /// Peer the envelope originates from, when it names one.
    pub fn sender(&self) -> Option<&PeerId> {
        match self {
            SignalEnvelope::Identify { peer_id, .. }
            | SignalEnvelope::Initiate { peer_id, .. }
            | SignalEnvelope::Candidate { peer_id, .. }
            | SignalEnvelope::Description { peer_id, .. } => Some(peer_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

impl CandidatePayload {
    pub fn into_init(self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.candidate,
            sdp_mid: self.sdp_mid,
            sdp_mline_index: self.sdp_m_line_index,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DescriptionPayload {
    #[serde(rename = "type")]
    pub typ: String,
    pub sdp: String,
}

impl DescriptionPayload {
    pub fn from_description(desc: &RTCSessionDescription) -> Self {
        Self {
            typ: desc.sdp_type.to_string(),
            sdp: desc.sdp.clone(),
        }
    }

    pub fn is_offer(&self) -> bool {
        RTCSdpType::from(self.typ.as_str()) == RTCSdpType::Offer
    }

    pub fn into_description(self) -> Result<RTCSessionDescription, TransportError> {
        let sdp_type = RTCSdpType::from(self.typ.as_str());
        let description = match sdp_type {
            RTCSdpType::Offer => RTCSessionDescription::offer(self.sdp)
                .map_err(|err| TransportError::Setup(err.to_string()))?,
            RTCSdpType::Answer => RTCSessionDescription::answer(self.sdp)
                .map_err(|err| TransportError::Setup(err.to_string()))?,
            RTCSdpType::Pranswer => RTCSessionDescription::pranswer(self.sdp)
                .map_err(|err| TransportError::Setup(err.to_string()))?,
            RTCSdpType::Rollback | RTCSdpType::Unspecified => {
                return Err(TransportError::Setup(format!(
                    "unsupported sdp type {}",
                    self.typ
                )));
            }
        };
        Ok(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_round_trip() {
        let envelope = SignalEnvelope::Identify {
            room_id: "studio-7".into(),
            peer_id: PeerId::from("alice"),
            is_host: true,
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"topic\":\"identify\""));
        assert!(json.contains("\"roomId\":\"studio-7\""));
        assert!(json.contains("\"isHost\":true"));
        let parsed: SignalEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn candidate_wire_shape() {
        let json = r#"{
            "topic": "candidate",
            "peerId": "bob",
            "to": "alice",
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        }"#;
        let parsed: SignalEnvelope = serde_json::from_str(json).unwrap();
        match parsed {
            SignalEnvelope::Candidate { peer_id, to, candidate } => {
                assert_eq!(peer_id.as_str(), "bob");
                assert_eq!(to.as_str(), "alice");
                let init = candidate.into_init();
                assert_eq!(init.sdp_mid.as_deref(), Some("0"));
                assert_eq!(init.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn candidate_tolerates_missing_mid() {
        let json = r#"{
            "topic": "candidate",
            "peerId": "bob",
            "to": "alice",
            "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.2 50000 typ host"}
        }"#;
        let parsed: SignalEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.sender().map(PeerId::as_str), Some("bob"));
    }

    #[test]
    fn description_rejects_rollback() {
        let payload = DescriptionPayload {
            typ: "rollback".into(),
            sdp: String::new(),
        };
        assert!(payload.into_description().is_err());
    }
}
