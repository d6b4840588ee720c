//! Signaling message model.
//!
//! One JSON object per message, tagged by `type`. SDP payloads and ICE
//! candidates keep the browser-side shapes (`{"type","sdp"}` and
//! `{"candidate","sdpMid","sdpMLineIndex"}`) so clients can pass
//! `RTCSessionDescription` / `RTCIceCandidate` JSON through unchanged.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Role a client declares at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Broadcaster,
    Viewer,
}

/// Messages received from a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Declare a role on this connection. A viewer may request a specific
    /// id; otherwise one is generated.
    #[serde(rename_all = "camelCase")]
    Register {
        role: ClientRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        viewer_id: Option<String>,
    },
    /// SDP offer from the broadcaster.
    Offer { offer: RTCSessionDescription },
    /// SDP answer from a viewer to a server-initiated offer.
    Answer { answer: RTCSessionDescription },
    /// Trickled ICE candidate, either role.
    Candidate { candidate: RTCIceCandidateInit },
}

/// Messages pushed to a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Registered {
        role: ClientRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        viewer_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        viewer_count: Option<usize>,
    },
    /// Server-initiated offer toward a viewer.
    Offer { offer: RTCSessionDescription },
    /// Answer to a broadcaster offer.
    Answer { answer: RTCSessionDescription },
    /// Locally gathered ICE candidate for the remote peer.
    Candidate { candidate: RTCIceCandidateInit },
    /// Current roster size, broadcaster only.
    ViewerCount { count: usize },
    /// The upstream broadcast is gone; `permanent` distinguishes process
    /// shutdown from a gap that may still recover.
    BroadcasterDisconnected { permanent: bool },
}

impl ServerMessage {
    /// The wire `type` tag, mostly for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::ViewerCount { .. } => "viewerCount",
            Self::BroadcasterDisconnected { .. } => "broadcasterDisconnected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_viewer_decodes() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "register",
            "role": "viewer",
            "viewerId": "abc123",
        }))
        .expect("valid register message");
        match msg {
            ClientMessage::Register { role, viewer_id } => {
                assert_eq!(role, ClientRole::Viewer);
                assert_eq!(viewer_id.as_deref(), Some("abc123"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_register_broadcaster_without_viewer_id() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "register",
            "role": "broadcaster",
        }))
        .expect("valid register message");
        assert!(matches!(
            msg,
            ClientMessage::Register { role: ClientRole::Broadcaster, viewer_id: None }
        ));
    }

    #[test]
    fn test_offer_keeps_browser_sdp_shape() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "offer",
            "offer": { "type": "offer", "sdp": "v=0\r\n" },
        }))
        .expect("valid offer message");
        match msg {
            ClientMessage::Offer { offer } => assert_eq!(offer.sdp, "v=0\r\n"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_candidate_tolerates_missing_optional_fields() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "candidate",
            "candidate": { "candidate": "candidate:1 1 udp 2122260223 192.0.2.1 54400 typ host" },
        }))
        .expect("valid candidate message");
        match msg {
            ClientMessage::Candidate { candidate } => {
                assert!(candidate.candidate.starts_with("candidate:1"));
                assert!(candidate.sdp_mid.is_none());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_disconnected_notice_encodes_camel_case_tag() {
        let value = serde_json::to_value(ServerMessage::BroadcasterDisconnected { permanent: false })
            .expect("serializable");
        assert_eq!(value["type"], "broadcasterDisconnected");
        assert_eq!(value["permanent"], false);
    }

    #[test]
    fn test_registered_omits_absent_fields() {
        let value = serde_json::to_value(ServerMessage::Registered {
            role: ClientRole::Viewer,
            viewer_id: Some("v1".to_string()),
            viewer_count: None,
        })
        .expect("serializable");
        assert_eq!(value["type"], "registered");
        assert_eq!(value["viewerId"], "v1");
        assert!(value.get("viewerCount").is_none());
    }

    #[test]
    fn test_malformed_message_is_a_decode_error() {
        assert!(serde_json::from_str::<ClientMessage>("{\"type\":\"launch\"}").is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }
}
