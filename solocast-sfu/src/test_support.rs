//! Shared fakes for exercising the signaling core without a media engine.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::channel::MessageSender;
use crate::error::{Error, Result};
use crate::message::ServerMessage;
use crate::peer::{PeerEvents, PeerFactory, RelayPeer, VideoSource};

/// A distinct relay source; `same_as` only holds between clones.
pub fn video_source(label: &str) -> VideoSource {
    VideoSource::new(Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            ..Default::default()
        },
        label.to_string(),
        "test-stream".to_string(),
    )))
}

/// Session descriptions built through serde so no SDP parsing happens.
fn description(kind: &str, tag: &str) -> RTCSessionDescription {
    serde_json::from_value(serde_json::json!({
        "type": kind,
        "sdp": format!("v=0 {tag}"),
    }))
    .expect("static description json")
}

pub fn offer_sdp(tag: &str) -> RTCSessionDescription {
    description("offer", tag)
}

pub fn answer_sdp(tag: &str) -> RTCSessionDescription {
    description("answer", tag)
}

pub fn candidate(tag: &str) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: format!("candidate:{tag}"),
        ..Default::default()
    }
}

/// Operations observed on a [`FakePeer`], in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCall {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(String),
    SetRemote(String),
    AddCandidate(String),
    AttachVideo(String),
    Close,
}

/// Scripted peer double. Candidates whose text contains `poison` are
/// recorded but rejected, for drain-continues assertions.
#[derive(Default)]
pub struct FakePeer {
    calls: Mutex<Vec<PeerCall>>,
    fail_offer: Mutex<bool>,
    fail_remote: Mutex<bool>,
}

impl FakePeer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    pub fn fail_offer(&self) {
        *self.fail_offer.lock() = true;
    }

    pub fn fail_remote(&self) {
        *self.fail_remote.lock() = true;
    }

    pub fn clear_failures(&self) {
        *self.fail_offer.lock() = false;
        *self.fail_remote.lock() = false;
    }

    pub fn closed(&self) -> bool {
        self.calls.lock().contains(&PeerCall::Close)
    }

    pub fn offer_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, PeerCall::CreateOffer { .. }))
            .count()
    }

    pub fn attach_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, PeerCall::AttachVideo(_)))
            .count()
    }
}

#[async_trait]
impl RelayPeer for FakePeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<RTCSessionDescription> {
        if *self.fail_offer.lock() {
            return Err(Error::Internal("offer refused".to_string()));
        }
        self.calls.lock().push(PeerCall::CreateOffer { ice_restart });
        Ok(offer_sdp("fake"))
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        self.calls.lock().push(PeerCall::CreateAnswer);
        Ok(answer_sdp("fake"))
    }

    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.calls.lock().push(PeerCall::SetLocal(desc.sdp));
        Ok(())
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        if *self.fail_remote.lock() {
            return Err(Error::Internal("remote description refused".to_string()));
        }
        self.calls.lock().push(PeerCall::SetRemote(desc.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        let text = candidate.candidate;
        self.calls.lock().push(PeerCall::AddCandidate(text.clone()));
        if text.contains("poison") {
            return Err(Error::Internal("candidate refused".to_string()));
        }
        Ok(())
    }

    async fn attach_video(&self, source: &VideoSource) -> Result<()> {
        self.calls
            .lock()
            .push(PeerCall::AttachVideo(source.id().to_string()));
        Ok(())
    }

    async fn close(&self) {
        self.calls.lock().push(PeerCall::Close);
    }
}

/// Factory double handing out [`FakePeer`]s and capturing the event
/// senders so tests can inject peer events.
#[derive(Default)]
pub struct FakePeerFactory {
    pub broadcasters: Mutex<Vec<Arc<FakePeer>>>,
    pub broadcaster_events: Mutex<Vec<PeerEvents>>,
    pub viewers: Mutex<Vec<Arc<FakePeer>>>,
    pub viewer_events: Mutex<Vec<PeerEvents>>,
    fail_next: Mutex<bool>,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self) {
        *self.fail_next.lock() = true;
    }

    pub fn last_broadcaster(&self) -> Arc<FakePeer> {
        self.broadcasters.lock().last().expect("a broadcaster peer").clone()
    }

    pub fn last_viewer(&self) -> Arc<FakePeer> {
        self.viewers.lock().last().expect("a viewer peer").clone()
    }

    fn take_failure(&self) -> bool {
        std::mem::take(&mut *self.fail_next.lock())
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create_broadcaster_peer(&self, events: PeerEvents) -> Result<Arc<dyn RelayPeer>> {
        if self.take_failure() {
            return Err(Error::Internal("engine refused".to_string()));
        }
        let peer = FakePeer::new();
        self.broadcasters.lock().push(peer.clone());
        self.broadcaster_events.lock().push(events);
        Ok(peer)
    }

    async fn create_viewer_peer(&self, events: PeerEvents) -> Result<Arc<dyn RelayPeer>> {
        if self.take_failure() {
            return Err(Error::Internal("engine refused".to_string()));
        }
        let peer = FakePeer::new();
        self.viewers.lock().push(peer.clone());
        self.viewer_events.lock().push(events);
        Ok(peer)
    }
}

/// Channel double recording every message pushed to one client.
#[derive(Default)]
pub struct RecordingSender {
    messages: Mutex<Vec<ServerMessage>>,
    closed: Mutex<bool>,
}

impl RecordingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn close(&self) {
        *self.closed.lock() = true;
    }

    pub fn messages(&self) -> Vec<ServerMessage> {
        self.messages.lock().clone()
    }

    /// Wire `type` tags of everything sent, for order assertions.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.messages.lock().iter().map(ServerMessage::kind).collect()
    }
}

impl MessageSender for RecordingSender {
    fn send(&self, message: ServerMessage) -> Result<()> {
        if *self.closed.lock() {
            return Err(Error::ChannelClosed);
        }
        self.messages.lock().push(message);
        Ok(())
    }
}
