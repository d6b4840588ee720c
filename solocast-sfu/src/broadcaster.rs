//! Broadcaster session state machine.

use std::sync::Arc;

use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::channel::MessageSender;
use crate::error::Result;
use crate::message::ServerMessage;
use crate::peer::{RelayPeer, VideoSource};
use crate::types::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcasterState {
    /// Registered, no live media yet.
    Connecting,
    /// A video track is live.
    Active,
}

/// The singleton upstream session. At most one exists at a time; the
/// registry enforces destructive replacement.
pub struct BroadcasterSession {
    conn: ConnectionId,
    pub epoch: u64,
    channel: Arc<dyn MessageSender>,
    peer: Arc<dyn RelayPeer>,
    state: BroadcasterState,
    /// Live source shared with every viewer slot. Cleared when the track
    /// ends; a renewed track may arrive later on the same connection.
    video: Option<VideoSource>,
}

impl BroadcasterSession {
    pub fn new(
        conn: ConnectionId,
        epoch: u64,
        channel: Arc<dyn MessageSender>,
        peer: Arc<dyn RelayPeer>,
    ) -> Self {
        Self {
            conn,
            epoch,
            channel,
            peer,
            state: BroadcasterState::Connecting,
            video: None,
        }
    }

    #[must_use]
    pub fn conn(&self) -> &ConnectionId {
        &self.conn
    }

    #[must_use]
    pub fn state(&self) -> BroadcasterState {
        self.state
    }

    #[must_use]
    pub fn video(&self) -> Option<&VideoSource> {
        self.video.as_ref()
    }

    /// Apply the broadcaster's offer and synthesize the answer. A failure
    /// leaves the session where it was; the remote side may retry with a
    /// fresh offer.
    pub async fn handle_offer(
        &mut self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription> {
        self.peer.set_remote_description(offer).await?;
        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Best-effort candidate application. The remote description is set in
    /// the same ordered message stream that delivers candidates, so
    /// nothing needs buffering here.
    pub async fn handle_candidate(&self, candidate: RTCIceCandidateInit) {
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            warn!(error = %e, "broadcaster candidate rejected");
        }
    }

    pub fn track_arrived(&mut self, source: VideoSource) {
        self.video = Some(source);
        self.state = BroadcasterState::Active;
    }

    pub fn track_ended(&mut self) {
        self.video = None;
        self.state = BroadcasterState::Connecting;
    }

    pub fn send(&self, message: ServerMessage) {
        if let Err(e) = self.channel.send(message) {
            debug!(error = %e, "broadcaster channel send failed");
        }
    }

    pub async fn destroy(self) {
        self.peer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{answer_sdp, candidate, offer_sdp, video_source, FakePeer, PeerCall, RecordingSender};

    fn session(peer: Arc<FakePeer>, sender: Arc<RecordingSender>) -> BroadcasterSession {
        BroadcasterSession::new(ConnectionId::from("b-conn"), 1, sender, peer)
    }

    #[tokio::test]
    async fn test_offer_produces_answer() {
        let peer = FakePeer::new();
        let sender = RecordingSender::new();
        let mut session = session(peer.clone(), sender);

        let answer = session.handle_offer(offer_sdp("o1")).await.expect("answer");
        assert_eq!(answer.sdp, answer_sdp("fake").sdp);
        assert_eq!(
            peer.calls(),
            vec![
                PeerCall::SetRemote("v=0 o1".to_string()),
                PeerCall::CreateAnswer,
                PeerCall::SetLocal(answer.sdp),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_offer_leaves_state_for_retry() {
        let peer = FakePeer::new();
        peer.fail_remote();
        let sender = RecordingSender::new();
        let mut session = session(peer.clone(), sender);

        assert!(session.handle_offer(offer_sdp("bad")).await.is_err());
        assert_eq!(session.state(), BroadcasterState::Connecting);

        // Recovered remote side retries successfully.
        peer.clear_failures();
        assert!(session.handle_offer(offer_sdp("good")).await.is_ok());
    }

    #[tokio::test]
    async fn test_candidate_errors_are_swallowed() {
        let peer = FakePeer::new();
        let sender = RecordingSender::new();
        let session = session(peer.clone(), sender);

        session.handle_candidate(candidate("poison")).await;
        session.handle_candidate(candidate("fine")).await;
        assert_eq!(
            peer.calls(),
            vec![
                PeerCall::AddCandidate("candidate:poison".to_string()),
                PeerCall::AddCandidate("candidate:fine".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_track_lifecycle() {
        let peer = FakePeer::new();
        let sender = RecordingSender::new();
        let mut session = session(peer, sender);

        assert_eq!(session.state(), BroadcasterState::Connecting);
        session.track_arrived(video_source("t1"));
        assert_eq!(session.state(), BroadcasterState::Active);
        assert!(session.video().is_some());

        // Track end clears the source but the session survives.
        session.track_ended();
        assert_eq!(session.state(), BroadcasterState::Connecting);
        assert!(session.video().is_none());
    }
}
