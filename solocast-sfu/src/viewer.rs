//! Viewer session state machine and ICE candidate buffering.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::channel::MessageSender;
use crate::error::Result;
use crate::message::ServerMessage;
use crate::peer::{RelayPeer, VideoSource};
use crate::types::{ConnectionId, ViewerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    /// Admitted, no offer sent yet.
    Connecting,
    /// Server offer sent, waiting for the answer.
    Offered,
    /// Answer applied; media can flow.
    Negotiated,
}

/// FIFO buffer for candidates that arrive before a remote description
/// exists. Drained exactly once, in arrival order.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<RTCIceCandidateInit>,
}

impl CandidateBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: RTCIceCandidateInit) {
        self.queue.push_back(candidate);
    }

    pub fn drain(&mut self) -> Vec<RTCIceCandidateInit> {
        self.queue.drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// One admitted viewer: a signaling channel, a peer with a reserved
/// send-only video slot, and the buffering needed to survive out-of-order
/// network events.
pub struct ViewerSession {
    pub id: ViewerId,
    pub epoch: u64,
    conn: ConnectionId,
    channel: Arc<dyn MessageSender>,
    peer: Arc<dyn RelayPeer>,
    state: ViewerState,
    /// Candidates waiting for the first answer to be applied.
    pending_candidates: CandidateBuffer,
    /// Whether a remote description has ever been applied. Buffering is
    /// gated on this rather than on `state` so an ICE restart (which goes
    /// back to `Offered`) does not restart buffering.
    remote_set: bool,
    /// Source currently occupying the reserved slot.
    attached: Option<VideoSource>,
    /// Substitution parked until negotiation completes.
    deferred: Option<VideoSource>,
}

impl ViewerSession {
    pub fn new(
        id: ViewerId,
        conn: ConnectionId,
        epoch: u64,
        channel: Arc<dyn MessageSender>,
        peer: Arc<dyn RelayPeer>,
    ) -> Self {
        Self {
            id,
            epoch,
            conn,
            channel,
            peer,
            state: ViewerState::Connecting,
            pending_candidates: CandidateBuffer::new(),
            remote_set: false,
            attached: None,
            deferred: None,
        }
    }

    #[must_use]
    pub fn conn(&self) -> &ConnectionId {
        &self.conn
    }

    #[must_use]
    pub fn state(&self) -> ViewerState {
        self.state
    }

    /// Generate and push a server-initiated offer.
    pub async fn send_offer(&mut self, ice_restart: bool) -> Result<()> {
        let offer = self.peer.create_offer(ice_restart).await?;
        self.peer.set_local_description(offer.clone()).await?;
        self.send(ServerMessage::Offer { offer });
        self.state = ViewerState::Offered;
        Ok(())
    }

    /// Attach the live source at admission time, before the first offer,
    /// so the offer already references it.
    pub async fn attach_initial(&mut self, source: &VideoSource) {
        match self.peer.attach_video(source).await {
            Ok(()) => self.attached = Some(source.clone()),
            Err(e) => warn!(viewer_id = %self.id, error = %e, "initial track attach failed"),
        }
    }

    /// Substitute the live source into the reserved slot. Substituting the
    /// source already in place is a no-op; before negotiation completes
    /// the substitution is parked for the post-answer flush.
    pub async fn substitute(&mut self, source: &VideoSource) {
        if let Some(current) = &self.attached {
            if current.same_as(source) {
                return;
            }
        }
        if self.state != ViewerState::Negotiated {
            debug!(viewer_id = %self.id, track = %source.id(), "deferring substitution until negotiated");
            self.deferred = Some(source.clone());
            return;
        }
        match self.peer.attach_video(source).await {
            Ok(()) => {
                self.attached = Some(source.clone());
                self.deferred = None;
            }
            Err(e) => warn!(viewer_id = %self.id, error = %e, "track substitution failed"),
        }
    }

    /// Apply the viewer's answer, then flush everything that was waiting
    /// on it: buffered candidates first (in arrival order), then any
    /// deferred track substitution.
    pub async fn handle_answer(&mut self, answer: RTCSessionDescription) -> Result<()> {
        self.peer.set_remote_description(answer).await?;
        self.state = ViewerState::Negotiated;
        self.remote_set = true;

        for candidate in self.pending_candidates.drain() {
            if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                warn!(viewer_id = %self.id, error = %e, "buffered candidate rejected");
            }
        }

        if let Some(source) = self.deferred.take() {
            self.substitute(&source).await;
        }

        Ok(())
    }

    /// Apply or buffer a trickled candidate, depending on whether a remote
    /// description exists yet.
    pub async fn handle_candidate(&mut self, candidate: RTCIceCandidateInit) {
        if !self.remote_set {
            self.pending_candidates.push(candidate);
            debug!(
                viewer_id = %self.id,
                buffered = self.pending_candidates.len(),
                "buffered early candidate"
            );
            return;
        }
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            warn!(viewer_id = %self.id, error = %e, "viewer candidate rejected");
        }
    }

    /// Recover from an ICE connectivity failure with a restart offer,
    /// keeping the session (and its negotiated slot) alive.
    pub async fn restart_ice(&mut self) {
        if let Err(e) = self.send_offer(true).await {
            warn!(viewer_id = %self.id, error = %e, "ICE restart offer failed");
        }
    }

    pub fn send(&self, message: ServerMessage) {
        if let Err(e) = self.channel.send(message) {
            debug!(viewer_id = %self.id, error = %e, "viewer channel send failed");
        }
    }

    pub async fn destroy(self) {
        self.peer.close().await;
    }
}
