//! Peer-connection abstraction and its webrtc-rs implementation.
//!
//! The rest of the relay talks to peer connections through the
//! [`RelayPeer`] / [`PeerFactory`] traits and receives callbacks as
//! [`PeerEvent`]s on a session-tagged channel, so the signaling state
//! machine can be exercised without a media engine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry as InterceptorRegistry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::config::WebRtcConfig;
use crate::error::{Error, Result};
use crate::types::ViewerId;

/// Interval between keyframe requests toward the broadcaster, so a viewer
/// joining mid-stream does not stare at a black frame until the next
/// natural keyframe.
const PLI_INTERVAL: Duration = Duration::from_secs(3);

/// Shared handle to the relayed video track.
///
/// The underlying local track fans out every written RTP packet to all
/// senders currently bound to it, so one handle can feed every viewer.
/// The handle itself is never mutated; replacing the broadcast source
/// means producing a new `VideoSource` and substituting it per viewer.
#[derive(Clone)]
pub struct VideoSource {
    track: Arc<TrackLocalStaticRTP>,
}

impl VideoSource {
    #[must_use]
    pub fn new(track: Arc<TrackLocalStaticRTP>) -> Self {
        Self { track }
    }

    /// The local track, ready to hand to a sender slot.
    #[must_use]
    pub fn track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.track.id()
    }

    /// Whether two handles refer to the same underlying track.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.track, &other.track)
    }
}

impl fmt::Debug for VideoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VideoSource").field(&self.id()).finish()
    }
}

/// Notifications surfaced from a peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A remote video track arrived and its RTP is being pumped into the
    /// carried source (broadcaster peers only).
    VideoTrack(VideoSource),
    /// The pumped remote track ended.
    TrackEnded,
    /// A locally gathered ICE candidate to trickle to the remote side.
    IceCandidate(RTCIceCandidateInit),
    /// ICE connectivity was lost badly enough to need a restart.
    IceFailed,
    /// Aggregate connection state change.
    ConnectionState(RTCPeerConnectionState),
}

/// Identifies the session a peer event belongs to. The epoch lets the
/// registry drop events from a session that has since been replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRef {
    Broadcaster { epoch: u64 },
    Viewer { id: ViewerId, epoch: u64 },
}

/// Session-tagged event sender handed to a peer at construction.
#[derive(Clone)]
pub struct PeerEvents {
    session: SessionRef,
    tx: mpsc::UnboundedSender<(SessionRef, PeerEvent)>,
}

impl PeerEvents {
    #[must_use]
    pub fn new(session: SessionRef, tx: mpsc::UnboundedSender<(SessionRef, PeerEvent)>) -> Self {
        Self { session, tx }
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send((self.session.clone(), event));
    }
}

/// The capability contract the relay needs from a peer connection.
///
/// Mirrors the browser-side surface: SDP negotiation, trickle ICE, and
/// in-place substitution of the source feeding the reserved video slot.
/// `close` must be idempotent.
#[async_trait]
pub trait RelayPeer: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<RTCSessionDescription>;
    async fn create_answer(&self) -> Result<RTCSessionDescription>;
    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;
    /// Substitute the source feeding the reserved send slot without
    /// renegotiating. Viewer peers only.
    async fn attach_video(&self, source: &VideoSource) -> Result<()>;
    async fn close(&self);
}

/// Builds role-specific peers.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// A broadcaster-facing peer: one recv-only video slot reserved up
    /// front, so the remote offer negotiates a video line before any
    /// track exists.
    async fn create_broadcaster_peer(&self, events: PeerEvents) -> Result<Arc<dyn RelayPeer>>;
    /// A viewer-facing peer: one send-only video slot reserved up front,
    /// available for substitution for the life of the connection.
    async fn create_viewer_peer(&self, events: PeerEvents) -> Result<Arc<dyn RelayPeer>>;
}

/// `PeerFactory` backed by webrtc-rs.
pub struct WebRtcPeerFactory {
    config: WebRtcConfig,
}

impl WebRtcPeerFactory {
    #[must_use]
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }

    async fn new_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = InterceptorRegistry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = self
            .config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?;

        Ok(Arc::new(pc))
    }
}

/// Wire the callbacks every peer forwards regardless of role.
fn wire_common(pc: &Arc<RTCPeerConnection>, events: &PeerEvents) {
    let ev = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let ev = ev.clone();
        Box::pin(async move {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => ev.emit(PeerEvent::IceCandidate(init)),
                    Err(e) => warn!(error = %e, "failed to serialize local ICE candidate"),
                }
            }
        })
    }));

    let ev = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state| {
        let ev = ev.clone();
        Box::pin(async move {
            debug!(ice_state = %state, "ICE connection state changed");
            if state == RTCIceConnectionState::Failed {
                ev.emit(PeerEvent::IceFailed);
            }
        })
    }));

    let ev = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let ev = ev.clone();
        Box::pin(async move {
            ev.emit(PeerEvent::ConnectionState(state));
        })
    }));
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create_broadcaster_peer(&self, events: PeerEvents) -> Result<Arc<dyn RelayPeer>> {
        let pc = self.new_connection().await?;

        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await?;

        wire_common(&pc, &events);

        let cancel = CancellationToken::new();
        let ev = events.clone();
        let track_cancel = cancel.clone();
        let pc_weak = Arc::downgrade(&pc);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let ev = ev.clone();
            let cancel = track_cancel.clone();
            let pc_weak = pc_weak.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Video {
                    debug!(kind = %track.kind(), "ignoring non-video track");
                    return;
                }

                let codec = track.codec().capability;
                info!(
                    ssrc = track.ssrc(),
                    codec = %codec.mime_type,
                    "broadcast video track received"
                );

                let relay = Arc::new(TrackLocalStaticRTP::new(
                    codec,
                    format!("relay-{}", track.ssrc()),
                    "solocast".to_string(),
                ));
                ev.emit(PeerEvent::VideoTrack(VideoSource::new(relay.clone())));

                // Periodic keyframe requests for the life of this track.
                if let Some(pc) = pc_weak.upgrade() {
                    let media_ssrc = track.ssrc();
                    let pli_cancel = cancel.clone();
                    tokio::spawn(async move {
                        let mut ticker = tokio::time::interval(PLI_INTERVAL);
                        loop {
                            tokio::select! {
                                _ = pli_cancel.cancelled() => break,
                                _ = ticker.tick() => {
                                    let pli = PictureLossIndication {
                                        sender_ssrc: 0,
                                        media_ssrc,
                                    };
                                    if pc.write_rtcp(&[Box::new(pli)]).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    });
                }

                // RTP pump: remote track into the shared relay track.
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            read = track.read_rtp() => match read {
                                Ok((packet, _)) => {
                                    if let Err(e) = relay.write_rtp(&packet).await {
                                        if e != webrtc::Error::ErrClosedPipe {
                                            warn!(error = %e, "relay write failed");
                                        }
                                    }
                                }
                                Err(e) => {
                                    debug!(error = %e, "broadcast track ended");
                                    break;
                                }
                            }
                        }
                    }
                    ev.emit(PeerEvent::TrackEnded);
                });
            })
        }));

        Ok(Arc::new(WebRtcPeer {
            pc,
            video_sender: None,
            cancel,
        }))
    }

    async fn create_viewer_peer(&self, events: PeerEvents) -> Result<Arc<dyn RelayPeer>> {
        let pc = self.new_connection().await?;

        let transceiver = pc
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        let sender = transceiver.sender().await;

        wire_common(&pc, &events);

        Ok(Arc::new(WebRtcPeer {
            pc,
            video_sender: Some(sender),
            cancel: CancellationToken::new(),
        }))
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    /// Sender of the reserved send-only video slot (viewer peers).
    video_sender: Option<Arc<RTCRtpSender>>,
    cancel: CancellationToken,
}

#[async_trait]
impl RelayPeer for WebRtcPeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<RTCSessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        Ok(self.pc.create_offer(options).await?)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        Ok(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
        Ok(self.pc.set_local_description(desc).await?)
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        Ok(self.pc.set_remote_description(desc).await?)
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        Ok(self.pc.add_ice_candidate(candidate).await?)
    }

    async fn attach_video(&self, source: &VideoSource) -> Result<()> {
        let sender = self
            .video_sender
            .as_ref()
            .ok_or_else(|| Error::Internal("peer has no reserved video slot".to_string()))?;
        sender.replace_track(Some(source.track())).await?;
        Ok(())
    }

    async fn close(&self) {
        self.cancel.cancel();
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "peer close reported an error");
        }
    }
}
