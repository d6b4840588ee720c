//! Session registry: admission, dispatch, and lifecycle supervision.
//!
//! The registry owns every live session and runs as a single sequential
//! command-processing task. Inbound signaling messages, channel closures,
//! peer-connection events and timer deadlines all funnel into that one
//! task, so per-session handling is strictly ordered and no two SDP
//! operations ever race on the same peer connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::broadcaster::{BroadcasterSession, BroadcasterState};
use crate::channel::MessageSender;
use crate::error::{Error, Result};
use crate::message::{ClientMessage, ClientRole, ServerMessage};
use crate::peer::{PeerEvent, PeerEvents, PeerFactory, SessionRef};
use crate::types::{ConnectionId, ViewerId};
use crate::viewer::ViewerSession;

/// Broadcaster slot state as reported to health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcasterStatus {
    Absent,
    Connecting,
    Active,
}

/// Registry snapshot for health reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStatus {
    pub broadcaster: BroadcasterStatus,
    pub viewer_count: usize,
}

/// Role bound to a signaling connection after registration.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnRole {
    Broadcaster,
    Viewer(ViewerId),
}

enum Command {
    Connected {
        conn: ConnectionId,
        sender: Arc<dyn MessageSender>,
    },
    Message {
        conn: ConnectionId,
        message: ClientMessage,
    },
    Closed {
        conn: ConnectionId,
    },
    DisconnectDeadline {
        generation: u64,
    },
    Status {
        reply: oneshot::Sender<RegistryStatus>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable front for submitting work to the registry task.
#[derive(Clone)]
pub struct RegistryHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl RegistryHandle {
    pub fn connected(&self, conn: ConnectionId, sender: Arc<dyn MessageSender>) {
        let _ = self.cmd_tx.send(Command::Connected { conn, sender });
    }

    pub fn message(&self, conn: ConnectionId, message: ClientMessage) {
        let _ = self.cmd_tx.send(Command::Message { conn, message });
    }

    pub fn closed(&self, conn: ConnectionId) {
        let _ = self.cmd_tx.send(Command::Closed { conn });
    }

    pub async fn status(&self) -> Result<RegistryStatus> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Status { reply: tx })
            .map_err(|_| Error::RegistryStopped)?;
        rx.await.map_err(|_| Error::RegistryStopped)
    }

    /// Coordinated shutdown: every viewer is told the broadcast is gone
    /// for good, then all sessions are released.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { done: tx })
            .map_err(|_| Error::RegistryStopped)?;
        rx.await.map_err(|_| Error::RegistryStopped)
    }
}

pub struct Registry {
    factory: Arc<dyn PeerFactory>,
    /// How long a broadcast gap may last before viewers hear about it.
    grace: Duration,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    peer_tx: mpsc::UnboundedSender<(SessionRef, PeerEvent)>,
    peer_rx: mpsc::UnboundedReceiver<(SessionRef, PeerEvent)>,
    connections: HashMap<ConnectionId, Arc<dyn MessageSender>>,
    conn_roles: HashMap<ConnectionId, ConnRole>,
    broadcaster: Option<BroadcasterSession>,
    viewers: HashMap<ViewerId, ViewerSession>,
    /// Monotonic session counter; lets stale peer events be rejected.
    epoch: u64,
    timer_generation: u64,
    disconnect_timer: Option<(u64, JoinHandle<()>)>,
}

impl Registry {
    pub fn new(factory: Arc<dyn PeerFactory>, grace: Duration) -> (RegistryHandle, Self) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let handle = RegistryHandle {
            cmd_tx: cmd_tx.clone(),
        };
        let registry = Self {
            factory,
            grace,
            cmd_tx,
            cmd_rx,
            peer_tx,
            peer_rx,
            connections: HashMap::new(),
            conn_roles: HashMap::new(),
            broadcaster: None,
            viewers: HashMap::new(),
            epoch: 0,
            timer_generation: 0,
            disconnect_timer: None,
        };
        (handle, registry)
    }

    /// Create and run a registry on its own task.
    pub fn spawn(factory: Arc<dyn PeerFactory>, grace: Duration) -> RegistryHandle {
        let (handle, registry) = Self::new(factory, grace);
        tokio::spawn(registry.run());
        handle
    }

    pub async fn run(mut self) {
        info!(grace_secs = self.grace.as_secs(), "session registry started");
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some((session, event)) = self.peer_rx.recv() => {
                    self.handle_peer_event(session, event).await;
                }
            }
        }
        info!("session registry stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connected { conn, sender } => {
                debug!(conn = %conn, "signaling connection attached");
                self.connections.insert(conn, sender);
            }
            Command::Message { conn, message } => self.dispatch(conn, message).await,
            Command::Closed { conn } => self.connection_closed(conn).await,
            Command::DisconnectDeadline { generation } => self.disconnect_deadline(generation),
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown { done } => {
                self.shutdown().await;
                let _ = done.send(());
            }
        }
    }

    async fn dispatch(&mut self, conn: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::Register {
                role: ClientRole::Broadcaster,
                ..
            } => self.register_broadcaster(conn).await,
            ClientMessage::Register {
                role: ClientRole::Viewer,
                viewer_id,
            } => {
                self.register_viewer(conn, viewer_id.map(ViewerId::from))
                    .await;
            }
            ClientMessage::Offer { offer } => match self.conn_roles.get(&conn).cloned() {
                Some(ConnRole::Broadcaster) => self.broadcaster_offer(offer).await,
                _ => debug!(conn = %conn, "ignoring offer from a non-broadcaster connection"),
            },
            ClientMessage::Answer { answer } => match self.conn_roles.get(&conn).cloned() {
                Some(ConnRole::Viewer(id)) => self.viewer_answer(&id, answer).await,
                _ => debug!(conn = %conn, "ignoring answer from a non-viewer connection"),
            },
            ClientMessage::Candidate { candidate } => match self.conn_roles.get(&conn).cloned() {
                Some(ConnRole::Broadcaster) => {
                    if let Some(broadcaster) = &self.broadcaster {
                        broadcaster.handle_candidate(candidate).await;
                    }
                }
                Some(ConnRole::Viewer(id)) => {
                    if let Some(viewer) = self.viewers.get_mut(&id) {
                        viewer.handle_candidate(candidate).await;
                    }
                }
                None => debug!(conn = %conn, "ignoring candidate from an unregistered connection"),
            },
        }
    }

    // ---- admission -------------------------------------------------------

    async fn register_broadcaster(&mut self, conn: ConnectionId) {
        let Some(sender) = self.connections.get(&conn).cloned() else {
            warn!(conn = %conn, "register from unknown connection");
            return;
        };

        // A connection switching roles gives up its old session first.
        self.release_role(&conn).await;

        // At most one broadcaster exists: registering destroys and
        // replaces any prior one.
        if let Some(prev) = self.broadcaster.take() {
            info!(epoch = prev.epoch, "replacing existing broadcaster");
            self.conn_roles.remove(prev.conn());
            prev.destroy().await;
        }
        self.cancel_disconnect_timer();

        self.epoch += 1;
        let events = PeerEvents::new(
            SessionRef::Broadcaster { epoch: self.epoch },
            self.peer_tx.clone(),
        );
        let peer = match self.factory.create_broadcaster_peer(events).await {
            Ok(peer) => peer,
            Err(e) => {
                error!(error = %e, "broadcaster peer construction failed");
                return;
            }
        };

        let session = BroadcasterSession::new(conn.clone(), self.epoch, sender, peer);
        session.send(ServerMessage::Registered {
            role: ClientRole::Broadcaster,
            viewer_id: None,
            viewer_count: Some(self.viewers.len()),
        });
        self.conn_roles.insert(conn, ConnRole::Broadcaster);
        self.broadcaster = Some(session);
        info!(
            epoch = self.epoch,
            viewers = self.viewers.len(),
            "broadcaster registered"
        );
    }

    async fn register_viewer(&mut self, conn: ConnectionId, requested: Option<ViewerId>) {
        let Some(sender) = self.connections.get(&conn).cloned() else {
            warn!(conn = %conn, "register from unknown connection");
            return;
        };

        self.release_role(&conn).await;

        let id = requested.unwrap_or_else(ViewerId::generate);

        // Re-registration under the same id tears down the prior session.
        if let Some(prev) = self.viewers.remove(&id) {
            info!(viewer_id = %id, "replacing existing viewer session");
            self.conn_roles.remove(prev.conn());
            prev.destroy().await;
        }

        self.epoch += 1;
        let events = PeerEvents::new(
            SessionRef::Viewer {
                id: id.clone(),
                epoch: self.epoch,
            },
            self.peer_tx.clone(),
        );
        let peer = match self.factory.create_viewer_peer(events).await {
            Ok(peer) => peer,
            Err(e) => {
                error!(viewer_id = %id, error = %e, "viewer peer construction failed");
                return;
            }
        };

        let mut session = ViewerSession::new(id.clone(), conn.clone(), self.epoch, sender, peer);
        session.send(ServerMessage::Registered {
            role: ClientRole::Viewer,
            viewer_id: Some(id.to_string()),
            viewer_count: None,
        });

        match &self.broadcaster {
            Some(broadcaster) => {
                if let Some(source) = broadcaster.video().cloned() {
                    session.attach_initial(&source).await;
                }
            }
            None => {
                // No upstream right now; tell the viewer up front, but keep
                // the session ready for a broadcaster to appear.
                session.send(ServerMessage::BroadcasterDisconnected { permanent: false });
            }
        }

        if let Err(e) = session.send_offer(false).await {
            warn!(viewer_id = %id, error = %e, "initial offer failed; viewer may retry by re-registering");
        }

        self.conn_roles.insert(conn, ConnRole::Viewer(id.clone()));
        self.viewers.insert(id.clone(), session);
        info!(viewer_id = %id, viewers = self.viewers.len(), "viewer registered");
        self.notify_viewer_count();
    }

    // ---- negotiation -----------------------------------------------------

    async fn broadcaster_offer(&mut self, offer: RTCSessionDescription) {
        let Some(broadcaster) = self.broadcaster.as_mut() else {
            return;
        };
        match broadcaster.handle_offer(offer).await {
            Ok(answer) => broadcaster.send(ServerMessage::Answer { answer }),
            Err(e) => warn!(error = %e, "broadcaster offer failed; awaiting retry"),
        }
    }

    async fn viewer_answer(&mut self, id: &ViewerId, answer: RTCSessionDescription) {
        let Some(viewer) = self.viewers.get_mut(id) else {
            return;
        };
        if let Err(e) = viewer.handle_answer(answer).await {
            warn!(viewer_id = %id, error = %e, "viewer answer failed; session keeps its state");
        }
    }

    // ---- lifecycle -------------------------------------------------------

    async fn connection_closed(&mut self, conn: ConnectionId) {
        self.connections.remove(&conn);
        debug!(conn = %conn, "signaling connection closed");
        self.release_role(&conn).await;
    }

    async fn release_role(&mut self, conn: &ConnectionId) {
        match self.conn_roles.remove(conn) {
            Some(ConnRole::Broadcaster) => self.broadcaster_lost().await,
            Some(ConnRole::Viewer(id)) => self.remove_viewer(&id).await,
            None => {}
        }
    }

    /// Free broadcaster resources immediately, but keep viewers in the
    /// dark for the grace period: a quick reconnect then looks like an
    /// uninterrupted stream.
    async fn broadcaster_lost(&mut self) {
        if let Some(session) = self.broadcaster.take() {
            self.conn_roles.remove(session.conn());
            session.destroy().await;
        }
        info!(
            grace_secs = self.grace.as_secs(),
            "broadcaster gone; delaying viewer notification"
        );
        self.arm_disconnect_timer();
    }

    async fn remove_viewer(&mut self, id: &ViewerId) {
        if let Some(session) = self.viewers.remove(id) {
            self.conn_roles.remove(session.conn());
            session.destroy().await;
            info!(viewer_id = %id, remaining = self.viewers.len(), "viewer removed");
            self.notify_viewer_count();
        }
    }

    fn arm_disconnect_timer(&mut self) {
        self.cancel_disconnect_timer();
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let tx = self.cmd_tx.clone();
        let grace = self.grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(Command::DisconnectDeadline { generation });
        });
        self.disconnect_timer = Some((generation, handle));
    }

    fn cancel_disconnect_timer(&mut self) {
        if let Some((_, handle)) = self.disconnect_timer.take() {
            handle.abort();
        }
    }

    fn disconnect_deadline(&mut self, generation: u64) {
        // An aborted timer may still have raced its deadline into the
        // queue; the generation check decides.
        match self.disconnect_timer.take() {
            Some((armed, _)) if armed == generation => {}
            other => {
                self.disconnect_timer = other;
                return;
            }
        }
        if self.broadcaster.is_some() {
            return;
        }
        info!(
            viewers = self.viewers.len(),
            "broadcast gap outlived the grace period; notifying viewers"
        );
        self.broadcast_to_viewers(&ServerMessage::BroadcasterDisconnected { permanent: false });
    }

    // ---- peer events -----------------------------------------------------

    async fn handle_peer_event(&mut self, session: SessionRef, event: PeerEvent) {
        match session {
            SessionRef::Broadcaster { epoch } => {
                if self.broadcaster.as_ref().map(|b| b.epoch) != Some(epoch) {
                    debug!(epoch, "dropping stale broadcaster peer event");
                    return;
                }
                self.broadcaster_event(event).await;
            }
            SessionRef::Viewer { id, epoch } => {
                if self.viewers.get(&id).map(|v| v.epoch) != Some(epoch) {
                    debug!(viewer_id = %id, epoch, "dropping stale viewer peer event");
                    return;
                }
                self.viewer_event(id, event).await;
            }
        }
    }

    async fn broadcaster_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::VideoTrack(source) => {
                if let Some(broadcaster) = self.broadcaster.as_mut() {
                    broadcaster.track_arrived(source.clone());
                }
                info!(
                    track = %source.id(),
                    viewers = self.viewers.len(),
                    "broadcast track live; updating viewer slots"
                );
                for viewer in self.viewers.values_mut() {
                    viewer.substitute(&source).await;
                }
            }
            PeerEvent::TrackEnded => {
                info!("broadcast track ended; awaiting renewal");
                if let Some(broadcaster) = self.broadcaster.as_mut() {
                    broadcaster.track_ended();
                }
            }
            PeerEvent::IceCandidate(candidate) => {
                if let Some(broadcaster) = &self.broadcaster {
                    broadcaster.send(ServerMessage::Candidate { candidate });
                }
            }
            PeerEvent::IceFailed => {
                // The broadcaster is the offering side; recovery is its
                // move, via a fresh offer on the still-open channel.
                warn!("broadcaster ICE failed; waiting for a new offer");
            }
            PeerEvent::ConnectionState(state) => {
                debug!(state = %state, "broadcaster connection state");
                if state == RTCPeerConnectionState::Failed {
                    warn!("broadcaster connection failed; notifying viewers");
                    self.broadcast_to_viewers(&ServerMessage::BroadcasterDisconnected {
                        permanent: false,
                    });
                }
            }
        }
    }

    async fn viewer_event(&mut self, id: ViewerId, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                if let Some(viewer) = self.viewers.get(&id) {
                    viewer.send(ServerMessage::Candidate { candidate });
                }
            }
            PeerEvent::IceFailed => {
                info!(viewer_id = %id, "viewer ICE failed; sending restart offer");
                if let Some(viewer) = self.viewers.get_mut(&id) {
                    viewer.restart_ice().await;
                }
            }
            PeerEvent::ConnectionState(state) => {
                debug!(viewer_id = %id, state = %state, "viewer connection state");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    self.remove_viewer(&id).await;
                }
            }
            PeerEvent::VideoTrack(_) | PeerEvent::TrackEnded => {
                debug!(viewer_id = %id, "unexpected media event from a viewer peer");
            }
        }
    }

    // ---- fan-out helpers -------------------------------------------------

    fn broadcast_to_viewers(&self, message: &ServerMessage) {
        for viewer in self.viewers.values() {
            viewer.send(message.clone());
        }
    }

    fn notify_viewer_count(&self) {
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.send(ServerMessage::ViewerCount {
                count: self.viewers.len(),
            });
        }
    }

    fn status(&self) -> RegistryStatus {
        let broadcaster = match &self.broadcaster {
            None => BroadcasterStatus::Absent,
            Some(b) if b.state() == BroadcasterState::Active => BroadcasterStatus::Active,
            Some(_) => BroadcasterStatus::Connecting,
        };
        RegistryStatus {
            broadcaster,
            viewer_count: self.viewers.len(),
        }
    }

    async fn shutdown(&mut self) {
        info!(viewers = self.viewers.len(), "shutting down; notifying viewers");
        self.cancel_disconnect_timer();
        self.broadcast_to_viewers(&ServerMessage::BroadcasterDisconnected { permanent: true });
        if let Some(broadcaster) = self.broadcaster.take() {
            broadcaster.destroy().await;
        }
        for (_, viewer) in self.viewers.drain() {
            viewer.destroy().await;
        }
        self.connections.clear();
        self.conn_roles.clear();
    }
}
