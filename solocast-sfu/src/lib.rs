//! Solocast SFU core
//!
//! A single-broadcaster selective forwarding unit: one live publisher,
//! any number of viewers, video relayed without transcoding. This crate
//! holds the whole signaling and relay state machine; the transport
//! surface (WebSocket + HTTP) lives in the server binary.
//!
//! ## Architecture
//!
//! - **`Registry`**: owns the singleton broadcaster slot and the viewer
//!   roster; processes all events on one sequential task
//! - **`BroadcasterSession`** / **`ViewerSession`**: per-peer negotiation
//!   state machines
//! - **`RelayPeer`** / **`PeerFactory`**: the peer-connection capability
//!   contract, implemented with webrtc-rs and faked in tests
//! - **`VideoSource`**: shared handle to the relayed track, substituted
//!   into viewer slots without renegotiation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use solocast_sfu::{Config, Registry};
//! use solocast_sfu::peer::WebRtcPeerFactory;
//! use std::sync::Arc;
//!
//! let config = Config::load()?;
//! let factory = Arc::new(WebRtcPeerFactory::new(config.webrtc.clone()));
//! let registry = Registry::spawn(factory, config.webrtc.disconnect_grace());
//! // hand `registry` to the signaling transport
//! ```

pub mod broadcaster;
pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod peer;
pub mod registry;
#[cfg(test)]
pub(crate) mod test_support;
pub mod types;
pub mod viewer;

pub use config::Config;
pub use error::{Error, Result};
pub use registry::{BroadcasterStatus, Registry, RegistryHandle, RegistryStatus};
