//! Peer session lifecycle for the Lisan voice tutor.
//!
//! A [`PeerSession`] is an actor: one task owns the peer link, the outbound
//! audio track and the event channel, and processes commands, transport
//! callbacks and playback signals strictly in order. [`TutorController`]
//! keeps at most one of them live.

pub mod controller;
pub mod protocol;
pub mod rtc;
pub mod session;
pub mod transport;

pub use controller::TutorController;
pub use protocol::EventProtocolHandler;
pub use rtc::WebRtcConnector;
pub use session::{
    PeerSession, SessionDeps, SessionEvent, SessionOptions, SessionStatus, StartOutcome,
};
pub use transport::{EventChannel, PeerConnector, PeerLink, PeerState, TransportEvent};
