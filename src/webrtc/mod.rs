//! WebRTC playback over WHEP
//!
//! Negotiation runs strictly in order: ICE server discovery, offer, answer,
//! then trickle ICE. Candidates gathered before the server has answered are
//! queued and sent in one PATCH once the session URL is known.

pub mod peer;
pub mod sdp;
pub mod signaling;
mod stats;
mod transport;
mod trickle;

pub use peer::{PeerConnector, PeerEvent, PeerEventSender, PeerSession, RtcPeerConnector};
pub use sdp::{LocalCandidate, SdpOffer, SdpOfferMedia};
pub use signaling::{ConnectionState, IceServerDescriptor, WhepClient};
pub use transport::WebRtcTransport;
