//! MeshCall signaling core.
//! Host-driven: no I/O; host passes frames and requests, and receives actions.

pub mod call;
pub mod connection;
pub mod contact;
pub mod core;
pub mod envelope;
pub mod event;
pub mod identity;
pub mod media;
pub mod protocol;
pub mod store;
pub mod wire;

pub use call::{CallError, CallSession, CallState};
pub use connection::{ConnectionId, Inbound, Phase};
pub use contact::{Contact, Presence};
pub use core::{ConnectionError, CoreError, MeshCore, Notification, OutboundAction};
pub use event::{CallEvent, EventKind};
pub use identity::{Keypair, PublicKey};
pub use media::{MediaError, MediaNegotiator};
pub use protocol::{Message, PROTOCOL_VERSION, SIGNALING_PORT};
pub use store::{Database, Persistence, Settings, StoreError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, WIRE_VERSION};
