//! Transport session to the remote recognition service
//!
//! One socket connection per session: lifecycle tracking
//! (connecting → open → closing → closed), raw send primitives, and a single
//! ordered inbound-notification pathway for frames and connection events.

pub mod client;
pub mod messages;
pub mod session;

pub use client::{WebSocketSession, CLOSE_HANDSHAKE_TIMEOUT};
pub use messages::{decode_frame, InboundMessage, ServiceMessage, END_OF_STREAM};
pub use session::{EventHandler, Frame, SessionState, Transport, TransportEvent};
