//! # objsync-wire: push-notification transport for objsync
//!
//! A minimal WebSocket client: opening handshake, base framing, masking,
//! fragmentation and close handling, plus the tokio task that keeps one
//! notification connection alive and fans decoded events out to engines.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  bytes   ┌──────────────┐  Event   ┌──────────────┐
//! │  TcpStream   │ ───────► │   Session    │ ───────► │  broadcast   │
//! │ (connection) │ ◄─────── │  (sans-IO)   │          │  (fan-out)   │
//! └──────────────┘  frames  └──────┬───────┘          └──────────────┘
//!                                  │
//!                           ┌──────┴───────┐
//!                           │ frame codec  │
//!                           │ handshake    │
//!                           └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`frame`]: stateless frame encode/decode
//! - [`mask`]: client-to-server masking
//! - [`close`]: close status codes
//! - [`handshake`]: HTTP Upgrade request and response validation
//! - [`notification`]: JSON notification messages
//! - [`session`]: handshake + framing state machine, no I/O
//! - [`connection`]: tokio driver with reconnect and fan-out

pub mod close;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod notification;
pub mod session;

pub use close::CloseStatus;
pub use connection::{
    ChannelConfig, ChannelStats, ConnectionState, NotificationChannel, ReconnectPolicy,
};
pub use error::{HandshakeError, ProtocolError, TransportError};
pub use frame::{Decoded, Frame, FrameHeader, MaskPolicy, OpCode};
pub use handshake::{Endpoint, Handshake};
pub use notification::{Event, EventKind, EventParseError};
pub use session::{Session, SessionEvent, SessionState};
