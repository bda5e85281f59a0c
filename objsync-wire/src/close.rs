//! Close status codes and the Close frame payload.
//!
//! The payload of a Close frame starts with a 2-byte big-endian status code. Anything
//! after it is a free-form reason which is read past and discarded.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A WebSocket close status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloseStatus(pub u16);

impl CloseStatus {
    pub const NORMAL: CloseStatus = CloseStatus(1000);
    pub const GOING_AWAY: CloseStatus = CloseStatus(1001);
    pub const PROTOCOL_ERROR: CloseStatus = CloseStatus(1002);
    pub const UNSUPPORTED_DATA: CloseStatus = CloseStatus(1003);
    /// Never sent on the wire; reported when a Close frame carries no status.
    pub const NO_STATUS: CloseStatus = CloseStatus(1005);
    /// Never sent on the wire; reported when the socket dropped without a Close frame.
    pub const ABNORMAL: CloseStatus = CloseStatus(1006);
    pub const INVALID_PAYLOAD: CloseStatus = CloseStatus(1007);
    pub const POLICY_VIOLATION: CloseStatus = CloseStatus(1008);
    pub const MESSAGE_TOO_BIG: CloseStatus = CloseStatus(1009);
    pub const INTERNAL_ERROR: CloseStatus = CloseStatus(1011);

    pub fn code(self) -> u16 {
        self.0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            1000 => "normal",
            1001 => "going away",
            1002 => "protocol error",
            1003 => "unsupported data",
            1005 => "no status",
            1006 => "abnormal closure",
            1007 => "invalid payload",
            1008 => "policy violation",
            1009 => "message too big",
            1011 => "internal error",
            _ => return None,
        })
    }

    /// Codes that only report local conditions and must not appear in a Close frame.
    pub fn is_reserved(self) -> bool {
        matches!(self.0, 1005 | 1006 | 1015)
    }

    /// Encode as the payload of an outgoing Close frame.
    pub fn to_payload(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Decode the status from a received Close payload.
    pub fn from_payload(payload: &[u8]) -> CloseStatus {
        match payload {
            [hi, lo, ..] => CloseStatus(u16::from_be_bytes([*hi, *lo])),
            _ => CloseStatus::NO_STATUS,
        }
    }
}

impl Default for CloseStatus {
    fn default() -> Self {
        CloseStatus::NORMAL
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({name})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}
