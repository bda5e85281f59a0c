//! WebSocket base framing.
//!
//! Wire layout (bit-exact):
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               | Masking-key, if MASK set to 1 |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------+ - - - - - - - - - - - - - - - +
//! ```
//!
//! Every function here is pure. The session keeps the partial-input state.

use crate::close::CloseStatus;
use crate::error::ProtocolError;
use crate::mask::apply_mask;

const FIN: u8 = 0x80;
const RSV: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK: u8 = 0x80;
const LEN_BITS: u8 = 0x7F;
const LONG_LENGTH_MSB: u8 = 0x80;

pub const BASE_HEADER_LEN: usize = 2;
pub const MASKING_KEY_LEN: usize = 4;
pub const MAX_CONTROL_PAYLOAD: usize = 125;

const SHORT_LENGTH_MARKER: u8 = 126;
const LONG_LENGTH_MARKER: u8 = 127;
const SHORT_LENGTH_LIMIT: u64 = 0xFFFF;
const SHORT_LENGTH_BYTES: usize = 2;
const LONG_LENGTH_BYTES: usize = 8;

/// Frame opcodes. `%x3-7` and `%xB-F` are reserved and rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        match bits {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(ProtocolError::violation(format!(
                "Reserved opcode {other:#x} received"
            ))),
        }
    }

    pub fn is_control(self) -> bool {
        (self as u8) & 0x08 != 0
    }
}

/// Which side is decoding. Servers must never mask, clients always do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskPolicy {
    /// Client side: a masked frame from the server is a protocol violation.
    RejectMasked,
    /// Server side: masked frames are unmasked while decoding.
    AcceptMasked,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpCode,
    pub is_final: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: OpCode, is_final: bool, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            is_final,
            payload: payload.into(),
        }
    }
}

/// A parsed frame header, available before the payload has fully arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub is_final: bool,
    pub opcode: OpCode,
    pub masking_key: Option<[u8; MASKING_KEY_LEN]>,
    pub payload_len: u64,
    /// Bytes occupied by the header, masking key included.
    pub header_len: usize,
}

/// Result of [`decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame { frame: Frame, consumed: usize },
    NeedMoreData,
}

/// Size of the length field (the 7-bit byte plus any extended length) for a payload.
pub fn length_field_len(payload_len: u64) -> usize {
    if payload_len < u64::from(SHORT_LENGTH_MARKER) {
        1
    } else if payload_len <= SHORT_LENGTH_LIMIT {
        1 + SHORT_LENGTH_BYTES
    } else {
        1 + LONG_LENGTH_BYTES
    }
}

/// Encode a masked client-to-server frame.
pub fn encode(
    opcode: OpCode,
    is_final: bool,
    payload: &[u8],
    masking_key: [u8; MASKING_KEY_LEN],
) -> Result<Vec<u8>, ProtocolError> {
    encode_frame(opcode, is_final, payload, Some(masking_key))
}

/// Encode an unmasked server-to-client frame.
pub fn encode_unmasked(
    opcode: OpCode,
    is_final: bool,
    payload: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    encode_frame(opcode, is_final, payload, None)
}

fn encode_frame(
    opcode: OpCode,
    is_final: bool,
    payload: &[u8],
    masking_key: Option<[u8; MASKING_KEY_LEN]>,
) -> Result<Vec<u8>, ProtocolError> {
    let payload_len = payload.len() as u64;
    if payload_len.to_be_bytes()[0] & LONG_LENGTH_MSB != 0 {
        return Err(ProtocolError::new(
            "Payload too large",
            CloseStatus::MESSAGE_TOO_BIG,
        ));
    }
    if opcode.is_control() && (!is_final || payload.len() > MAX_CONTROL_PAYLOAD) {
        return Err(ProtocolError::violation(
            "Control frames must be final and at most 125 bytes",
        ));
    }

    let key_len = if masking_key.is_some() { MASKING_KEY_LEN } else { 0 };
    let mut out =
        Vec::with_capacity(1 + length_field_len(payload_len) + key_len + payload.len());

    out.push(if is_final { FIN } else { 0 } | opcode as u8);

    let mask_bit = if masking_key.is_some() { MASK } else { 0 };
    if payload_len < u64::from(SHORT_LENGTH_MARKER) {
        out.push(mask_bit | payload_len as u8);
    } else if payload_len <= SHORT_LENGTH_LIMIT {
        out.push(mask_bit | SHORT_LENGTH_MARKER);
        out.extend_from_slice(&(payload_len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | LONG_LENGTH_MARKER);
        out.extend_from_slice(&payload_len.to_be_bytes());
    }

    let payload_start = out.len() + key_len;
    if let Some(key) = masking_key {
        out.extend_from_slice(&key);
    }
    out.extend_from_slice(payload);
    if let Some(key) = masking_key {
        apply_mask(&mut out[payload_start..], key);
    }
    Ok(out)
}

/// Parse a frame header from the front of `buf`.
///
/// Returns `Ok(None)` until enough bytes for the complete header (including the
/// extended length and masking key) are available.
pub fn parse_header(buf: &[u8], policy: MaskPolicy) -> Result<Option<FrameHeader>, ProtocolError> {
    if buf.len() < BASE_HEADER_LEN {
        return Ok(None);
    }
    let (flags, length_byte) = (buf[0], buf[1]);

    if flags & RSV != 0 {
        return Err(ProtocolError::violation(
            "Reserved bits set without a negotiated extension",
        ));
    }
    let opcode = OpCode::from_bits(flags & OPCODE_BITS)?;
    let is_final = flags & FIN != 0;
    let masked = length_byte & MASK != 0;

    if masked && policy == MaskPolicy::RejectMasked {
        return Err(ProtocolError::violation(
            "Invalid masked frame received from server",
        ));
    }

    let (payload_len, mut header_len) = match length_byte & LEN_BITS {
        SHORT_LENGTH_MARKER => {
            let end = BASE_HEADER_LEN + SHORT_LENGTH_BYTES;
            if buf.len() < end {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[2], buf[3]]);
            (u64::from(len), end)
        }
        LONG_LENGTH_MARKER => {
            let end = BASE_HEADER_LEN + LONG_LENGTH_BYTES;
            if buf.len() < end {
                return Ok(None);
            }
            let mut bytes = [0u8; LONG_LENGTH_BYTES];
            bytes.copy_from_slice(&buf[BASE_HEADER_LEN..end]);
            if bytes[0] & LONG_LENGTH_MSB != 0 {
                return Err(ProtocolError::new(
                    "The most significant bit of a large payload length must be 0",
                    CloseStatus::MESSAGE_TOO_BIG,
                ));
            }
            (u64::from_be_bytes(bytes), end)
        }
        short => (u64::from(short), BASE_HEADER_LEN),
    };

    if opcode.is_control() {
        if !is_final {
            return Err(ProtocolError::violation("Fragmented control frame received"));
        }
        if payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(ProtocolError::violation(
                "Control frame payload exceeds 125 bytes",
            ));
        }
    }

    let masking_key = if masked {
        let end = header_len + MASKING_KEY_LEN;
        if buf.len() < end {
            return Ok(None);
        }
        let mut key = [0u8; MASKING_KEY_LEN];
        key.copy_from_slice(&buf[header_len..end]);
        header_len = end;
        Some(key)
    } else {
        None
    };

    Ok(Some(FrameHeader {
        is_final,
        opcode,
        masking_key,
        payload_len,
        header_len,
    }))
}

/// Decode one complete frame from the front of `buf`.
pub fn decode(buf: &[u8], policy: MaskPolicy) -> Result<Decoded, ProtocolError> {
    let Some(header) = parse_header(buf, policy)? else {
        return Ok(Decoded::NeedMoreData);
    };
    let too_big = || ProtocolError::new("Frame exceeds addressable memory", CloseStatus::MESSAGE_TOO_BIG);
    let payload_len = usize::try_from(header.payload_len).map_err(|_| too_big())?;
    let total = header.header_len.checked_add(payload_len).ok_or_else(too_big)?;
    if buf.len() < total {
        return Ok(Decoded::NeedMoreData);
    }

    let mut payload = buf[header.header_len..total].to_vec();
    if let Some(key) = header.masking_key {
        apply_mask(&mut payload, key);
    }
    Ok(Decoded::Frame {
        frame: Frame {
            opcode: header.opcode,
            is_final: header.is_final,
            payload,
        },
        consumed: total,
    })
}
