//! Sans-IO client session: handshake plus frame reassembly.
//!
//! ```text
//!  HandshakePending ──101──► FrameHeaderPending ◄──────┐
//!        │                        │                    │
//!        │                        ▼                    │
//!        │                  PayloadDataPending ──frame─┘
//!        │                        │
//!        └──── error / Close ─────┴──────► Closed
//! ```
//!
//! The owner writes whatever [`Session::take_outbound`] returns to the socket,
//! feeds every read into [`Session::receive`] and drains [`Session::poll_event`].

use std::collections::VecDeque;

use crate::close::CloseStatus;
use crate::error::{ProtocolError, TransportError};
use crate::frame::{self, FrameHeader, MaskPolicy, OpCode};
use crate::handshake::{Endpoint, Handshake};
use crate::mask::random_masking_key;
use crate::notification::Event;

/// Largest reassembled text message accepted by default (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    HandshakePending,
    FrameHeaderPending,
    PayloadDataPending,
    Closed,
}

/// Output of the session, produced lazily as bytes arrive.
#[derive(Debug)]
pub enum SessionEvent {
    /// The server accepted the upgrade.
    Connected,
    Notification(Event),
    /// A Close frame was received or sent.
    Closed { status: CloseStatus },
    /// Handshake or framing failure. The session is closed.
    Failed(TransportError),
}

pub struct Session {
    state: SessionState,
    handshake: Handshake,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    events: VecDeque<SessionEvent>,
    /// Header of the frame whose payload is still arriving.
    header: Option<FrameHeader>,
    /// Text message being reassembled from fragments.
    message: Option<Vec<u8>>,
    close_sent: bool,
    max_message_size: usize,
}

impl Session {
    /// Start a session with a fresh handshake nonce. The upgrade request is
    /// queued immediately.
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_handshake(Handshake::new(endpoint))
    }

    pub fn with_handshake(handshake: Handshake) -> Self {
        let outbound = handshake.request_bytes();
        Self {
            state: SessionState::HandshakePending,
            handshake,
            inbound: Vec::new(),
            outbound,
            events: VecDeque::new(),
            header: None,
            message: None,
            close_sent: false,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            SessionState::FrameHeaderPending | SessionState::PayloadDataPending
        )
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.handshake.endpoint()
    }

    /// Next decoded event, if any.
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Bytes that must be written to the socket, in order.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Close the session with `status`.
    ///
    /// Sends a masked Close frame once; later calls do nothing. Before the
    /// handshake completes there is no frame to send and the session just ends.
    pub fn close(&mut self, status: CloseStatus) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.state != SessionState::HandshakePending {
            self.send_close(status);
        } else {
            self.outbound.clear();
        }
        log::debug!("Closing notification session with status {status}");
        self.state = SessionState::Closed;
        self.events.push_back(SessionEvent::Closed { status });
    }

    /// Feed bytes read from the socket.
    pub fn receive(&mut self, bytes: &[u8]) {
        if self.state == SessionState::Closed {
            log::trace!("Ignoring {} bytes received after close", bytes.len());
            return;
        }
        self.inbound.extend_from_slice(bytes);

        loop {
            match self.state {
                SessionState::HandshakePending => {
                    match self.handshake.parse_response(&self.inbound) {
                        Ok(None) => return,
                        Ok(Some(consumed)) => {
                            self.inbound.drain(..consumed);
                            self.state = SessionState::FrameHeaderPending;
                            log::info!(
                                "Notification channel upgraded on {}",
                                self.handshake.endpoint().authority()
                            );
                            self.events.push_back(SessionEvent::Connected);
                        }
                        Err(err) => {
                            log::warn!("Notification handshake failed: {err}");
                            self.state = SessionState::Closed;
                            self.outbound.clear();
                            self.events.push_back(SessionEvent::Failed(err.into()));
                            return;
                        }
                    }
                }
                SessionState::FrameHeaderPending => {
                    match frame::parse_header(&self.inbound, MaskPolicy::RejectMasked) {
                        Ok(None) => return,
                        Ok(Some(header)) => {
                            if let Err(err) = self.check_message_size(&header) {
                                self.fail(err);
                                return;
                            }
                            self.inbound.drain(..header.header_len);
                            self.header = Some(header);
                            self.state = SessionState::PayloadDataPending;
                        }
                        Err(err) => {
                            self.fail(err);
                            return;
                        }
                    }
                }
                SessionState::PayloadDataPending => {
                    let Some(header) = self.header else {
                        self.fail(ProtocolError::new(
                            "Payload pending without a frame header",
                            CloseStatus::INTERNAL_ERROR,
                        ));
                        return;
                    };
                    // Bounded by the message size check on the header.
                    let len = header.payload_len as usize;
                    if self.inbound.len() < len {
                        return;
                    }
                    let payload: Vec<u8> = self.inbound.drain(..len).collect();
                    self.header = None;
                    self.state = SessionState::FrameHeaderPending;
                    self.handle_frame(header, payload);
                }
                SessionState::Closed => return,
            }
        }
    }

    fn check_message_size(&self, header: &FrameHeader) -> Result<(), ProtocolError> {
        if header.opcode.is_control() {
            return Ok(());
        }
        let buffered = self.message.as_ref().map_or(0, Vec::len) as u64;
        if buffered.saturating_add(header.payload_len) > self.max_message_size as u64 {
            return Err(ProtocolError::new(
                format!(
                    "Message exceeds the {} byte limit",
                    self.max_message_size
                ),
                CloseStatus::MESSAGE_TOO_BIG,
            ));
        }
        Ok(())
    }

    fn handle_frame(&mut self, header: FrameHeader, payload: Vec<u8>) {
        match header.opcode {
            OpCode::Close => {
                let status = CloseStatus::from_payload(&payload);
                log::info!("Notification channel closed by the server with status {status}");
                self.send_close(status);
                self.state = SessionState::Closed;
                self.events.push_back(SessionEvent::Closed { status });
            }
            OpCode::Ping => self.queue_frame(OpCode::Pong, &payload),
            OpCode::Pong => {}
            OpCode::Binary => self.fail(ProtocolError::new(
                "Binary messages are not supported",
                CloseStatus::UNSUPPORTED_DATA,
            )),
            OpCode::Text => {
                if self.message.is_some() {
                    self.fail(ProtocolError::violation(
                        "New data frame received while a fragmented message is in progress",
                    ));
                } else if header.is_final {
                    self.deliver(payload);
                } else {
                    self.message = Some(payload);
                }
            }
            OpCode::Continuation => match self.message.as_mut() {
                None => self.fail(ProtocolError::violation(
                    "Continuation frame received with no message in progress",
                )),
                Some(message) => {
                    message.extend_from_slice(&payload);
                    if header.is_final {
                        if let Some(message) = self.message.take() {
                            self.deliver(message);
                        }
                    }
                }
            },
        }
    }

    fn deliver(&mut self, message: Vec<u8>) {
        let text = match String::from_utf8(message) {
            Ok(text) => text,
            Err(_) => {
                self.fail(ProtocolError::new(
                    "Text message is not valid UTF-8",
                    CloseStatus::INVALID_PAYLOAD,
                ));
                return;
            }
        };
        match Event::from_json(&text) {
            Ok(event) => {
                log::debug!(
                    "Notification {:?} for {} {:?}",
                    event.kind,
                    event.object_type,
                    event.object_id()
                );
                self.events.push_back(SessionEvent::Notification(event));
            }
            Err(err) => log::warn!("Dropping malformed notification: {err}"),
        }
    }

    fn fail(&mut self, err: ProtocolError) {
        log::warn!("Notification protocol error: {err}");
        self.send_close(err.close_status);
        self.state = SessionState::Closed;
        self.header = None;
        self.message = None;
        self.events.push_back(SessionEvent::Failed(err.into()));
    }

    fn send_close(&mut self, status: CloseStatus) {
        if self.close_sent {
            return;
        }
        let code = status.to_payload();
        let payload: &[u8] = if status.is_reserved() { &[] } else { &code };
        self.queue_frame(OpCode::Close, payload);
        self.close_sent = true;
    }

    fn queue_frame(&mut self, opcode: OpCode, payload: &[u8]) {
        if self.close_sent {
            return;
        }
        match frame::encode(opcode, true, payload, random_masking_key()) {
            Ok(bytes) => self.outbound.extend_from_slice(&bytes),
            Err(err) => log::error!("Failed to encode outgoing {opcode:?} frame: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_unmasked, Decoded, Frame};
    use crate::handshake::accept_key_for;
    use crate::notification::EventKind;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn session() -> Session {
        let endpoint = Endpoint::parse("ws://localhost:9000/stream").unwrap();
        Session::with_handshake(Handshake::with_key(endpoint, KEY.to_string()))
    }

    fn upgrade_response() -> Vec<u8> {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept_key_for(KEY)
        )
        .into_bytes()
    }

    fn connected() -> Session {
        let mut session = session();
        session.take_outbound();
        session.receive(&upgrade_response());
        assert!(matches!(session.poll_event(), Some(SessionEvent::Connected)));
        session
    }

    fn text(json: &str) -> Vec<u8> {
        encode_unmasked(OpCode::Text, true, json.as_bytes()).unwrap()
    }

    fn sent_frames(session: &mut Session) -> Vec<Frame> {
        let bytes = session.take_outbound();
        let mut frames = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            match frame::decode(&bytes[offset..], MaskPolicy::AcceptMasked).unwrap() {
                Decoded::Frame { frame, consumed } => {
                    frames.push(frame);
                    offset += consumed;
                }
                Decoded::NeedMoreData => panic!("truncated outbound frame"),
            }
        }
        frames
    }

    const CREATE: &str =
        r#"{"messageType":"data","event":"create","data":{"id":"a","objectType":"objects.todos"}}"#;

    #[test]
    fn test_handshake_request_queued_on_start() {
        let mut session = session();
        let request = String::from_utf8(session.take_outbound()).unwrap();
        assert!(request.starts_with("GET /stream HTTP/1.1"));
        assert_eq!(session.state(), SessionState::HandshakePending);
        assert!(!session.has_outbound());
    }

    #[test]
    fn test_response_and_frame_in_one_read() {
        let mut session = session();
        let mut bytes = upgrade_response();
        bytes.extend(text(CREATE));
        session.receive(&bytes);
        assert!(matches!(session.poll_event(), Some(SessionEvent::Connected)));
        match session.poll_event() {
            Some(SessionEvent::Notification(event)) => {
                assert_eq!(event.kind, EventKind::Create);
                assert_eq!(event.object_id(), Some("a"));
            }
            other => panic!("expected notification, got {other:?}"),
        }
        assert!(session.poll_event().is_none());
        assert_eq!(session.state(), SessionState::FrameHeaderPending);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut session = session();
        let mut bytes = upgrade_response();
        bytes.extend(text(CREATE));
        for byte in &bytes {
            session.receive(std::slice::from_ref(byte));
        }
        assert!(matches!(session.poll_event(), Some(SessionEvent::Connected)));
        assert!(matches!(
            session.poll_event(),
            Some(SessionEvent::Notification(_))
        ));
    }

    #[test]
    fn test_bad_handshake_fails_without_close_frame() {
        let mut session = session();
        session.take_outbound();
        session.receive(b"HTTP/1.1 404 Not Found\r\n\r\n");
        assert!(matches!(
            session.poll_event(),
            Some(SessionEvent::Failed(TransportError::Handshake(_)))
        ));
        assert!(session.is_closed());
        assert!(!session.has_outbound());
    }

    #[test]
    fn test_masked_server_frame_is_protocol_error() {
        let mut session = connected();
        let masked = frame::encode(OpCode::Text, true, CREATE.as_bytes(), [1, 2, 3, 4]).unwrap();
        session.receive(&masked);
        match session.poll_event() {
            Some(SessionEvent::Failed(TransportError::Protocol(err))) => {
                assert_eq!(err.close_status, CloseStatus::PROTOCOL_ERROR)
            }
            other => panic!("expected protocol failure, got {other:?}"),
        }
        let frames = sent_frames(&mut session);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, OpCode::Close);
        assert_eq!(CloseStatus::from_payload(&frames[0].payload), CloseStatus::PROTOCOL_ERROR);
    }

    #[test]
    fn test_server_close_is_echoed() {
        let mut session = connected();
        let mut payload = CloseStatus::GOING_AWAY.to_payload().to_vec();
        payload.extend_from_slice(b"maintenance");
        session.receive(&encode_unmasked(OpCode::Close, true, &payload).unwrap());
        assert!(matches!(
            session.poll_event(),
            Some(SessionEvent::Closed { status }) if status == CloseStatus::GOING_AWAY
        ));
        let frames = sent_frames(&mut session);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, CloseStatus::GOING_AWAY.to_payload());

        session.receive(&text(CREATE));
        assert!(session.poll_event().is_none());
    }

    #[test]
    fn test_server_close_without_status_echoed_empty() {
        let mut session = connected();
        session.receive(&encode_unmasked(OpCode::Close, true, b"").unwrap());
        assert!(matches!(
            session.poll_event(),
            Some(SessionEvent::Closed { status }) if status == CloseStatus::NO_STATUS
        ));
        let frames = sent_frames(&mut session);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, OpCode::Close);
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut session = connected();
        session.close(CloseStatus::NORMAL);
        session.close(CloseStatus::GOING_AWAY);
        let frames = sent_frames(&mut session);
        assert_eq!(frames.len(), 1);
        assert_eq!(CloseStatus::from_payload(&frames[0].payload), CloseStatus::NORMAL);
        assert!(matches!(session.poll_event(), Some(SessionEvent::Closed { .. })));
        assert!(session.poll_event().is_none());
    }

    #[test]
    fn test_close_during_handshake_sends_nothing() {
        let mut session = session();
        session.close(CloseStatus::NORMAL);
        assert!(!session.has_outbound());
        assert!(session.is_closed());
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let mut session = connected();
        session.receive(&encode_unmasked(OpCode::Ping, true, b"are you there").unwrap());
        let frames = sent_frames(&mut session);
        assert_eq!(frames, vec![Frame::new(OpCode::Pong, true, b"are you there".to_vec())]);
        assert!(session.poll_event().is_none());
    }

    #[test]
    fn test_fragmented_text_with_interleaved_ping() {
        let mut session = connected();
        let (head, tail) = CREATE.as_bytes().split_at(20);
        let mut bytes = encode_unmasked(OpCode::Text, false, head).unwrap();
        bytes.extend(encode_unmasked(OpCode::Ping, true, b"").unwrap());
        bytes.extend(encode_unmasked(OpCode::Continuation, true, tail).unwrap());
        session.receive(&bytes);
        assert!(matches!(
            session.poll_event(),
            Some(SessionEvent::Notification(_))
        ));
        assert_eq!(sent_frames(&mut session)[0].opcode, OpCode::Pong);
    }

    #[test]
    fn test_orphan_continuation_fails() {
        let mut session = connected();
        session.receive(&encode_unmasked(OpCode::Continuation, true, b"x").unwrap());
        assert!(matches!(session.poll_event(), Some(SessionEvent::Failed(_))));
        assert!(session.is_closed());
    }

    #[test]
    fn test_binary_rejected_with_unsupported_data() {
        let mut session = connected();
        session.receive(&encode_unmasked(OpCode::Binary, true, &[1, 2, 3]).unwrap());
        assert!(matches!(session.poll_event(), Some(SessionEvent::Failed(_))));
        let frames = sent_frames(&mut session);
        assert_eq!(
            CloseStatus::from_payload(&frames[0].payload),
            CloseStatus::UNSUPPORTED_DATA
        );
    }

    #[test]
    fn test_message_size_limit() {
        let mut session = connected().with_max_message_size(16);
        let mut bytes = encode_unmasked(OpCode::Text, false, &[b' '; 10]).unwrap();
        bytes.extend(encode_unmasked(OpCode::Continuation, true, &[b' '; 10]).unwrap());
        session.receive(&bytes);
        assert!(matches!(session.poll_event(), Some(SessionEvent::Failed(_))));
        let frames = sent_frames(&mut session);
        assert_eq!(
            CloseStatus::from_payload(&frames[0].payload),
            CloseStatus::MESSAGE_TOO_BIG
        );
    }

    #[test]
    fn test_malformed_json_dropped_session_survives() {
        let mut session = connected();
        session.receive(&text("{\"event\":"));
        session.receive(&text(CREATE));
        assert!(matches!(
            session.poll_event(),
            Some(SessionEvent::Notification(_))
        ));
        assert!(session.is_connected());
    }
}
