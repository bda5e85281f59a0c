//! Opening handshake (HTTP/1.1 Upgrade).
//!
//! ```text
//! client                                   server
//!   │ GET /path?query HTTP/1.1               │
//!   │ Sec-WebSocket-Key: base64(16 bytes) ─► │
//!   │                                        │
//!   │ ◄─ HTTP/1.1 101 Switching Protocols    │
//!   │    Sec-WebSocket-Accept:               │
//!   │      base64(sha1(key + GUID))          │
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use http::Uri;
use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::error::{HandshakeError, TransportError};

/// Fixed GUID appended to the key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const WEBSOCKET_VERSION: &str = "13";
/// Port used when the endpoint URL does not name one.
pub const DEFAULT_PORT: u16 = 8080;
/// Upper bound on the response header block.
pub const MAX_RESPONSE_HEADER: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const SWITCHING_PROTOCOLS: u16 = 101;

/// Where the notification socket connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub resource: String,
}

impl Endpoint {
    /// Parse a `ws://host[:port]/path?query` URL.
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let invalid = |reason| TransportError::InvalidEndpoint {
            endpoint: url.to_string(),
            reason,
        };

        let uri: Uri = url.parse().map_err(|_| invalid("not a valid URL"))?;
        match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("ws") => {}
            Some(scheme) if scheme.eq_ignore_ascii_case("wss") => {
                return Err(invalid("TLS endpoints are not supported"))
            }
            _ => return Err(invalid("scheme must be ws://")),
        }
        let host = uri.host().ok_or_else(|| invalid("missing host"))?;
        let resource = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/");
        let resource = if resource.starts_with('/') {
            resource.to_string()
        } else {
            format!("/{resource}")
        };

        Ok(Self {
            host: host.to_string(),
            port: uri.port_u16().unwrap_or(DEFAULT_PORT),
            resource,
        })
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `Sec-WebSocket-Accept` for a given `Sec-WebSocket-Key`.
pub fn accept_key_for(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// One handshake attempt: the nonce we sent and the accept value we expect back.
#[derive(Debug, Clone)]
pub struct Handshake {
    endpoint: Endpoint,
    key: String,
    expected_accept: String,
}

impl Handshake {
    /// A handshake with a fresh random 16-byte nonce.
    pub fn new(endpoint: Endpoint) -> Self {
        let nonce = Uuid::new_v4();
        Self::with_key(endpoint, STANDARD.encode(nonce.as_bytes()))
    }

    pub fn with_key(endpoint: Endpoint, key: String) -> Self {
        let expected_accept = accept_key_for(&key);
        Self {
            endpoint,
            key,
            expected_accept,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The raw HTTP Upgrade request.
    pub fn request_bytes(&self) -> Vec<u8> {
        let host = if self.endpoint.port == 80 {
            self.endpoint.host.clone()
        } else {
            self.endpoint.authority()
        };
        format!(
            "GET {resource} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Upgrade: websocket\r\n\
             Connection: upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: {version}\r\n\
             \r\n",
            resource = self.endpoint.resource,
            key = self.key,
            version = WEBSOCKET_VERSION,
        )
        .into_bytes()
    }

    /// Validate the response at the front of `buf`.
    ///
    /// Returns `Ok(None)` while the header block is incomplete and
    /// `Ok(Some(consumed))` once it has been accepted. Bytes after `consumed`
    /// already belong to the framing layer.
    pub fn parse_response(&self, buf: &[u8]) -> Result<Option<usize>, HandshakeError> {
        let Some(end) = find_terminator(buf) else {
            if buf.len() > MAX_RESPONSE_HEADER {
                return Err(HandshakeError::ResponseTooLarge {
                    limit: MAX_RESPONSE_HEADER,
                });
            }
            return Ok(None);
        };
        let consumed = end + HEADER_TERMINATOR.len();
        if consumed > MAX_RESPONSE_HEADER {
            return Err(HandshakeError::ResponseTooLarge {
                limit: MAX_RESPONSE_HEADER,
            });
        }

        let head = std::str::from_utf8(&buf[..end])
            .map_err(|_| HandshakeError::MalformedResponse("header block is not UTF-8"))?;
        let mut lines = head.split("\r\n");

        let status_line = lines
            .next()
            .ok_or(HandshakeError::MalformedResponse("empty response"))?;
        let mut parts = status_line.splitn(3, ' ');
        match parts.next() {
            Some(version) if version.starts_with("HTTP/1.") => {}
            _ => return Err(HandshakeError::MalformedResponse("missing HTTP version")),
        }
        let status: u16 = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or(HandshakeError::MalformedResponse("missing status code"))?;
        if status != SWITCHING_PROTOCOLS {
            return Err(HandshakeError::UnexpectedStatus(status));
        }

        let mut upgrade = None;
        let mut connection = None;
        let mut accept = None;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                return Err(HandshakeError::MalformedResponse("header line without ':'"));
            };
            let value = value.trim();
            if name.eq_ignore_ascii_case("upgrade") {
                upgrade = Some(value);
            } else if name.eq_ignore_ascii_case("connection") {
                connection = Some(value);
            } else if name.eq_ignore_ascii_case("sec-websocket-accept") {
                accept = Some(value);
            }
        }

        let upgrade = upgrade.ok_or(HandshakeError::MissingHeader("Upgrade"))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(HandshakeError::InvalidUpgrade(upgrade.to_string()));
        }
        let connection = connection.ok_or(HandshakeError::MissingHeader("Connection"))?;
        if !connection
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        {
            return Err(HandshakeError::InvalidConnection(connection.to_string()));
        }
        let accept = accept.ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Accept"))?;
        if accept != self.expected_accept {
            return Err(HandshakeError::AcceptMismatch);
        }

        Ok(Some(consumed))
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn endpoint() -> Endpoint {
        Endpoint::parse("ws://backend.local:9000/v1/stream?objectType=todos").unwrap()
    }

    fn response(accept: &str) -> String {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             upgrade: WebSocket\r\n\
             CONNECTION: keep-alive, Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\r\n"
        )
    }

    #[test]
    fn test_accept_key_known_vector() {
        assert_eq!(accept_key_for(SAMPLE_KEY), SAMPLE_ACCEPT);
    }

    #[test]
    fn test_endpoint_parsing() {
        let ep = endpoint();
        assert_eq!(ep.host, "backend.local");
        assert_eq!(ep.port, 9000);
        assert_eq!(ep.resource, "/v1/stream?objectType=todos");

        let ep = Endpoint::parse("ws://localhost").unwrap();
        assert_eq!(ep.port, DEFAULT_PORT);
        assert_eq!(ep.resource, "/");
    }

    #[test]
    fn test_endpoint_rejects_other_schemes() {
        assert!(matches!(
            Endpoint::parse("wss://secure.example/"),
            Err(TransportError::InvalidEndpoint { .. })
        ));
        assert!(Endpoint::parse("http://example.com/").is_err());
        assert!(Endpoint::parse("not a url").is_err());
    }

    #[test]
    fn test_fresh_key_is_16_bytes() {
        let handshake = Handshake::new(endpoint());
        let decoded = STANDARD.decode(handshake.key()).unwrap();
        assert_eq!(decoded.len(), 16);
        assert_eq!(handshake.key().len(), 24);
        assert_ne!(handshake.key(), Handshake::new(endpoint()).key());
    }

    #[test]
    fn test_request_format() {
        let handshake = Handshake::with_key(endpoint(), SAMPLE_KEY.to_string());
        let request = String::from_utf8(handshake.request_bytes()).unwrap();
        assert!(request.starts_with("GET /v1/stream?objectType=todos HTTP/1.1\r\n"));
        assert!(request.contains("Host: backend.local:9000\r\n"));
        assert!(request.contains("Upgrade: websocket\r\n"));
        assert!(request.contains("Connection: upgrade\r\n"));
        assert!(request.contains(&format!("Sec-WebSocket-Key: {SAMPLE_KEY}\r\n")));
        assert!(request.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_valid_response_accepted_case_insensitively() {
        let handshake = Handshake::with_key(endpoint(), SAMPLE_KEY.to_string());
        let mut bytes = response(SAMPLE_ACCEPT).into_bytes();
        let header_len = bytes.len();
        bytes.extend_from_slice(&[0x81, 0x00]);
        assert_eq!(handshake.parse_response(&bytes).unwrap(), Some(header_len));
    }

    #[test]
    fn test_incomplete_response_waits() {
        let handshake = Handshake::with_key(endpoint(), SAMPLE_KEY.to_string());
        let bytes = response(SAMPLE_ACCEPT).into_bytes();
        assert_eq!(handshake.parse_response(&bytes[..bytes.len() - 1]).unwrap(), None);
    }

    #[test]
    fn test_accept_mismatch() {
        let handshake = Handshake::with_key(endpoint(), SAMPLE_KEY.to_string());
        let bytes = response("bogus=").into_bytes();
        assert_eq!(
            handshake.parse_response(&bytes),
            Err(HandshakeError::AcceptMismatch)
        );
    }

    #[test]
    fn test_non_101_status() {
        let handshake = Handshake::with_key(endpoint(), SAMPLE_KEY.to_string());
        let bytes = b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n";
        assert_eq!(
            handshake.parse_response(bytes),
            Err(HandshakeError::UnexpectedStatus(403))
        );
    }

    #[test]
    fn test_missing_upgrade_header() {
        let handshake = Handshake::with_key(endpoint(), SAMPLE_KEY.to_string());
        let bytes = format!(
            "HTTP/1.1 101 Switching Protocols\r\nConnection: upgrade\r\nSec-WebSocket-Accept: {SAMPLE_ACCEPT}\r\n\r\n"
        );
        assert_eq!(
            handshake.parse_response(bytes.as_bytes()),
            Err(HandshakeError::MissingHeader("Upgrade"))
        );
    }

    #[test]
    fn test_oversized_response() {
        let handshake = Handshake::with_key(endpoint(), SAMPLE_KEY.to_string());
        let bytes = vec![b'a'; MAX_RESPONSE_HEADER + 1];
        assert_eq!(
            handshake.parse_response(&bytes),
            Err(HandshakeError::ResponseTooLarge {
                limit: MAX_RESPONSE_HEADER
            })
        );
    }
}
