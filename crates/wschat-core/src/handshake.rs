//! RFC 6455 opening handshake (section 4).
//!
//! The server reads an HTTP/1.1 `GET` carrying `Upgrade: websocket`,
//! `Connection: Upgrade` and a `Sec-WebSocket-Key`, and answers
//! `101 Switching Protocols` with the derived `Sec-WebSocket-Accept`.
//! The client half is used by tests and tooling.

use crate::error::{ChatError, ChatResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ring::digest;

/// Fixed GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest request head the server will buffer before giving up.
pub const MAX_REQUEST_SIZE: usize = 8 * 1024;

/// The only protocol version this server speaks.
pub const SUPPORTED_VERSION: &str = "13";

/// `base64(SHA1(key + GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    ctx.update(key.as_bytes());
    ctx.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(ctx.finish().as_ref())
}

/// A validated upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Request target, e.g. `/chat`.
    pub path: String,
    /// Value of `Sec-WebSocket-Key`.
    pub key: String,
    /// All headers in arrival order, names as sent.
    pub headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Parse and validate the request head at the front of `buf`.
    ///
    /// Returns `Ok(None)` until the blank line ending the head has arrived,
    /// then the request and the number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> ChatResult<Option<(UpgradeRequest, usize)>> {
        let end = match find_head_end(buf) {
            Some(end) => end,
            None if buf.len() > MAX_REQUEST_SIZE => {
                return Err(ChatError::Handshake(format!(
                    "request head exceeds {MAX_REQUEST_SIZE} bytes"
                )));
            }
            None => return Ok(None),
        };
        if end > MAX_REQUEST_SIZE {
            return Err(ChatError::Handshake(format!(
                "request head exceeds {MAX_REQUEST_SIZE} bytes"
            )));
        }

        let head = std::str::from_utf8(&buf[..end])
            .map_err(|_| ChatError::Handshake("request head is not valid UTF-8".into()))?;
        let mut lines = head.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(p), Some(v), None) if !p.is_empty() => (m, p, v),
            _ => {
                return Err(ChatError::Handshake(format!(
                    "malformed request line: {request_line:?}"
                )));
            }
        };
        if method != "GET" {
            return Err(ChatError::Handshake(format!("method must be GET, got {method}")));
        }
        if !http_version_at_least_1_1(version) {
            return Err(ChatError::Handshake(format!(
                "HTTP/1.1 or later required, got {version}"
            )));
        }

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ChatError::Handshake(format!("malformed header line: {line:?}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let request = UpgradeRequest {
            path: path.to_string(),
            key: String::new(),
            headers,
        };

        if !request.header_has_token("Upgrade", "websocket") {
            return Err(ChatError::Handshake("missing `Upgrade: websocket`".into()));
        }
        if !request.header_has_token("Connection", "upgrade") {
            return Err(ChatError::Handshake("missing `Connection: Upgrade`".into()));
        }
        if let Some(version) = request.header("Sec-WebSocket-Version") {
            if version != SUPPORTED_VERSION {
                return Err(ChatError::Handshake(format!(
                    "unsupported Sec-WebSocket-Version {version}"
                )));
            }
        }
        let key = match request.header("Sec-WebSocket-Key") {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => return Err(ChatError::Handshake("missing Sec-WebSocket-Key".into())),
        };

        Ok(Some((UpgradeRequest { key, ..request }, end)))
    }

    /// First header value with this name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .any(|(_, v)| has_token(v, token))
    }

    /// The `101 Switching Protocols` response completing this handshake.
    pub fn accept_response(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(&self.key)
        )
        .into_bytes()
    }
}

/// A plain-text HTTP error response for a failed upgrade.
pub fn reject_response(status: u16, reason: &str) -> Vec<u8> {
    let phrase = match status {
        400 => "Bad Request",
        503 => "Service Unavailable",
        _ => "Error",
    };
    format!(
        "HTTP/1.1 {status} {phrase}\r\n\
         Connection: close\r\n\
         Sec-WebSocket-Version: {SUPPORTED_VERSION}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\r\n{reason}",
        reason.len()
    )
    .into_bytes()
}

/// Random base64-encoded 16-byte nonce for `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// Build a client upgrade request.
pub fn client_request(host: &str, path: &str, key: &str) -> Vec<u8> {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: {SUPPORTED_VERSION}\r\n\r\n"
    )
    .into_bytes()
}

/// Validate the server's answer to [`client_request`].
///
/// Returns `Ok(None)` until the response head is complete, then the number
/// of bytes it occupied. Anything after that belongs to the frame stream.
pub fn parse_response(buf: &[u8], key: &str) -> ChatResult<Option<usize>> {
    let Some(end) = find_head_end(buf) else {
        return Ok(None);
    };
    let head = std::str::from_utf8(&buf[..end])
        .map_err(|_| ChatError::Handshake("response head is not valid UTF-8".into()))?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    if status_line.split(' ').nth(1) != Some("101") {
        return Err(ChatError::Handshake(format!(
            "upgrade refused: {status_line}"
        )));
    }

    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();

    let expected = accept_key(key);
    match header_value(&headers, "Sec-WebSocket-Accept") {
        Some(accept) if accept == expected => Ok(Some(end)),
        Some(accept) => Err(ChatError::Handshake(format!(
            "Sec-WebSocket-Accept mismatch: {accept}"
        ))),
        None => Err(ChatError::Handshake("missing Sec-WebSocket-Accept".into())),
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Comma-separated token list membership, e.g. `Connection: keep-alive, Upgrade`.
fn has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn http_version_at_least_1_1(version: &str) -> bool {
    let Some(number) = version.strip_prefix("HTTP/") else {
        return false;
    };
    let (major, minor) = number.split_once('.').unwrap_or((number, "0"));
    match (major.parse::<u32>(), minor.parse::<u32>()) {
        (Ok(major), Ok(minor)) => (major, minor) >= (1, 1),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn request(lines: &[&str]) -> Vec<u8> {
        let mut s = lines.join("\r\n");
        s.push_str("\r\n\r\n");
        s.into_bytes()
    }

    #[test]
    fn rfc_accept_vector() {
        assert_eq!(accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn parses_valid_request() {
        let buf = request(&[
            "GET /chat HTTP/1.1",
            "Host: server.example.com",
            "upgrade: WebSocket",
            "Connection: keep-alive, Upgrade",
            "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==",
            "Sec-WebSocket-Version: 13",
        ]);
        let (req, used) = UpgradeRequest::parse(&buf).unwrap().unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(req.path, "/chat");
        assert_eq!(req.key, SAMPLE_KEY);
        assert_eq!(req.header("host"), Some("server.example.com"));

        let response = String::from_utf8(req.accept_response()).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn incomplete_head_waits() {
        let buf = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n";
        assert!(UpgradeRequest::parse(buf).unwrap().is_none());
    }

    #[test]
    fn oversized_head_rejected() {
        let mut buf = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        buf.extend(std::iter::repeat(b'a').take(MAX_REQUEST_SIZE));
        assert!(matches!(
            UpgradeRequest::parse(&buf),
            Err(ChatError::Handshake(_))
        ));
    }

    #[test]
    fn rejects_missing_requirements() {
        let cases: [&[&str]; 6] = [
            &["POST / HTTP/1.1", "Upgrade: websocket", "Connection: Upgrade", "Sec-WebSocket-Key: k"],
            &["GET / HTTP/1.0", "Upgrade: websocket", "Connection: Upgrade", "Sec-WebSocket-Key: k"],
            &["GET / HTTP/1.1", "Connection: Upgrade", "Sec-WebSocket-Key: k"],
            &["GET / HTTP/1.1", "Upgrade: websocket", "Connection: keep-alive", "Sec-WebSocket-Key: k"],
            &["GET / HTTP/1.1", "Upgrade: websocket", "Connection: Upgrade"],
            &[
                "GET / HTTP/1.1",
                "Upgrade: websocket",
                "Connection: Upgrade",
                "Sec-WebSocket-Key: k",
                "Sec-WebSocket-Version: 8",
            ],
        ];
        for lines in cases {
            let err = UpgradeRequest::parse(&request(lines)).unwrap_err();
            assert!(matches!(err, ChatError::Handshake(_)), "{lines:?}");
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(UpgradeRequest::parse(b"\x16\x03\x01 hello\r\n\r\n").is_err());
        assert!(UpgradeRequest::parse(b"GET /\r\n\r\n").is_err());
    }

    #[test]
    fn client_round_trip() {
        let key = generate_key();
        assert_eq!(BASE64.decode(&key).unwrap().len(), 16);

        let req_bytes = client_request("localhost:8090", "/", &key);
        let (req, _) = UpgradeRequest::parse(&req_bytes).unwrap().unwrap();
        assert_eq!(req.key, key);

        let mut response = req.accept_response();
        let head_len = response.len();
        response.extend_from_slice(&[0x81, 0x00]);
        assert_eq!(parse_response(&response, &key).unwrap(), Some(head_len));
        assert!(parse_response(&response, "other-key").is_err());
    }

    #[test]
    fn rejection_is_not_an_upgrade() {
        let response = reject_response(400, "missing Sec-WebSocket-Key");
        let text = String::from_utf8(response.clone()).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.ends_with("missing Sec-WebSocket-Key"));
        assert!(parse_response(&response, SAMPLE_KEY).is_err());
    }
}
