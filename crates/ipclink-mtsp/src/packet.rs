use bytes::Bytes;

use crate::error::FrameError;

/// Leading byte of an interleaved frame.
pub const INTERLEAVED_MARKER: u8 = b'$';

/// Fixed request URI. The device ignores it but requires the request line
/// to be well-formed.
pub const MULTITRANS_URI: &str = "rtsp://127.0.0.1/multitrans";

pub const MAX_LINE_LEN: usize = 8 * 1024;
pub const MAX_BODY_LEN: usize = 1024 * 1024;
pub(crate) const MAX_HEADERS: usize = 64;

const PROTOCOL: &str = "RTSP/1.0";

// MARK: - Headers

/// Ordered, case-insensitive header multimap.
///
/// Insertion order is kept so that encoded requests list headers exactly in
/// the order the caller added them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Builder form of [`Headers::add`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(name, value);
        self
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name` in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a folded continuation line to the most recent value.
    pub(crate) fn extend_last(&mut self, continuation: &str) -> bool {
        match self.entries.last_mut() {
            Some((_, v)) => {
                v.push(' ');
                v.push_str(continuation);
                true
            }
            None => false,
        }
    }
}

// MARK: - Packet

/// Text control response from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status_line: String,
    pub status_code: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    /// Reason phrase following the status code, if any.
    pub fn reason(&self) -> &str {
        self.status_line
            .splitn(3, char::is_whitespace)
            .nth(2)
            .map(str::trim)
            .unwrap_or("")
    }

    pub fn is_ok(&self) -> bool {
        self.status_code == 200
    }
}

/// Binary media frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Bytes,
}

/// What the device sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Response(Response),
    Interleaved(InterleavedFrame),
}

/// Control request as seen by the device side of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn cseq(&self) -> Option<u32> {
        self.headers.get("CSeq").and_then(|v| v.trim().parse().ok())
    }
}

/// What a client sends to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Request(Request),
    Interleaved(InterleavedFrame),
}

// MARK: - Encoding

/// Serialises one control request: request line, `CSeq`, `Content-Length`,
/// caller headers (one line per value, in insertion order), blank line, body.
pub fn encode_request(method: &str, cseq: u32, headers: &Headers, body: &[u8]) -> Vec<u8> {
    let mut head = format!(
        "{} {} {}\r\nCSeq: {}\r\nContent-Length: {}\r\n",
        method,
        MULTITRANS_URI,
        PROTOCOL,
        cseq,
        body.len()
    );
    for (name, value) in headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    let mut out = Vec::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body);
    out
}

/// Serialises one control response. `Content-Length` is always emitted.
pub fn encode_response(status: u16, reason: &str, headers: &Headers, body: &[u8]) -> Vec<u8> {
    let mut head = format!("{} {} {}\r\n", PROTOCOL, status, reason);
    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    let mut out = Vec::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body);
    out
}

/// Serialises one interleaved frame.
///
/// ```text
/// ┌──────┬─────────┬──────────────┬─────────────┐
/// │ '$'  │ channel │ length u16BE │ payload ... │
/// └──────┴─────────┴──────────────┴─────────────┘
/// ```
pub fn encode_interleaved(channel: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;
    let mut out = Vec::with_capacity(4 + payload.len());
    out.push(INTERLEAVED_MARKER);
    out.push(channel);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

// MARK: - Parsing helpers

/// Parses `RTSP/1.0 <digits>[ <reason>]`.
pub(crate) fn parse_status_line(line: &str) -> Result<u16, FrameError> {
    let malformed = || FrameError::MalformedStatusLine(line.to_owned());

    let rest = line.strip_prefix(PROTOCOL).ok_or_else(malformed)?;
    if !rest.starts_with(char::is_whitespace) {
        return Err(malformed());
    }
    let code = rest
        .trim_start()
        .split(char::is_whitespace)
        .next()
        .unwrap_or("");
    if code.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    code.parse().map_err(|_| malformed())
}

/// Parses `<METHOD> <URI> RTSP/1.0`.
pub(crate) fn parse_request_line(line: &str) -> Result<(String, String), FrameError> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(uri), Some(PROTOCOL), None) => Ok((method.to_owned(), uri.to_owned())),
        _ => Err(FrameError::MalformedRequestLine(line.to_owned())),
    }
}

/// Splits `Name: value`. Leading/trailing whitespace of the value is dropped.
pub(crate) fn parse_header_line(line: &str) -> Result<(String, String), FrameError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| FrameError::MalformedHeader(line.to_owned()))?;
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(FrameError::MalformedHeader(line.to_owned()));
    }
    Ok((name.to_owned(), value.trim().to_owned()))
}

/// Declared body length; absent header means no body.
pub(crate) fn content_length(headers: &Headers) -> Result<usize, FrameError> {
    let Some(raw) = headers.get("Content-Length") else {
        return Ok(0);
    };
    let len: usize = raw
        .trim()
        .parse()
        .map_err(|_| FrameError::InvalidContentLength(raw.to_owned()))?;
    if len > MAX_BODY_LEN {
        return Err(FrameError::BodyTooLarge(len));
    }
    Ok(len)
}
