use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::FrameError;
use crate::packet::{
    content_length, encode_interleaved, encode_request, encode_response, parse_header_line,
    parse_request_line, parse_status_line, Headers, Inbound, InterleavedFrame, Packet, Request,
    Response, INTERLEAVED_MARKER, MAX_HEADERS, MAX_LINE_LEN,
};
use crate::{METHOD_MULTITRANS, METHOD_TEARDOWN};

pub type TcpMtspConn = MtspConn<TcpStream>;

const READ_CHUNK: usize = 8 * 1024;

// ── Connection ────────────────────────────────────────────────────────────────

struct ReadSide<S> {
    half: ReadHalf<S>,
    /// Bytes received but not yet returned as a packet.
    buf: BytesMut,
}

struct WriteSide<S> {
    half: WriteHalf<S>,
    cseq: u32,
}

/// Framed connection to one device.
///
/// The stream is split: the read half is drained by a single reader at a
/// time, the write half and the `CSeq` counter sit behind one lock so that
/// every write is a single, non-interleaved block. A reader waiting for media
/// never blocks a writer.
///
/// Reads are cancel-safe. Dropping a pending [`read_packet`](Self::read_packet)
/// or [`read_inbound`](Self::read_inbound) loses nothing: a partially received
/// packet stays buffered and the next read completes it.
pub struct MtspConn<S> {
    reader: Mutex<ReadSide<S>>,
    writer: Mutex<WriteSide<S>>,
}

impl<S> MtspConn<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(ReadSide {
                half: read_half,
                buf: BytesMut::with_capacity(READ_CHUNK),
            }),
            writer: Mutex::new(WriteSide {
                half: write_half,
                cseq: 0,
            }),
        }
    }

    /// `CSeq` the next control request will carry.
    pub async fn cseq(&self) -> u32 {
        self.writer.lock().await.cseq
    }

    // ── Client → device ─────────────────────────────────────────────────────

    /// Writes one control request. The `CSeq` counter advances only when the
    /// whole block reached the stream.
    pub async fn write_control(
        &self,
        method: &str,
        headers: &Headers,
        body: &[u8],
    ) -> Result<(), FrameError> {
        let mut w = self.writer.lock().await;
        let block = encode_request(method, w.cseq, headers, body);
        w.half.write_all(&block).await?;
        w.half.flush().await?;
        trace!("→ {} CSeq={} ({} body bytes)", method, w.cseq, body.len());
        w.cseq = w.cseq.wrapping_add(1);
        Ok(())
    }

    pub async fn write_multitrans(&self, headers: &Headers, body: &[u8]) -> Result<(), FrameError> {
        self.write_control(METHOD_MULTITRANS, headers, body).await
    }

    pub async fn write_teardown(&self) -> Result<(), FrameError> {
        self.write_control(METHOD_TEARDOWN, &Headers::new(), &[]).await
    }

    /// Writes one interleaved frame on channel 0.
    pub async fn write_interleaved(&self, payload: &[u8]) -> Result<(), FrameError> {
        self.write_frame(0, payload).await
    }

    /// Writes one interleaved frame on `channel`. Oversized payloads are
    /// rejected before anything touches the stream.
    pub async fn write_frame(&self, channel: u8, payload: &[u8]) -> Result<(), FrameError> {
        let frame = encode_interleaved(channel, payload)?;
        let mut w = self.writer.lock().await;
        w.half.write_all(&frame).await?;
        w.half.flush().await?;
        Ok(())
    }

    /// Reads the next packet from the device: an interleaved frame or a text
    /// response.
    pub async fn read_packet(&self) -> Result<Packet, FrameError> {
        let mut r = self.reader.lock().await;
        loop {
            match r.buf.first().copied() {
                None => {}
                Some(INTERLEAVED_MARKER) => {
                    if let Some(frame) = decode_interleaved(&mut r.buf) {
                        trace!("← ${} ({} bytes)", frame.channel, frame.payload.len());
                        return Ok(Packet::Interleaved(frame));
                    }
                }
                Some(_) => {
                    if let Some(msg) = decode_message(&mut r.buf, parse_status_line)? {
                        trace!("← {} ({} body bytes)", msg.start_line, msg.body.len());
                        return Ok(Packet::Response(Response {
                            status_line: msg.start_line,
                            status_code: msg.start,
                            headers: msg.headers,
                            body: msg.body,
                        }));
                    }
                }
            }
            r.fill().await?;
        }
    }

    // ── Device → client ─────────────────────────────────────────────────────

    /// Reads the next request or interleaved frame sent by a client. Used by
    /// device-side endpoints (simulators, test doubles).
    pub async fn read_inbound(&self) -> Result<Inbound, FrameError> {
        let mut r = self.reader.lock().await;
        loop {
            match r.buf.first().copied() {
                None => {}
                Some(INTERLEAVED_MARKER) => {
                    if let Some(frame) = decode_interleaved(&mut r.buf) {
                        return Ok(Inbound::Interleaved(frame));
                    }
                }
                Some(_) => {
                    if let Some(msg) = decode_message(&mut r.buf, parse_request_line)? {
                        let (method, uri) = msg.start;
                        return Ok(Inbound::Request(Request {
                            method,
                            uri,
                            headers: msg.headers,
                            body: msg.body,
                        }));
                    }
                }
            }
            r.fill().await?;
        }
    }

    pub async fn write_response(
        &self,
        status: u16,
        reason: &str,
        headers: &Headers,
        body: &[u8],
    ) -> Result<(), FrameError> {
        let block = encode_response(status, reason, headers, body);
        let mut w = self.writer.lock().await;
        w.half.write_all(&block).await?;
        w.half.flush().await?;
        Ok(())
    }

    /// Shuts the write half down. The peer sees end-of-stream.
    pub async fn shutdown(&self) -> Result<(), FrameError> {
        let mut w = self.writer.lock().await;
        w.half.shutdown().await?;
        Ok(())
    }
}

// ── Read helpers ──────────────────────────────────────────────────────────────

impl<S: AsyncRead> ReadSide<S> {
    /// Appends whatever the stream has to `buf`. Cancel-safe: `read_buf`
    /// either appends or leaves `buf` untouched.
    async fn fill(&mut self) -> Result<(), FrameError> {
        self.buf.reserve(READ_CHUNK);
        if self.half.read_buf(&mut self.buf).await? > 0 {
            return Ok(());
        }
        if self.buf.is_empty() {
            Err(FrameError::ConnectionClosed)
        } else {
            Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into())
        }
    }
}

/// Takes one `$`-frame off the front of `buf` once all of it is there.
fn decode_interleaved(buf: &mut BytesMut) -> Option<InterleavedFrame> {
    if buf.len() < 4 {
        return None;
    }
    let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return None;
    }
    let channel = buf[1];
    buf.advance(4);
    Some(InterleavedFrame {
        channel,
        payload: buf.split_to(len).freeze(),
    })
}

struct Message<T> {
    start: T,
    start_line: String,
    headers: Headers,
    body: Bytes,
}

/// Takes one text message (start line, headers, body) off the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` alone while the message is incomplete.
/// Malformed input is reported as soon as the offending line is complete.
fn decode_message<T>(
    buf: &mut BytesMut,
    parse_start: impl Fn(&str) -> Result<T, FrameError>,
) -> Result<Option<Message<T>>, FrameError> {
    let mut pos = 0;
    let Some(start_line) = next_line(buf, &mut pos)? else {
        return Ok(None);
    };
    let start = parse_start(&start_line)?;

    // Lines starting with whitespace continue the previous value.
    let mut headers = Headers::new();
    loop {
        let Some(line) = next_line(buf, &mut pos)? else {
            return Ok(None);
        };
        if line.is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) {
            if !headers.extend_last(line.trim()) {
                return Err(FrameError::MalformedHeader(line));
            }
            continue;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(FrameError::TooManyHeaders(MAX_HEADERS));
        }
        let (name, value) = parse_header_line(&line)?;
        headers.add(name, value);
    }

    let len = content_length(&headers)?;
    if buf.len() - pos < len {
        return Ok(None);
    }
    buf.advance(pos);
    Ok(Some(Message {
        start,
        start_line,
        headers,
        body: buf.split_to(len).freeze(),
    }))
}

/// Next complete line at `pos`, without its terminator. Accepts `\r\n` and
/// bare `\n`.
fn next_line(buf: &[u8], pos: &mut usize) -> Result<Option<String>, FrameError> {
    let rest = &buf[*pos..];
    let Some(end) = rest.iter().position(|&b| b == b'\n') else {
        if rest.len() > MAX_LINE_LEN + 1 {
            return Err(FrameError::LineTooLong(MAX_LINE_LEN));
        }
        return Ok(None);
    };
    let mut line = &rest[..end];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    if line.len() > MAX_LINE_LEN {
        return Err(FrameError::LineTooLong(MAX_LINE_LEN));
    }
    *pos += end + 1;
    std::str::from_utf8(line)
        .map(str::to_owned)
        .map(Some)
        .map_err(|_| FrameError::NotUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};
    use tokio::time::timeout;

    fn pair() -> (MtspConn<DuplexStream>, MtspConn<DuplexStream>) {
        let (a, b) = duplex(256 * 1024);
        (MtspConn::new(a), MtspConn::new(b))
    }

    fn expect_request(inbound: Inbound) -> Request {
        match inbound {
            Inbound::Request(r) => r,
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn control_request_round_trip() {
        let (client, device) = pair();
        let headers = Headers::new()
            .with("Authorization", "Basic YWRtaW46c2VjcmV0")
            .with("X-Handshake", "unused debug")
            .with("X-Multi", "one")
            .with("X-Multi", "two");
        let body = br#"{"type":"request","seq":0}"#;

        client.write_multitrans(&headers, body).await.unwrap();
        let req = expect_request(device.read_inbound().await.unwrap());

        assert_eq!(req.method, "MULTITRANS");
        assert_eq!(req.uri, "rtsp://127.0.0.1/multitrans");
        assert_eq!(req.cseq(), Some(0));
        assert_eq!(req.headers.get("content-length"), Some("26"));
        assert_eq!(req.headers.get("Authorization"), Some("Basic YWRtaW46c2VjcmV0"));
        assert_eq!(req.headers.get("X-Handshake"), Some("unused debug"));
        assert_eq!(req.headers.get_all("X-Multi").collect::<Vec<_>>(), vec!["one", "two"]);
        assert_eq!(&req.body[..], body);
    }

    #[tokio::test]
    async fn response_round_trip() {
        let (client, device) = pair();
        let headers = Headers::new().with("Content-Type", "application/json");
        device
            .write_response(200, "OK", &headers, br#"{"ok":true}"#)
            .await
            .unwrap();

        match client.read_packet().await.unwrap() {
            Packet::Response(r) => {
                assert_eq!(r.status_code, 200);
                assert_eq!(r.reason(), "OK");
                assert_eq!(r.headers.get("content-type"), Some("application/json"));
                assert_eq!(&r.body[..], br#"{"ok":true}"#);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn interleaved_round_trip_boundaries() {
        let (client, device) = pair();
        let client = Arc::new(client);

        for len in [0usize, 1, 1400, 65_535] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let writer = Arc::clone(&client);
            let sent = payload.clone();
            let write = tokio::spawn(async move { writer.write_interleaved(&sent).await });

            match device.read_inbound().await.unwrap() {
                Inbound::Interleaved(f) => {
                    assert_eq!(f.channel, 0);
                    assert_eq!(&f.payload[..], &payload[..], "payload of {len} bytes");
                }
                other => panic!("expected frame, got {other:?}"),
            }
            write.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn frames_on_other_channels_keep_their_id() {
        let (client, device) = pair();
        device.write_frame(1, b"pcma").await.unwrap();
        device.write_frame(255, b"").await.unwrap();

        let a = client.read_packet().await.unwrap();
        let b = client.read_packet().await.unwrap();
        assert_eq!(
            a,
            Packet::Interleaved(InterleavedFrame {
                channel: 1,
                payload: Bytes::from_static(b"pcma")
            })
        );
        assert_eq!(
            b,
            Packet::Interleaved(InterleavedFrame {
                channel: 255,
                payload: Bytes::new()
            })
        );
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_without_writing() {
        let (client, device) = pair();
        let err = client.write_interleaved(&vec![0u8; 70_000]).await.unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge(70_000)));

        // Nothing reached the wire: the next frame is the first one seen.
        client.write_interleaved(b"next").await.unwrap();
        match device.read_inbound().await.unwrap() {
            Inbound::Interleaved(f) => assert_eq!(&f.payload[..], b"next"),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn absent_content_length_means_empty_body() {
        let (a, mut raw) = duplex(4096);
        let conn = MtspConn::new(a);
        raw.write_all(b"RTSP/1.0 200 OK\r\nServer: cam\r\n\r\n$\x00\x00\x02hi")
            .await
            .unwrap();

        match conn.read_packet().await.unwrap() {
            Packet::Response(r) => assert!(r.body.is_empty()),
            other => panic!("expected response, got {other:?}"),
        }
        // The bytes after the blank line belong to the next packet.
        match conn.read_packet().await.unwrap() {
            Packet::Interleaved(f) => assert_eq!(&f.payload[..], b"hi"),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn content_length_consumes_exactly_n_bytes() {
        let (a, mut raw) = duplex(4096);
        let conn = MtspConn::new(a);
        raw.write_all(b"RTSP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nhelloRTSP/1.0 404 Not Found\r\n\r\n")
            .await
            .unwrap();

        match conn.read_packet().await.unwrap() {
            Packet::Response(r) => assert_eq!(&r.body[..], b"hello"),
            other => panic!("expected response, got {other:?}"),
        }
        match conn.read_packet().await.unwrap() {
            Packet::Response(r) => {
                assert_eq!(r.status_code, 404);
                assert_eq!(r.reason(), "Not Found");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn folded_headers_are_joined() {
        let (a, mut raw) = duplex(4096);
        let conn = MtspConn::new(a);
        raw.write_all(b"RTSP/1.0 200 OK\r\nX-Long: first\r\n  second\r\n\r\n")
            .await
            .unwrap();
        match conn.read_packet().await.unwrap() {
            Packet::Response(r) => assert_eq!(r.headers.get("x-long"), Some("first second")),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_input_is_fatal() {
        let (a, mut raw) = duplex(4096);
        let conn = MtspConn::new(a);
        raw.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        assert!(matches!(
            conn.read_packet().await,
            Err(FrameError::MalformedStatusLine(_))
        ));

        let (a, mut raw) = duplex(4096);
        let conn = MtspConn::new(a);
        raw.write_all(b"RTSP/1.0 200 OK\r\nContent-Length: abc\r\n\r\n")
            .await
            .unwrap();
        assert!(matches!(
            conn.read_packet().await,
            Err(FrameError::InvalidContentLength(_))
        ));

        let (a, mut raw) = duplex(4096);
        let conn = MtspConn::new(a);
        raw.write_all(b"RTSP/1.0 200 OK\r\nbroken header\r\n\r\n")
            .await
            .unwrap();
        assert!(matches!(
            conn.read_packet().await,
            Err(FrameError::MalformedHeader(_))
        ));
    }

    #[tokio::test]
    async fn short_reads_are_errors() {
        let (a, mut raw) = duplex(4096);
        let conn = MtspConn::new(a);
        raw.write_all(b"RTSP/1.0 200 OK\r\nContent-Length: 10\r\n\r\nabc")
            .await
            .unwrap();
        drop(raw);
        assert!(matches!(conn.read_packet().await, Err(FrameError::Io(_))));

        let (a, raw) = duplex(64);
        let conn = MtspConn::new(a);
        drop(raw);
        assert!(matches!(
            conn.read_packet().await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn abandoned_read_resumes_mid_frame() {
        let (a, mut raw) = duplex(4096);
        let conn = MtspConn::new(a);
        let mut frame = vec![b'$', 0, 0x03, 0xE8];
        frame.extend((0..1000u32).map(|i| (i % 199) as u8));

        raw.write_all(&frame[..404]).await.unwrap();
        let abandoned = timeout(Duration::from_millis(50), conn.read_packet()).await;
        assert!(abandoned.is_err());

        raw.write_all(&frame[404..]).await.unwrap();
        raw.write_all(b"RTSP/1.0 200 OK\r\n\r\n").await.unwrap();
        match conn.read_packet().await.unwrap() {
            Packet::Interleaved(f) => {
                assert_eq!(f.channel, 0);
                assert_eq!(&f.payload[..], &frame[4..]);
            }
            other => panic!("expected frame, got {other:?}"),
        }
        match conn.read_packet().await.unwrap() {
            Packet::Response(r) => assert_eq!(r.status_code, 200),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn abandoned_read_resumes_mid_message() {
        let (a, mut raw) = duplex(4096);
        let conn = MtspConn::new(a);

        raw.write_all(b"MULTITRANS rtsp://127.0.0.1/multitrans RTSP/1.0\r\nCSeq: 3\r\nContent-Le")
            .await
            .unwrap();
        let abandoned = timeout(Duration::from_millis(50), conn.read_inbound()).await;
        assert!(abandoned.is_err());

        raw.write_all(b"ngth: 4\r\n\r\nbo").await.unwrap();
        let abandoned = timeout(Duration::from_millis(50), conn.read_inbound()).await;
        assert!(abandoned.is_err());

        raw.write_all(b"dy").await.unwrap();
        let req = expect_request(conn.read_inbound().await.unwrap());
        assert_eq!(req.cseq(), Some(3));
        assert_eq!(&req.body[..], b"body");
    }

    #[tokio::test]
    async fn overlong_line_is_rejected() {
        let (a, mut raw) = duplex(32 * 1024);
        let conn = MtspConn::new(a);
        let mut line = b"RTSP/1.0 200 ".to_vec();
        line.resize(MAX_LINE_LEN + 16, b'x');
        raw.write_all(&line).await.unwrap();
        assert!(matches!(
            conn.read_packet().await,
            Err(FrameError::LineTooLong(MAX_LINE_LEN))
        ));
    }

    #[tokio::test]
    async fn cseq_advances_only_on_successful_writes() {
        let (client, device) = pair();
        assert_eq!(client.cseq().await, 0);

        client.write_multitrans(&Headers::new(), b"").await.unwrap();
        client.write_teardown().await.unwrap();
        assert_eq!(client.cseq().await, 2);

        let first = expect_request(device.read_inbound().await.unwrap());
        let second = expect_request(device.read_inbound().await.unwrap());
        assert_eq!(first.cseq(), Some(0));
        assert_eq!((second.method.as_str(), second.cseq()), ("TEARDOWN", Some(1)));

        drop(device);
        assert!(client.write_multitrans(&Headers::new(), b"x").await.is_err());
        assert_eq!(client.cseq().await, 2);
    }

    #[tokio::test]
    async fn shutdown_signals_end_of_stream() {
        let (client, device) = pair();
        client.shutdown().await.unwrap();
        assert!(matches!(
            device.read_inbound().await,
            Err(FrameError::ConnectionClosed)
        ));
    }
}
