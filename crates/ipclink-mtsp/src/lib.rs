//! MULTITRANS wire framer.
//!
//! One device connection carries two kinds of traffic on the same byte
//! stream: RTSP-flavoured text control messages and binary interleaved media
//! frames.
//!
//! ```text
//! request   "<METHOD> rtsp://127.0.0.1/multitrans RTSP/1.0\r\n"
//!           "CSeq: <n>\r\n"
//!           "Content-Length: <len>\r\n"
//!           <caller headers>\r\n
//!           \r\n
//!           <body>
//!
//! response  "RTSP/1.0 <code> <reason>\r\n" <headers> \r\n <body>
//!
//! frame     0x24 '$' | channel u8 | length u16 BE | payload
//! ```

pub mod conn;
pub mod error;
pub mod packet;

pub use conn::{MtspConn, TcpMtspConn};
pub use error::FrameError;
pub use packet::{
    encode_interleaved, encode_request, encode_response, Headers, Inbound, InterleavedFrame,
    Packet, Request, Response, INTERLEAVED_MARKER, MAX_BODY_LEN, MAX_LINE_LEN, MULTITRANS_URI,
};

pub const METHOD_MULTITRANS: &str = "MULTITRANS";
pub const METHOD_TEARDOWN: &str = "TEARDOWN";
