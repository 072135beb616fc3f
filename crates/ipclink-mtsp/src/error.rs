use thiserror::Error;

/// Framing errors. Every variant is fatal for the connection it came from:
/// there is no resynchronisation after a partial frame.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Malformed status line: {0:?}")]
    MalformedStatusLine(String),

    #[error("Malformed request line: {0:?}")]
    MalformedRequestLine(String),

    #[error("Malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("Too many header lines (max {0})")]
    TooManyHeaders(usize),

    #[error("Invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("Body too large: {0} bytes")]
    BodyTooLarge(usize),

    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("Line is not valid UTF-8")]
    NotUtf8,

    #[error("Interleaved payload too large: {0} bytes (max 65535)")]
    PayloadTooLarge(usize),
}
