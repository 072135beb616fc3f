//! WebSocket side of the relay: a writer task owns the sink, and sessions
//! talk to it through [`WsRelay`].

use std::borrow::Cow;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt};
use ipclink_peer::{Relay, RelayError};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

/// Close reasons must fit a control frame (125 bytes, 2 of them the code).
const MAX_CLOSE_REASON: usize = 123;

enum Outbound {
    Message(Message),
    Close(Option<CloseFrame<'static>>),
}

/// Relay handle for one WebSocket connection.
pub struct WsRelay {
    tx: mpsc::UnboundedSender<Outbound>,
    close_requested: Notify,
}

impl WsRelay {
    /// Spawns the writer task that owns `sink`. The task ends after sending
    /// a close frame or once every handle is dropped.
    pub fn spawn<S>(sink: S, label: String) -> (Self, JoinHandle<()>)
    where
        S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(sink, rx, label));
        let relay = Self {
            tx,
            close_requested: Notify::new(),
        };
        (relay, writer)
    }

    /// Queues a binary or control message.
    pub fn send_message(&self, msg: Message) -> Result<(), RelayError> {
        self.tx
            .send(Outbound::Message(msg))
            .map_err(|_| RelayError::Closed)
    }

    /// Queues a close frame; the writer stops after it.
    pub fn send_close(&self, code: CloseCode, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: Cow::Owned(truncate_reason(reason).to_owned()),
        };
        let _ = self.tx.send(Outbound::Close(Some(frame)));
    }

    /// Resolves once the session asked for the connection to be closed.
    pub async fn close_requested(&self) {
        self.close_requested.notified().await
    }
}

#[async_trait]
impl Relay for WsRelay {
    async fn send(&self, text: String) -> Result<(), RelayError> {
        self.send_message(Message::Text(text))
    }

    async fn close(&self) {
        let _ = self.tx.send(Outbound::Close(None));
        self.close_requested.notify_one();
    }
}

async fn run_writer<S>(mut sink: S, mut rx: mpsc::UnboundedReceiver<Outbound>, label: String)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(out) = rx.recv().await {
        let (msg, last) = match out {
            Outbound::Message(msg) => (msg, false),
            Outbound::Close(frame) => (Message::Close(frame), true),
        };
        if let Err(e) = sink.send(msg).await {
            warn!("[{}] WebSocket write failed: {}", label, e);
            break;
        }
        if last {
            break;
        }
    }
    if let Err(e) = sink.close().await {
        debug!("[{}] WebSocket close: {}", label, e);
    }
    debug!("[{}] WebSocket writer finished", label);
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
