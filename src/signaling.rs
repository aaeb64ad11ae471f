//! The relay connection of one meeting session.
//!
//! A single websocket, split into a writer task fed by [`SignalingSender`]
//! and a reader task that parses frames into [`ServerMessage`]s.  There is no
//! reconnect: once the socket closes the channel yields
//! [`SignalingInput::Closed`] and stays quiet.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{MeshError, Result};
use crate::protocol::{ClientMessage, ServerMessage};

// ─── Inputs ─────────────────────────────────────────────────────────────────

/// What the reader side hands to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingInput {
    Message(ServerMessage),
    /// The socket is gone.  Carries the close reason or transport error, if
    /// any.
    Closed(Option<String>),
}

// ─── Sender ─────────────────────────────────────────────────────────────────

/// Cloneable handle for queueing outgoing relay messages.
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl SignalingSender {
    pub fn new(tx: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self { tx }
    }

    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| MeshError::SessionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ─── Channel ────────────────────────────────────────────────────────────────

pub struct SignalingChannel {
    sender: SignalingSender,
    inbound: mpsc::UnboundedReceiver<SignalingInput>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingChannel {
    /// Build the socket URL: the configured endpoint with `token` and
    /// `room_id` appended as query parameters.
    pub fn socket_url(base: &str, room_id: &str, token: &str) -> Result<Url> {
        let mut url = Url::parse(base)?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(MeshError::Config(format!(
                    "signaling url must be ws:// or wss://, got {other}://"
                )))
            }
        }
        url.query_pairs_mut()
            .append_pair("token", token)
            .append_pair("room_id", room_id);
        Ok(url)
    }

    /// Open the relay socket and start the reader/writer tasks.
    pub async fn connect(base: &str, room_id: &str, token: &str) -> Result<Self> {
        let url = Self::socket_url(base, room_id, token)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| MeshError::Signaling(format!("websocket connect failed: {e}")))?;
        info!(room_id = %room_id, host = url.host_str().unwrap_or_default(), "signaling connected");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SignalingInput>();
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    next = out_rx.recv() => {
                        let Some(message) = next else { break };
                        let text = match serde_json::to_string(&message) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("dropping unserialisable signaling message: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = ws_write.send(Message::Text(text)).await {
                            warn!("signaling write failed: {e}");
                            break;
                        }
                    }
                    _ = writer_cancel.cancelled() => break,
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
            debug!("signaling writer stopped");
        });

        let reader_cancel = cancel.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                let frame = tokio::select! {
                    frame = ws_read.next() => frame,
                    _ = reader_cancel.cancelled() => return,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => forward(&in_tx, &text),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => forward(&in_tx, &text),
                        Err(_) => warn!("non-utf8 binary signaling frame dropped"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("signaling websocket error: {e}");
                        break Some(e.to_string());
                    }
                    None => break None,
                }
            };
            let _ = in_tx.send(SignalingInput::Closed(reason));
        });

        Ok(Self {
            sender: SignalingSender::new(out_tx),
            inbound: in_rx,
            cancel,
            tasks: vec![writer, reader],
        })
    }

    /// Wrap already-established channels, for transports other than the
    /// built-in websocket.
    pub fn from_channels(
        outbound: mpsc::UnboundedSender<ClientMessage>,
        inbound: mpsc::UnboundedReceiver<SignalingInput>,
    ) -> Self {
        Self {
            sender: SignalingSender::new(outbound),
            inbound,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    /// Next inbound item.  `None` once the reader is gone and everything
    /// has been drained.
    pub async fn recv(&mut self) -> Option<SignalingInput> {
        self.inbound.recv().await
    }

    /// Stop both tasks and wait for them.  Anything already queued on the
    /// sender is written before the close frame.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.inbound.close();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn forward(in_tx: &mpsc::UnboundedSender<SignalingInput>, text: &str) {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => {
            debug!(kind = message.kind(), "signaling message received");
            let _ = in_tx.send(SignalingInput::Message(message));
        }
        Err(e) => warn!("unparseable signaling frame dropped: {e}"),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
