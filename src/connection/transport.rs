//! Outbound half of one connection.
//!
//! The worker is the only writer of its transport, but writes must not
//! block the request loop, so frames go through an unbounded queue drained
//! by a writer task. The queue tracks its buffered byte count, which is
//! what the push pipeline consults for backpressure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4001;

enum Outbound {
    Frame(String),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Handle to the writer task. Cloneable; all clones share the queue.
#[derive(Clone)]
pub struct Transport {
    tx: mpsc::UnboundedSender<Outbound>,
    buffered: Arc<AtomicUsize>,
}

impl Transport {
    /// Spawn the writer task draining into `sink`.
    pub fn start<S>(mut sink: S) -> Self
    where
        S: Sink<Message> + Send + Unpin + 'static,
        S::Error: std::fmt::Display,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let buffered = Arc::new(AtomicUsize::new(0));

        let counter = buffered.clone();
        tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                match out {
                    Outbound::Frame(frame) => {
                        let len = frame.len();
                        let sent = sink.send(Message::Text(frame)).await;
                        counter.fetch_sub(len, Ordering::SeqCst);
                        if let Err(e) = sent {
                            debug!(err = %e, "transport write failed");
                            break;
                        }
                    }
                    Outbound::Pong(data) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        break;
                    }
                }
            }
        });

        Self { tx, buffered }
    }

    /// Queue a text frame. Returns `false` when the writer is gone, which
    /// the worker treats as a dead transport.
    pub fn send_frame(&self, frame: String) -> bool {
        self.buffered.fetch_add(frame.len(), Ordering::SeqCst);
        let sent = self.tx.send(Outbound::Frame(frame)).is_ok();
        if !sent {
            // Nothing will drain the queue anymore; keep the counter honest.
            self.buffered.store(0, Ordering::SeqCst);
        }
        sent
    }

    pub fn send_pong(&self, data: Vec<u8>) {
        let _ = self.tx.send(Outbound::Pong(data));
    }

    /// Queue a close frame. Frames queued earlier are written first; the
    /// writer task exits after the close goes out.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Bytes queued but not yet handed to the socket.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }
}
