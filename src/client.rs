use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::errors::{TransferError, TransferResult};
use crate::frame::{decode_relay, ChunkFrame};
use crate::pacer::BufferGauge;
use crate::wsproto::{decode_text, SignalMessage};

/// Something that arrived on the signaling connection.
#[derive(Debug)]
pub enum Inbound {
    Control(SignalMessage),
    RelayFrame(ChunkFrame),
    BadFrame(TransferError),
    Closed,
}

enum Outgoing {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

impl Outgoing {
    fn len(&self) -> usize {
        match self {
            Outgoing::Text(t) => t.len(),
            Outgoing::Binary(b) => b.len(),
            Outgoing::Close => 0,
        }
    }
}

/// Handle to the WebSocket connection with the signaling server.
///
/// Writes are queued to a writer task; the queued byte count is what the
/// relay transport reports as buffered.
#[derive(Clone)]
pub struct SignalingClient {
    tx: mpsc::UnboundedSender<Outgoing>,
    gauge: BufferGauge,
    tasks: Arc<[JoinHandle<()>; 2]>,
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("buffered", &self.gauge.buffered())
            .field("closed", &self.gauge.is_closed())
            .finish()
    }
}

/// Turn `http(s)://host` or `ws(s)://host` into the `/ws` endpoint URL.
pub fn signaling_url(server_url: &str) -> Result<Url> {
    let mut url = Url::parse(
        &server_url
            .replace("http://", "ws://")
            .replace("https://", "wss://"),
    )
    .with_context(|| format!("parse server url {server_url}"))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    Ok(url)
}

impl SignalingClient {
    pub async fn connect(server_url: &str) -> Result<(Self, mpsc::UnboundedReceiver<Inbound>)> {
        let ws_url = signaling_url(server_url)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("connect {ws_url}"))?;
        crate::logging::info_kv("signaling connected", &[("url", ws_url.as_str())]);
        let (mut write, mut read) = ws_stream.split();

        let gauge = BufferGauge::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();

        // writer
        let writer_gauge = gauge.clone();
        let write_task = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                let len = out.len();
                let msg = match out {
                    Outgoing::Text(t) => Message::Text(t),
                    Outgoing::Binary(b) => Message::Binary(b),
                    Outgoing::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                };
                let sent = write.send(msg).await;
                writer_gauge.release(len);
                if let Err(err) = sent {
                    crate::logging::error(format!("ws send error: {err}"));
                    break;
                }
            }
            writer_gauge.close();
        });

        // reader
        let reader_gauge = gauge.clone();
        let read_task = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let inbound = match msg {
                    Ok(Message::Text(txt)) => match decode_text(&txt) {
                        Ok(m) => Inbound::Control(m),
                        Err(err) => {
                            crate::logging::warn(format!("ws message parse error: {err}"));
                            continue;
                        }
                    },
                    Ok(Message::Binary(bin)) => match decode_relay(&bin) {
                        Ok(frame) => Inbound::RelayFrame(frame),
                        Err(err) => Inbound::BadFrame(err),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        crate::logging::warn(format!("ws read error: {err}"));
                        break;
                    }
                };
                if inbound_tx.send(inbound).is_err() {
                    break;
                }
            }
            reader_gauge.close();
            let _ = inbound_tx.send(Inbound::Closed);
            crate::logging::info("signaling disconnected");
        });

        Ok((
            Self {
                tx,
                gauge,
                tasks: Arc::new([write_task, read_task]),
            },
            inbound_rx,
        ))
    }

    fn enqueue(&self, out: Outgoing) -> TransferResult<()> {
        if self.gauge.is_closed() {
            return Err(TransferError::Closed);
        }
        let len = out.len();
        self.gauge.add(len);
        self.tx.send(out).map_err(|_| {
            self.gauge.release(len);
            TransferError::Closed
        })
    }

    pub fn send_control(&self, msg: &SignalMessage) -> TransferResult<()> {
        let text = msg.to_text()?;
        self.enqueue(Outgoing::Text(text))
    }

    pub fn send_binary(&self, bytes: Vec<u8>) -> TransferResult<()> {
        self.enqueue(Outgoing::Binary(bytes))
    }

    pub fn gauge(&self) -> &BufferGauge {
        &self.gauge
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.gauge.buffered()
    }

    pub fn is_closed(&self) -> bool {
        self.gauge.is_closed()
    }

    /// Flush queued messages, send a close frame and stop reading.
    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
        self.tasks[1].abort();
        self.gauge.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaling_url_maps_http_and_adds_path() {
        assert_eq!(
            signaling_url("http://127.0.0.1:3000").unwrap().as_str(),
            "ws://127.0.0.1:3000/ws"
        );
        assert_eq!(
            signaling_url("https://drop.example.com").unwrap().as_str(),
            "wss://drop.example.com/ws"
        );
        assert_eq!(
            signaling_url("ws://127.0.0.1:3000/custom").unwrap().as_str(),
            "ws://127.0.0.1:3000/custom"
        );
    }
}
