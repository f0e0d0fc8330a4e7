use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use uuid::Uuid;

use crate::client::SignalingClient;
use crate::errors::{TransferError, TransferResult};
use crate::pacer::BufferGauge;
use crate::wsproto::{decode_channel_text, ChannelMessage, SignalMessage, SignalPayload};

const CHANNEL_MAGIC: &[u8; 4] = b"MDCH";
const KIND_TEXT: u8 = 0;
const KIND_BINARY: u8 = 1;
const MAX_ENVELOPE_BYTES: usize = 16 * 1024 * 1024;
const SESSION_PREFIX: &str = "mayadrop-session:";

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(12);

/// One message on a direct channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Text(String),
    Binary(Vec<u8>),
}

impl Envelope {
    fn len(&self) -> usize {
        match self {
            Envelope::Text(t) => t.len(),
            Envelope::Binary(b) => b.len(),
        }
    }
}

/// `[magic "MDCH"][kind:u8][len:u32-BE][payload]`
pub fn encode_envelope(env: &Envelope) -> Vec<u8> {
    let (kind, payload) = match env {
        Envelope::Text(t) => (KIND_TEXT, t.as_bytes()),
        Envelope::Binary(b) => (KIND_BINARY, b.as_slice()),
    };
    let mut out = Vec::with_capacity(4 + 1 + 4 + payload.len());
    out.extend_from_slice(CHANNEL_MAGIC);
    out.push(kind);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Read one envelope. `Ok(None)` on a clean end of stream between envelopes.
pub async fn read_envelope<R>(reader: &mut R) -> TransferResult<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let mut magic = [0u8; 4];
    match reader.read_exact(&mut magic).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    if &magic != CHANNEL_MAGIC {
        return Err(TransferError::frame("bad direct channel magic"));
    }
    let kind = reader.read_u8().await?;
    let len = reader.read_u32().await? as usize;
    if len > MAX_ENVELOPE_BYTES {
        return Err(TransferError::frame(format!(
            "envelope of {len} bytes exceeds limit"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    match kind {
        KIND_TEXT => String::from_utf8(payload)
            .map(|t| Some(Envelope::Text(t)))
            .map_err(|_| TransferError::frame("text envelope is not utf-8")),
        KIND_BINARY => Ok(Some(Envelope::Binary(payload))),
        other => Err(TransferError::frame(format!("unknown envelope kind {other}"))),
    }
}

enum Queued {
    Envelope(Envelope),
    Shutdown,
}

/// Sending half of an open direct channel.
#[derive(Clone)]
pub struct DirectChannel {
    peer_id: String,
    tx: mpsc::UnboundedSender<Queued>,
    gauge: BufferGauge,
}

impl std::fmt::Debug for DirectChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectChannel")
            .field("peer_id", &self.peer_id)
            .field("buffered", &self.gauge.buffered())
            .finish()
    }
}

/// Receiving half of an open direct channel.
pub struct DirectReceiver {
    reader: BufReader<OwnedReadHalf>,
    gauge: BufferGauge,
}

impl DirectReceiver {
    /// Next message, or `None` once the peer closed the channel.
    pub async fn recv(&mut self) -> TransferResult<Option<Envelope>> {
        let res = read_envelope(&mut self.reader).await;
        if !matches!(res, Ok(Some(_))) {
            self.gauge.close();
        }
        res
    }

    /// Read and discard until the peer hangs up.
    pub async fn drain(mut self) {
        while let Ok(Some(_)) = self.recv().await {}
    }
}

impl DirectChannel {
    pub fn from_stream(peer_id: &str, stream: TcpStream) -> (DirectChannel, DirectReceiver) {
        let _ = stream.set_nodelay(true);
        let (read, mut write) = stream.into_split();
        let gauge = BufferGauge::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<Queued>();

        let writer_gauge = gauge.clone();
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Queued::Envelope(env) => {
                        let len = env.len();
                        let res = write.write_all(&encode_envelope(&env)).await;
                        writer_gauge.release(len);
                        if let Err(err) = res {
                            crate::logging::warn(format!("direct channel write failed: {err}"));
                            break;
                        }
                    }
                    Queued::Shutdown => {
                        let _ = write.flush().await;
                        let _ = write.shutdown().await;
                        break;
                    }
                }
            }
            writer_gauge.close();
        });

        (
            DirectChannel {
                peer_id: peer_id.to_string(),
                tx,
                gauge: gauge.clone(),
            },
            DirectReceiver {
                reader: BufReader::new(read),
                gauge,
            },
        )
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn send(&self, env: Envelope) -> TransferResult<()> {
        if self.gauge.is_closed() {
            return Err(TransferError::Closed);
        }
        let len = env.len();
        self.gauge.add(len);
        self.tx.send(Queued::Envelope(env)).map_err(|_| {
            self.gauge.release(len);
            TransferError::Closed
        })
    }

    pub fn send_message(&self, msg: &ChannelMessage) -> TransferResult<()> {
        self.send(Envelope::Text(msg.to_text()?))
    }

    pub fn gauge(&self) -> &BufferGauge {
        &self.gauge
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.gauge.buffered()
    }

    /// Flush what is queued, then close the write side.
    pub fn close(&self) {
        let _ = self.tx.send(Queued::Shutdown);
    }

    /// Stop immediately; pending sends fail with `Closed`.
    pub fn abort(&self) {
        self.gauge.close();
        let _ = self.tx.send(Queued::Shutdown);
    }
}

fn session_sdp(token: &str) -> String {
    format!("{SESSION_PREFIX}{token}")
}

fn session_token(sdp: &str) -> Option<&str> {
    sdp.strip_prefix(SESSION_PREFIX).filter(|t| !t.is_empty())
}

fn advertised(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    }
}

/// Offering side of the negotiation: listen, announce the session and its
/// candidates through signaling, and wait for the peer to dial in.
///
/// `signals` carries the answer/ice payloads the peer sends back.
pub async fn offer(
    client: &SignalingClient,
    self_id: &str,
    peer_id: &str,
    bind: &str,
    salt: Option<Vec<u8>>,
    open_timeout: Duration,
    mut signals: mpsc::UnboundedReceiver<SignalPayload>,
) -> TransferResult<(DirectChannel, DirectReceiver)> {
    let listener = TcpListener::bind(bind).await?;
    let candidate = advertised(listener.local_addr()?);
    let token = Uuid::new_v4().as_simple().to_string();

    client.send_control(&SignalMessage::signal(
        peer_id,
        self_id,
        &SignalPayload::Offer {
            sdp: session_sdp(&token),
            salt,
        },
    )?)?;
    client.send_control(&SignalMessage::signal(
        peer_id,
        self_id,
        &SignalPayload::Ice {
            candidate: candidate.to_string(),
        },
    )?)?;
    crate::logging::debug(format!("direct offer sent to={peer_id} candidate={candidate}"));

    match timeout(open_timeout, accept_loop(&listener, &token, peer_id, &mut signals)).await {
        Ok(res) => res,
        Err(_) => Err(TransferError::ChannelTimeout(open_timeout)),
    }
}

async fn accept_loop(
    listener: &TcpListener,
    token: &str,
    peer_id: &str,
    signals: &mut mpsc::UnboundedReceiver<SignalPayload>,
) -> TransferResult<(DirectChannel, DirectReceiver)> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = accepted?;
                match verify_handshake(stream, token, peer_id).await {
                    Ok(pair) => return Ok(pair),
                    Err(err) => crate::logging::warn(format!(
                        "direct handshake from {remote} rejected: {err}"
                    )),
                }
            }
            Some(payload) = signals.recv() => {
                if let SignalPayload::Answer { .. } = payload {
                    crate::logging::debug(format!("direct answer from={peer_id}"));
                }
            }
        }
    }
}

async fn verify_handshake(
    stream: TcpStream,
    token: &str,
    peer_id: &str,
) -> TransferResult<(DirectChannel, DirectReceiver)> {
    let (channel, mut receiver) = DirectChannel::from_stream(peer_id, stream);
    let first = timeout(HANDSHAKE_TIMEOUT, receiver.recv())
        .await
        .map_err(|_| TransferError::Protocol("handshake timed out".into()))??;
    let Some(Envelope::Text(text)) = first else {
        channel.abort();
        return Err(TransferError::Protocol("expected handshake".into()));
    };
    match decode_channel_text(&text) {
        Ok(ChannelMessage::Handshake { session, from }) if session == token && from == peer_id => {
            Ok((channel, receiver))
        }
        _ => {
            channel.abort();
            Err(TransferError::Protocol("handshake mismatch".into()))
        }
    }
}

/// Answering side: acknowledge the offer, then dial trickled candidates until
/// one connects.
pub async fn answer(
    client: &SignalingClient,
    self_id: &str,
    peer_id: &str,
    offer_sdp: &str,
    salt: Option<Vec<u8>>,
    open_timeout: Duration,
    mut signals: mpsc::UnboundedReceiver<SignalPayload>,
) -> TransferResult<(DirectChannel, DirectReceiver)> {
    let token = session_token(offer_sdp)
        .ok_or_else(|| TransferError::Protocol(format!("unsupported offer sdp '{offer_sdp}'")))?
        .to_string();
    client.send_control(&SignalMessage::signal(
        peer_id,
        self_id,
        &SignalPayload::Answer {
            sdp: session_sdp(&token),
            salt,
        },
    )?)?;

    let deadline = Instant::now() + open_timeout;
    loop {
        let payload = match tokio::time::timeout_at(deadline, signals.recv()).await {
            Ok(Some(p)) => p,
            Ok(None) => return Err(TransferError::Closed),
            Err(_) => return Err(TransferError::ChannelTimeout(open_timeout)),
        };
        let SignalPayload::Ice { candidate } = payload else {
            continue;
        };
        let Ok(addr) = candidate.parse::<SocketAddr>() else {
            crate::logging::warn(format!("ignoring candidate '{candidate}'"));
            continue;
        };
        match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let (channel, receiver) = DirectChannel::from_stream(peer_id, stream);
                channel.send_message(&ChannelMessage::Handshake {
                    session: token.clone(),
                    from: self_id.to_string(),
                })?;
                crate::logging::debug(format!("direct channel dialed peer={peer_id} addr={addr}"));
                return Ok((channel, receiver));
            }
            Ok(Err(err)) => crate::logging::warn(format!("dial {addr} failed: {err}")),
            Err(_) => crate::logging::warn(format!("dial {addr} timed out")),
        }
    }
}
