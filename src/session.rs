//! One file moving in one direction: the state machine, the sender's chunk
//! loop and the receiver's reassembly into a [`Sink`].

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::crypto::CryptoContext;
use crate::errors::{TransferError, TransferResult};
use crate::frame::ChunkFrame;
use crate::pacer::{AdaptivePacer, TransportKind};
use crate::sink::Sink;
use crate::transport::Transport;
use crate::wsproto::{FileMeta, PeerInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Receive => "receive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Offered,
    Declined,
    Accepted,
    Negotiating,
    Streaming,
    Complete,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Offered => "offered",
            SessionState::Declined => "declined",
            SessionState::Accepted => "accepted",
            SessionState::Negotiating => "negotiating",
            SessionState::Streaming => "streaming",
            SessionState::Complete => "complete",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Declined | SessionState::Complete | SessionState::Failed
        )
    }

    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Offered)
                | (Offered, Declined)
                | (Offered, Accepted)
                | (Accepted, Negotiating)
                | (Negotiating, Streaming)
                | (Negotiating, Failed)
                | (Streaming, Complete)
                | (Streaming, Failed)
        )
    }
}

#[derive(Debug, Clone)]
pub struct TransferSession {
    direction: Direction,
    peer_id: String,
    file_meta: FileMeta,
    sequence: u32,
    bytes_transferred: u64,
    transport_mode: Option<TransportKind>,
    crypto_enabled: bool,
    state: SessionState,
}

impl TransferSession {
    /// A file about to be offered to `peer_id`.
    pub fn outgoing(peer_id: &str, file_meta: FileMeta, crypto_enabled: bool) -> Self {
        Self {
            direction: Direction::Send,
            peer_id: peer_id.to_string(),
            file_meta,
            sequence: 0,
            bytes_transferred: 0,
            transport_mode: None,
            crypto_enabled,
            state: SessionState::Idle,
        }
    }

    /// A file whose metadata just arrived; consent and negotiation already
    /// happened, so it starts out streaming.
    pub fn incoming(
        peer_id: &str,
        file_meta: FileMeta,
        mode: TransportKind,
        crypto_enabled: bool,
    ) -> Self {
        Self {
            direction: Direction::Receive,
            peer_id: peer_id.to_string(),
            file_meta,
            sequence: 0,
            bytes_transferred: 0,
            transport_mode: Some(mode),
            crypto_enabled,
            state: SessionState::Streaming,
        }
    }

    pub fn advance(&mut self, next: SessionState) -> TransferResult<()> {
        if !self.state.can_advance_to(next) {
            return Err(TransferError::Protocol(format!(
                "session for {} cannot go from {} to {}",
                self.file_meta.name,
                self.state.as_str(),
                next.as_str()
            )));
        }
        crate::logging::debug(format!(
            "session {} {} peer={} {} -> {}",
            self.direction.as_str(),
            self.file_meta.name,
            self.peer_id,
            self.state.as_str(),
            next.as_str()
        ));
        self.state = next;
        Ok(())
    }

    pub fn set_transport(&mut self, mode: TransportKind) {
        self.transport_mode = Some(mode);
    }

    fn record_chunk(&mut self, len: usize) {
        self.sequence = self.sequence.wrapping_add(1);
        self.bytes_transferred += len as u64;
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn file_meta(&self) -> &FileMeta {
        &self.file_meta
    }

    /// Next sequence number to send or expect; equals the chunk count so far.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn transport_mode(&self) -> Option<TransportKind> {
        self.transport_mode
    }

    pub fn crypto_enabled(&self) -> bool {
        self.crypto_enabled
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn progress(&self) -> Progress {
        Progress {
            direction: self.direction,
            peer_id: self.peer_id.clone(),
            file_name: self.file_meta.name.clone(),
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.file_meta.size,
            transport: self.transport_mode,
        }
    }

    pub fn summary(&self) -> TransferSummary {
        TransferSummary {
            direction: self.direction,
            peer_id: self.peer_id.clone(),
            file_meta: self.file_meta.clone(),
            bytes_transferred: self.bytes_transferred,
            chunks: self.sequence,
            transport: self.transport_mode,
            encrypted: self.crypto_enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub direction: Direction,
    pub peer_id: String,
    pub file_name: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub transport: Option<TransportKind>,
}

impl Progress {
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        ((self.bytes_transferred.min(self.total_bytes) * 100) / self.total_bytes) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub direction: Direction,
    pub peer_id: String,
    pub file_meta: FileMeta,
    pub bytes_transferred: u64,
    pub chunks: u32,
    pub transport: Option<TransportKind>,
    pub encrypted: bool,
}

/// Consent request shown to the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingOffer {
    pub from: String,
    pub sender_name: String,
    pub files: Vec<FileMeta>,
}

impl IncomingOffer {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Callbacks into whatever presents transfers to a user.
///
/// Every method has a default, so implementors pick what they care about.
/// Offers are declined unless `decide_offer` says otherwise.
pub trait TransferObserver: Send + Sync {
    fn on_peers(&self, _peers: &[PeerInfo]) {}

    fn on_state(&self, _session: &TransferSession) {}

    fn on_progress(&self, _progress: &Progress) {}

    fn on_complete(&self, _summary: &TransferSummary) {}

    fn on_failed(&self, _session: &TransferSession, _err: &TransferError) {}

    fn decide_offer<'a>(&'a self, _offer: &'a IncomingOffer) -> BoxFuture<'a, bool> {
        async { false }.boxed()
    }
}

/// Observer that ignores everything and declines every offer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TransferObserver for NoopObserver {}

/// Fill `buf` from `source` up to its capacity limit `want`. Returns fewer
/// bytes only at end of input.
async fn read_chunk<R>(source: &mut R, want: usize) -> TransferResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; want];
    let mut filled = 0;
    while filled < want {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Stream one file over an already open transport.
///
/// The session must be `Negotiating`. On success it ends `Complete` with
/// `bytes_transferred == file_meta.size`; on any error it ends `Failed` and
/// the observer hears about it.
pub async fn stream_file<R>(
    session: &mut TransferSession,
    source: R,
    transport: &Transport,
    crypto: &CryptoContext,
    observer: &dyn TransferObserver,
) -> TransferResult<TransferSummary>
where
    R: AsyncRead + Unpin,
{
    session.set_transport(transport.kind());
    session.advance(SessionState::Streaming)?;
    observer.on_state(session);

    match stream_chunks(session, source, transport, crypto, observer).await {
        Ok(()) => {
            session.advance(SessionState::Complete)?;
            observer.on_state(session);
            let summary = session.summary();
            crate::logging::info_kv(
                "file sent",
                &[
                    ("peer", session.peer_id()),
                    ("file", &summary.file_meta.name),
                    ("bytes", &summary.bytes_transferred.to_string()),
                    ("chunks", &summary.chunks.to_string()),
                    ("transport", transport.kind().as_str()),
                ],
            );
            observer.on_complete(&summary);
            Ok(summary)
        }
        Err(err) => {
            session.advance(SessionState::Failed)?;
            crate::logging::error_kv(
                "send failed",
                &[
                    ("peer", session.peer_id()),
                    ("file", &session.file_meta().name),
                    ("error", &err.to_string()),
                ],
            );
            observer.on_state(session);
            observer.on_failed(session, &err);
            Err(err)
        }
    }
}

async fn stream_chunks<R>(
    session: &mut TransferSession,
    mut source: R,
    transport: &Transport,
    crypto: &CryptoContext,
    observer: &dyn TransferObserver,
) -> TransferResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut pacer = AdaptivePacer::new(transport.kind());
    transport.begin_file(session.file_meta())?;

    let total = session.file_meta().size;
    while session.bytes_transferred() < total {
        if transport.is_closed() {
            return Err(TransferError::Closed);
        }
        let remaining = total - session.bytes_transferred();
        let size = pacer
            .next_chunk_size(transport.buffered_bytes())
            .min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let plain = read_chunk(&mut source, size).await?;
        if plain.is_empty() {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "{} ended after {} of {total} bytes",
                    session.file_meta().name,
                    session.bytes_transferred()
                ),
            )));
        }
        let len = plain.len();
        let sealed = crypto.encrypt_chunk(plain)?;
        transport.ready_for_send().await?;
        transport.send_chunk(session.sequence(), &sealed)?;
        session.record_chunk(len);
        observer.on_progress(&session.progress());
    }
    if total == 0 {
        observer.on_progress(&session.progress());
    }

    transport.end_file()
}

/// Receiving half of a session: decrypts frames in order into a sink.
pub struct ReceiveSession {
    session: TransferSession,
    crypto: CryptoContext,
    sink: Box<dyn Sink>,
}

impl ReceiveSession {
    pub fn start(
        peer_id: &str,
        meta: FileMeta,
        mode: TransportKind,
        crypto: CryptoContext,
        sink: Box<dyn Sink>,
    ) -> Self {
        let session = TransferSession::incoming(peer_id, meta, mode, crypto.is_enabled());
        crate::logging::info_kv(
            "receive started",
            &[
                ("peer", peer_id),
                ("file", &session.file_meta().name),
                ("size", &session.file_meta().size.to_string()),
                ("transport", mode.as_str()),
            ],
        );
        Self {
            session,
            crypto,
            sink,
        }
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    /// Decrypt one frame and hand it to the sink.
    pub async fn on_chunk(&mut self, frame: ChunkFrame) -> TransferResult<Progress> {
        let expected = self.session.sequence();
        if frame.seq != expected {
            return Err(TransferError::SequenceGap {
                expected,
                got: frame.seq,
            });
        }
        let plain = self.crypto.decrypt_chunk(frame.ciphertext, &frame.iv)?;
        let len = plain.len();
        self.sink.write(plain).await?;
        self.session.record_chunk(len);
        Ok(self.session.progress())
    }

    /// End of file observed: close the sink and report completion.
    pub async fn finish(&mut self) -> TransferResult<TransferSummary> {
        if let Err(err) = self.sink.close().await {
            return Err(self.fail(err.into()).await);
        }
        let got = self.session.bytes_transferred();
        let want = self.session.file_meta().size;
        if got != want {
            crate::logging::warn_kv(
                "received size differs from announced size",
                &[
                    ("peer", self.session.peer_id()),
                    ("file", &self.session.file_meta().name),
                    ("got", &got.to_string()),
                    ("want", &want.to_string()),
                ],
            );
        }
        self.session.advance(SessionState::Complete)?;
        crate::logging::info_kv(
            "file received",
            &[
                ("peer", self.session.peer_id()),
                ("file", &self.session.file_meta().name),
                ("bytes", &got.to_string()),
            ],
        );
        Ok(self.session.summary())
    }

    /// Abort: discard the sink and move to `Failed`. Returns the error for
    /// convenient propagation.
    pub async fn fail(&mut self, err: TransferError) -> TransferError {
        self.sink.abort().await;
        if self.session.state().can_advance_to(SessionState::Failed) {
            self.session.state = SessionState::Failed;
        }
        crate::logging::error_kv(
            "receive failed",
            &[
                ("peer", self.session.peer_id()),
                ("file", &self.session.file_meta().name),
                ("error", &err.to_string()),
            ],
        );
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode_relay;
    use crate::sink::{MemorySinkFactory, SinkFactory};
    use std::sync::Mutex;

    fn meta(size: u64) -> FileMeta {
        FileMeta {
            name: "data.bin".into(),
            size,
            mime_type: "application/octet-stream".into(),
        }
    }

    #[test]
    fn state_machine_allows_only_documented_edges() {
        let mut s = TransferSession::outgoing("p", meta(1), false);
        assert!(s.advance(SessionState::Streaming).is_err());
        s.advance(SessionState::Offered).unwrap();
        s.advance(SessionState::Accepted).unwrap();
        s.advance(SessionState::Negotiating).unwrap();
        s.advance(SessionState::Failed).unwrap();
        assert!(s.state().is_terminal());
        assert!(s.advance(SessionState::Streaming).is_err());

        let mut d = TransferSession::outgoing("p", meta(1), false);
        d.advance(SessionState::Offered).unwrap();
        d.advance(SessionState::Declined).unwrap();
        assert!(d.advance(SessionState::Accepted).is_err());
    }

    #[test]
    fn progress_percent_handles_empty_files() {
        let s = TransferSession::outgoing("p", meta(0), false);
        assert_eq!(s.progress().percent(), 100);
        let mut s = TransferSession::outgoing("p", meta(200), false);
        s.record_chunk(50);
        assert_eq!(s.progress().percent(), 25);
    }

    #[derive(Default)]
    struct Recorder {
        progress: Mutex<Vec<u64>>,
        completed: Mutex<Vec<TransferSummary>>,
    }

    impl TransferObserver for Recorder {
        fn on_progress(&self, progress: &Progress) {
            self.progress.lock().unwrap().push(progress.bytes_transferred);
        }
        fn on_complete(&self, summary: &TransferSummary) {
            self.completed.lock().unwrap().push(summary.clone());
        }
    }

    async fn loopback_relay_send(
        data: &[u8],
        crypto: &CryptoContext,
    ) -> (TransferSummary, Vec<Vec<u8>>, Vec<String>) {
        use crate::signaling::SignalingServer;

        let server = SignalingServer::start("127.0.0.1:0").await.unwrap();
        let (client, mut inbound) = crate::client::SignalingClient::connect(&server.ws_url())
            .await
            .unwrap();
        // Talk to ourselves: lock the relay to our own id.
        client
            .send_control(&crate::wsproto::SignalMessage::Hello {
                id: "self".into(),
                name: None,
                room: None,
            })
            .unwrap();
        let transport = Transport::Relay(crate::transport::RelayChannel::new(
            client.clone(),
            "self",
            "self",
        ));
        let mut session = TransferSession::outgoing("self", meta(data.len() as u64), crypto.is_enabled());
        session.advance(SessionState::Offered).unwrap();
        session.advance(SessionState::Accepted).unwrap();
        session.advance(SessionState::Negotiating).unwrap();

        // Wait for our own registration to show up before locking the relay.
        loop {
            match inbound.recv().await.unwrap() {
                crate::client::Inbound::Control(crate::wsproto::SignalMessage::Peers { .. }) => break,
                _ => continue,
            }
        }

        let recorder = Recorder::default();
        let summary = stream_file(&mut session, data, &transport, crypto, &recorder)
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Complete);
        assert_eq!(
            *recorder.progress.lock().unwrap().last().unwrap(),
            data.len() as u64
        );

        let mut frames = Vec::new();
        let mut controls = Vec::new();
        loop {
            match inbound.recv().await.unwrap() {
                crate::client::Inbound::RelayFrame(f) => frames.push(f.ciphertext),
                crate::client::Inbound::Control(msg) => {
                    let done = matches!(
                        msg,
                        crate::wsproto::SignalMessage::RelayChunk { done: true, .. }
                    );
                    controls.push(msg.kind().to_string());
                    if done {
                        break;
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        client.close();
        server.stop();
        (summary, frames, controls)
    }

    #[tokio::test]
    async fn clear_relay_stream_sends_meta_chunks_and_done() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (summary, frames, controls) =
            loopback_relay_send(&data, &CryptoContext::disabled()).await;
        assert_eq!(summary.bytes_transferred, 200_000);
        assert_eq!(summary.chunks as usize, frames.len());
        assert_eq!(frames.concat(), data);
        assert_eq!(controls, vec!["relay-chunk", "relay-chunk"]);
    }

    #[tokio::test]
    async fn empty_file_sends_only_markers() {
        let (summary, frames, controls) =
            loopback_relay_send(&[], &CryptoContext::disabled()).await;
        assert_eq!(summary.bytes_transferred, 0);
        assert_eq!(summary.chunks, 0);
        assert_eq!(summary.file_meta.size, 0);
        assert!(frames.is_empty());
        assert_eq!(controls.len(), 2);
    }

    #[tokio::test]
    async fn short_source_fails_the_session() {
        let server = crate::signaling::SignalingServer::start("127.0.0.1:0")
            .await
            .unwrap();
        let (client, _inbound) = crate::client::SignalingClient::connect(&server.ws_url())
            .await
            .unwrap();
        let transport = Transport::Relay(crate::transport::RelayChannel::new(client, "a", "b"));
        let mut session = TransferSession::outgoing("b", meta(10), false);
        session.advance(SessionState::Offered).unwrap();
        session.advance(SessionState::Accepted).unwrap();
        session.advance(SessionState::Negotiating).unwrap();
        let src: &[u8] = &[1, 2, 3];
        let err = stream_file(&mut session, src, &transport, &CryptoContext::disabled(), &NoopObserver)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
        assert_eq!(session.state(), SessionState::Failed);
        server.stop();
    }

    fn sealed_frames(crypto: &CryptoContext, parts: &[&[u8]]) -> Vec<ChunkFrame> {
        parts
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let sealed = crypto.encrypt_chunk(p.to_vec()).unwrap();
                let raw = crate::frame::encode_relay(i as u32, sealed.iv(), &sealed.ciphertext).unwrap();
                decode_relay(&raw).unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn receive_session_decrypts_in_order_into_sink() {
        let crypto = CryptoContext::from_passphrase("hunter2", None).unwrap();
        let peer_crypto = CryptoContext::from_passphrase("hunter2", crypto.salt()).unwrap();
        let factory = MemorySinkFactory::new();
        let m = meta(9);
        let sink = factory.open(&m).await.unwrap();
        let mut rx = ReceiveSession::start("p", m, TransportKind::Relay, peer_crypto, sink);

        for frame in sealed_frames(&crypto, &[&b"abc"[..], &b"def"[..], &b"ghi"[..]]) {
            rx.on_chunk(frame).await.unwrap();
        }
        let summary = rx.finish().await.unwrap();
        assert_eq!(summary.bytes_transferred, 9);
        assert_eq!(summary.chunks, 3);
        assert!(summary.encrypted);
        assert_eq!(factory.received()[0].bytes, b"abcdefghi");
    }

    #[tokio::test]
    async fn receive_session_rejects_gaps_and_bad_keys() {
        let crypto = CryptoContext::from_passphrase("hunter2", None).unwrap();
        let factory = MemorySinkFactory::new();

        let m = meta(6);
        let sink = factory.open(&m).await.unwrap();
        let peer_crypto = CryptoContext::from_passphrase("hunter2", crypto.salt()).unwrap();
        let mut rx = ReceiveSession::start("p", m.clone(), TransportKind::Direct, peer_crypto, sink);
        let mut frames = sealed_frames(&crypto, &[&b"abc"[..], &b"def"[..]]);
        let second = frames.pop().unwrap();
        let err = rx.on_chunk(second).await.unwrap_err();
        assert!(matches!(err, TransferError::SequenceGap { expected: 0, got: 1 }));
        rx.fail(err).await;
        assert_eq!(rx.session().state(), SessionState::Failed);

        let sink = factory.open(&m).await.unwrap();
        let wrong = CryptoContext::from_passphrase("hunter3", crypto.salt()).unwrap();
        let mut rx = ReceiveSession::start("p", m, TransportKind::Direct, wrong, sink);
        let err = rx.on_chunk(frames.remove(0)).await.unwrap_err();
        assert!(matches!(err, TransferError::Decryption(_)));
        assert!(factory.received().is_empty());
    }
}
