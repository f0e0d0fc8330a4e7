//! Client runtime: one signaling connection, the consent exchange, transport
//! negotiation with relay fallback, and dispatch of everything that arrives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::client::{Inbound, SignalingClient};
use crate::config::{validate_room, Config};
use crate::crypto::CryptoContext;
use crate::errors::{TransferError, TransferResult};
use crate::frame::{decode_direct, ChunkFrame};
use crate::pacer::TransportKind;
use crate::session::{
    stream_file, IncomingOffer, ReceiveSession, SessionState, TransferObserver, TransferSession,
    TransferSummary,
};
use crate::sink::SinkFactory;
use crate::transport::direct::{self, DEFAULT_OPEN_TIMEOUT};
use crate::transport::{DirectChannel, DirectReceiver, Envelope, RelayChannel, Transport};
use crate::wsproto::{
    decode_channel_text, ChannelMessage, FileMeta, PeerInfo, SignalMessage, SignalPayload,
    DEFAULT_NAME, DEFAULT_ROOM,
};

pub const DEFAULT_CONSENT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub server_url: String,
    pub peer_id: String,
    pub name: String,
    pub room: String,
    pub passphrase: Option<String>,
    pub direct_enabled: bool,
    pub direct_bind: String,
    pub direct_timeout: Duration,
    pub consent_timeout: Duration,
    pub auto_accept: bool,
}

impl AgentOptions {
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
            peer_id: Uuid::new_v4().to_string(),
            name: DEFAULT_NAME.to_string(),
            room: DEFAULT_ROOM.to_string(),
            passphrase: None,
            direct_enabled: true,
            direct_bind: "127.0.0.1:0".to_string(),
            direct_timeout: DEFAULT_OPEN_TIMEOUT,
            consent_timeout: DEFAULT_CONSENT_TIMEOUT,
            auto_accept: false,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self {
            server_url: cfg.server_url.clone(),
            peer_id: cfg.peer_id().to_string(),
            name: cfg.name.clone(),
            room: cfg.room.clone(),
            passphrase: cfg.passphrase.clone(),
            direct_enabled: cfg.direct_enabled,
            direct_bind: cfg.direct_bind.clone(),
            direct_timeout: cfg.direct_timeout(),
            consent_timeout: cfg.consent_timeout(),
            auto_accept: cfg.auto_accept,
        }
    }
}

enum RelayEvent {
    Frame(ChunkFrame),
    Done,
    Abort(TransferError),
}

struct RelayInbound {
    peer_id: String,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

/// Per-peer bookkeeping touched by the dispatch loop and the send path.
#[derive(Default)]
struct Pending {
    consent: HashMap<String, oneshot::Sender<bool>>,
    negotiations: HashMap<String, mpsc::UnboundedSender<SignalPayload>>,
    // files still expected from a peer whose offer we accepted
    accepted: HashMap<String, usize>,
    receive_keys: HashMap<String, (Option<Vec<u8>>, CryptoContext)>,
    relay_inbound: Option<RelayInbound>,
    send_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

struct Identity {
    name: String,
    room: String,
}

struct Shared {
    opts: AgentOptions,
    identity: Mutex<Identity>,
    client: SignalingClient,
    crypto: Mutex<CryptoContext>,
    passphrase: Mutex<Option<String>>,
    observer: Arc<dyn TransferObserver>,
    sinks: Arc<dyn SinkFactory>,
    peers: watch::Sender<Vec<PeerInfo>>,
    pending: Mutex<Pending>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn derive_key(pass: String, salt: Option<Vec<u8>>) -> TransferResult<CryptoContext> {
    tokio::task::spawn_blocking(move || CryptoContext::from_passphrase(&pass, salt.as_deref()))
        .await
        .map_err(|e| TransferError::Other(anyhow::anyhow!("key derivation task: {e}")))?
}

/// A connected peer.
#[derive(Clone)]
pub struct Agent {
    shared: Arc<Shared>,
}

impl Agent {
    pub async fn connect(
        opts: AgentOptions,
        observer: Arc<dyn TransferObserver>,
        sinks: Arc<dyn SinkFactory>,
    ) -> anyhow::Result<Agent> {
        validate_room(&opts.room)?;
        let crypto = match opts.passphrase.as_deref() {
            Some(pass) if !pass.is_empty() => derive_key(pass.to_string(), None).await?,
            _ => CryptoContext::disabled(),
        };
        let (client, inbound) = SignalingClient::connect(&opts.server_url).await?;
        let (peers, _) = watch::channel(Vec::new());
        let shared = Arc::new(Shared {
            identity: Mutex::new(Identity {
                name: opts.name.clone(),
                room: opts.room.clone(),
            }),
            passphrase: Mutex::new(opts.passphrase.clone().filter(|p| !p.is_empty())),
            opts,
            client,
            crypto: Mutex::new(crypto),
            observer,
            sinks,
            peers,
            pending: Mutex::new(Pending::default()),
        });
        tokio::spawn(dispatch_loop(shared.clone(), inbound));
        let agent = Agent { shared };
        agent.hello()?;
        Ok(agent)
    }

    pub fn id(&self) -> &str {
        &self.shared.opts.peer_id
    }

    pub fn room(&self) -> String {
        lock(&self.shared.identity).room.clone()
    }

    /// Announce (or re-announce) ourselves to the server.
    pub fn hello(&self) -> TransferResult<()> {
        let (name, room) = {
            let id = lock(&self.shared.identity);
            (id.name.clone(), id.room.clone())
        };
        self.shared.client.send_control(&SignalMessage::Hello {
            id: self.shared.opts.peer_id.clone(),
            name: Some(name),
            room: Some(room),
        })
    }

    pub fn set_room(&self, room: &str) -> anyhow::Result<()> {
        validate_room(room)?;
        lock(&self.shared.identity).room = room.to_string();
        self.hello()?;
        Ok(())
    }

    /// Replace the key used for outgoing files. An empty passphrase turns
    /// encryption off.
    pub async fn set_passphrase(&self, pass: &str) -> TransferResult<()> {
        let ctx = if pass.is_empty() {
            CryptoContext::disabled()
        } else {
            derive_key(pass.to_string(), None).await?
        };
        *lock(&self.shared.crypto) = ctx;
        *lock(&self.shared.passphrase) = Some(pass.to_string()).filter(|p| !p.is_empty());
        lock(&self.shared.pending).receive_keys.clear();
        crate::logging::info_kv(
            "passphrase updated",
            &[("encrypted", if pass.is_empty() { "false" } else { "true" })],
        );
        Ok(())
    }

    pub fn crypto_enabled(&self) -> bool {
        lock(&self.shared.crypto).is_enabled()
    }

    /// Other peers in our room, as last broadcast by the server.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared.peers.borrow().clone()
    }

    /// Wait until a peer whose id or display name is `who` shows up in our room.
    pub async fn wait_for_peer(&self, who: &str, within: Duration) -> TransferResult<PeerInfo> {
        let mut rx = self.shared.peers.subscribe();
        let wait = async {
            loop {
                let found = rx
                    .borrow_and_update()
                    .iter()
                    .find(|p| p.id == who || p.name == who)
                    .cloned();
                if let Some(p) = found {
                    return Ok(p);
                }
                if rx.changed().await.is_err() {
                    return Err(TransferError::Closed);
                }
            }
        };
        match timeout(within, wait).await {
            Ok(res) => res,
            Err(_) => Err(TransferError::UnregisteredPeer(who.to_string())),
        }
    }

    /// Resolves once the signaling connection is gone.
    pub async fn closed(&self) {
        self.shared.client.gauge().closed().await;
    }

    pub fn shutdown(&self) {
        self.shared.client.close();
    }

    /// Offer `paths` to `peer_id` and, once accepted, send them one after the
    /// other over a single transport.
    ///
    /// A refusal comes back as `Declined` or `ConsentTimeout`; in both cases
    /// nothing but the offer itself went out.
    pub async fn send_files(
        &self,
        peer_id: &str,
        paths: &[PathBuf],
    ) -> TransferResult<Vec<TransferSummary>> {
        if paths.is_empty() {
            return Err(TransferError::Protocol("nothing to send".into()));
        }
        let send_lock = lock(&self.shared.pending)
            .send_locks
            .entry(peer_id.to_string())
            .or_default()
            .clone();
        let res = {
            let _guard = send_lock.lock().await;
            self.send_batch(peer_id, paths).await
        };
        drop(send_lock);
        self.shared.release_send_lock(peer_id);
        res
    }

    async fn send_batch(
        &self,
        peer_id: &str,
        paths: &[PathBuf],
    ) -> TransferResult<Vec<TransferSummary>> {
        let shared = &self.shared;
        let files = describe_files(paths).await?;
        let crypto = lock(&shared.crypto).clone();
        let observer = shared.observer.as_ref();
        let mut sessions: Vec<TransferSession> = files
            .iter()
            .map(|(_, meta)| TransferSession::outgoing(peer_id, meta.clone(), crypto.is_enabled()))
            .collect();
        for s in sessions.iter_mut() {
            s.advance(SessionState::Offered)?;
            observer.on_state(s);
        }

        let refusal = match shared.request_consent(peer_id, &files, &crypto).await {
            Ok(true) => None,
            Ok(false) => Some(TransferError::Declined),
            Err(TransferError::ConsentTimeout) => Some(TransferError::ConsentTimeout),
            Err(err) => return Err(err),
        };
        if let Some(err) = refusal {
            crate::logging::info_kv(
                "transfer refused",
                &[("peer", peer_id), ("reason", &err.to_string())],
            );
            for s in sessions.iter_mut() {
                s.advance(SessionState::Declined)?;
                observer.on_state(s);
            }
            return Err(err);
        }

        for s in sessions.iter_mut() {
            s.advance(SessionState::Accepted)?;
            observer.on_state(s);
            s.advance(SessionState::Negotiating)?;
            observer.on_state(s);
        }

        let transport = shared.open_transport(peer_id, &crypto).await;
        let mut summaries = Vec::with_capacity(files.len());
        let mut failure: Option<TransferError> = None;
        for ((path, _), session) in files.iter().zip(sessions.iter_mut()) {
            if failure.is_some() {
                session.advance(SessionState::Failed)?;
                observer.on_state(session);
                continue;
            }
            let source = match tokio::fs::File::open(path).await {
                Ok(f) => f,
                Err(err) => {
                    let err = TransferError::Io(err);
                    session.advance(SessionState::Failed)?;
                    observer.on_state(session);
                    observer.on_failed(session, &err);
                    failure = Some(err);
                    continue;
                }
            };
            match stream_file(session, source, &transport, &crypto, observer).await {
                Ok(summary) => summaries.push(summary),
                Err(err) => failure = Some(err),
            }
        }
        transport.finish().await;

        match failure {
            Some(err) => Err(err),
            None => Ok(summaries),
        }
    }
}

impl Shared {
    fn self_id(&self) -> &str {
        &self.opts.peer_id
    }

    /// Forget the per-peer send lock once no send holds or waits on it.
    fn release_send_lock(&self, peer_id: &str) {
        let mut pending = lock(&self.pending);
        if pending
            .send_locks
            .get(peer_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            pending.send_locks.remove(peer_id);
        }
    }

    fn local_salt(&self) -> Option<Vec<u8>> {
        lock(&self.crypto).salt().map(<[u8]>::to_vec)
    }

    async fn request_consent(
        &self,
        peer_id: &str,
        files: &[(PathBuf, FileMeta)],
        crypto: &CryptoContext,
    ) -> TransferResult<bool> {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).consent.insert(peer_id.to_string(), tx);
        let name = lock(&self.identity).name.clone();
        let offer = SignalMessage::TransferOffer {
            to: peer_id.to_string(),
            from: self.self_id().to_string(),
            files: files.iter().map(|(_, m)| m.clone()).collect(),
            sender_name: Some(name),
            salt: crypto.salt().map(<[u8]>::to_vec),
        };
        if let Err(err) = self.client.send_control(&offer) {
            lock(&self.pending).consent.remove(peer_id);
            return Err(err);
        }
        crate::logging::info_kv(
            "transfer offered",
            &[("peer", peer_id), ("files", &files.len().to_string())],
        );
        match timeout(self.opts.consent_timeout, rx).await {
            Ok(Ok(accepted)) => Ok(accepted),
            Ok(Err(_)) => Err(TransferError::Closed),
            Err(_) => {
                lock(&self.pending).consent.remove(peer_id);
                Err(TransferError::ConsentTimeout)
            }
        }
    }

    /// Try the direct channel first; anything going wrong while negotiating
    /// falls back to the relay, once.
    async fn open_transport(&self, peer_id: &str, crypto: &CryptoContext) -> Transport {
        if self.opts.direct_enabled {
            let (tx, rx) = mpsc::unbounded_channel();
            lock(&self.pending)
                .negotiations
                .insert(peer_id.to_string(), tx);
            let res = direct::offer(
                &self.client,
                self.self_id(),
                peer_id,
                &self.opts.direct_bind,
                crypto.salt().map(<[u8]>::to_vec),
                self.opts.direct_timeout,
                rx,
            )
            .await;
            lock(&self.pending).negotiations.remove(peer_id);
            match res {
                Ok((channel, receiver)) => {
                    crate::logging::info_kv("direct channel open", &[("peer", peer_id)]);
                    tokio::spawn(receiver.drain());
                    return Transport::Direct(channel);
                }
                Err(err) => crate::logging::warn_kv(
                    "direct channel unavailable, using relay",
                    &[("peer", peer_id), ("error", &err.to_string())],
                ),
            }
        }
        Transport::Relay(RelayChannel::new(
            self.client.clone(),
            self.self_id(),
            peer_id,
        ))
    }

    fn handle_control(self: &Arc<Self>, msg: SignalMessage) {
        match msg {
            SignalMessage::Peers { peers } => {
                let others: Vec<PeerInfo> = peers
                    .into_iter()
                    .filter(|p| p.id != self.opts.peer_id)
                    .collect();
                self.observer.on_peers(&others);
                self.peers.send_replace(others);
            }
            SignalMessage::TransferOffer {
                from,
                files,
                sender_name,
                salt,
                ..
            } => {
                let shared = self.clone();
                let offer = IncomingOffer {
                    from,
                    sender_name: sender_name.unwrap_or_else(|| DEFAULT_NAME.to_string()),
                    files,
                };
                tokio::spawn(async move { shared.answer_offer(offer, salt).await });
            }
            SignalMessage::TransferResponse { from, accepted, .. } => {
                match lock(&self.pending).consent.remove(&from) {
                    Some(tx) => {
                        let _ = tx.send(accepted);
                    }
                    None => crate::logging::debug(format!("unsolicited transfer-response from={from}")),
                }
            }
            SignalMessage::Signal { from, payload, .. } => self.on_signal(from, payload),
            SignalMessage::RelayChunk {
                from,
                file_meta: Some(meta),
                ..
            } => self.begin_relay_receive(from, meta),
            SignalMessage::RelayChunk {
                from, done: true, ..
            } => {
                let current = {
                    let mut pending = lock(&self.pending);
                    match &pending.relay_inbound {
                        Some(r) if r.peer_id == from => pending.relay_inbound.take(),
                        _ => None,
                    }
                };
                match current {
                    Some(r) => {
                        let _ = r.tx.send(RelayEvent::Done);
                    }
                    None => crate::logging::debug(format!("relay done without session from={from}")),
                }
            }
            SignalMessage::RelayChunk { from, .. } => {
                crate::logging::debug(format!("empty relay-chunk from={from}"));
            }
            SignalMessage::Hello { id, .. } => {
                crate::logging::debug(format!("ignoring hello for id={id}"));
            }
        }
    }

    async fn answer_offer(self: Arc<Self>, offer: IncomingOffer, salt: Option<Vec<u8>>) {
        crate::logging::info_kv(
            "transfer offer received",
            &[
                ("peer", &offer.from),
                ("name", &offer.sender_name),
                ("files", &offer.files.len().to_string()),
                ("bytes", &offer.total_bytes().to_string()),
            ],
        );
        let mut accepted = self.opts.auto_accept || self.observer.decide_offer(&offer).await;
        if accepted {
            if let Err(err) = self.prepare_receive_key(&offer.from, salt).await {
                crate::logging::error_kv(
                    "cannot derive key for offer",
                    &[("peer", &offer.from), ("error", &err.to_string())],
                );
                accepted = false;
            }
        }
        if accepted {
            let mut pending = lock(&self.pending);
            if offer.files.is_empty() {
                pending.receive_keys.remove(&offer.from);
            } else {
                pending.accepted.insert(offer.from.clone(), offer.files.len());
            }
        }
        let reply = SignalMessage::TransferResponse {
            to: offer.from.clone(),
            from: self.self_id().to_string(),
            accepted,
        };
        if let Err(err) = self.client.send_control(&reply) {
            crate::logging::warn(format!("transfer-response to {} failed: {err}", offer.from));
        }
    }

    /// Derive the key for files coming from `peer_id`. Without a local
    /// passphrase, or without a salt from the peer, chunks are expected clear.
    async fn prepare_receive_key(&self, peer_id: &str, salt: Option<Vec<u8>>) -> TransferResult<()> {
        let pass = lock(&self.passphrase).clone();
        let ctx = match (pass, salt.as_ref()) {
            (Some(pass), Some(s)) => {
                let cached = lock(&self.pending)
                    .receive_keys
                    .get(peer_id)
                    .filter(|(known, _)| known.as_ref() == Some(s))
                    .map(|(_, ctx)| ctx.clone());
                match cached {
                    Some(ctx) => ctx,
                    None => derive_key(pass, Some(s.clone())).await?,
                }
            }
            (None, Some(_)) => {
                crate::logging::warn_kv(
                    "peer encrypts but no passphrase is set",
                    &[("peer", peer_id)],
                );
                CryptoContext::disabled()
            }
            (_, None) => CryptoContext::disabled(),
        };
        lock(&self.pending)
            .receive_keys
            .insert(peer_id.to_string(), (salt, ctx));
        Ok(())
    }

    fn is_accepted(&self, peer_id: &str) -> bool {
        lock(&self.pending)
            .accepted
            .get(peer_id)
            .is_some_and(|n| *n > 0)
    }

    /// Consume one accepted file slot for `peer_id` and hand out the key
    /// for that file. The key is forgotten with the last slot.
    fn take_accepted(&self, peer_id: &str) -> Option<CryptoContext> {
        let mut pending = lock(&self.pending);
        let left = pending.accepted.get_mut(peer_id)?;
        if *left == 0 {
            pending.accepted.remove(peer_id);
            pending.receive_keys.remove(peer_id);
            return None;
        }
        *left -= 1;
        let last = *left == 0;
        let crypto = if last {
            pending.accepted.remove(peer_id);
            pending.receive_keys.remove(peer_id).map(|(_, ctx)| ctx)
        } else {
            pending.receive_keys.get(peer_id).map(|(_, ctx)| ctx.clone())
        };
        Some(crypto.unwrap_or_default())
    }

    fn on_signal(self: &Arc<Self>, from: String, payload: serde_json::Value) {
        let payload = match SignalPayload::from_value(payload) {
            Ok(p) => p,
            Err(err) => {
                crate::logging::debug(format!("unsupported signal from={from}: {err}"));
                return;
            }
        };
        match payload {
            SignalPayload::Offer { sdp, salt } => self.answer_direct(from, sdp, salt),
            other => match lock(&self.pending).negotiations.get(&from) {
                Some(tx) => {
                    let _ = tx.send(other);
                }
                None => crate::logging::debug(format!("no negotiation for signal from={from}")),
            },
        }
    }

    fn answer_direct(self: &Arc<Self>, from: String, sdp: String, salt: Option<Vec<u8>>) {
        if !self.opts.direct_enabled {
            crate::logging::debug(format!("direct disabled, ignoring offer from={from}"));
            return;
        }
        if !self.is_accepted(&from) {
            crate::logging::warn_kv("direct offer without consent", &[("peer", &from)]);
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.pending).negotiations.insert(from.clone(), tx);
        let shared = self.clone();
        tokio::spawn(async move {
            if salt.is_some() {
                if let Err(err) = shared.prepare_receive_key(&from, salt).await {
                    crate::logging::warn(format!("key derivation for {from} failed: {err}"));
                }
            }
            let res = direct::answer(
                &shared.client,
                shared.self_id(),
                &from,
                &sdp,
                shared.local_salt(),
                shared.opts.direct_timeout,
                rx,
            )
            .await;
            lock(&shared.pending).negotiations.remove(&from);
            match res {
                Ok((channel, receiver)) => shared.receive_direct(from, channel, receiver).await,
                Err(err) => crate::logging::warn_kv(
                    "direct answer failed",
                    &[("peer", &from), ("error", &err.to_string())],
                ),
            }
        });
    }

    fn begin_relay_receive(self: &Arc<Self>, from: String, meta: FileMeta) {
        let Some(crypto) = self.take_accepted(&from) else {
            crate::logging::warn_kv(
                "relay file without consent",
                &[("peer", &from), ("file", &meta.name)],
            );
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = lock(&self.pending).relay_inbound.replace(RelayInbound {
            peer_id: from.clone(),
            tx,
        });
        if let Some(prev) = previous {
            let _ = prev.tx.send(RelayEvent::Abort(TransferError::Protocol(
                "relay session superseded".into(),
            )));
        }
        let shared = self.clone();
        tokio::spawn(async move { shared.receive_relay(from, meta, crypto, rx).await });
    }

    fn relay_frame(&self, frame: ChunkFrame) {
        let pending = lock(&self.pending);
        match &pending.relay_inbound {
            Some(r) => {
                let _ = r.tx.send(RelayEvent::Frame(frame));
            }
            None => crate::logging::debug(format!("relay frame seq={} without session", frame.seq)),
        }
    }

    fn relay_abort(&self, err: TransferError) {
        match lock(&self.pending).relay_inbound.take() {
            Some(r) => {
                let _ = r.tx.send(RelayEvent::Abort(err));
            }
            None => crate::logging::warn(format!("dropping bad relay frame: {err}")),
        }
    }

    async fn open_receive(
        &self,
        from: &str,
        meta: FileMeta,
        mode: TransportKind,
        crypto: CryptoContext,
    ) -> Option<ReceiveSession> {
        match self.sinks.open(&meta).await {
            Ok(sink) => {
                let session = ReceiveSession::start(from, meta, mode, crypto, sink);
                self.observer.on_state(session.session());
                Some(session)
            }
            Err(err) => {
                crate::logging::error_kv(
                    "cannot open sink",
                    &[("peer", from), ("file", &meta.name), ("error", &format!("{err:#}"))],
                );
                None
            }
        }
    }

    async fn complete_receive(&self, mut session: ReceiveSession) {
        match session.finish().await {
            Ok(summary) => {
                self.observer.on_state(session.session());
                self.observer.on_complete(&summary);
            }
            Err(err) => {
                self.observer.on_state(session.session());
                self.observer.on_failed(session.session(), &err);
            }
        }
    }

    async fn fail_receive(&self, session: &mut ReceiveSession, err: TransferError) {
        let err = session.fail(err).await;
        self.observer.on_state(session.session());
        self.observer.on_failed(session.session(), &err);
    }

    async fn receive_relay(
        self: Arc<Self>,
        from: String,
        meta: FileMeta,
        crypto: CryptoContext,
        mut events: mpsc::UnboundedReceiver<RelayEvent>,
    ) {
        let Some(mut session) = self.open_receive(&from, meta, TransportKind::Relay, crypto).await
        else {
            return;
        };
        while let Some(event) = events.recv().await {
            match event {
                RelayEvent::Frame(frame) => match session.on_chunk(frame).await {
                    Ok(progress) => self.observer.on_progress(&progress),
                    Err(err) => {
                        self.fail_receive(&mut session, err).await;
                        return;
                    }
                },
                RelayEvent::Done => {
                    self.complete_receive(session).await;
                    return;
                }
                RelayEvent::Abort(err) => {
                    self.fail_receive(&mut session, err).await;
                    return;
                }
            }
        }
        self.fail_receive(&mut session, TransferError::Closed).await;
    }

    async fn receive_direct(&self, from: String, channel: DirectChannel, mut receiver: DirectReceiver) {
        crate::logging::info_kv("direct channel accepted", &[("peer", &from)]);
        let mut current: Option<ReceiveSession> = None;
        loop {
            let env = match receiver.recv().await {
                Ok(Some(env)) => env,
                Ok(None) => break,
                Err(err) => {
                    match current.take() {
                        Some(mut s) => self.fail_receive(&mut s, err).await,
                        None => crate::logging::warn_kv(
                            "direct channel error",
                            &[("peer", &from), ("error", &err.to_string())],
                        ),
                    }
                    channel.abort();
                    return;
                }
            };
            match env {
                Envelope::Text(text) => match decode_channel_text(&text) {
                    Ok(ChannelMessage::FileMeta { meta }) => {
                        if let Some(mut s) = current.take() {
                            let err = TransferError::Protocol("file-meta before eof".into());
                            self.fail_receive(&mut s, err).await;
                        }
                        let Some(crypto) = self.take_accepted(&from) else {
                            crate::logging::warn_kv(
                                "direct file without consent",
                                &[("peer", &from), ("file", &meta.name)],
                            );
                            channel.abort();
                            return;
                        };
                        current = self
                            .open_receive(&from, meta, TransportKind::Direct, crypto)
                            .await;
                        if current.is_none() {
                            channel.abort();
                            return;
                        }
                    }
                    Ok(ChannelMessage::Eof) => match current.take() {
                        Some(s) => self.complete_receive(s).await,
                        None => crate::logging::warn_kv("eof without file", &[("peer", &from)]),
                    },
                    Ok(ChannelMessage::Handshake { .. }) => {
                        crate::logging::debug(format!("late handshake from={from}"));
                    }
                    Err(err) => crate::logging::warn(format!("bad channel message from {from}: {err}")),
                },
                Envelope::Binary(raw) => {
                    let Some(session) = current.as_mut() else {
                        crate::logging::warn_kv("chunk without file-meta", &[("peer", &from)]);
                        continue;
                    };
                    let res = match decode_direct(&raw) {
                        Ok(frame) => session.on_chunk(frame).await,
                        Err(err) => Err(err),
                    };
                    match res {
                        Ok(progress) => self.observer.on_progress(&progress),
                        Err(err) => {
                            self.fail_receive(session, err).await;
                            channel.abort();
                            return;
                        }
                    }
                }
            }
        }
        if let Some(mut s) = current.take() {
            self.fail_receive(&mut s, TransferError::Closed).await;
        }
        channel.close();
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(item) = inbound.recv().await {
        match item {
            Inbound::Control(msg) => shared.handle_control(msg),
            Inbound::RelayFrame(frame) => shared.relay_frame(frame),
            Inbound::BadFrame(err) => shared.relay_abort(err),
            Inbound::Closed => break,
        }
    }
    let mut pending = lock(&shared.pending);
    pending.consent.clear();
    pending.negotiations.clear();
    pending.accepted.clear();
    pending.receive_keys.clear();
    if let Some(r) = pending.relay_inbound.take() {
        let _ = r.tx.send(RelayEvent::Abort(TransferError::Closed));
    }
    drop(pending);
    shared.peers.send_replace(Vec::new());
}

async fn describe_files(paths: &[PathBuf]) -> TransferResult<Vec<(PathBuf, FileMeta)>> {
    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        let md = tokio::fs::metadata(path).await?;
        if !md.is_file() {
            return Err(TransferError::Protocol(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        out.push((
            path.clone(),
            FileMeta {
                name,
                size: md.len(),
                mime_type: guess_mime(path).to_string(),
            },
        ));
    }
    Ok(out)
}

/// Expand directories into the regular files below them, sorted by path.
pub fn expand_paths(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut files = Vec::new();
            for entry in WalkDir::new(path).follow_links(false) {
                let entry = entry?;
                if entry.file_type().is_file() {
                    files.push(entry.into_path());
                }
            }
            files.sort();
            out.extend(files);
        } else {
            out.push(path.clone());
        }
    }
    Ok(out)
}

pub fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "json" => "application/json",
        "js" => "text/javascript",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}
