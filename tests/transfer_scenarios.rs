use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use mayadrop_rs::agent::{Agent, AgentOptions};
use mayadrop_rs::errors::TransferError;
use mayadrop_rs::pacer::TransportKind;
use mayadrop_rs::session::{
    IncomingOffer, SessionState, TransferObserver, TransferSession, TransferSummary,
};
use mayadrop_rs::signaling::SignalingServer;
use mayadrop_rs::sink::{MemorySinkFactory, Sink, SinkFactory};
use mayadrop_rs::wsproto::FileMeta;
use tokio::sync::watch;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(20);

#[derive(Clone, Copy)]
enum Decision {
    Accept,
    Decline,
    Stall,
}

struct Recorder {
    decision: Decision,
    offers: Mutex<Vec<IncomingOffer>>,
    states: Mutex<Vec<SessionState>>,
    done: watch::Sender<Vec<TransferSummary>>,
    failed: watch::Sender<Vec<String>>,
}

impl Recorder {
    fn new(decision: Decision) -> Arc<Self> {
        Arc::new(Self {
            decision,
            offers: Mutex::new(Vec::new()),
            states: Mutex::new(Vec::new()),
            done: watch::channel(Vec::new()).0,
            failed: watch::channel(Vec::new()).0,
        })
    }

    async fn wait_done(&self, n: usize) -> Vec<TransferSummary> {
        wait_len(&self.done, n).await
    }

    async fn wait_failed(&self, n: usize) -> Vec<String> {
        wait_len(&self.failed, n).await
    }
}

async fn wait_len<T: Clone>(tx: &watch::Sender<Vec<T>>, n: usize) -> Vec<T> {
    let mut rx = tx.subscribe();
    tokio::time::timeout(WAIT, async {
        loop {
            let current = rx.borrow_and_update().clone();
            if current.len() >= n {
                return current;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("timed out waiting for observer")
}

impl TransferObserver for Recorder {
    fn on_state(&self, session: &TransferSession) {
        self.states.lock().unwrap().push(session.state());
    }

    fn on_complete(&self, summary: &TransferSummary) {
        let summary = summary.clone();
        self.done.send_modify(|v| v.push(summary));
    }

    fn on_failed(&self, _session: &TransferSession, err: &TransferError) {
        let msg = err.to_string();
        self.failed.send_modify(|v| v.push(msg));
    }

    fn decide_offer<'a>(&'a self, offer: &'a IncomingOffer) -> BoxFuture<'a, bool> {
        self.offers.lock().unwrap().push(offer.clone());
        let decision = self.decision;
        async move {
            match decision {
                Decision::Accept => true,
                Decision::Decline => false,
                Decision::Stall => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    false
                }
            }
        }
        .boxed()
    }
}

/// Memory sinks plus a count of how many were ever opened.
#[derive(Clone, Default)]
struct CountingSinks {
    inner: MemorySinkFactory,
    opened: Arc<AtomicUsize>,
}

impl SinkFactory for CountingSinks {
    fn open<'a>(&'a self, meta: &'a FileMeta) -> BoxFuture<'a, anyhow::Result<Box<dyn Sink>>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.inner.open(meta)
    }
}

/// Sinks whose writes fail, as on a full disk.
#[derive(Clone, Default)]
struct FullDisk {
    opened: Arc<AtomicUsize>,
}

struct FullDiskSink;

impl Sink for FullDiskSink {
    fn write(&mut self, _bytes: Vec<u8>) -> BoxFuture<'_, anyhow::Result<()>> {
        async { Err(anyhow::anyhow!("no space left on device")) }.boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        async { Ok(()) }.boxed()
    }
}

impl SinkFactory for FullDisk {
    fn open<'a>(&'a self, _meta: &'a FileMeta) -> BoxFuture<'a, anyhow::Result<Box<dyn Sink>>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        async { Ok(Box::new(FullDiskSink) as Box<dyn Sink>) }.boxed()
    }
}

fn scratch_file(name: &str, data: &[u8]) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mayadrop-it-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn opts(url: &str, name: &str) -> AgentOptions {
    let mut o = AgentOptions::new(url);
    o.name = name.to_string();
    o
}

async fn connect(o: AgentOptions, observer: Arc<Recorder>, sinks: CountingSinks) -> Agent {
    Agent::connect(o, observer, Arc::new(sinks)).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn encrypted_transfer_falls_back_to_relay() {
    let server = SignalingServer::start("127.0.0.1:0").await.unwrap();
    let url = server.ws_url();

    let bob_obs = Recorder::new(Decision::Accept);
    let bob_sinks = CountingSinks::default();
    let mut bob_opts = opts(&url, "bob");
    bob_opts.passphrase = Some("hunter2".into());
    bob_opts.direct_enabled = false;
    let bob = connect(bob_opts, bob_obs.clone(), bob_sinks.clone()).await;

    let alice_obs = Recorder::new(Decision::Decline);
    let mut alice_opts = opts(&url, "alice");
    alice_opts.passphrase = Some("hunter2".into());
    alice_opts.direct_timeout = Duration::from_millis(500);
    let alice = connect(alice_opts, alice_obs.clone(), CountingSinks::default()).await;

    alice.wait_for_peer(bob.id(), WAIT).await.unwrap();
    let data = pattern(300_000);
    let path = scratch_file("secret.bin", &data);

    let sent = alice.send_files(bob.id(), &[path.clone()]).await.unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].bytes_transferred, 300_000);
    assert_eq!(sent[0].transport, Some(TransportKind::Relay));
    assert!(sent[0].encrypted);

    let received = bob_obs.wait_done(1).await;
    assert_eq!(received[0].bytes_transferred, 300_000);
    assert_eq!(received[0].transport, Some(TransportKind::Relay));
    assert!(received[0].encrypted);
    assert_eq!(received[0].chunks, sent[0].chunks);

    let files = bob_sinks.inner.received();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].meta.name, "secret.bin");
    assert_eq!(files[0].bytes, data);

    let offers = bob_obs.offers.lock().unwrap().clone();
    assert_eq!(offers[0].sender_name, "alice");
    assert_eq!(
        *alice_obs.states.lock().unwrap().last().unwrap(),
        SessionState::Complete
    );

    alice.shutdown();
    bob.shutdown();
    server.stop();
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn direct_channel_carries_several_files_in_order() {
    let server = SignalingServer::start("127.0.0.1:0").await.unwrap();
    let url = server.ws_url();

    let bob_obs = Recorder::new(Decision::Accept);
    let bob_sinks = CountingSinks::default();
    let bob = connect(opts(&url, "bob"), bob_obs.clone(), bob_sinks.clone()).await;
    let alice_obs = Recorder::new(Decision::Decline);
    let alice = connect(opts(&url, "alice"), alice_obs, CountingSinks::default()).await;

    alice.wait_for_peer("bob", WAIT).await.unwrap();
    let first = pattern(700_000);
    let second = b"second file".to_vec();
    let p1 = scratch_file("one.bin", &first);
    let p2 = scratch_file("two.txt", &second);

    let sent = alice
        .send_files(bob.id(), &[p1.clone(), p2.clone()])
        .await
        .unwrap();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|s| s.transport == Some(TransportKind::Direct)));
    assert!(sent.iter().all(|s| !s.encrypted));

    let received = bob_obs.wait_done(2).await;
    assert_eq!(received[0].file_meta.name, "one.bin");
    assert_eq!(received[1].file_meta.name, "two.txt");
    assert_eq!(received[1].file_meta.mime_type, "text/plain");

    let files = bob_sinks.inner.received();
    assert_eq!(files[0].bytes, first);
    assert_eq!(files[1].bytes, second);

    alice.shutdown();
    bob.shutdown();
    server.stop();
    let _ = std::fs::remove_dir_all(p1.parent().unwrap());
    let _ = std::fs::remove_dir_all(p2.parent().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn declined_offer_sends_nothing() {
    let server = SignalingServer::start("127.0.0.1:0").await.unwrap();
    let url = server.ws_url();

    let bob_obs = Recorder::new(Decision::Decline);
    let bob_sinks = CountingSinks::default();
    let bob = connect(opts(&url, "bob"), bob_obs.clone(), bob_sinks.clone()).await;
    let alice_obs = Recorder::new(Decision::Decline);
    let alice = connect(opts(&url, "alice"), alice_obs.clone(), CountingSinks::default()).await;

    alice.wait_for_peer(bob.id(), WAIT).await.unwrap();
    let path = scratch_file("nope.bin", &pattern(1000));
    let err = alice.send_files(bob.id(), &[path.clone()]).await.unwrap_err();
    assert!(matches!(err, TransferError::Declined));
    assert!(err.is_refusal());

    // Give any stray frames time to arrive.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(bob_obs.offers.lock().unwrap().len(), 1);
    assert_eq!(bob_sinks.opened.load(Ordering::SeqCst), 0);
    assert!(bob_obs.done.borrow().is_empty());
    assert_eq!(
        alice_obs.states.lock().unwrap().clone(),
        vec![SessionState::Offered, SessionState::Declined]
    );

    alice.shutdown();
    bob.shutdown();
    server.stop();
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unanswered_offer_times_out_as_refusal() {
    let server = SignalingServer::start("127.0.0.1:0").await.unwrap();
    let url = server.ws_url();

    let bob_sinks = CountingSinks::default();
    let bob = connect(opts(&url, "bob"), Recorder::new(Decision::Stall), bob_sinks.clone()).await;
    let mut alice_opts = opts(&url, "alice");
    alice_opts.consent_timeout = Duration::from_millis(300);
    let alice = connect(alice_opts, Recorder::new(Decision::Decline), CountingSinks::default()).await;

    alice.wait_for_peer(bob.id(), WAIT).await.unwrap();
    let path = scratch_file("slow.bin", &pattern(10));
    let err = alice.send_files(bob.id(), &[path.clone()]).await.unwrap_err();
    assert!(matches!(err, TransferError::ConsentTimeout));
    assert_eq!(bob_sinks.opened.load(Ordering::SeqCst), 0);

    alice.shutdown();
    bob.shutdown();
    server.stop();
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_passphrase_fails_the_receiver() {
    let server = SignalingServer::start("127.0.0.1:0").await.unwrap();
    let url = server.ws_url();

    let bob_obs = Recorder::new(Decision::Accept);
    let bob_sinks = CountingSinks::default();
    let mut bob_opts = opts(&url, "bob");
    bob_opts.passphrase = Some("hunter3".into());
    bob_opts.direct_enabled = false;
    let bob = connect(bob_opts, bob_obs.clone(), bob_sinks.clone()).await;

    let mut alice_opts = opts(&url, "alice");
    alice_opts.passphrase = Some("hunter2".into());
    alice_opts.direct_enabled = false;
    let alice = connect(alice_opts, Recorder::new(Decision::Decline), CountingSinks::default()).await;

    alice.wait_for_peer(bob.id(), WAIT).await.unwrap();
    let path = scratch_file("x.bin", &pattern(50_000));
    alice.send_files(bob.id(), &[path.clone()]).await.unwrap();

    let failures = bob_obs.wait_failed(1).await;
    assert!(failures[0].contains("decrypt"), "{failures:?}");
    assert!(bob_sinks.inner.received().is_empty());

    alice.shutdown();
    bob.shutdown();
    server.stop();
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rooms_partition_peer_lists_but_not_addressed_delivery() {
    let server = SignalingServer::start("127.0.0.1:0").await.unwrap();
    let url = server.ws_url();

    let a = connect(opts(&url, "a"), Recorder::new(Decision::Decline), CountingSinks::default()).await;
    let c = connect(opts(&url, "c"), Recorder::new(Decision::Decline), CountingSinks::default()).await;
    let b_obs = Recorder::new(Decision::Decline);
    let mut b_opts = opts(&url, "b");
    b_opts.room = "team-x".into();
    let b = connect(b_opts, b_obs.clone(), CountingSinks::default()).await;

    a.wait_for_peer(c.id(), WAIT).await.unwrap();
    c.wait_for_peer(a.id(), WAIT).await.unwrap();
    assert!(matches!(
        b.wait_for_peer(a.id(), Duration::from_millis(300)).await,
        Err(TransferError::UnregisteredPeer(_))
    ));
    assert!(a.peers().iter().all(|p| p.id != b.id()));
    assert!(b.peers().is_empty());

    // Delivery is by id, so a can still reach b across rooms.
    let path = scratch_file("cross.bin", &pattern(10));
    let err = a.send_files(b.id(), &[path.clone()]).await.unwrap_err();
    assert!(matches!(err, TransferError::Declined));
    assert_eq!(b_obs.offers.lock().unwrap().len(), 1);

    // Moving rooms updates both sides.
    b.set_room("public").unwrap();
    a.wait_for_peer(b.id(), WAIT).await.unwrap();

    a.shutdown();
    b.shutdown();
    c.shutdown();
    server.stop();
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn receiver_hanging_up_mid_file_fails_the_sender() {
    let server = SignalingServer::start("127.0.0.1:0").await.unwrap();
    let url = server.ws_url();

    // Bob accepts, then aborts the direct channel on the first chunk.
    let bob_obs = Recorder::new(Decision::Accept);
    let bob_sinks = FullDisk::default();
    let bob = Agent::connect(opts(&url, "bob"), bob_obs.clone(), Arc::new(bob_sinks.clone()))
        .await
        .unwrap();
    let alice_obs = Recorder::new(Decision::Decline);
    let alice = connect(opts(&url, "alice"), alice_obs.clone(), CountingSinks::default()).await;

    alice.wait_for_peer(bob.id(), WAIT).await.unwrap();
    // Larger than the direct buffering ceiling plus socket buffers, so the
    // sender cannot finish before the hang-up reaches it.
    let path = scratch_file("big.bin", &vec![0x5a; 48 * 1024 * 1024]);
    let second = scratch_file("after.txt", b"never sent");

    let err = alice
        .send_files(bob.id(), &[path.clone(), second.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Closed), "{err:?}");
    assert!(!err.is_refusal());

    let sender_failures = alice_obs.wait_failed(1).await;
    assert_eq!(sender_failures.len(), 1);
    assert!(alice_obs.done.borrow().is_empty());
    let states = alice_obs.states.lock().unwrap().clone();
    assert!(states.contains(&SessionState::Streaming));
    assert!(!states.contains(&SessionState::Complete));
    assert_eq!(states.last(), Some(&SessionState::Failed));

    let receiver_failures = bob_obs.wait_failed(1).await;
    assert!(receiver_failures[0].contains("no space"), "{receiver_failures:?}");
    assert_eq!(bob_sinks.opened.load(Ordering::SeqCst), 1);

    alice.shutdown();
    bob.shutdown();
    server.stop();
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
    let _ = std::fs::remove_dir_all(second.parent().unwrap());
}
