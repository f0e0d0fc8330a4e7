use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Json, Router as HttpRouter,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};

use super::router::{Outbound, Router};
use crate::telemetry::{RelayStats, RelayStatsSnapshot};
use crate::wsproto::WS_MAX_MESSAGE_BYTES;

struct ServerState {
    router: Router,
    stats: Arc<RelayStats>,
}

/// A running signaling server.
#[derive(Clone)]
pub struct SignalingServer {
    bound_addr: SocketAddr,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for SignalingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingServer")
            .field("bound_addr", &self.bound_addr)
            .finish()
    }
}

impl SignalingServer {
    /// Bind `addr` and serve `/ws` and `/health` until [`stop`](Self::stop).
    pub async fn start(addr: &str) -> anyhow::Result<Self> {
        crate::logging::info_kv("signaling server starting", &[("requested_addr", addr)]);

        let requested: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid listen address '{addr}' (use numeric IP)"))?;
        let listener = tokio::net::TcpListener::bind(requested)
            .await
            .with_context(|| format!("bind {requested}"))?;
        let bound_addr = listener.local_addr()?;

        let stats = Arc::new(RelayStats::default());
        let state = Arc::new(ServerState {
            router: Router::new(stats.clone()),
            stats,
        });
        let app = app(state);

        let shutdown = Arc::new(Notify::new());
        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_clone.notified().await;
                })
                .await;
            if let Err(e) = result {
                crate::logging::error(format!("signaling server error: {e}"));
            }
            crate::logging::info("signaling server stopped");
        });

        crate::logging::info_kv(
            "signaling server started",
            &[("bound_addr", &bound_addr.to_string())],
        );
        Ok(Self {
            bound_addr,
            shutdown,
        })
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.bound_addr)
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }
}

fn app(state: Arc<ServerState>) -> HttpRouter {
    HttpRouter::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
    relay: RelayStatsSnapshot,
}

async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
        relay: state.stats.snapshot(),
    })
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.max_message_size(WS_MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut write, mut read) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let mut conn = state.router.connect(tx);
    let conn_id = conn.id().to_string();
    crate::logging::debug(format!("ws connected conn={conn_id}"));

    // writer
    let write_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let msg = match out {
                Outbound::Text(t) => Message::Text(t),
                Outbound::Binary(b) => Message::Binary(b),
            };
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    // reader
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(txt)) => state.router.handle_text(&mut conn, &txt),
            Ok(Message::Binary(bin)) => {
                state.router.route_relay_binary(&conn, bin);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                crate::logging::debug(format!("ws read error conn={conn_id}: {err}"));
                break;
            }
        }
    }

    state.router.unregister(&conn);
    write_task.abort();
    crate::logging::debug(format!("ws closed conn={conn_id}"));
}
