use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::telemetry::RelayStats;
use crate::wsproto::{decode_text, PeerInfo, SignalMessage, DEFAULT_NAME, DEFAULT_ROOM};

pub type ConnId = u64;

/// A message queued for one connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

struct PeerEntry {
    conn: ConnId,
    name: String,
    room: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

/// State owned by a single connection handler.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    tx: mpsc::UnboundedSender<Outbound>,
    peer_id: Option<String>,
    room: String,
    relay_to: Option<String>,
}

impl Connection {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Destination of raw binary frames from this connection, if a relay
    /// session is in progress.
    pub fn relay_to(&self) -> Option<&str> {
        self.relay_to.as_deref()
    }
}

/// Registry of connected peers shared by every connection handler.
///
/// Delivery is by peer id and does not check rooms; rooms only scope the
/// `peers` broadcast. Messages for unknown peers are dropped without telling
/// the sender.
pub struct Router {
    peers: Mutex<HashMap<String, PeerEntry>>,
    next_conn: AtomicU64,
    stats: Arc<RelayStats>,
}

impl Router {
    pub fn new(stats: Arc<RelayStats>) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    pub fn connect(&self, tx: mpsc::UnboundedSender<Outbound>) -> Connection {
        Connection {
            id: self.next_conn.fetch_add(1, Ordering::Relaxed),
            tx,
            peer_id: None,
            room: DEFAULT_ROOM.to_string(),
            relay_to: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PeerEntry>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decode and dispatch one text frame. Malformed input is dropped.
    pub fn handle_text(&self, conn: &mut Connection, raw: &str) {
        match decode_text(raw) {
            Ok(msg) => self.dispatch(conn, msg, Some(raw)),
            Err(err) => {
                self.stats.on_control_dropped();
                crate::logging::warn_kv(
                    "signaling message dropped",
                    &[("conn", &conn.id.to_string()), ("error", &err.to_string())],
                );
            }
        }
    }

    pub fn handle_message(&self, conn: &mut Connection, msg: SignalMessage) {
        self.dispatch(conn, msg, None)
    }

    /// `raw` is the text the message was decoded from; routed messages are
    /// forwarded as that exact text when present.
    fn dispatch(&self, conn: &mut Connection, msg: SignalMessage, raw: Option<&str>) {
        match msg {
            SignalMessage::Hello { id, name, room } => {
                let name = name
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_NAME.to_string());
                let room = room
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_ROOM.to_string());
                self.register(conn, id, name, room);
            }
            SignalMessage::Signal { .. }
            | SignalMessage::TransferOffer { .. }
            | SignalMessage::TransferResponse { .. } => {
                self.forward(&msg, raw);
            }
            SignalMessage::RelayChunk {
                ref to,
                ref file_meta,
                done,
                ..
            } => {
                if !self.is_registered(to) {
                    self.stats.on_control_dropped();
                    return;
                }
                if file_meta.is_some() {
                    conn.relay_to = Some(to.clone());
                    crate::logging::debug(format!(
                        "relay locked conn={} to={to}",
                        conn.id
                    ));
                    self.forward(&msg, raw);
                } else if done {
                    self.forward(&msg, raw);
                    conn.relay_to = None;
                    crate::logging::debug(format!("relay released conn={}", conn.id));
                } else {
                    self.stats.on_control_dropped();
                }
            }
            SignalMessage::Peers { .. } => {
                // Server-to-client only.
                self.stats.on_control_dropped();
            }
        }
    }

    /// Insert or replace `id`, then broadcast the peer list of its room (and
    /// of the previous room if the connection moved).
    pub fn register(&self, conn: &mut Connection, id: String, name: String, room: String) {
        let previous_room = conn.room.clone();
        {
            let mut peers = self.lock();
            if let Some(old_id) = conn.peer_id.as_ref().filter(|old| **old != id) {
                if peers.get(old_id).map(|e| e.conn) == Some(conn.id) {
                    peers.remove(old_id);
                }
            }
            peers.insert(
                id.clone(),
                PeerEntry {
                    conn: conn.id,
                    name: name.clone(),
                    room: room.clone(),
                    tx: conn.tx.clone(),
                },
            );
        }
        let was_registered = conn.peer_id.is_some();
        conn.peer_id = Some(id.clone());
        conn.room = room.clone();
        crate::logging::info_kv(
            "peer registered",
            &[("peer", &id), ("name", &name), ("room", &room)],
        );
        if was_registered && previous_room != room {
            self.broadcast_peers(&previous_room);
        }
        self.broadcast_peers(&room);
    }

    /// Remove the connection's peer if the registry entry still belongs to it.
    pub fn unregister(&self, conn: &Connection) {
        let Some(id) = conn.peer_id.as_deref() else {
            return;
        };
        let removed = {
            let mut peers = self.lock();
            match peers.get(id) {
                Some(entry) if entry.conn == conn.id => peers.remove(id).map(|e| e.room),
                _ => None,
            }
        };
        if let Some(room) = removed {
            crate::logging::info_kv("peer left", &[("peer", id), ("room", &room)]);
            self.broadcast_peers(&room);
        }
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Forward a control message to its destination. Returns whether it was
    /// handed to a live connection.
    pub fn route_control(&self, msg: &SignalMessage) -> bool {
        self.forward(msg, None)
    }

    fn forward(&self, msg: &SignalMessage, raw: Option<&str>) -> bool {
        let Some(to) = msg.destination() else {
            self.stats.on_control_dropped();
            return false;
        };
        let text = match raw {
            Some(raw) => raw.to_string(),
            None => match msg.to_text() {
                Ok(t) => t,
                Err(_) => {
                    self.stats.on_control_dropped();
                    return false;
                }
            },
        };
        let delivered = self
            .lock()
            .get(to)
            .map(|dest| dest.tx.send(Outbound::Text(text)).is_ok())
            .unwrap_or(false);
        if delivered {
            self.stats.on_control_forwarded();
        } else {
            self.stats.on_control_dropped();
            crate::logging::debug(format!("{} to unknown peer {to} dropped", msg.kind()));
        }
        delivered
    }

    /// Forward raw relay bytes to the connection's locked destination.
    pub fn route_relay_binary(&self, conn: &Connection, bytes: Vec<u8>) -> bool {
        let Some(to) = conn.relay_to.as_deref() else {
            self.stats.on_frame_dropped();
            return false;
        };
        let len = bytes.len();
        let delivered = self
            .lock()
            .get(to)
            .map(|dest| dest.tx.send(Outbound::Binary(bytes)).is_ok())
            .unwrap_or(false);
        if delivered {
            self.stats.on_frame_forwarded(len);
        } else {
            self.stats.on_frame_dropped();
        }
        delivered
    }

    pub fn peers_in_room(&self, room: &str) -> Vec<PeerInfo> {
        let mut list: Vec<PeerInfo> = self
            .lock()
            .iter()
            .filter(|(_, e)| e.room == room)
            .map(|(id, e)| PeerInfo {
                id: id.clone(),
                name: e.name.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    fn broadcast_peers(&self, room: &str) {
        let msg = SignalMessage::Peers {
            peers: self.peers_in_room(room),
        };
        let Ok(text) = msg.to_text() else {
            return;
        };
        for entry in self.lock().values().filter(|e| e.room == room) {
            let _ = entry.tx.send(Outbound::Text(text.clone()));
        }
    }
}
