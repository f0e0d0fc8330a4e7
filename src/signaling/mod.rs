//! Server side: peer registry, message routing and the WebSocket endpoint.

pub mod router;
pub mod server;

pub use router::{Connection, Outbound, Router};
pub use server::SignalingServer;
