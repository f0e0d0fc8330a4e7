pub mod agent;
pub mod client;
pub mod config;
pub mod console;
pub mod crypto;
pub mod errors;
pub mod frame;
pub mod logging;
pub mod pacer;
pub mod session;
pub mod signaling;
pub mod sink;
pub mod telemetry;
pub mod transport;
pub mod wsproto;
