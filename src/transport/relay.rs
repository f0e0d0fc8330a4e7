use crate::client::SignalingClient;
use crate::errors::TransferResult;
use crate::frame::encode_relay;
use crate::wsproto::{FileMeta, SignalMessage};

/// Tunnels a file through the signaling connection.
///
/// The server forwards raw frames to whichever peer the connection is locked
/// to, so `begin_file` must precede the first chunk and `end_file` releases
/// the lock.
#[derive(Clone, Debug)]
pub struct RelayChannel {
    client: SignalingClient,
    self_id: String,
    peer_id: String,
}

impl RelayChannel {
    pub fn new(client: SignalingClient, self_id: &str, peer_id: &str) -> Self {
        Self {
            client,
            self_id: self_id.to_string(),
            peer_id: peer_id.to_string(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn client(&self) -> &SignalingClient {
        &self.client
    }

    pub fn begin_file(&self, meta: &FileMeta) -> TransferResult<()> {
        self.client.send_control(&SignalMessage::RelayChunk {
            to: self.peer_id.clone(),
            from: self.self_id.clone(),
            file_meta: Some(meta.clone()),
            done: false,
        })
    }

    pub fn send_chunk(&self, seq: u32, iv: &[u8], ciphertext: &[u8]) -> TransferResult<usize> {
        let frame = encode_relay(seq, iv, ciphertext)?;
        let len = frame.len();
        self.client.send_binary(frame)?;
        Ok(len)
    }

    pub fn end_file(&self) -> TransferResult<()> {
        self.client.send_control(&SignalMessage::RelayChunk {
            to: self.peer_id.clone(),
            from: self.self_id.clone(),
            file_meta: None,
            done: true,
        })
    }
}
