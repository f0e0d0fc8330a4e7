//! The two ways chunks reach a peer, behind one send/backpressure contract.

pub mod direct;
pub mod relay;

pub use direct::{DirectChannel, DirectReceiver, Envelope};
pub use relay::RelayChannel;

use crate::crypto::SealedChunk;
use crate::errors::TransferResult;
use crate::frame::encode_direct;
use crate::pacer::{BufferGauge, TransportKind};
use crate::wsproto::{ChannelMessage, FileMeta};

#[derive(Clone, Debug)]
pub enum Transport {
    Direct(DirectChannel),
    Relay(RelayChannel),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Direct(_) => TransportKind::Direct,
            Transport::Relay(_) => TransportKind::Relay,
        }
    }

    pub fn peer_id(&self) -> &str {
        match self {
            Transport::Direct(c) => c.peer_id(),
            Transport::Relay(c) => c.peer_id(),
        }
    }

    fn gauge(&self) -> &BufferGauge {
        match self {
            Transport::Direct(c) => c.gauge(),
            Transport::Relay(c) => c.client().gauge(),
        }
    }

    /// Bytes handed to the transport that have not reached the socket yet.
    pub fn buffered_bytes(&self) -> u64 {
        self.gauge().buffered()
    }

    pub fn is_closed(&self) -> bool {
        self.gauge().is_closed()
    }

    /// Wait until buffering drops to the transport's hard ceiling.
    pub async fn ready_for_send(&self) -> TransferResult<()> {
        self.gauge().wait_below(self.kind().buffered_ceiling()).await
    }

    pub fn begin_file(&self, meta: &FileMeta) -> TransferResult<()> {
        match self {
            Transport::Direct(c) => c.send_message(&ChannelMessage::FileMeta { meta: meta.clone() }),
            Transport::Relay(c) => c.begin_file(meta),
        }
    }

    /// Frame and send one chunk. Returns the number of bytes put on the wire.
    pub fn send_chunk(&self, seq: u32, chunk: &SealedChunk) -> TransferResult<usize> {
        match self {
            Transport::Direct(c) => {
                let frame = encode_direct(seq, chunk.iv(), &chunk.ciphertext)?;
                let len = frame.len();
                c.send(Envelope::Binary(frame))?;
                Ok(len)
            }
            Transport::Relay(c) => c.send_chunk(seq, chunk.iv(), &chunk.ciphertext),
        }
    }

    pub fn end_file(&self) -> TransferResult<()> {
        match self {
            Transport::Direct(c) => c.send_message(&ChannelMessage::Eof),
            Transport::Relay(c) => c.end_file(),
        }
    }

    /// Wait until everything queued has been written out. A direct channel
    /// is closed afterwards; the relay rides on the shared signaling
    /// connection, which stays open.
    pub async fn finish(&self) {
        match self {
            Transport::Direct(c) => {
                c.close();
                c.gauge().closed().await;
            }
            Transport::Relay(c) => {
                let _ = c.client().gauge().wait_below(0).await;
            }
        }
    }
}
