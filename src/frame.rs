use crate::errors::{TransferError, TransferResult};

/// Relay frame `kind` for a binary file chunk.
pub const RELAY_KIND_CHUNK: u8 = 1;

const DIRECT_HEADER_LEN: usize = 4 + 1;
const RELAY_HEADER_LEN: usize = 1 + DIRECT_HEADER_LEN;

/// One encrypted (or clear) chunk as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub seq: u32,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// `[seq:u32-LE][ivLen:u8][iv][ciphertext]`
pub fn encode_direct(seq: u32, iv: &[u8], ciphertext: &[u8]) -> TransferResult<Vec<u8>> {
    let iv_len = iv_len_byte(iv)?;
    let mut out = Vec::with_capacity(DIRECT_HEADER_LEN + iv.len() + ciphertext.len());
    out.extend_from_slice(&seq.to_le_bytes());
    out.push(iv_len);
    out.extend_from_slice(iv);
    out.extend_from_slice(ciphertext);
    Ok(out)
}

pub fn decode_direct(raw: &[u8]) -> TransferResult<ChunkFrame> {
    if raw.len() < DIRECT_HEADER_LEN {
        return Err(TransferError::frame(format!(
            "direct frame is {} bytes, header needs {DIRECT_HEADER_LEN}",
            raw.len()
        )));
    }
    let seq = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let iv_len = raw[4] as usize;
    let rest = &raw[DIRECT_HEADER_LEN..];
    if iv_len > rest.len() {
        return Err(TransferError::frame(format!(
            "iv length {iv_len} exceeds remaining {} bytes",
            rest.len()
        )));
    }
    let (iv, ciphertext) = rest.split_at(iv_len);
    Ok(ChunkFrame {
        seq,
        iv: iv.to_vec(),
        ciphertext: ciphertext.to_vec(),
    })
}

/// `[kind:u8][seq:u32-LE][ivLen:u8][iv][ciphertext]`, always `kind = 1`.
pub fn encode_relay(seq: u32, iv: &[u8], ciphertext: &[u8]) -> TransferResult<Vec<u8>> {
    let iv_len = iv_len_byte(iv)?;
    let mut out = Vec::with_capacity(RELAY_HEADER_LEN + iv.len() + ciphertext.len());
    out.push(RELAY_KIND_CHUNK);
    out.extend_from_slice(&seq.to_le_bytes());
    out.push(iv_len);
    out.extend_from_slice(iv);
    out.extend_from_slice(ciphertext);
    Ok(out)
}

pub fn decode_relay(raw: &[u8]) -> TransferResult<ChunkFrame> {
    if raw.len() < RELAY_HEADER_LEN {
        return Err(TransferError::frame(format!(
            "relay frame is {} bytes, header needs {RELAY_HEADER_LEN}",
            raw.len()
        )));
    }
    if raw[0] != RELAY_KIND_CHUNK {
        return Err(TransferError::frame(format!(
            "unknown relay frame kind {}",
            raw[0]
        )));
    }
    decode_direct(&raw[1..])
}

fn iv_len_byte(iv: &[u8]) -> TransferResult<u8> {
    u8::try_from(iv.len())
        .map_err(|_| TransferError::frame(format!("iv of {} bytes does not fit", iv.len())))
}
