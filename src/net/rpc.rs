//! RPC message types and framing for peer communication.
//!
//! Messages are bincode-encoded and framed with a 4-byte big-endian length
//! prefix. The payload format is owned by this transport layer; the
//! coordinator only sees the `PeerGetter` contract.

use crate::error::{NetworkError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Maximum accepted frame size.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Wire messages exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Fetch a key from the receiving peer.
    GetRequest { group: String, key: String },

    /// Answer to a `GetRequest`.
    GetResponse(GetResponse),
}

/// Outcome of a remote get.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GetResponse {
    /// The value for the key.
    Value(Vec<u8>),

    /// The owning peer consulted the backing source and the key does not
    /// exist. Authoritative; the caller must not mask it.
    NotFound(String),

    /// The request failed on the remote side (unknown group, load error).
    Error(String),
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> Result<Message> {
    Ok(bincode::deserialize(data)?)
}

/// Write a length-prefixed message to the stream.
pub async fn write_message(stream: &mut TcpStream, msg: &Message) -> Result<()> {
    let data = encode_message(msg)?;
    let len = data.len() as u32;

    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(NetworkError::Io)?;
    stream.write_all(&data).await.map_err(NetworkError::Io)?;

    Ok(())
}

/// Read one length-prefixed message from the stream.
///
/// Returns `None` when the peer closed the connection cleanly at a frame
/// boundary.
pub async fn read_message(stream: &mut TcpStream) -> Result<Option<Message>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(NetworkError::MessageTooLarge(len).into());
    }

    let mut data = vec![0u8; len];
    stream
        .read_exact(&mut data)
        .await
        .map_err(NetworkError::Io)?;

    Ok(Some(decode_message(&data)?))
}
