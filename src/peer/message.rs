//! Peer wire messages, exchanged after the handshake completes.
//!
//! Every message is `<length prefix><message id><payload>`, length prefix
//! a 4-byte big-endian `u32` counting the id byte plus payload. A
//! zero-length message (no id, no payload) is a keep-alive.
//!
//!     keep-alive: <len=0000>
//!     choke:             <len=0001><id=0>
//!     unchoke:           <len=0001><id=1>
//!     interested:        <len=0001><id=2>
//!     not interested:    <len=0001><id=3>
//!     have:              <len=0005><id=4><piece index>
//!     bitfield:          <len=0001+X><id=5><bitfield>
//!     request:           <len=0013><id=6><index><begin><length>
//!     piece:             <len=0009+X><id=7><index><begin><block>
//!     cancel:            <len=0013><id=8><index><begin><length>
use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_MESSAGE_LEN: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { bits: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// An id outside 0-8. The body has already been read off the wire and
    /// discarded; the session treats this as a no-op rather than closing
    /// the connection.
    Unknown { id: u8 },
}

impl Message {
    fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have { .. } => Some(4),
            Message::Bitfield { .. } => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
            Message::Unknown { .. } => None, // never constructed for writing
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Message::Have { index } => index.to_be_bytes().to_vec(),
            Message::Bitfield { bits } => bits.clone(),
            Message::Request { index, begin, length }
            | Message::Cancel { index, begin, length } => {
                let mut buf = Vec::with_capacity(12);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }
            Message::Piece { index, begin, block } => {
                let mut buf = Vec::with_capacity(8 + block.len());
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::Unknown { .. } => Vec::new(),
        }
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let Some(id) = self.id() else {
            writer.write_all(&0u32.to_be_bytes()).await?;
            return Ok(());
        };
        let payload = self.payload();
        let len = 1 + payload.len() as u32;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(&[id]).await?;
        writer.write_all(&payload).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Ok(Message::KeepAlive);
        }
        if len > MAX_MESSAGE_LEN {
            bail!("message of length {len} exceeds the maximum of {MAX_MESSAGE_LEN}");
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        let id = body[0];
        let payload = &body[1..];

        Ok(match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if payload.len() != 4 {
                    bail!("have payload must be 4 bytes, got {}", payload.len());
                }
                Message::Have {
                    index: u32::from_be_bytes(payload.try_into().unwrap()),
                }
            }
            5 => Message::Bitfield {
                bits: payload.to_vec(),
            },
            6 | 8 => {
                if payload.len() != 12 {
                    bail!("request/cancel payload must be 12 bytes, got {}", payload.len());
                }
                let index = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                let begin = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                let length = u32::from_be_bytes(payload[8..12].try_into().unwrap());
                if id == 6 {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            7 => {
                if payload.len() < 8 {
                    bail!("piece payload must be at least 8 bytes, got {}", payload.len());
                }
                let index = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                let begin = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                Message::Piece {
                    index,
                    begin,
                    block: payload[8..].to_vec(),
                }
            }
            other => {
                tracing::debug!(id = other, "skipping unknown peer message id");
                Message::Unknown { id: other }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(msg: Message) -> Message {
        let mut buf = Vec::new();
        msg.write(&mut buf).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        Message::read(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn round_trips_every_variant() {
        assert_eq!(round_trip(Message::KeepAlive).await, Message::KeepAlive);
        assert_eq!(round_trip(Message::Choke).await, Message::Choke);
        assert_eq!(round_trip(Message::Unchoke).await, Message::Unchoke);
        assert_eq!(round_trip(Message::Interested).await, Message::Interested);
        assert_eq!(
            round_trip(Message::NotInterested).await,
            Message::NotInterested
        );
        assert_eq!(
            round_trip(Message::Have { index: 7 }).await,
            Message::Have { index: 7 }
        );
        assert_eq!(
            round_trip(Message::Bitfield { bits: vec![0xff, 0x00] }).await,
            Message::Bitfield { bits: vec![0xff, 0x00] }
        );
        assert_eq!(
            round_trip(Message::Request { index: 1, begin: 2, length: 16384 }).await,
            Message::Request { index: 1, begin: 2, length: 16384 }
        );
        assert_eq!(
            round_trip(Message::Cancel { index: 1, begin: 2, length: 16384 }).await,
            Message::Cancel { index: 1, begin: 2, length: 16384 }
        );
        assert_eq!(
            round_trip(Message::Piece { index: 3, begin: 0, block: vec![1, 2, 3] }).await,
            Message::Piece { index: 3, begin: 0, block: vec![1, 2, 3] }
        );
    }

    #[tokio::test]
    async fn rejects_malformed_have_payload() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.push(4);
        buf.extend_from_slice(&[0u8; 2]);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(Message::read(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn unknown_message_id_is_skipped_not_an_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.push(200);
        buf.extend_from_slice(&[0u8; 2]);
        let mut cursor = std::io::Cursor::new(buf);
        let message = Message::read(&mut cursor).await.unwrap();
        assert_eq!(message, Message::Unknown { id: 200 });
    }

    #[tokio::test]
    async fn rejects_oversized_message_length() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_MESSAGE_LEN as u32) + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(Message::read(&mut cursor).await.is_err());
    }
}
