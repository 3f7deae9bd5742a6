//! Packet framing on control and file fibers.
//!
//! ```text
//! packet_type(u8) || payload_size(u32 LE) || payload[payload_size]
//! ```
//!
//! Typed payloads are MessagePack maps; `Data` payloads are raw file bytes.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum payload bytes of one packet.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    CopyRequest = 1,
    CopyRequestAck = 2,
    InitRequest = 3,
    InitReply = 4,
    Data = 5,
    Eof = 6,
    CheckIntegrityRequest = 7,
    CheckIntegrityReply = 8,
    CopyFinished = 9,
    Abort = 10,
    AbortAck = 11,
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(PacketType::CopyRequest),
            2 => Ok(PacketType::CopyRequestAck),
            3 => Ok(PacketType::InitRequest),
            4 => Ok(PacketType::InitReply),
            5 => Ok(PacketType::Data),
            6 => Ok(PacketType::Eof),
            7 => Ok(PacketType::CheckIntegrityRequest),
            8 => Ok(PacketType::CheckIntegrityReply),
            9 => Ok(PacketType::CopyFinished),
            10 => Ok(PacketType::Abort),
            11 => Ok(PacketType::AbortAck),
            other => Err(other),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);
        Self {
            packet_type,
            payload,
        }
    }

    /// Packet without payload (`Eof`).
    pub fn empty(packet_type: PacketType) -> Self {
        Self::new(packet_type, Bytes::new())
    }

    /// Serializes `msg` as a MessagePack map payload.
    pub fn from_msg<T: Serialize>(packet_type: PacketType, msg: &T) -> anyhow::Result<Self> {
        let payload = rmp_serde::to_vec_named(msg)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            anyhow::bail!("{packet_type:?} payload of {} bytes too large", payload.len());
        }
        Ok(Self::new(packet_type, Bytes::from(payload)))
    }

    /// Decodes the payload as a MessagePack map.
    pub fn to_msg<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        let mut header = [0u8; 5];
        header[0] = self.packet_type as u8;
        header[1..5].copy_from_slice(&(self.payload.len() as u32).to_le_bytes());
        writer.write_all(&header).await?;
        writer.write_all(&self.payload).await
    }

    /// Reads one packet; `Ok(None)` on clean EOF at a packet boundary.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Packet>> {
        let mut header = [0u8; 5];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let packet_type = PacketType::try_from(header[0]).map_err(|raw| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown packet type {raw}"),
            )
        })?;
        let payload_size = u32::from_le_bytes(header[1..5].try_into().unwrap()) as usize;
        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("packet payload of {payload_size} bytes too large"),
            ));
        }
        let mut payload = vec![0u8; payload_size];
        reader.read_exact(&mut payload).await?;
        Ok(Some(Packet::new(packet_type, Bytes::from(payload))))
    }
}
