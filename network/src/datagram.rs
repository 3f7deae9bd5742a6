//! Datagram framing on an established link.
//!
//! Every datagram carries a one-byte protocol id, the fiber pair id and a
//! bounded payload:
//!
//! ```text
//! protocol_id(u8) || remote_port(u32 LE) || local_port(u32 LE) ||
//! payload_length(u16 LE) || payload[payload_length]
//! ```
//!
//! The pair id is written from the sender's perspective (remote half first);
//! on receipt the halves land directly in the receiver's (local, remote)
//! order. Ports are 32 bits wide: the well-known microservice ports sit above
//! 2^17.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum payload bytes per datagram (the link MTU).
pub const MTU: usize = 4 * 1024;

pub const HEADER_SIZE: usize = 1 + 4 + 4 + 2;

/// Lowest well-known microservice port; user ports are below.
pub const MICROSERVICE_PORT_MIN: u32 = 1 << 17;

/// Fiber pair id. The remote half identifies the peer's end of the
/// connection, the local half this end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiberId {
    pub local_port: u32,
    pub remote_port: u32,
}

impl FiberId {
    pub fn new(local_port: u32, remote_port: u32) -> Self {
        Self {
            local_port,
            remote_port,
        }
    }

    /// The same fiber seen from the peer's side.
    pub fn flip(self) -> Self {
        Self {
            local_port: self.remote_port,
            remote_port: self.local_port,
        }
    }
}

impl std::fmt::Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.local_port, self.remote_port)
    }
}

/// Sub-protocols multiplexed in the datagram stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolId {
    /// User bytes for an established fiber.
    Data = 0,
    /// Open request; argument is the connecting side's receive window.
    Syn = 1,
    /// Open accepted; argument is the accepting side's receive window.
    SynAck = 2,
    /// Write-side shutdown; argument is a reason code.
    Fin = 3,
    /// Abort; argument is a reason code.
    Rst = 4,
    /// Flow-control grant; argument is the number of credits returned.
    Credit = 5,
}

impl TryFrom<u8> for ProtocolId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(ProtocolId::Data),
            1 => Ok(ProtocolId::Syn),
            2 => Ok(ProtocolId::SynAck),
            3 => Ok(ProtocolId::Fin),
            4 => Ok(ProtocolId::Rst),
            5 => Ok(ProtocolId::Credit),
            other => Err(other),
        }
    }
}

/// One framed unit on the link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub protocol: ProtocolId,
    /// Pair id in the holder's perspective: as sent for outbound datagrams,
    /// already flipped to the receiver's view for inbound ones.
    pub id: FiberId,
    pub payload: Bytes,
}

impl Datagram {
    pub fn data(id: FiberId, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MTU);
        Self {
            protocol: ProtocolId::Data,
            id,
            payload,
        }
    }

    /// Control datagram carrying a single `u32` argument.
    pub fn control(protocol: ProtocolId, id: FiberId, arg: u32) -> Self {
        Self {
            protocol,
            id,
            payload: Bytes::copy_from_slice(&arg.to_le_bytes()),
        }
    }

    /// Argument of a control datagram, if well-formed.
    pub fn control_arg(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// Serializes the datagram; `self.id` is taken as the sender's view.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE + self.payload.len());
        dst.put_u8(self.protocol as u8);
        dst.put_u32_le(self.id.remote_port);
        dst.put_u32_le(self.id.local_port);
        dst.put_u16_le(self.payload.len() as u16);
        dst.put_slice(&self.payload);
    }

    /// Parses a datagram from `src`; the resulting `id` is in the receiver's
    /// perspective. Returns `None` if `src` does not hold a full datagram.
    pub fn decode(src: &mut BytesMut) -> std::io::Result<Option<Datagram>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let payload_len = u16::from_le_bytes([src[9], src[10]]) as usize;
        if payload_len > MTU {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("datagram payload {payload_len} exceeds MTU {MTU}"),
            ));
        }
        if src.len() < HEADER_SIZE + payload_len {
            return Ok(None);
        }
        let protocol = ProtocolId::try_from(src[0]).map_err(|raw| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown protocol id {raw}"),
            )
        })?;
        src.advance(1);
        // sender's remote half is our local half
        let local_port = src.get_u32_le();
        let remote_port = src.get_u32_le();
        src.advance(2);
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(Datagram {
            protocol,
            id: FiberId::new(local_port, remote_port),
            payload,
        }))
    }

    /// Reads one datagram; `Ok(None)` on clean EOF at a frame boundary.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> std::io::Result<Option<Datagram>> {
        let mut header = [0u8; HEADER_SIZE];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let mut buf = BytesMut::from(&header[..]);
        let payload_len = u16::from_le_bytes([header[9], header[10]]) as usize;
        buf.resize(HEADER_SIZE + payload_len, 0);
        reader.read_exact(&mut buf[HEADER_SIZE..]).await?;
        Datagram::decode(&mut buf)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.encode(&mut buf);
        writer.write_all(&buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_flips_perspective() {
        let sent = Datagram::data(FiberId::new(7, 130_000), Bytes::from_static(b"hello"));
        let mut buf = BytesMut::new();
        sent.encode(&mut buf);
        let received = Datagram::decode(&mut buf).unwrap().unwrap();
        assert_eq!(received.protocol, ProtocolId::Data);
        assert_eq!(received.id, sent.id.flip());
        assert_eq!(received.payload, sent.payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_layout_little_endian() {
        let d = Datagram::data(FiberId::new(0x0102_0304, 0x0A0B_0C0D), Bytes::from_static(b"x"));
        let mut buf = BytesMut::new();
        d.encode(&mut buf);
        assert_eq!(buf[0], 0); // data protocol id
        assert_eq!(&buf[1..5], &0x0A0B_0C0Du32.to_le_bytes()); // remote half first
        assert_eq!(&buf[5..9], &0x0102_0304u32.to_le_bytes());
        assert_eq!(&buf[9..11], &1u16.to_le_bytes());
        assert_eq!(&buf[11..], b"x");
    }

    #[test]
    fn test_decode_partial_returns_none() {
        let d = Datagram::data(FiberId::new(1, 2), Bytes::from_static(b"payload"));
        let mut full = BytesMut::new();
        d.encode(&mut full);
        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(Datagram::decode(&mut partial).unwrap().is_none());
        }
    }

    #[test]
    fn test_decode_rejects_unknown_protocol() {
        let d = Datagram::data(FiberId::new(1, 2), Bytes::new());
        let mut buf = BytesMut::new();
        d.encode(&mut buf);
        buf[0] = 0xFF;
        assert!(Datagram::decode(&mut buf).is_err());
    }

    #[test]
    fn test_control_arg_roundtrip() {
        let d = Datagram::control(ProtocolId::Credit, FiberId::new(1, 2), 65_536);
        assert_eq!(d.control_arg(), Some(65_536));
        let data = Datagram::data(FiberId::new(1, 2), Bytes::from_static(b"abcde"));
        assert_eq!(data.control_arg(), None);
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = Datagram::control(ProtocolId::Syn, FiberId::new(3, 200_000), 256 * 1024);
        sent.write_to(&mut a).await.unwrap();
        drop(a);
        let received = Datagram::read_from(&mut b).await.unwrap().unwrap();
        assert_eq!(received.id, sent.id.flip());
        assert_eq!(received.control_arg(), Some(256 * 1024));
        // clean EOF at frame boundary
        assert!(Datagram::read_from(&mut b).await.unwrap().is_none());
    }
}
