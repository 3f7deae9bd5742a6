//! Version words exchanged during link and transport establishment.
//!
//! Both words travel as a single `u32` in network byte order. The link word
//! requires all four bytes to match; the transport word only compares `major`
//! and `transport` (the remaining bytes are advisory - observed behavior of
//! the wire protocol, kept as-is).

use common::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION_MAJOR: u8 = 3;
pub const VERSION_MINOR: u8 = 0;
pub const VERSION_SECURITY: u8 = 2;
pub const VERSION_ARCHIVE: u8 = 1;
pub const VERSION_TRANSPORT: u8 = 2;
pub const VERSION_CIRCUIT: u8 = 2;

/// Link version word: `major << 24 | minor << 16 | security << 8 | archive`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkVersion {
    pub major: u8,
    pub minor: u8,
    pub security: u8,
    pub archive: u8,
}

impl Default for LinkVersion {
    fn default() -> Self {
        Self {
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
            security: VERSION_SECURITY,
            archive: VERSION_ARCHIVE,
        }
    }
}

impl LinkVersion {
    pub fn encode(self) -> u32 {
        u32::from_be_bytes([self.major, self.minor, self.security, self.archive])
    }

    pub fn decode(word: u32) -> Self {
        let [major, minor, security, archive] = word.to_be_bytes();
        Self {
            major,
            minor,
            security,
            archive,
        }
    }

    /// Any differing byte aborts the link.
    pub fn is_compatible_with(self, other: Self) -> bool {
        self == other
    }
}

/// Transport version word: `major << 24 | minor << 16 | transport << 8 | circuit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportVersion {
    pub major: u8,
    pub minor: u8,
    pub transport: u8,
    pub circuit: u8,
}

impl Default for TransportVersion {
    fn default() -> Self {
        Self {
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
            transport: VERSION_TRANSPORT,
            circuit: VERSION_CIRCUIT,
        }
    }
}

impl TransportVersion {
    pub fn encode(self) -> u32 {
        u32::from_be_bytes([self.major, self.minor, self.transport, self.circuit])
    }

    pub fn decode(word: u32) -> Self {
        let [major, minor, transport, circuit] = word.to_be_bytes();
        Self {
            major,
            minor,
            transport,
            circuit,
        }
    }

    /// Only `major` and `transport` take part in the comparison.
    pub fn is_compatible_with(self, other: Self) -> bool {
        self.major == other.major && self.transport == other.transport
    }
}

pub async fn write_word<W: AsyncWrite + Unpin>(writer: &mut W, word: u32) -> std::io::Result<()> {
    writer.write_all(&word.to_be_bytes()).await
}

pub async fn read_word<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

/// Initiator half of the transport handshake: sends the local word and reads
/// the one-byte boolean reply.
pub async fn transport_handshake_initiate<S>(stream: &mut S) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_word(stream, TransportVersion::default().encode()).await?;
    let mut reply = [0u8; 1];
    stream.read_exact(&mut reply).await?;
    if reply[0] == 0 {
        tracing::error!("transport version rejected by peer");
        return Err(Error::WrongProtocolType.into());
    }
    Ok(())
}

/// Acceptor half: reads the remote word, replies with a boolean and fails the
/// handshake on mismatch.
pub async fn transport_handshake_accept<S>(stream: &mut S) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = TransportVersion::decode(read_word(stream).await?);
    let local = TransportVersion::default();
    let ok = local.is_compatible_with(remote);
    stream.write_all(&[u8::from(ok)]).await?;
    if !ok {
        tracing::error!(
            "transport version mismatch: local {:?}, remote {:?}",
            local,
            remote
        );
        return Err(Error::ProtocolNotSupported.into());
    }
    Ok(())
}
