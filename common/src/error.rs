//! Error kinds that cross layer boundaries.
//!
//! Lower layers attach a kind when raising; upper layers pass the kind
//! through unchanged. Only the outermost surface (a CLI or a library caller)
//! renders a message.

/// Cross-layer error kinds.
///
/// Each kind has a stable numeric code used for circuit error replies and
/// process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Destination prefix unroutable or output directory missing.
    #[error("address not available")]
    AddressNotAvailable,
    /// Duplicate route or duplicate listener.
    #[error("address in use")]
    AddressInUse,
    /// Queue or fiber already closed.
    #[error("broken pipe")]
    BrokenPipe,
    /// Bounded queue or op-queue full.
    #[error("buffer full")]
    BufferFull,
    /// No route or peer gone.
    #[error("not connected")]
    NotConnected,
    /// Teardown caused abortion of a pending operation.
    #[error("operation canceled")]
    OperationCanceled,
    /// Link or transport version mismatch.
    #[error("protocol not supported")]
    ProtocolNotSupported,
    /// Missing destination in a user-supplied address.
    #[error("destination address required")]
    DestinationAddressRequired,
    /// Transport version rejected by peer.
    #[error("wrong protocol type")]
    WrongProtocolType,
    /// Non-blocking operation would have to suspend.
    #[error("would block")]
    WouldBlock,
    /// Connection refused by the remote endpoint.
    #[error("connection refused")]
    ConnectionRefused,
}

impl Error {
    /// Stable numeric code, used as the circuit error-reply word and as a
    /// process exit code.
    pub fn code(self) -> u32 {
        match self {
            Error::AddressNotAvailable => 99,
            Error::AddressInUse => 98,
            Error::BrokenPipe => 32,
            Error::BufferFull => 105,
            Error::NotConnected => 107,
            Error::OperationCanceled => 125,
            Error::ProtocolNotSupported => 93,
            Error::DestinationAddressRequired => 89,
            Error::WrongProtocolType => 91,
            Error::WouldBlock => 11,
            Error::ConnectionRefused => 111,
        }
    }

    /// Inverse of [`Error::code`]; unknown words map to `NotConnected`.
    pub fn from_code(code: u32) -> Self {
        match code {
            99 => Error::AddressNotAvailable,
            98 => Error::AddressInUse,
            32 => Error::BrokenPipe,
            105 => Error::BufferFull,
            107 => Error::NotConnected,
            125 => Error::OperationCanceled,
            93 => Error::ProtocolNotSupported,
            89 => Error::DestinationAddressRequired,
            91 => Error::WrongProtocolType,
            11 => Error::WouldBlock,
            _ => Error::NotConnected,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        let kind = match e {
            Error::AddressNotAvailable => std::io::ErrorKind::AddrNotAvailable,
            Error::AddressInUse => std::io::ErrorKind::AddrInUse,
            Error::BrokenPipe => std::io::ErrorKind::BrokenPipe,
            Error::BufferFull => std::io::ErrorKind::OutOfMemory,
            Error::NotConnected => std::io::ErrorKind::NotConnected,
            Error::OperationCanceled => std::io::ErrorKind::Interrupted,
            Error::ProtocolNotSupported => std::io::ErrorKind::Unsupported,
            Error::DestinationAddressRequired => std::io::ErrorKind::InvalidInput,
            Error::WrongProtocolType => std::io::ErrorKind::InvalidData,
            Error::WouldBlock => std::io::ErrorKind::WouldBlock,
            Error::ConnectionRefused => std::io::ErrorKind::ConnectionRefused,
        };
        std::io::Error::new(kind, e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for e in [
            Error::AddressNotAvailable,
            Error::AddressInUse,
            Error::BrokenPipe,
            Error::BufferFull,
            Error::NotConnected,
            Error::OperationCanceled,
            Error::ProtocolNotSupported,
            Error::DestinationAddressRequired,
            Error::WrongProtocolType,
            Error::WouldBlock,
        ] {
            assert_eq!(Error::from_code(e.code()), e);
        }
    }

    #[test]
    fn test_io_error_kind_mapping() {
        let io: std::io::Error = Error::BrokenPipe.into();
        assert_eq!(io.kind(), std::io::ErrorKind::BrokenPipe);
        let io: std::io::Error = Error::OperationCanceled.into();
        assert_eq!(io.kind(), std::io::ErrorKind::Interrupted);
    }
}
