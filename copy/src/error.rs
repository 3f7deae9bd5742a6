//! Copy microservice error codes.
//!
//! Codes travel inside `Abort`, `InitReply` and `CopyFinished` payloads and
//! double as `ssfcp` exit codes.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", from = "u32")]
pub enum ErrorCode {
    Success,
    Unknown,
    Interrupted,
    CopyStopped,
    NetworkError,
    CopyRequestCorrupted,
    CopyRequestAckNotReceived,
    SenderInputFileListingFailed,
    CopyInitializationFailed,
    InitRequestCorrupted,
    OutputDirectoryNotFound,
    OutputFileNotAvailable,
    InputFileReadError,
    OutputFileWriteError,
    ResumeFileTransferNotPermitted,
    OutputFileCorrupted,
    InboundPacketNotSupported,
    FilesPartiallyCopied,
    NoFileCopied,
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> u32 {
        match code {
            ErrorCode::Success => 0,
            ErrorCode::Unknown => 1,
            ErrorCode::Interrupted => 2,
            ErrorCode::CopyStopped => 3,
            ErrorCode::NetworkError => 4,
            ErrorCode::CopyRequestCorrupted => 5,
            ErrorCode::CopyRequestAckNotReceived => 6,
            ErrorCode::SenderInputFileListingFailed => 7,
            ErrorCode::CopyInitializationFailed => 8,
            ErrorCode::InitRequestCorrupted => 9,
            ErrorCode::OutputDirectoryNotFound => 10,
            ErrorCode::OutputFileNotAvailable => 11,
            ErrorCode::InputFileReadError => 12,
            ErrorCode::OutputFileWriteError => 13,
            ErrorCode::ResumeFileTransferNotPermitted => 14,
            ErrorCode::OutputFileCorrupted => 15,
            ErrorCode::InboundPacketNotSupported => 16,
            ErrorCode::FilesPartiallyCopied => 17,
            ErrorCode::NoFileCopied => 18,
        }
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> ErrorCode {
        match code {
            0 => ErrorCode::Success,
            2 => ErrorCode::Interrupted,
            3 => ErrorCode::CopyStopped,
            4 => ErrorCode::NetworkError,
            5 => ErrorCode::CopyRequestCorrupted,
            6 => ErrorCode::CopyRequestAckNotReceived,
            7 => ErrorCode::SenderInputFileListingFailed,
            8 => ErrorCode::CopyInitializationFailed,
            9 => ErrorCode::InitRequestCorrupted,
            10 => ErrorCode::OutputDirectoryNotFound,
            11 => ErrorCode::OutputFileNotAvailable,
            12 => ErrorCode::InputFileReadError,
            13 => ErrorCode::OutputFileWriteError,
            14 => ErrorCode::ResumeFileTransferNotPermitted,
            15 => ErrorCode::OutputFileCorrupted,
            16 => ErrorCode::InboundPacketNotSupported,
            17 => ErrorCode::FilesPartiallyCopied,
            18 => ErrorCode::NoFileCopied,
            _ => ErrorCode::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            ErrorCode::Success => "success",
            ErrorCode::Unknown => "unknown error",
            ErrorCode::Interrupted => "copy interrupted",
            ErrorCode::CopyStopped => "copy stopped",
            ErrorCode::NetworkError => "network error",
            ErrorCode::CopyRequestCorrupted => "copy request corrupted",
            ErrorCode::CopyRequestAckNotReceived => "copy request not acknowledged",
            ErrorCode::SenderInputFileListingFailed => "cannot list input files",
            ErrorCode::CopyInitializationFailed => "copy initialization failed",
            ErrorCode::InitRequestCorrupted => "init request corrupted",
            ErrorCode::OutputDirectoryNotFound => "output directory not found",
            ErrorCode::OutputFileNotAvailable => "output file not available",
            ErrorCode::InputFileReadError => "cannot read input file",
            ErrorCode::OutputFileWriteError => "cannot write output file",
            ErrorCode::ResumeFileTransferNotPermitted => "resume not permitted",
            ErrorCode::OutputFileCorrupted => "output file corrupted",
            ErrorCode::InboundPacketNotSupported => "inbound packet not supported",
            ErrorCode::FilesPartiallyCopied => "files partially copied",
            ErrorCode::NoFileCopied => "no file copied",
        };
        write!(f, "{message}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for raw in 0..=18u32 {
            let code = ErrorCode::from(raw);
            assert_eq!(u32::from(code), raw);
        }
        assert_eq!(ErrorCode::from(999), ErrorCode::Unknown);
    }
}
