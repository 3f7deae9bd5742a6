//! Typed payloads of control and file packets.

use common::crypto::Sha1Digest;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// A copy query, immutable once sent on the control fiber.
///
/// `get_from_server` selects the direction: false pushes client files to the
/// server, true asks the server to transmit files matching `input_pattern`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRequest {
    pub is_from_stdin: bool,
    pub is_resume: bool,
    pub is_recursive: bool,
    pub check_integrity: bool,
    pub max_parallel: u32,
    pub get_from_server: bool,
    pub input_pattern: String,
    pub output_pattern: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyRequestStatus {
    Received,
    Corrupted,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CopyRequestAck {
    pub req: CopyRequest,
    pub status: CopyRequestStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitRequest {
    pub input_filepath: String,
    pub check_integrity: bool,
    pub stdin_input: bool,
    pub resume: bool,
    pub filesize: u64,
    pub output_dir: String,
    pub output_filename: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitStatus {
    Failed,
    Succeeded,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitReply {
    pub req: InitRequest,
    /// Where the sender must start reading; non-zero only on resume.
    pub start_offset: u64,
    /// Digest of the bytes already present in the output file.
    pub current_digest: Sha1Digest,
    pub status: InitStatus,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CheckIntegrityRequest {
    pub input_file_digest: Sha1Digest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckIntegrityStatus {
    Failed,
    Succeeded,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CheckIntegrityReply {
    pub output_file_digest: Sha1Digest,
    pub status: CheckIntegrityStatus,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CopyFinished {
    pub files_count: u64,
    pub errors_count: u64,
    pub error_code: ErrorCode,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Abort {
    pub error_code: ErrorCode,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AbortAck {
    pub error_code: ErrorCode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, PacketType};

    #[test]
    fn test_msgpack_roundtrip() {
        let req = CopyRequest {
            is_from_stdin: false,
            is_resume: true,
            is_recursive: false,
            check_integrity: true,
            max_parallel: 5,
            get_from_server: false,
            input_pattern: "in/*.bin".into(),
            output_pattern: "out/".into(),
        };
        let packet = Packet::from_msg(PacketType::CopyRequest, &req).unwrap();
        let decoded: CopyRequest = packet.to_msg().unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_init_reply_roundtrip() {
        let reply = InitReply {
            req: InitRequest {
                input_filepath: "file.bin".into(),
                check_integrity: true,
                stdin_input: false,
                resume: true,
                filesize: 42,
                output_dir: "out".into(),
                output_filename: "file.bin".into(),
            },
            start_offset: 2_621_440,
            current_digest: [7u8; 20],
            status: InitStatus::Succeeded,
        };
        let packet = Packet::from_msg(PacketType::InitReply, &reply).unwrap();
        let decoded: InitReply = packet.to_msg().unwrap();
        assert_eq!(decoded.start_offset, reply.start_offset);
        assert_eq!(decoded.current_digest, reply.current_digest);
        assert_eq!(decoded.status, InitStatus::Succeeded);
    }

    #[test]
    fn test_corrupted_payload_fails_decode() {
        let packet = Packet::new(
            PacketType::CopyRequest,
            bytes::Bytes::from_static(&[0xC1, 0x00, 0x01]),
        );
        assert!(packet.to_msg::<CopyRequest>().is_err());
    }
}
