//! The state record of one file transfer.

use std::path::{Path, PathBuf};

use common::crypto::Hasher;
use tokio::io::AsyncReadExt;

use crate::error::ErrorCode;

/// Byte source of a sending session: a file or process stdin.
pub enum InputStream {
    File(tokio::fs::File),
    Stdin(tokio::io::Stdin),
}

impl InputStream {
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            InputStream::File(file) => file.read(buf).await,
            InputStream::Stdin(stdin) => stdin.read(buf).await,
        }
    }
}

/// Everything one transfer needs: paths, streams, digests and the error
/// outcome. Created when a transfer begins, dropped when its fiber closes.
pub struct CopyContext {
    /// Path announced to the peer, relative to the sender's input directory.
    pub input_filepath: PathBuf,
    /// Sender-local directory the input path is relative to.
    pub input_dir: PathBuf,
    pub is_stdin_input: bool,
    pub check_integrity: bool,
    pub resume: bool,
    pub filesize: u64,
    pub start_offset: u64,
    pub output_dir: PathBuf,
    pub output_filename: PathBuf,
    pub input: Option<InputStream>,
    pub output: Option<tokio::fs::File>,
    /// Digest of the input bytes, covering a resumed prefix.
    pub input_hasher: Option<Hasher>,
    /// Receiver-side digest of the output bytes as they land.
    pub output_hasher: Option<Hasher>,
    pub error: ErrorCode,
}

impl CopyContext {
    /// Sender context for one local file.
    pub async fn for_file(
        input_dir: &Path,
        relative: &Path,
        check_integrity: bool,
        resume: bool,
        output_dir: &Path,
        output_filename: &Path,
    ) -> Self {
        let filesize = tokio::fs::metadata(input_dir.join(relative))
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        Self {
            input_filepath: relative.to_path_buf(),
            input_dir: input_dir.to_path_buf(),
            is_stdin_input: false,
            check_integrity,
            resume,
            filesize,
            start_offset: 0,
            output_dir: output_dir.to_path_buf(),
            output_filename: output_filename.to_path_buf(),
            input: None,
            output: None,
            input_hasher: None,
            output_hasher: None,
            error: ErrorCode::Success,
        }
    }

    /// Sender context reading process stdin.
    pub fn for_stdin(output_dir: &Path, output_filename: &Path) -> Self {
        Self {
            input_filepath: PathBuf::new(),
            input_dir: PathBuf::new(),
            is_stdin_input: true,
            check_integrity: false,
            resume: false,
            filesize: 0,
            start_offset: 0,
            output_dir: output_dir.to_path_buf(),
            output_filename: output_filename.to_path_buf(),
            input: None,
            output: None,
            input_hasher: None,
            output_hasher: None,
            error: ErrorCode::Success,
        }
    }

    /// Receiver context; the real fields arrive with the `InitRequest`.
    pub fn for_receiver() -> Self {
        Self {
            input_filepath: PathBuf::new(),
            input_dir: PathBuf::new(),
            is_stdin_input: false,
            check_integrity: false,
            resume: false,
            filesize: 0,
            start_offset: 0,
            output_dir: PathBuf::new(),
            output_filename: PathBuf::new(),
            input: None,
            output: None,
            input_hasher: None,
            output_hasher: None,
            error: ErrorCode::Success,
        }
    }

    pub fn input_fullpath(&self) -> PathBuf {
        self.input_dir.join(&self.input_filepath)
    }

    pub fn output_filepath(&self) -> PathBuf {
        self.output_dir.join(&self.output_filename)
    }

    /// Opens the input at `start_offset`, feeding the skipped prefix through
    /// the input hasher so the final digest covers the whole file.
    pub async fn open_input(&mut self) -> std::io::Result<()> {
        if self.is_stdin_input {
            self.input = Some(InputStream::Stdin(tokio::io::stdin()));
            self.input_hasher = Some(Hasher::new());
            return Ok(());
        }
        let mut file = tokio::fs::File::open(self.input_fullpath()).await?;
        let mut hasher = Hasher::new();
        if self.start_offset > 0 {
            let mut remaining = self.start_offset;
            let mut buf = vec![0u8; 64 * 1024];
            while remaining > 0 {
                let want = buf.len().min(remaining as usize);
                let n = file.read(&mut buf[..want]).await?;
                if n == 0 {
                    return Err(std::io::ErrorKind::UnexpectedEof.into());
                }
                hasher.update(&buf[..n]);
                remaining -= n as u64;
            }
        }
        self.input = Some(InputStream::File(file));
        self.input_hasher = Some(hasher);
        Ok(())
    }
}
