//! SHA-1 digests for copy integrity checks and resume validation.

use anyhow::Context;
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;

/// Raw SHA-1 digest bytes.
pub type Sha1Digest = [u8; 20];

const CHUNK_SIZE: usize = 64 * 1024;

/// Incremental SHA-1, fed as bytes move through a transfer.
#[derive(Clone, Default)]
pub struct Hasher {
    inner: Sha1,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finalize(self) -> Sha1Digest {
        self.inner.finalize().into()
    }
}

pub fn digest_to_hex(digest: &Sha1Digest) -> String {
    hex::encode(digest)
}

/// Digest of a whole file.
pub async fn file_digest(path: &std::path::Path) -> anyhow::Result<Sha1Digest> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("cannot stat {path:?}"))?;
    file_prefix_digest(path, metadata.len()).await
}

/// Digest of the first `len` bytes of a file. Fails if the file is shorter.
pub async fn file_prefix_digest(path: &std::path::Path, len: u64) -> anyhow::Result<Sha1Digest> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {path:?}"))?;
    let mut reader = file.take(len);
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    if total != len {
        anyhow::bail!("{path:?} is shorter than {len} bytes (read {total})");
    }
    Ok(hasher.finalize())
}
