#![allow(dead_code)]

use anyhow::Result;
use rand::RngCore;

/// Creates a unique scratch directory under the system temp dir.
pub async fn setup_test_dir() -> Result<std::path::PathBuf> {
    let mut idx = 0;
    loop {
        let tmp_dir = std::env::temp_dir().join(format!(
            "ssf_test{}_{}",
            std::process::id(),
            &idx
        ));
        if let Err(error) = tokio::fs::create_dir(&tmp_dir).await {
            match error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    idx += 1;
                }
                _ => return Err(error.into()),
            }
        } else {
            return Ok(tmp_dir);
        }
    }
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rng().fill_bytes(&mut buf);
    buf
}

/// Writes `len` random bytes to `path` and returns the payload.
pub async fn write_random_file(path: &std::path::Path, len: usize) -> Result<Vec<u8>> {
    let payload = random_bytes(len);
    tokio::fs::write(path, &payload).await?;
    Ok(payload)
}
