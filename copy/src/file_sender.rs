//! Sender-side orchestration: input listing, parallel file sessions and the
//! `CopyFinished` rollup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use network::fiber::{Demux, FiberWriteHalf};
use tokio::sync::Semaphore;

use crate::context::CopyContext;
use crate::error::ErrorCode;
use crate::msg::{CopyFinished, CopyRequest};
use crate::packet::{Packet, PacketType};
use crate::session;
use crate::state::SenderState;
use crate::CopySummary;
use crate::FILE_ACCEPTOR_PORT;

/// Expands an input pattern into `(input_dir, relative files)`.
///
/// A plain file path yields itself; a directory or glob pattern is matched
/// against file names, descending into subdirectories when `recursive`.
pub fn list_input_files(pattern: &str, recursive: bool) -> anyhow::Result<(PathBuf, Vec<PathBuf>)> {
    let pattern_path = Path::new(pattern);
    if pattern_path.is_file() {
        let dir = pattern_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let name = pattern_path
            .file_name()
            .context("input path has no file name")?;
        return Ok((dir, vec![PathBuf::from(name)]));
    }

    let (dir, glob_part) = if pattern_path.is_dir() {
        (pattern_path.to_path_buf(), "*".to_string())
    } else {
        let dir = pattern_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let name = pattern_path
            .file_name()
            .context("empty input pattern")?
            .to_string_lossy()
            .into_owned();
        (dir, name)
    };

    let matcher = globset::Glob::new(&glob_part)
        .with_context(|| format!("invalid input pattern {glob_part:?}"))?
        .compile_matcher();

    let mut files = Vec::new();
    collect_files(&dir, Path::new(""), &matcher, recursive, &mut files)
        .with_context(|| format!("cannot list {dir:?}"))?;
    files.sort();
    Ok((dir, files))
}

fn collect_files(
    base: &Path,
    relative: &Path,
    matcher: &globset::GlobMatcher,
    recursive: bool,
    out: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(base.join(relative))? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let child = relative.join(entry.file_name());
        if file_type.is_dir() {
            if recursive {
                collect_files(base, &child, matcher, recursive, out)?;
            }
        } else if file_type.is_file() && matcher.is_match(entry.file_name()) {
            out.push(child);
        }
    }
    Ok(())
}

/// Sends every file selected by `req` over dedicated file fibers, bounded by
/// `max_parallel`, then reports `CopyFinished` on the control fiber.
pub async fn send_files(
    demux: &Demux,
    control_writer: &mut FiberWriteHalf,
    req: &CopyRequest,
) -> CopySummary {
    let mut summary = if req.is_from_stdin {
        send_stdin(demux, req).await
    } else {
        send_file_list(demux, req).await
    };

    let finished = CopyFinished {
        files_count: summary.files_count,
        errors_count: summary.errors_count,
        error_code: summary.error_code,
    };
    match Packet::from_msg(PacketType::CopyFinished, &finished) {
        Ok(packet) => {
            if let Err(e) = packet.write_to(control_writer).await {
                tracing::debug!("cannot send copy finished notification: {}", e);
                summary.error_code = ErrorCode::NetworkError;
            }
        }
        Err(e) => tracing::debug!("cannot encode copy finished notification: {}", e),
    }
    summary
}

async fn send_stdin(demux: &Demux, req: &CopyRequest) -> CopySummary {
    let output_path = Path::new(&req.output_pattern);
    let output_dir = output_path.parent().unwrap_or(Path::new("."));
    let output_filename = output_path.file_name().map(PathBuf::from).unwrap_or_default();

    let ctx = CopyContext::for_stdin(output_dir, &output_filename);
    let code = match demux.connect(FILE_ACCEPTOR_PORT).await {
        Ok(fiber) => session::run_session(fiber, ctx, SenderState::SendInitRequest)
            .await
            .1,
        Err(e) => {
            tracing::debug!("cannot connect file fiber for stdin: {}", e);
            ErrorCode::NetworkError
        }
    };
    CopySummary {
        files_count: 1,
        errors_count: u64::from(!code.is_success()),
        error_code: code,
    }
}

async fn send_file_list(demux: &Demux, req: &CopyRequest) -> CopySummary {
    let (input_dir, files) = match list_input_files(&req.input_pattern, req.is_recursive) {
        Ok(listed) => listed,
        Err(e) => {
            tracing::error!("cannot list input files: {:#}", e);
            return CopySummary {
                files_count: 0,
                errors_count: 0,
                error_code: ErrorCode::SenderInputFileListingFailed,
            };
        }
    };
    if files.is_empty() {
        return CopySummary {
            files_count: 0,
            errors_count: 0,
            error_code: ErrorCode::Success,
        };
    }

    // single exact file: the output pattern names the file, not a directory
    let single_exact = Path::new(&req.input_pattern).is_file();
    let output_pattern = Path::new(&req.output_pattern).to_path_buf();

    let files_count = files.len() as u64;
    let semaphore = Arc::new(Semaphore::new(req.max_parallel.max(1) as usize));
    let mut sessions = tokio::task::JoinSet::new();
    for relative in files {
        let demux = demux.clone();
        let semaphore = semaphore.clone();
        let input_dir = input_dir.clone();
        let output_pattern = output_pattern.clone();
        let check_integrity = req.check_integrity;
        let resume = req.is_resume;
        sessions.spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            let (output_dir, output_filename) = if single_exact {
                (
                    output_pattern
                        .parent()
                        .unwrap_or(Path::new("."))
                        .to_path_buf(),
                    output_pattern
                        .file_name()
                        .map(PathBuf::from)
                        .unwrap_or_default(),
                )
            } else {
                (output_pattern.clone(), relative.clone())
            };
            let ctx = CopyContext::for_file(
                &input_dir,
                &relative,
                check_integrity,
                resume,
                &output_dir,
                &output_filename,
            )
            .await;
            let code = match demux.connect(FILE_ACCEPTOR_PORT).await {
                Ok(fiber) => {
                    tracing::debug!("sending {:?}", input_dir.join(&relative));
                    session::run_session(fiber, ctx, SenderState::SendInitRequest)
                        .await
                        .1
                }
                Err(e) => {
                    tracing::debug!("cannot connect file fiber: {}", e);
                    ErrorCode::NetworkError
                }
            };
            (relative, code)
        });
    }

    let mut errors_count = 0u64;
    let mut last_error = ErrorCode::Success;
    while let Some(joined) = sessions.join_next().await {
        match joined {
            Ok((relative, code)) => {
                if code.is_success() {
                    tracing::info!("copied {:?}", relative);
                } else {
                    tracing::warn!("copy of {:?} failed: {}", relative, code);
                    errors_count += 1;
                    last_error = code;
                }
            }
            Err(e) => {
                tracing::warn!("copy session panicked: {}", e);
                errors_count += 1;
                last_error = ErrorCode::Unknown;
            }
        }
    }

    let error_code = rollup(files_count, errors_count, last_error);
    CopySummary {
        files_count,
        errors_count,
        error_code,
    }
}

/// `CopyFinished` outcome: a lone transfer reports its own code, otherwise
/// partial and total failures get their aggregate codes.
fn rollup(files_count: u64, errors_count: u64, last_error: ErrorCode) -> ErrorCode {
    if errors_count == 0 {
        ErrorCode::Success
    } else if files_count == 1 {
        last_error
    } else if errors_count == files_count {
        ErrorCode::NoFileCopied
    } else {
        ErrorCode::FilesPartiallyCopied
    }
}
