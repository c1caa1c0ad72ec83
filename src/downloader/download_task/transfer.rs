//! Single download attempt: request, stream to a `.part` file, verify, rename.

use super::context::TaskContext;
use crate::error::FetchError;
use crate::retry::parse_retry_after;
use crate::types::{EntryId, Event};
use crate::utils::part_path;
use chrono::Utc;
use futures::StreamExt;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use url::Url;

/// Byte counts of the attempt currently running
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct AttemptProgress {
    /// Bytes written to the `.part` file so far
    pub(super) bytes_written: u64,
    /// Declared Content-Length
    pub(super) total_bytes: Option<u64>,
}

/// Reject URLs that cannot be requested before touching the network
pub(super) fn parse_target_url(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url.trim()).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(FetchError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }
    Ok(parsed)
}

/// Fetch `url` into `destination`
///
/// The body is written to `<destination>.part` in slices of at most `chunk_size` bytes and
/// renamed over `destination` only after the whole body arrived. Returns the byte count.
pub(super) async fn transfer(
    ctx: &TaskContext,
    id: EntryId,
    url: &str,
    destination: &Path,
    progress: &mut AttemptProgress,
) -> Result<u64, FetchError> {
    *progress = AttemptProgress::default();
    let url = parse_target_url(url)?;

    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| FetchError::filesystem(parent, e))?;
    }

    let response = tokio::time::timeout(ctx.timeout, ctx.client.get(url).send())
        .await
        .map_err(|_| FetchError::Stalled {
            timeout: ctx.timeout,
        })??;

    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        return Err(FetchError::Status {
            status: status.as_u16(),
            retry_after,
        });
    }

    progress.total_bytes = response.content_length();

    let part = part_path(destination);
    let mut file = tokio::fs::File::create(&part)
        .await
        .map_err(|e| FetchError::filesystem(&part, e))?;

    let mut body = response.bytes_stream();
    loop {
        let next = tokio::time::timeout(ctx.timeout, body.next())
            .await
            .map_err(|_| FetchError::Stalled {
                timeout: ctx.timeout,
            })?;
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk?;

        for piece in chunk.chunks(ctx.chunk_size) {
            file.write_all(piece)
                .await
                .map_err(|e| FetchError::filesystem(&part, e))?;
            progress.bytes_written += piece.len() as u64;
            ctx.progress.add_bytes(piece.len() as u64);
        }

        ctx.emit(Event::Progress {
            id,
            bytes_written: progress.bytes_written,
            total_bytes: progress.total_bytes,
        });
    }

    file.flush()
        .await
        .map_err(|e| FetchError::filesystem(&part, e))?;
    drop(file);

    if let Some(expected) = progress.total_bytes
        && expected != progress.bytes_written
    {
        return Err(FetchError::Truncated {
            received: progress.bytes_written,
            expected,
        });
    }

    tokio::fs::rename(&part, destination)
        .await
        .map_err(|e| FetchError::filesystem(destination, e))?;

    Ok(progress.bytes_written)
}

/// Remove the `.part` file of `destination`, if any
pub(super) async fn remove_partial(destination: &Path) {
    let part = part_path(destination);
    match tokio::fs::remove_file(&part).await {
        Ok(()) => tracing::debug!(path = %part.display(), "Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %part.display(), error = %e, "Failed to remove partial file")
        }
    }
}
