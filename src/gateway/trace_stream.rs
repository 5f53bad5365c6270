// SPDX-License-Identifier: MIT
//! GET /_inspector/trace/{session_id}
//!
//! Serves the session's gzipped JSONL trace. Without a `Range` header the
//! raw gzip bytes stream out in 1 MiB chunks; with `Range: bytes=a-b` the
//! file is decompressed on the fly and the uncompressed slice is served as
//! a 206. The resolved path must stay inside the traces directory; any
//! escape is indistinguishable from a missing trace.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use axum::body::{Body, Bytes};
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use flate2::read::MultiGzDecoder;
use futures_util::stream;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::ApiError;
use crate::sessions::valid_session_id;
use crate::InspectorContext;

const STREAM_CHUNK: usize = 1024 * 1024;
const DECODE_CHUNK: usize = 64 * 1024;

static RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^bytes=(\d+)-(\d*)$").expect("range regex"));

pub async fn trace(
    State(ctx): State<Arc<InspectorContext>>,
    UrlPath(session_id): UrlPath<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    // The router URL-decodes the path parameter before it reaches us, so
    // encoded traversal attempts are already in their dangerous form here
    // and fail the pattern check.
    if !valid_session_id(&session_id) {
        return Err(ApiError::NotFound);
    }

    let path = resolve_trace_path(&ctx.config.traces_dir, &session_id)?;

    let meta = std::fs::metadata(&path).map_err(|_| ApiError::NotFound)?;
    let etag = etag_for(&meta);

    if let Some(if_none_match) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok())
    {
        if if_none_match == etag {
            return Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(header::ETAG, &etag)
                .body(Body::empty())
                .map_err(|e| ApiError::Internal(e.to_string()));
        }
    }

    match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(range) => serve_range(&path, range, &etag).await,
        None => serve_full(&path, meta.len(), &etag).await,
    }
}

/// Join, resolve symlinks, and require containment in the traces dir.
/// Every failure is a 404, never a 403, so filenames cannot be enumerated.
fn resolve_trace_path(traces_dir: &Path, session_id: &str) -> Result<PathBuf, ApiError> {
    let dir = traces_dir.canonicalize().map_err(|_| ApiError::NotFound)?;
    let resolved = dir
        .join(format!("{session_id}.jsonl.gz"))
        .canonicalize()
        .map_err(|_| ApiError::NotFound)?;
    if !resolved.starts_with(&dir) {
        debug!(path = %resolved.display(), "trace path escaped traces dir");
        return Err(ApiError::NotFound);
    }
    Ok(resolved)
}

/// `"<size>-<mtime_ns>"`, quoted as a strong validator.
fn etag_for(meta: &std::fs::Metadata) -> String {
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("\"{}-{}\"", meta.len(), mtime_ns)
}

/// Stream the stored gzip bytes untouched, 1 MiB at a time.
async fn serve_full(path: &Path, size: u64, etag: &str) -> Result<Response, ApiError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|_| ApiError::NotFound)?;

    let body = Body::from_stream(stream::unfold(file, |mut file| async move {
        let mut buf = vec![0u8; STREAM_CHUNK];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok::<_, std::io::Error>(Bytes::from(buf)), file))
            }
            Err(e) => Some((Err(e), file)),
        }
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-jsonlines+gzip")
        .header(header::CONTENT_ENCODING, "gzip")
        .header(header::CONTENT_LENGTH, size)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ETAG, etag)
        .body(body)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Decompress on the fly and serve the requested uncompressed slice.
async fn serve_range(path: &Path, range: &str, etag: &str) -> Result<Response, ApiError> {
    let captures = RANGE_RE
        .captures(range)
        .ok_or_else(|| ApiError::Validation(format!("invalid Range header: {range}")))?;
    let start: u64 = captures[1]
        .parse()
        .map_err(|_| ApiError::Validation("invalid Range start".to_string()))?;
    let end: Option<u64> = match &captures[2] {
        "" => None,
        digits => Some(
            digits
                .parse()
                .map_err(|_| ApiError::Validation("invalid Range end".to_string()))?,
        ),
    };
    if let Some(end) = end {
        if end < start {
            return Err(ApiError::Validation("Range end precedes start".to_string()));
        }
    }

    let path = path.to_path_buf();
    let (total, slice) =
        tokio::task::spawn_blocking(move || read_decompressed_range(&path, start, end))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .map_err(|e| ApiError::Internal(e.to_string()))?;

    if start >= total {
        return Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{total}"))
            .body(Body::empty())
            .map_err(|e| ApiError::Internal(e.to_string()));
    }

    let last = end.map_or(total - 1, |e| e.min(total - 1));
    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_TYPE, "application/x-jsonlines")
        .header(header::CONTENT_RANGE, format!("bytes {start}-{last}/{total}"))
        .header(header::CONTENT_LENGTH, slice.len())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ETAG, etag)
        .body(Body::from(slice))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Stream-decompress the file, discarding outside `[start, end]` (both in
/// decompressed coordinates, `end` inclusive) at chunk granularity, while
/// counting the total uncompressed size for `Content-Range`.
fn read_decompressed_range(
    path: &Path,
    start: u64,
    end: Option<u64>,
) -> std::io::Result<(u64, Vec<u8>)> {
    let file = std::fs::File::open(path)?;
    let mut decoder = MultiGzDecoder::new(std::io::BufReader::new(file));

    let mut total = 0u64;
    let mut out = Vec::new();
    let mut buf = vec![0u8; DECODE_CHUNK];
    loop {
        let n = decoder.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let chunk_start = total;
        let chunk_end = total + n as u64; // exclusive
        total = chunk_end;

        let want_start = start.max(chunk_start);
        let want_end = match end {
            Some(e) => (e + 1).min(chunk_end),
            None => chunk_end,
        };
        if want_start < want_end {
            let from = (want_start - chunk_start) as usize;
            let to = (want_end - chunk_start) as usize;
            out.extend_from_slice(&buf[from..to]);
        }
    }
    Ok((total, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn write_gz(path: &Path, content: &[u8]) {
        let file = std::fs::File::create(path).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(content).unwrap();
        enc.finish().unwrap();
    }

    #[test]
    fn range_regex_accepts_open_and_closed() {
        assert!(RANGE_RE.is_match("bytes=0-499"));
        assert!(RANGE_RE.is_match("bytes=200-"));
        assert!(!RANGE_RE.is_match("bytes=-500"));
        assert!(!RANGE_RE.is_match("lines=0-4"));
    }

    #[test]
    fn decompressed_range_slices_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl.gz");
        let content: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        write_gz(&path, &content);

        let (total, slice) = read_decompressed_range(&path, 200, Some(399)).unwrap();
        assert_eq!(total, 5000);
        assert_eq!(slice, &content[200..=399]);
    }

    #[test]
    fn single_byte_range_at_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl.gz");
        let content = b"0123456789".to_vec();
        write_gz(&path, &content);

        let (total, slice) = read_decompressed_range(&path, 9, Some(9)).unwrap();
        assert_eq!(total, 10);
        assert_eq!(slice, b"9");
    }

    #[test]
    fn open_ended_range_runs_to_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl.gz");
        write_gz(&path, b"hello world");

        let (total, slice) = read_decompressed_range(&path, 6, None).unwrap();
        assert_eq!(total, 11);
        assert_eq!(slice, b"world");
    }

    #[test]
    fn multi_member_gzip_decodes_across_appends() {
        // Append-mode writers produce concatenated gzip members.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl.gz");
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut enc = GzEncoder::new(file, Compression::default());
            enc.write_all(b"first|").unwrap();
            enc.finish().unwrap();
        }
        {
            let file = std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .unwrap();
            let mut enc = GzEncoder::new(file, Compression::default());
            enc.write_all(b"second").unwrap();
            enc.finish().unwrap();
        }

        let (total, slice) = read_decompressed_range(&path, 0, None).unwrap();
        assert_eq!(total, 12);
        assert_eq!(slice, b"first|second");
    }
}
