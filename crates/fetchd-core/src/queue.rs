//! Queue intake and dispatch selection

use crate::error::{EngineError, Result};
use fetchd_types::{DownloadId, DownloadRecord, DownloadRequest};
use std::path::MAIN_SEPARATOR;
use url::Url;

/// Reject requests that could never run
pub fn validate_request(request: &DownloadRequest) -> Result<()> {
    let url = Url::parse(&request.url)
        .map_err(|e| EngineError::InvalidRequest(format!("invalid url {:?}: {}", request.url, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(EngineError::InvalidRequest(format!(
            "unsupported scheme {:?}",
            url.scheme()
        )));
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(EngineError::InvalidRequest(format!("url {:?} has no host", request.url)));
    }

    let destination = request.destination.to_string_lossy();
    if destination.trim().is_empty() {
        return Err(EngineError::InvalidRequest("destination is empty".to_string()));
    }
    if destination.ends_with('/') || destination.ends_with(MAIN_SEPARATOR) || request.destination.file_name().is_none() {
        return Err(EngineError::InvalidRequest(format!(
            "destination {:?} is not a file path",
            destination
        )));
    }

    for name in request.headers.keys() {
        if name.trim().is_empty() || name.contains(':') || name.chars().any(char::is_whitespace) {
            return Err(EngineError::InvalidRequest(format!("invalid header name {:?}", name)));
        }
    }

    Ok(())
}

/// Pick up to `free` records to start.
///
/// `queued` is expected in dispatch order already. Records the network does not
/// admit, or whose previous executor call is still draining, are skipped.
pub(crate) fn select_for_dispatch<A, B>(
    queued: Vec<DownloadRecord>,
    free: usize,
    admits: A,
    busy: B,
) -> Vec<DownloadRecord>
where
    A: Fn(&DownloadRecord) -> bool,
    B: Fn(DownloadId) -> bool,
{
    queued
        .into_iter()
        .filter(|record| !busy(record.id) && admits(record))
        .take(free)
        .collect()
}
