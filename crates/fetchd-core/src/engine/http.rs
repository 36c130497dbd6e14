//! HTTP executor - streams a URL into the destination file
//!
//! Resumes with an open-ended `Range` request from the bytes already on disk.
//! A server that answers a ranged request with the full body is treated as a
//! failure, since restarting from zero would move progress backwards.

use crate::engine::executor::{ProgressSink, TransferExecutor, TransferOutcome, TransferSpec};
use crate::error::{EngineError, TransferError};
use async_trait::async_trait;
use fetchd_types::EngineConfig;
use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::io::SeekFrom;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Executor backed by a shared `reqwest` client
#[derive(Clone, Debug)]
pub struct HttpExecutor {
    client: Client,
}

impl HttpExecutor {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TransferExecutor for HttpExecutor {
    async fn transfer(
        &self,
        spec: TransferSpec,
        progress: ProgressSink,
        stop: CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        if let Some(parent) = spec.destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        // The file may be shorter than the stored count after a crash
        let on_disk = match fs::metadata(&spec.destination).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let offset = spec.resume_offset.min(on_disk);

        let mut request = self.client.get(&spec.url);
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if offset > 0 {
            debug!("Requesting {} from byte {}", spec.id, offset);
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                return Ok(TransferOutcome::Stopped { downloaded_bytes: offset });
            }
            response = request.send() => response?,
        };

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            let total = content_range_total(&response).or(spec.total_bytes);
            if total.map(|total| offset >= total).unwrap_or(false) {
                info!("{} was already complete on disk", spec.id);
                return Ok(TransferOutcome::Completed { total_bytes: offset });
            }
        }
        if !status.is_success() {
            return Err(TransferError::failed(format!("server returned {}", status)));
        }

        let (start, total) = if status == StatusCode::PARTIAL_CONTENT {
            let total = content_range_total(&response)
                .or_else(|| response.content_length().map(|len| offset + len));
            (offset, total)
        } else if offset > 0 {
            return Err(TransferError::failed("server ignored range request"));
        } else {
            (0, response.content_length())
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&spec.destination)
            .await?;
        file.set_len(start).await?;
        file.seek(SeekFrom::Start(start)).await?;

        progress.report_now(start, total);

        let mut stream = response.bytes_stream();
        let mut downloaded = start;

        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    file.flush().await?;
                    debug!("Stopped {} at {} bytes", spec.id, downloaded);
                    return Ok(TransferOutcome::Stopped { downloaded_bytes: downloaded });
                }
                next = stream.next() => next,
            };

            let Some(chunk) = next else { break };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    file.flush().await?;
                    progress.report_now(downloaded, total);
                    // Body errors mid-stream are almost always a dropped connection
                    return Err(TransferError::network(e.to_string()));
                }
            };

            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress.report(downloaded, total);
        }

        file.flush().await?;
        file.sync_all().await?;

        if let Some(total) = total {
            if downloaded < total {
                progress.report_now(downloaded, Some(total));
                return Err(TransferError::network(format!(
                    "connection closed after {} of {} bytes",
                    downloaded, total
                )));
            }
        }

        progress.report_now(downloaded, Some(downloaded));
        info!("Transfer {} complete ({} bytes)", spec.id, downloaded);
        Ok(TransferOutcome::Completed {
            total_bytes: downloaded,
        })
    }
}

/// Total size from `Content-Range: bytes 0-99/1000`
fn content_range_total(response: &Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    let total = value.rsplit('/').next()?;
    if total == "*" {
        return None;
    }
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetchd_types::{DownloadId, ErrorKind};
    use std::collections::BTreeMap;
    use std::path::Path;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spec(url: String, destination: &Path, offset: u64) -> TransferSpec {
        TransferSpec {
            id: DownloadId::derive(&url, destination),
            url,
            destination: destination.to_path_buf(),
            headers: BTreeMap::new(),
            resume_offset: offset,
            total_bytes: None,
        }
    }

    fn executor() -> HttpExecutor {
        HttpExecutor::new(&EngineConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_full_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("nested/file.bin");
        let outcome = executor()
            .transfer(
                spec(format!("{}/file.bin", server.uri()), &dest, 0),
                ProgressSink::noop(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, TransferOutcome::Completed { total_bytes: 10 });
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_resume_with_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header("Range", "bytes=4-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 4-9/10")
                    .set_body_bytes(b"456789".to_vec()),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("file.bin");
        // Trailing garbage past the stored count gets cut off
        tokio::fs::write(&dest, b"0123XX").await.unwrap();

        let outcome = executor()
            .transfer(
                spec(format!("{}/file.bin", server.uri()), &dest, 4),
                ProgressSink::noop(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, TransferOutcome::Completed { total_bytes: 10 });
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_ignored_range_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("file.bin");
        tokio::fs::write(&dest, b"0123").await.unwrap();

        let err = executor()
            .transfer(
                spec(format!("{}/file.bin", server.uri()), &dest, 4),
                ProgressSink::noop(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransferFailed);
        // Existing bytes untouched
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"0123");
    }

    #[tokio::test]
    async fn test_http_error_is_transfer_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let err = executor()
            .transfer(
                spec(format!("{}/missing", server.uri()), &dir.path().join("m"), 0),
                ProgressSink::noop(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransferFailed);
        assert!(err.message.contains("404"));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_failure() {
        let dir = TempDir::new().unwrap();
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = executor()
            .transfer(
                spec(format!("http://127.0.0.1:{}/x", port), &dir.path().join("x"), 0),
                ProgressSink::noop(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkUnavailable);
    }

    #[tokio::test]
    async fn test_stop_before_request_keeps_offset() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("file.bin");
        tokio::fs::write(&dest, b"01234567").await.unwrap();

        let stop = CancellationToken::new();
        stop.cancel();
        let outcome = executor()
            .transfer(
                spec("http://127.0.0.1:9/never".to_string(), &dest, 8),
                ProgressSink::noop(),
                stop,
            )
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::Stopped { downloaded_bytes: 8 });
    }
}
