//! Direct HTTP download of source audio
//!
//! For sources whose URL already points at a media file. The body is streamed
//! to disk in the caller's staging directory.

use crate::error::RetrievalError;
use crate::services::retrieval_worker::AudioFetcher;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Client for plain HTTP(S) media downloads
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a new fetcher
    ///
    /// # Arguments
    /// * `user_agent` - Sent with every request
    /// * `timeout` - Whole-request timeout (connect + body)
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, RetrievalError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RetrievalError::ToolUnavailable(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self { client })
    }
}

/// Map an HTTP status onto the retrieval taxonomy
pub fn classify_status(status: StatusCode, url: &str) -> Option<RetrievalError> {
    if status.is_success() {
        return None;
    }
    let message = format!("{} returned {}", url, status);
    Some(match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => RetrievalError::SourceUnavailable(message),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            RetrievalError::Transient(message)
        }
        s if s.is_server_error() => RetrievalError::Transient(message),
        _ => RetrievalError::SourceUnavailable(message),
    })
}

fn classify_request_error(e: reqwest::Error) -> RetrievalError {
    if e.is_timeout() {
        RetrievalError::Transient(format!("Request timed out: {}", e))
    } else {
        RetrievalError::Transient(format!("Request failed: {}", e))
    }
}

/// Output name in the staging dir, keeping the URL's extension as a decoder hint
fn staging_file_name(url: &reqwest::Url) -> String {
    let ext = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|last| Path::new(last).extension())
        .and_then(|e| e.to_str())
        .filter(|e| e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("bin");
    format!("source.{}", ext)
}

#[async_trait]
impl AudioFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, staging_dir: &Path) -> Result<PathBuf, RetrievalError> {
        let parsed =
            reqwest::Url::parse(url).map_err(|e| RetrievalError::InvalidUrl(format!("{}: {}", url, e)))?;
        let dest = staging_dir.join(staging_file_name(&parsed));

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(classify_request_error)?;

        if let Some(error) = classify_status(response.status(), url) {
            return Err(error);
        }

        let mut file = tokio::fs::File::create(&dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify_request_error)?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(url, bytes = written, dest = %dest.display(), "HTTP fetch complete");
        Ok(dest)
    }

    async fn health_check(&self) -> Result<(), RetrievalError> {
        Ok(())
    }
}
