//! Export client: submit, poll, download and reassemble.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_LOCATION, HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::BulkExportConfig;
use crate::download::{DownloadReport, FailedDownload, download_all};
use crate::error::{BulkError, Result};
use crate::manifest::{FileListing, Manifest};
use crate::reassemble::{ReassemblyReport, reassemble};

const POLL_STATUS_MARKER: &str = "$export-poll-status";

/// Lifecycle of one export run, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Idle,
    Submitted,
    Polling,
    Ready,
    Downloading,
    Reassembling,
    Done,
    Failed,
}

impl fmt::Display for ExportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Submitted => "submitted",
            Self::Polling => "polling",
            Self::Ready => "ready",
            Self::Downloading => "downloading",
            Self::Reassembling => "reassembling",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Requests and waits spent polling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub attempts: u32,
    pub waits: Vec<Duration>,
}

/// Result of a completed export run.
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub poll_url: String,
    pub output: PathBuf,
    pub listings: Vec<FileListing>,
    pub staged: Vec<PathBuf>,
    pub failed: Vec<FailedDownload>,
    pub lines_written: u64,
    pub lines_rejected: u64,
    pub poll: PollReport,
}

/// Client for the FHIR Bulk Data `$export` flow.
#[derive(Clone)]
pub struct BulkExportClient {
    http: Client,
    config: Arc<BulkExportConfig>,
    token: Option<String>,
    state: Arc<watch::Sender<ExportState>>,
}

impl fmt::Debug for BulkExportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkExportClient")
            .field("config", &self.config)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl BulkExportClient {
    pub fn new(config: BulkExportConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .build()?;
        let (tx, _) = watch::channel(ExportState::Idle);
        Ok(Self {
            http,
            config: Arc::new(config),
            token: None,
            state: Arc::new(tx),
        })
    }

    /// Sends `Authorization: Bearer <token>` with every request.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn config(&self) -> &BulkExportConfig {
        &self.config
    }

    pub fn state(&self) -> ExportState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExportState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ExportState) {
        let prev = self.state.send_replace(next);
        info!(from = %prev, to = %next, "Export state changed");
    }

    pub(crate) fn request(&self, url: &str) -> RequestBuilder {
        let builder = self
            .http
            .get(url)
            .header(ACCEPT, self.config.accept_header.as_str());
        match &self.token {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        }
    }

    /// A request to the export API itself, bounded by `request_timeout_secs`.
    fn api_request(&self, url: &str) -> RequestBuilder {
        self.request(url)
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
    }

    /// Runs the whole export against `url`.
    ///
    /// A URL containing `$export-poll-status` is treated as an already
    /// submitted export and polled directly.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, url: &str, cancel: CancellationToken) -> Result<ExportOutcome> {
        let result = self.run_inner(url, &cancel).await;
        match &result {
            Ok(outcome) => {
                self.transition(ExportState::Done);
                info!(
                    output = %outcome.output.display(),
                    files = outcome.staged.len(),
                    failed = outcome.failed.len(),
                    lines = outcome.lines_written,
                    "Export finished"
                );
            }
            Err(e) => {
                self.transition(ExportState::Failed);
                warn!(error = %e, "Export failed");
            }
        }
        result
    }

    async fn run_inner(&self, url: &str, cancel: &CancellationToken) -> Result<ExportOutcome> {
        let poll_url = if url.contains(POLL_STATUS_MARKER) {
            debug!(url, "Skipping submission for poll-status URL");
            url.to_string()
        } else {
            self.submit(url).await?
        };
        self.transition(ExportState::Submitted);

        let (manifest, poll) = self.poll(&poll_url, cancel).await?;
        self.transition(ExportState::Ready);
        info!(
            files = manifest.output.len(),
            errors = manifest.error.len(),
            "Export manifest received"
        );

        if cancel.is_cancelled() {
            return Err(BulkError::Cancelled);
        }
        self.transition(ExportState::Downloading);
        let DownloadReport { staged, failed } =
            download_all(self, &manifest.output, cancel).await?;
        if cancel.is_cancelled() {
            return Err(BulkError::Cancelled);
        }

        self.transition(ExportState::Reassembling);
        let output = self.config.output_file();
        let files = staged.clone();
        let target = output.clone();
        let batch_size = self.config.reassembly_batch_size;
        let ReassemblyReport {
            lines_written,
            lines_rejected,
            ..
        } = tokio::task::spawn_blocking(move || {
            reassemble(files.as_slice(), &target, batch_size)
        })
        .await
        .map_err(|e| BulkError::io(&output, std::io::Error::other(e)))??;

        Ok(ExportOutcome {
            poll_url,
            output,
            listings: manifest.output,
            staged,
            failed,
            lines_written,
            lines_rejected,
            poll,
        })
    }

    /// Kicks off the export and returns the poll URL from `Content-Location`.
    pub async fn submit(&self, url: &str) -> Result<String> {
        let response = self
            .api_request(url)
            .header("Prefer", "respond-async")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BulkError::Status {
                url: url.to_string(),
                status,
            });
        }

        let location = response
            .headers()
            .get(CONTENT_LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(BulkError::MissingContentLocation)?;
        let poll_url = resolve(url, location)?;
        info!(%status, poll_url = %poll_url, "Export submitted");
        Ok(poll_url)
    }

    /// Polls until the manifest is available.
    ///
    /// Each `202` waits `Retry-After * attempt`; any other answer backs off by
    /// `error_backoff * attempt`. Gives up after `max_retries` attempts.
    pub async fn poll(
        &self,
        poll_url: &str,
        cancel: &CancellationToken,
    ) -> Result<(Manifest, PollReport)> {
        self.transition(ExportState::Polling);
        let mut report = PollReport::default();

        loop {
            if cancel.is_cancelled() {
                return Err(BulkError::Cancelled);
            }
            report.attempts += 1;
            let attempt = report.attempts;

            let wait_secs = match self.api_request(poll_url).send().await {
                Ok(response) if response.status() == StatusCode::OK => {
                    let body = response.text().await?;
                    return Ok((Manifest::parse(&body)?, report));
                }
                Ok(response) if response.status() == StatusCode::ACCEPTED => {
                    let progress = response
                        .headers()
                        .get("X-Progress")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let retry_after = retry_after_secs(response.headers(), SystemTime::now())
                        .unwrap_or(self.config.default_retry_after_secs);
                    debug!(attempt, retry_after, progress = %progress, "Export still in progress");
                    retry_after.saturating_mul(u64::from(attempt))
                }
                Ok(response) => {
                    warn!(attempt, status = %response.status(), "Unexpected poll status");
                    self.config.error_backoff_secs.saturating_mul(u64::from(attempt))
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Poll request failed");
                    self.config.error_backoff_secs.saturating_mul(u64::from(attempt))
                }
            };

            if attempt >= self.config.max_retries {
                return Err(BulkError::PollExhausted { attempts: attempt });
            }

            let wait = self.config.scaled(wait_secs);
            report.waits.push(wait);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(BulkError::Cancelled),
            }
        }
    }
}

fn resolve(base: &str, location: &str) -> Result<String> {
    let invalid = |e: url::ParseError| BulkError::InvalidUrl {
        url: location.to_string(),
        message: e.to_string(),
    };
    match Url::parse(location) {
        Ok(url) => Ok(url.into()),
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(base)
            .and_then(|b| b.join(location))
            .map(Into::into)
            .map_err(invalid),
        Err(e) => Err(invalid(e)),
    }
}

/// `Retry-After` as seconds: delta-seconds or an HTTP-date relative to `now`.
pub(crate) fn retry_after_secs(headers: &HeaderMap, now: SystemTime) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(now).map(|d| d.as_secs()).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(retry_after: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(RETRY_AFTER, HeaderValue::from_str(retry_after).unwrap());
        h
    }

    #[test]
    fn test_retry_after_delta_seconds() {
        let now = SystemTime::now();
        assert_eq!(retry_after_secs(&headers("10"), now), Some(10));
        assert_eq!(retry_after_secs(&headers(" 7 "), now), Some(7));
        assert_eq!(retry_after_secs(&headers("soon"), now), None);
        assert_eq!(retry_after_secs(&HeaderMap::new(), now), None);
    }

    #[test]
    fn test_retry_after_http_date() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let later = httpdate::fmt_http_date(now + Duration::from_secs(30));
        assert_eq!(retry_after_secs(&headers(&later), now), Some(30));

        let past = httpdate::fmt_http_date(now - Duration::from_secs(30));
        assert_eq!(retry_after_secs(&headers(&past), now), Some(0));
    }

    #[test]
    fn test_resolve_content_location() {
        assert_eq!(
            resolve("https://x/fhir/$export", "https://y/poll/1").unwrap(),
            "https://y/poll/1"
        );
        assert_eq!(
            resolve("https://x/fhir/$export", "/poll/1").unwrap(),
            "https://x/poll/1"
        );
    }

    #[test]
    fn test_debug_hides_token() {
        let client = BulkExportClient::new(BulkExportConfig::default())
            .unwrap()
            .with_token("secret");
        let debug = format!("{client:?}");
        assert!(!debug.contains("secret"));
        assert_eq!(client.state(), ExportState::Idle);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ExportState::Reassembling.to_string(), "reassembling");
        assert_eq!(ExportState::Failed.to_string(), "failed");
    }
}
