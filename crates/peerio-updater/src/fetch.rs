//! Hardened HTTPS fetching.
//!
//! The fetcher owns every network policy the pipeline depends on: https is
//! mandatory (including across redirects), redirects are followed by hand
//! under a hard cap, transient failures retry with exponential backoff,
//! responses can be gated on `Content-Type`, and the text sink enforces a
//! size budget. Automatic redirect handling in the HTTP client is disabled
//! so none of this is delegated.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, LINK, LOCATION};
use reqwest::{Response, StatusCode, Url};
use tokio::io::AsyncWriteExt;

use crate::error::UpdateError;

/// Retries after the initial attempt for transient failures.
pub const MAX_RETRIES: u32 = 3;

/// Maximum redirects followed for one logical fetch.
pub const MAX_REDIRECTS: u32 = 10;

/// Idle-socket timeout for connects and reads.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Text sink budget, counted in UTF-16 code units.
pub const MAX_TEXT_LENGTH: usize = 3 * 1024 * 1024;

/// Base delay for exponential backoff; attempt `n` waits `100 * 2^n` ms.
const BACKOFF_BASE_MS: u64 = 100;

/// User agent sent with every request.
pub const USER_AGENT: &str = "peerio-updater/1.0";

/// HTTPS fetcher with manual redirect handling and retry policy.
///
/// Stateless between requests; cheap to share behind the controller.
pub struct Fetcher {
    client: reqwest::Client,
    allow_http_loopback: bool,
}

impl Fetcher {
    /// Create a fetcher with the production policy: https only.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Test-only fetcher that additionally accepts plain http to loopback
    /// addresses, so policy tests can run against a local stub server.
    /// Non-loopback http is still refused, redirects included.
    #[cfg(test)]
    pub(crate) fn allowing_http_loopback() -> Self {
        Self::build(true)
    }

    fn build(allow_http_loopback: bool) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(REQUEST_TIMEOUT)
            .read_timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .expect("failed to create HTTP client");

        Self {
            client,
            allow_http_loopback,
        }
    }

    /// Issue a GET, following redirects and retrying transient failures.
    ///
    /// Policy, in order:
    /// - the initial URL and every redirect target must be https
    ///   ([`UpdateError::UnsafeRedirect`] otherwise);
    /// - 404 fails immediately with [`UpdateError::NotFound`], no retry;
    /// - 3xx with a `Location` header is followed, resolving relative
    ///   targets, up to [`MAX_REDIRECTS`] ([`UpdateError::TooManyRedirects`]
    ///   past the cap); the retry counter survives redirects;
    /// - any other non-200 status, transport error or timeout retries up to
    ///   [`MAX_RETRIES`] times with exponential backoff;
    /// - on 200, when `expected_content_type` is given, the response
    ///   `Content-Type` (parameters stripped) must match it exactly.
    ///
    /// Returns the streaming response; the caller must drain it.
    pub async fn get(
        &self,
        url: &str,
        expected_content_type: Option<&str>,
    ) -> Result<Response, UpdateError> {
        let mut current = Url::parse(url)
            .map_err(|e| UpdateError::RequestFailed(format!("invalid URL {url}: {e}")))?;
        self.ensure_safe_scheme(&current)?;

        let mut redirects = 0u32;
        let mut attempt = 0u32;

        loop {
            tracing::debug!(url = %current, attempt, redirects, "GET");
            let result = self.client.get(current.clone()).send().await;

            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    let err = UpdateError::from(err);
                    if attempt >= MAX_RETRIES {
                        return Err(err);
                    }
                    tracing::warn!(url = %current, attempt, error = %err, "request failed, retrying");
                    backoff(attempt).await;
                    attempt += 1;
                    continue;
                }
            };

            let status = response.status();

            if status == StatusCode::NOT_FOUND {
                return Err(UpdateError::NotFound {
                    url: current.to_string(),
                });
            }

            if status.is_redirection() {
                if let Some(location) =
                    response.headers().get(LOCATION).and_then(|v| v.to_str().ok())
                {
                    let next = current.join(location).map_err(|e| {
                        UpdateError::RequestFailed(format!("invalid redirect target {location}: {e}"))
                    })?;
                    redirects += 1;
                    if redirects > MAX_REDIRECTS {
                        return Err(UpdateError::TooManyRedirects {
                            url: url.to_string(),
                        });
                    }
                    self.ensure_safe_scheme(&next)?;
                    tracing::debug!(from = %current, to = %next, redirects, "following redirect");
                    current = next;
                    continue;
                }
                // A redirect status without a target is treated as transient.
            }

            if status == StatusCode::OK {
                if let Some(expected) = expected_content_type {
                    let actual = response
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(strip_parameters)
                        .unwrap_or("");
                    if actual != expected {
                        return Err(UpdateError::UnexpectedContentType {
                            expected: expected.to_string(),
                            actual: actual.to_string(),
                        });
                    }
                }
                return Ok(response);
            }

            if attempt >= MAX_RETRIES {
                return Err(UpdateError::RequestFailed(format!(
                    "HTTP {status} from {current}"
                )));
            }
            tracing::warn!(url = %current, %status, attempt, "unexpected status, retrying");
            backoff(attempt).await;
            attempt += 1;
        }
    }

    /// Fetch a text body, optionally gated on `Content-Type`.
    ///
    /// Fails with [`UpdateError::ResponseTooLarge`] once the accumulated
    /// text exceeds [`MAX_TEXT_LENGTH`] UTF-16 code units.
    pub async fn fetch_text(
        &self,
        url: &str,
        expected_content_type: Option<&str>,
    ) -> Result<String, UpdateError> {
        let response = self.get(url, expected_content_type).await?;
        read_text(response).await
    }

    /// Fetch and parse a JSON body (`Content-Type: application/json`).
    pub async fn fetch_json(&self, url: &str) -> Result<serde_json::Value, UpdateError> {
        let text = self.fetch_text(url, Some("application/json")).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Fetch a paginated JSON array, following `Link: rel="next"` headers.
    ///
    /// Every page must be a JSON array; the pages are concatenated in
    /// fetch order. Terminates when a page carries no `next` link.
    pub async fn fetch_json_pages(
        &self,
        url: &str,
    ) -> Result<Vec<serde_json::Value>, UpdateError> {
        let mut items = Vec::new();
        let mut next = Some(url.to_string());

        while let Some(page_url) = next {
            let response = self.get(&page_url, Some("application/json")).await?;
            let base = response.url().clone();
            let link_header = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);

            let text = read_text(response).await?;
            let page: serde_json::Value = serde_json::from_str(&text)?;
            let serde_json::Value::Array(page_items) = page else {
                return Err(UpdateError::RequestFailed(format!(
                    "paginated response from {page_url} is not a JSON array"
                )));
            };
            items.extend(page_items);

            next = link_header
                .as_deref()
                .and_then(next_link)
                .and_then(|target| base.join(&target).ok())
                .map(|u| u.to_string());
        }

        Ok(items)
    }

    /// Stream a response body to `dest`.
    ///
    /// On any error the partially written file is closed and removed
    /// (best-effort) before the error propagates. A retried file fetch
    /// always starts the destination from scratch; partial downloads are
    /// never resumed.
    pub async fn fetch_file(&self, url: &str, dest: &Path) -> Result<PathBuf, UpdateError> {
        let response = self.get(url, None).await?;

        match stream_to_file(response, dest).await {
            Ok(bytes) => {
                tracing::info!(url, path = %dest.display(), bytes, "download complete");
                Ok(dest.to_path_buf())
            }
            Err(err) => {
                if let Err(unlink_err) = tokio::fs::remove_file(dest).await {
                    tracing::debug!(
                        path = %dest.display(),
                        error = %unlink_err,
                        "could not remove partial download"
                    );
                }
                Err(err)
            }
        }
    }

    fn ensure_safe_scheme(&self, url: &Url) -> Result<(), UpdateError> {
        if url.scheme() == "https" {
            return Ok(());
        }
        if self.allow_http_loopback && url.scheme() == "http" {
            let loopback = matches!(url.host_str(), Some("127.0.0.1" | "localhost" | "[::1]"));
            if loopback {
                return Ok(());
            }
        }
        Err(UpdateError::UnsafeRedirect {
            url: url.to_string(),
        })
    }
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep for the backoff delay of retry `attempt` (0-based).
async fn backoff(attempt: u32) {
    let delay = BACKOFF_BASE_MS << attempt;
    tokio::time::sleep(Duration::from_millis(delay)).await;
}

/// Strip `;`-separated parameters from a content-type value.
fn strip_parameters(value: &str) -> &str {
    value.split(';').next().unwrap_or(value).trim()
}

/// Extract the `rel="next"` target from a `Link` header.
///
/// Accepts single or double quotes around the relation and matches it
/// case-insensitively.
fn next_link(header: &str) -> Option<String> {
    for entry in header.split(',') {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        if !(target.starts_with('<') && target.ends_with('>')) {
            continue;
        }
        let url = &target[1..target.len() - 1];
        for param in parts {
            let Some((name, value)) = param.split_once('=') else {
                continue;
            };
            if !name.trim().eq_ignore_ascii_case("rel") {
                continue;
            }
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            if value.eq_ignore_ascii_case("next") {
                return Some(url.to_string());
            }
        }
    }
    None
}

/// Drain a response as UTF-8 text, enforcing the UTF-16 code unit budget
/// incrementally as chunks arrive.
async fn read_text(response: Response) -> Result<String, UpdateError> {
    let mut stream = response.bytes_stream();
    let mut text = String::new();
    let mut units = 0usize;
    let mut pending: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(UpdateError::from)?;
        pending.extend_from_slice(&chunk);

        // Decode as far as the chunk boundary allows; a trailing partial
        // UTF-8 sequence is carried into the next iteration.
        let valid = match std::str::from_utf8(&pending) {
            Ok(_) => pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => {
                return Err(UpdateError::RequestFailed(
                    "response is not valid UTF-8".to_string(),
                ))
            }
        };
        let decoded = std::str::from_utf8(&pending[..valid]).expect("validated prefix");
        units += decoded.encode_utf16().count();
        if units > MAX_TEXT_LENGTH {
            return Err(UpdateError::ResponseTooLarge {
                limit: MAX_TEXT_LENGTH,
            });
        }
        text.push_str(decoded);
        pending.drain(..valid);
    }

    if !pending.is_empty() {
        return Err(UpdateError::RequestFailed(
            "response ends mid UTF-8 sequence".to_string(),
        ));
    }
    Ok(text)
}

/// Stream a response body into a freshly created file. Returns bytes written.
async fn stream_to_file(response: Response, dest: &Path) -> Result<u64, UpdateError> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(UpdateError::from)?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.sync_all().await?;
    Ok(written)
}
