//! Seen-lead persistence + HTTP fetch utilities for leadsync.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub use reqwest::StatusCode;

pub const CRATE_NAME: &str = "leadsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("creating store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("seen store is closed")]
    Closed,
}

/// Durable set of lead ids that earlier runs already emitted.
///
/// Backed by a single SQLite table. Every `mark` runs in autocommit mode, so it
/// is on disk before the call returns.
#[derive(Debug)]
pub struct SeenStore {
    path: PathBuf,
    conn: Option<Connection>,
}

impl SeenStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let conn = Connection::open(&path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS seen_leads(
               lead_id TEXT PRIMARY KEY
             )",
            [],
        )?;
        debug!(path = %path.display(), "opened seen store");
        Ok(Self {
            path,
            conn: Some(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn.as_ref().ok_or(StoreError::Closed)
    }

    pub fn exists(&self, lead_id: &str) -> Result<bool, StoreError> {
        let found = self
            .conn()?
            .query_row(
                "SELECT 1 FROM seen_leads WHERE lead_id = ?1",
                params![lead_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Records `lead_id` as seen. Marking an id twice is a no-op.
    pub fn mark(&self, lead_id: &str) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO seen_leads(lead_id) VALUES (?1)",
            params![lead_id],
        )?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM seen_leads", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Releases the connection. Safe to call repeatedly; failures are only logged.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_conn, err)) = conn.close() {
                warn!(path = %self.path.display(), error = %err, "closing seen store failed");
            }
        }
    }
}

impl Drop for SeenStore {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Statuses the transport retries on its own before handing a response back.
pub const RETRYABLE_STATUSES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if RETRYABLE_STATUSES.contains(&status) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Hides the `access_token` query value so URLs are safe to log or report.
pub fn redact_access_token(url: &str) -> String {
    const KEY: &str = "access_token=";
    let Some(start) = url.find(KEY) else {
        return url.to_string();
    };
    let value_start = start + KEY.len();
    let value_end = url[value_start..]
        .find('&')
        .map(|i| value_start + i)
        .unwrap_or(url.len());
    format!("{}***{}", &url[..value_start], &url[value_end..])
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// GET client with bounded retry on transient statuses and transport errors.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Issues a GET, retrying on the statuses in [`RETRYABLE_STATUSES`] and on
    /// timeout/connect errors. When retries run out on a status, the last
    /// response is returned as-is so the caller decides what it means.
    pub async fn get(
        &self,
        url: &str,
        query: Option<&[(String, String)]>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url = %redact_access_token(url));
        self.get_with_retries(url, query).instrument(span).await
    }

    async fn get_with_retries(
        &self,
        url: &str,
        query: Option<&[(String, String)]>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.get(url);
            if let Some(query) = query {
                request = request.query(query);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if !status.is_success()
                        && classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(status = status.as_u16(), attempt, ?delay, "retrying after status");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp
                        .bytes()
                        .await
                        .map_err(|err| FetchError::Request(err.without_url()))?
                        .to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        let err = err.without_url();
                        debug!(error = %err, attempt, ?delay, "retrying after transport error");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err.without_url()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn unknown_ids_are_not_seen() {
        let dir = tempdir().expect("tempdir");
        let store = SeenStore::open(dir.path().join("seen.db")).expect("open");
        assert!(!store.exists("lead-1").expect("exists"));
        assert!(store.is_empty().expect("is_empty"));
    }

    #[test]
    fn marking_twice_is_a_noop() {
        let dir = tempdir().expect("tempdir");
        let store = SeenStore::open(dir.path().join("seen.db")).expect("open");
        store.mark("lead-1").expect("first mark");
        store.mark("lead-1").expect("second mark");
        assert!(store.exists("lead-1").expect("exists"));
        assert_eq!(store.len().expect("len"), 1);
    }

    #[test]
    fn marks_survive_reopen_and_directory_is_created() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state").join("seen.db");
        {
            let mut store = SeenStore::open(&path).expect("open");
            store.mark("lead-a").expect("mark");
            store.close();
        }
        let store = SeenStore::open(&path).expect("reopen");
        assert!(store.exists("lead-a").expect("exists"));
        assert!(!store.exists("lead-b").expect("exists"));
    }

    #[test]
    fn close_is_idempotent_and_blocks_further_use() {
        let dir = tempdir().expect("tempdir");
        let mut store = SeenStore::open(dir.path().join("seen.db")).expect("open");
        store.close();
        store.close();
        assert!(matches!(store.exists("x"), Err(StoreError::Closed)));
        assert!(matches!(store.mark("x"), Err(StoreError::Closed)));
    }

    #[test]
    fn unwritable_location_fails_to_open() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").expect("write blocker");
        let err = SeenStore::open(blocker.join("seen.db")).expect_err("should fail");
        assert!(matches!(err, StoreError::CreateDir { .. }));
    }

    #[test]
    fn only_listed_statuses_are_retryable() {
        for code in [429u16, 500, 502, 503, 504] {
            let status = StatusCode::from_u16(code).expect("status");
            assert_eq!(classify_status(status), RetryDisposition::Retryable, "{code}");
        }
        for code in [400u16, 401, 404, 501, 505] {
            let status = StatusCode::from_u16(code).expect("status");
            assert_eq!(classify_status(status), RetryDisposition::NonRetryable, "{code}");
        }
    }

    #[test]
    fn default_policy_retries_three_times() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn redacts_token_wherever_it_sits_in_the_query() {
        assert_eq!(
            redact_access_token("https://g/x?access_token=abc&after=Q"),
            "https://g/x?access_token=***&after=Q"
        );
        assert_eq!(
            redact_access_token("https://g/x?after=Q&access_token=abc"),
            "https://g/x?after=Q&access_token=***"
        );
        assert_eq!(redact_access_token("https://g/x"), "https://g/x");
    }

    fn fast_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        })
        .expect("client")
    }

    /// Serves `status` on every connection and counts requests.
    async fn stub_server(status_line: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 8192];
                let mut read = 0usize;
                while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => read += n,
                    }
                }
                counter.fetch_add(1, Ordering::SeqCst);
                let response = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{{}}"
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}/v16.0/1/leads"), hits)
    }

    fn token_query() -> Vec<(String, String)> {
        vec![("access_token".to_string(), "SECRET123".to_string())]
    }

    #[tokio::test]
    async fn retryable_status_is_retried_three_times_then_returned() {
        let (url, hits) = stub_server("503 Service Unavailable").await;
        let resp = fast_fetcher()
            .get(&url, Some(token_query().as_slice()))
            .await
            .expect("final response");
        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.body, b"{}");
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn rate_limit_status_is_retried() {
        let (url, hits) = stub_server("429 Too Many Requests").await;
        let resp = fast_fetcher().get(&url, None).await.expect("final response");
        assert_eq!(resp.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn not_found_is_returned_without_retry() {
        let (url, hits) = stub_server("404 Not Found").await;
        let resp = fast_fetcher().get(&url, None).await.expect("response");
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_failure_is_retried_and_reported_without_token() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let url = format!("http://{addr}/v16.0/1/leads");
        let err = fast_fetcher()
            .get(&url, Some(token_query().as_slice()))
            .await
            .expect_err("nothing listening");
        assert!(matches!(err, FetchError::Request(_)));
        let message = err.to_string();
        assert!(!message.contains("SECRET123"), "{message}");
        assert!(!message.contains("access_token"), "{message}");
    }
}
