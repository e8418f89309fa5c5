use std::time::Duration;

use anyhow::Result;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::CacheGateway;

/// Pause after each page that had to be fetched from the network.
pub(crate) const PAGE_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HttpMethod {
    Get,
    Post,
}

/// Request envelope handed to a [`Transport`]. The path is relative to the
/// transport's base URL.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub(crate) fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub(crate) fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub(crate) fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub(crate) const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// The wire. Authentication and signing are the transport's business.
pub(crate) trait Transport: Send + Sync {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>>;
}

pub(crate) struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    headers: Vec<(String, String)>,
}

impl ReqwestTransport {
    pub(crate) fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            headers: Vec::new(),
        })
    }

    pub(crate) fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(async move {
            let url = format!("{}{}", self.base_url, request.path);
            let mut builder = match request.method {
                HttpMethod::Get => self.client.get(&url),
                HttpMethod::Post => self.client.post(&url),
            };
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            for (name, value) in &self.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            Ok(HttpResponse { status, body })
        })
    }
}

#[derive(Debug, Error)]
pub(crate) enum FetchError {
    #[error("{endpoint} [{period}]: request failed: {message}")]
    Request { endpoint: String, period: String, message: String },
    #[error("{endpoint} [{period}]: unexpected HTTP status {status}")]
    Status { endpoint: String, period: String, status: u16 },
    #[error("{endpoint} [{period}]: cannot decode response: {message}")]
    Decode { endpoint: String, period: String, message: String },
    #[error("{endpoint} [{period}]: giving up after {attempts} attempts")]
    Exhausted {
        endpoint: String,
        period: String,
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Whether another attempt could succeed.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, FetchError::Request { .. } | FetchError::Status { .. })
    }
}

/// Bounded attempts with a fixed delay in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// Cache-first page fetching with retry, shared by the API adapters.
pub(crate) struct Fetcher<'a> {
    cache: &'a CacheGateway,
    transport: &'a dyn Transport,
    retry: RetryPolicy,
    pause: Duration,
}

impl<'a> Fetcher<'a> {
    pub(crate) fn new(cache: &'a CacheGateway, transport: &'a dyn Transport, retry: RetryPolicy) -> Self {
        Self {
            cache,
            transport,
            retry,
            pause: PAGE_PAUSE,
        }
    }

    pub(crate) fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub(crate) fn cache(&self) -> &CacheGateway {
        self.cache
    }

    /// Returns the cached page for `(namespace, key)`, or fetches it with
    /// retry and caches it before returning.
    pub(crate) async fn fetch_cached<T, F>(&self, namespace: &str, key: &str, build_request: F) -> Result<T, FetchError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> HttpRequest,
    {
        if let Some(page) = self.cache.get(namespace, key) {
            return Ok(page);
        }

        let page = self.fetch(namespace, key, &build_request).await?;
        self.cache.put(namespace, key, &page);
        self.pause().await;
        Ok(page)
    }

    /// Fetches one page per window, newest window first, stopping at the
    /// first window that fails. Pages fetched before the failure stay cached.
    pub(crate) async fn fetch_windows<T, F>(&self, namespace: &str, windows: &[Window], build_request: F) -> Result<Vec<T>, FetchError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&Window) -> HttpRequest,
    {
        let mut pages = Vec::with_capacity(windows.len());
        for window in windows {
            pages.push(self.fetch_cached(namespace, &window.period, || build_request(window)).await?);
            // pages of the open quarter from earlier runs are superseded
            if let Some(quarter) = window.open_quarter() {
                self.cache.remove_stale(namespace, quarter, &window.period);
            }
        }
        Ok(pages)
    }

    /// Fetches and decodes a page, bypassing the cache.
    pub(crate) async fn fetch<T, F>(&self, endpoint: &str, period: &str, build_request: &F) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
        F: Fn() -> HttpRequest,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_once(endpoint, period, build_request()).await {
                Ok(page) => return Ok(page),
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(attempt, "{}, retrying", err);
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(err) if err.is_transient() => {
                    return Err(FetchError::Exhausted {
                        endpoint: endpoint.to_owned(),
                        period: period.to_owned(),
                        attempts,
                        last: Box::new(err),
                    })
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub(crate) async fn pause(&self) {
        if !self.pause.is_zero() {
            tokio::time::sleep(self.pause).await;
        }
    }

    async fn fetch_once<T: DeserializeOwned>(&self, endpoint: &str, period: &str, request: HttpRequest) -> Result<T, FetchError> {
        debug!(endpoint, period, path = %request.path, "fetching");
        let response = self.transport.send(request).await.map_err(|err| FetchError::Request {
            endpoint: endpoint.to_owned(),
            period: period.to_owned(),
            message: format!("{:#}", err),
        })?;

        if !response.is_success() {
            return Err(FetchError::Status {
                endpoint: endpoint.to_owned(),
                period: period.to_owned(),
                status: response.status,
            });
        }

        serde_json::from_str(&response.body).map_err(|err| FetchError::Decode {
            endpoint: endpoint.to_owned(),
            period: period.to_owned(),
            message: err.to_string(),
        })
    }
}

/// A fetch interval in UTC with its cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Window {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub period: String,
}

impl Window {
    /// The `YYYY-Qn` part of the key when the window ends before its quarter.
    pub(crate) fn open_quarter(&self) -> Option<&str> {
        self.period.rsplit_once('-').map(|(quarter, _)| quarter).filter(|quarter| quarter.contains('-'))
    }
}

fn quarter_start(year: i32, quarter: u32, tz: Tz) -> NaiveDateTime {
    let midnight = NaiveDate::from_ymd_opt(year, quarter * 3 + 1, 1)
        .expect("quarter start month is valid")
        .and_time(NaiveTime::MIN);
    tz.from_local_datetime(&midnight)
        .earliest()
        .map(|local| local.naive_utc())
        .unwrap_or(midnight)
}

/// Calendar quarters in `tz` from the one containing `open` up to `now`,
/// newest first. The current quarter ends at `now` and its key carries the
/// end as Unix seconds, so it is re-fetched on a later run while closed
/// quarters stay cached.
pub(crate) fn quarter_windows(open: NaiveDate, now: NaiveDateTime, tz: Tz) -> Vec<Window> {
    let mut windows = Vec::new();
    let (mut year, mut quarter) = (open.year(), open.month0() / 3);

    loop {
        let start = quarter_start(year, quarter, tz);
        if start > now {
            break;
        }

        let (next_year, next_quarter) = if quarter == 3 { (year + 1, 0) } else { (year, quarter + 1) };
        let end = quarter_start(next_year, next_quarter, tz);
        let period = format!("{}-Q{}", year, quarter + 1);

        windows.push(if end > now {
            Window {
                start,
                end: now,
                period: format!("{}-{}", period, now.and_utc().timestamp()),
            }
        } else {
            Window { start, end, period }
        });

        (year, quarter) = (next_year, next_quarter);
    }

    windows.reverse();
    windows
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::testing::*;
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_retry_succeeds_before_attempts_run_out() {
        let failures = AtomicUsize::new(0);
        let transport = MockTransport::new(move |_| {
            if failures.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow!("connection reset"))
            } else {
                json(200, json!([1, 2, 3]))
            }
        });
        let cache = CacheGateway::disabled();
        let fetcher = Fetcher::new(&cache, &transport, no_delay()).with_pause(Duration::ZERO);

        let page: Vec<u32> = fetcher.fetch_cached("ns", "2021-Q1", || HttpRequest::get("page")).await.unwrap();
        assert_eq!(page, [1, 2, 3]);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let transport = MockTransport::new(|_| json(503, json!({})));
        let cache = CacheGateway::disabled();
        let fetcher = Fetcher::new(&cache, &transport, no_delay()).with_pause(Duration::ZERO);

        let err = fetcher
            .fetch_cached::<Vec<u32>, _>("ns", "2021-Q1", || HttpRequest::get("page"))
            .await
            .unwrap_err();
        match err {
            FetchError::Exhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, FetchError::Status { status: 503, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_decode_error_is_not_retried() {
        let transport = MockTransport::new(|_| json(200, json!({"code": 10002})));
        let cache = CacheGateway::disabled();
        let fetcher = Fetcher::new(&cache, &transport, no_delay()).with_pause(Duration::ZERO);

        let err = fetcher
            .fetch_cached::<Vec<u32>, _>("ns", "2021-Q1", || HttpRequest::get("page"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
        assert!(!err.is_transient());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_cached_page_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheGateway::open(dir.path());
        let transport = MockTransport::new(|_| json(200, json!(["a"])));
        let fetcher = Fetcher::new(&cache, &transport, no_delay()).with_pause(Duration::ZERO);

        let first: Vec<String> = fetcher.fetch_cached("ns", "2020-Q4", || HttpRequest::get("page")).await.unwrap();
        let second: Vec<String> = fetcher.fetch_cached("ns", "2020-Q4", || HttpRequest::get("page")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn test_quarter_windows_truncate_current_quarter() {
        let now = at(2021, 2, 10, 0);
        let windows = quarter_windows(NaiveDate::from_ymd_opt(2020, 11, 1).unwrap(), now, chrono_tz::UTC);

        assert_eq!(
            windows,
            vec![
                Window {
                    start: at(2021, 1, 1, 0),
                    end: now,
                    period: "2021-Q1-1612915200".to_owned(),
                },
                Window {
                    start: at(2020, 10, 1, 0),
                    end: at(2021, 1, 1, 0),
                    period: "2020-Q4".to_owned(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_open_quarter_replaces_earlier_runs() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheGateway::open(dir.path());
        let transport = MockTransport::new(|_| json(200, json!(["a"])));
        let fetcher = Fetcher::new(&cache, &transport, no_delay()).with_pause(Duration::ZERO);
        let open = NaiveDate::from_ymd_opt(2020, 11, 1).unwrap();

        let earlier = quarter_windows(open, at(2021, 2, 10, 0), chrono_tz::UTC);
        let _: Vec<Vec<String>> = fetcher.fetch_windows("ns", &earlier, |_| HttpRequest::get("page")).await.unwrap();
        let later = quarter_windows(open, at(2021, 3, 1, 0), chrono_tz::UTC);
        let _: Vec<Vec<String>> = fetcher.fetch_windows("ns", &later, |_| HttpRequest::get("page")).await.unwrap();
        assert_eq!(transport.calls(), 3);

        assert_eq!(earlier[0].open_quarter(), Some("2021-Q1"));
        assert_eq!(earlier[1].open_quarter(), None);
        assert!(cache.get::<Vec<String>>("ns", &earlier[0].period).is_none());
        assert!(cache.get::<Vec<String>>("ns", &later[0].period).is_some());
        assert!(cache.get::<Vec<String>>("ns", "2020-Q4").is_some());
    }

    #[test]
    fn test_quarter_windows_in_local_time() {
        let now = at(2021, 1, 15, 12);
        let windows = quarter_windows(NaiveDate::from_ymd_opt(2020, 10, 1).unwrap(), now, chrono_tz::Europe::Paris);

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].start, at(2020, 9, 30, 22));
        assert_eq!(windows[1].end, at(2020, 12, 31, 23));
        assert_eq!(windows[0].start, at(2020, 12, 31, 23));
    }

    #[test]
    fn test_quarter_windows_skip_future() {
        let now = at(2021, 2, 10, 0);
        assert!(quarter_windows(NaiveDate::from_ymd_opt(2021, 6, 1).unwrap(), now, chrono_tz::UTC).is_empty());
    }
}
