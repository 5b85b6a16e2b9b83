//! Outbound HTTP with request de-duplication.
//!
//! Every upstream call goes through a [`FetchCache`]. Within a 60 second
//! window a URL is fetched at most once; callers that arrive while the first
//! request is still in flight poll until it lands instead of issuing their own.
//! One cache is shared by all coordinators of a process.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use tokio::time::Instant;
use tracing::debug;

use crate::{Result, WeatherError};

const ENTRY_TTL: Duration = Duration::from_secs(60);
const PENDING_POLL: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("cwa-weather/", env!("CARGO_PKG_VERSION"));

/// Query parameters that carry credentials and must not reach the logs.
const SECRET_PARAMS: &[&str] = &["Authorization", "api_key"];

/// The raw network seam. Returns the response body of a successful GET.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    async fn get(&self, url: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| WeatherError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { http })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<String> {
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| WeatherError::upstream(redact(url), e.without_url()))?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| WeatherError::upstream(redact(url), e.without_url()))?;

        if !status.is_success() {
            return Err(WeatherError::upstream(
                redact(url),
                format!("status {}: {}", status, truncate_body(&body)),
            ));
        }

        Ok(body)
    }
}

#[derive(Debug)]
enum Slot {
    Pending,
    Ready(String),
}

#[derive(Debug)]
struct Entry {
    fetched_at: Instant,
    slot: Slot,
}

enum Lookup {
    Hit(String),
    Wait,
    Miss,
}

/// Shared, time-bounded response cache keyed by URL.
///
/// Cloning is cheap and every clone sees the same entries.
#[derive(Debug, Clone)]
pub struct FetchCache {
    transport: Arc<dyn Transport>,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl FetchCache {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A cache backed by the real network.
    pub fn http() -> Result<Self> {
        Ok(Self::new(Arc::new(HttpTransport::new()?)))
    }

    /// Fetches `url`, serving a body fetched in the last 60 seconds when there is one.
    ///
    /// The returned body is the caller's own copy. Failures are not cached.
    pub async fn fetch(&self, url: &str) -> Result<String> {
        let stamp = self.purge();

        loop {
            match self.lookup_or_mark(url, stamp) {
                Lookup::Hit(body) => {
                    debug!(url = %redact(url), "cached");
                    return Ok(body);
                }
                Lookup::Miss => {
                    let mut guard = PendingGuard {
                        cache: self,
                        url,
                        stamp,
                        armed: true,
                    };
                    let body = self.transport.get(url).await?;
                    self.store(url, stamp, body.clone());
                    guard.armed = false;
                    debug!(url = %redact(url), "fetched");
                    return Ok(body);
                }
                Lookup::Wait => {
                    debug!(url = %redact(url), "wait...");
                    tokio::time::sleep(PENDING_POLL).await;
                }
            }
        }
    }

    /// Drops every entry older than the TTL and returns the stamp for new ones.
    fn purge(&self) -> Instant {
        let now = Instant::now();
        self.lock()
            .retain(|_, entry| now.duration_since(entry.fetched_at) < ENTRY_TTL);
        now
    }

    /// Check and mark happen under one lock so two callers can never both miss.
    fn lookup_or_mark(&self, url: &str, stamp: Instant) -> Lookup {
        let mut entries = self.lock();
        match entries.get(url) {
            Some(Entry {
                slot: Slot::Ready(body),
                ..
            }) => Lookup::Hit(body.clone()),
            Some(Entry {
                slot: Slot::Pending,
                ..
            }) => Lookup::Wait,
            None => {
                entries.insert(
                    url.to_string(),
                    Entry {
                        fetched_at: stamp,
                        slot: Slot::Pending,
                    },
                );
                Lookup::Miss
            }
        }
    }

    fn store(&self, url: &str, stamp: Instant, body: String) {
        self.lock().insert(
            url.to_string(),
            Entry {
                fetched_at: stamp,
                slot: Slot::Ready(body),
            },
        );
    }

    /// Removes the pending marker placed at `stamp`. A marker placed by a
    /// later caller, after the first one went stale, is left alone.
    fn forget(&self, url: &str, stamp: Instant) {
        let mut entries = self.lock();
        let owned = matches!(
            entries.get(url),
            Some(Entry { fetched_at, slot: Slot::Pending }) if *fetched_at == stamp
        );
        if owned {
            entries.remove(url);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the pending marker if the fetch fails or its future is dropped.
struct PendingGuard<'a> {
    cache: &'a FetchCache,
    url: &'a str,
    stamp: Instant,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.forget(self.url, self.stamp);
        }
    }
}

/// Masks credential query parameters so URLs can be logged.
pub fn redact(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };

    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| {
            let v = if SECRET_PARAMS.contains(&k.as_ref()) {
                "***".to_string()
            } else {
                v.into_owned()
            };
            (k.into_owned(), v)
        })
        .collect();

    if pairs.is_empty() {
        return parsed.to_string();
    }

    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    parsed.to_string()
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
