// Decryption key resolution: one network fetch per key URI per job.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::config::KeyConfig;
use crate::decrypt::BLOCK_SIZE;
use crate::events::{EventEmitter, JobEvent};
use crate::retry::{RetryPolicy, is_transient_reqwest_error};
use crate::DownloadError;

/// Single attempt at retrieving raw key bytes.
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    async fn fetch_key(&self, uri: &Url) -> Result<Bytes, DownloadError>;
}

pub struct HttpKeyFetcher {
    client: Client,
    config: KeyConfig,
}

impl HttpKeyFetcher {
    pub fn new(client: Client, config: KeyConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl KeyFetcher for HttpKeyFetcher {
    async fn fetch_key(&self, uri: &Url) -> Result<Bytes, DownloadError> {
        let transient = |e: reqwest::Error| {
            if is_transient_reqwest_error(&e) {
                DownloadError::KeyFetchTransient {
                    url: uri.to_string(),
                    reason: e.to_string(),
                }
            } else {
                DownloadError::KeyRequestFailed {
                    url: uri.to_string(),
                    reason: e.to_string(),
                }
            }
        };

        let response = self
            .client
            .get(uri.clone())
            .timeout(self.config.download_timeout)
            .send()
            .await
            .map_err(transient)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::KeyFetchRejected {
                url: uri.to_string(),
                status,
            });
        }
        response.bytes().await.map_err(transient)
    }
}

/// Memoizing, single-flight key cache scoped to one job.
///
/// Concurrent first requests for the same URI share one underlying fetch.
pub struct KeyResolver {
    fetcher: Arc<dyn KeyFetcher>,
    cache: Cache<String, Bytes>,
    policy: RetryPolicy,
    token: CancellationToken,
    events: EventEmitter,
    fetches: AtomicUsize,
}

impl KeyResolver {
    pub fn new(fetcher: Arc<dyn KeyFetcher>, policy: RetryPolicy, token: CancellationToken) -> Self {
        Self {
            fetcher,
            cache: Cache::builder().build(),
            policy,
            token,
            events: EventEmitter::disabled(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Number of underlying fetches started so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    pub async fn resolve(&self, uri: &Url) -> Result<Bytes, DownloadError> {
        self.cache
            .try_get_with(uri.to_string(), self.fetch_and_validate(uri))
            .await
            .map_err(DownloadError::from_shared)
    }

    async fn fetch_and_validate(&self, uri: &Url) -> Result<Bytes, DownloadError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        debug!(uri = %uri, "Fetching decryption key");

        let key = self
            .policy
            .run(&self.token, |_| self.fetcher.fetch_key(uri))
            .await
            .map_err(|err| match err {
                DownloadError::KeyFetchTransient { url, reason } => {
                    DownloadError::KeyFetchTransient {
                        url,
                        reason: format!(
                            "gave up after {} attempts: {reason}",
                            self.policy.max_attempts
                        ),
                    }
                }
                other => other,
            })?;

        if key.len() != BLOCK_SIZE {
            return Err(DownloadError::decryption(format!(
                "key from {uri} is {} bytes (expected {BLOCK_SIZE})",
                key.len()
            )));
        }

        info!(uri = %uri, "Decryption key fetched");
        self.events.emit(JobEvent::KeyFetched {
            uri: uri.to_string(),
        });
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use reqwest::StatusCode;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Fake key server with scripted per-URI failures and a counter per URI.
    #[derive(Default)]
    struct ScriptedFetcher {
        keys: HashMap<String, Bytes>,
        failures: Mutex<HashMap<String, VecDeque<DownloadError>>>,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedFetcher {
        fn with_key(mut self, uri: &str, key: &[u8]) -> Self {
            self.keys.insert(uri.to_string(), Bytes::copy_from_slice(key));
            self
        }

        fn fail_first(self, uri: &str, err: DownloadError) -> Self {
            self.failures
                .lock()
                .entry(uri.to_string())
                .or_default()
                .push_back(err);
            self
        }

        fn calls(&self, uri: &str) -> usize {
            self.calls.lock().get(uri).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl KeyFetcher for ScriptedFetcher {
        async fn fetch_key(&self, uri: &Url) -> Result<Bytes, DownloadError> {
            *self.calls.lock().entry(uri.to_string()).or_default() += 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(err) = self
                .failures
                .lock()
                .get_mut(uri.as_str())
                .and_then(VecDeque::pop_front)
            {
                return Err(err);
            }
            self.keys
                .get(uri.as_str())
                .cloned()
                .ok_or_else(|| DownloadError::KeyFetchRejected {
                    url: uri.to_string(),
                    status: StatusCode::NOT_FOUND,
                })
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn resolver(fetcher: Arc<ScriptedFetcher>) -> KeyResolver {
        KeyResolver::new(
            fetcher,
            RetryPolicy::fixed(3, Duration::from_millis(1)),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn concurrent_first_requests_share_one_fetch() {
        let fetcher = Arc::new(ScriptedFetcher::default().with_key("https://keys/a", &[1u8; 16]));
        let resolver = Arc::new(resolver(Arc::clone(&fetcher)));
        let uri = url("https://keys/a");

        let lookups = (0..16).map(|_| {
            let resolver = Arc::clone(&resolver);
            let uri = uri.clone();
            tokio::spawn(async move { resolver.resolve(&uri).await })
        });
        for result in futures::future::join_all(lookups).await {
            assert_eq!(result.unwrap().unwrap().as_ref(), &[1u8; 16]);
        }

        assert_eq!(fetcher.calls("https://keys/a"), 1);
        assert_eq!(resolver.fetch_count(), 1);
    }

    #[tokio::test]
    async fn cached_key_costs_no_further_fetches() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with_key("https://keys/a", &[1u8; 16])
                .with_key("https://keys/b", &[2u8; 16]),
        );
        let resolver = resolver(Arc::clone(&fetcher));
        for _ in 0..5 {
            resolver.resolve(&url("https://keys/a")).await.unwrap();
        }
        resolver.resolve(&url("https://keys/b")).await.unwrap();
        assert_eq!(fetcher.calls("https://keys/a"), 1);
        assert_eq!(fetcher.calls("https://keys/b"), 1);
        assert_eq!(resolver.fetch_count(), 2);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with_key("https://keys/a", &[5u8; 16])
                .fail_first(
                    "https://keys/a",
                    DownloadError::KeyFetchTransient {
                        url: "https://keys/a".into(),
                        reason: "reset".into(),
                    },
                ),
        );
        let resolver = resolver(Arc::clone(&fetcher));
        let key = resolver.resolve(&url("https://keys/a")).await.unwrap();
        assert_eq!(key.as_ref(), &[5u8; 16]);
        assert_eq!(fetcher.calls("https://keys/a"), 2);
    }

    #[tokio::test]
    async fn rejection_is_fatal_and_not_retried() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let resolver = resolver(Arc::clone(&fetcher));
        let err = resolver.resolve(&url("https://keys/missing")).await.unwrap_err();
        assert!(matches!(err, DownloadError::KeyFetchRejected { .. }));
        assert_eq!(fetcher.calls("https://keys/missing"), 1);
    }

    #[tokio::test]
    async fn wrong_key_length_is_a_decryption_failure() {
        let fetcher = Arc::new(ScriptedFetcher::default().with_key("https://keys/short", &[0u8; 8]));
        let resolver = resolver(fetcher);
        let err = resolver.resolve(&url("https://keys/short")).await.unwrap_err();
        assert!(matches!(err, DownloadError::Decryption { .. }));
    }

    #[tokio::test]
    async fn http_fetcher_returns_body_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/key.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9u8; 16]))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpKeyFetcher::new(Client::new(), KeyConfig::default());
        let key = fetcher
            .fetch_key(&url(&format!("{}/key.bin", server.uri())))
            .await
            .unwrap();
        assert_eq!(key.as_ref(), &[9u8; 16]);
    }

    #[tokio::test]
    async fn http_fetcher_maps_error_status_to_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/key.bin"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let fetcher = HttpKeyFetcher::new(Client::new(), KeyConfig::default());
        let err = fetcher
            .fetch_key(&url(&format!("{}/key.bin", server.uri())))
            .await
            .unwrap_err();
        match err {
            DownloadError::KeyFetchRejected { status, .. } => {
                assert_eq!(status, StatusCode::FORBIDDEN)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn redirect_loop_is_reported_as_a_key_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/key.bin"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/key.bin"))
            .mount(&server)
            .await;

        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(2))
            .build()
            .unwrap();
        let err = HttpKeyFetcher::new(client, KeyConfig::default())
            .fetch_key(&url(&format!("{}/key.bin", server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::KeyRequestFailed { .. }));
        assert_eq!(err.stage(), crate::Stage::Key);
        assert!(!err.is_transient());
    }
}
