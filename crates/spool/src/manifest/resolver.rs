use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::observer::{BrowserLauncher, BrowserSession};
use crate::DownloadError;
use crate::config::ManifestConfig;
use crate::events::{EventEmitter, JobEvent};

/// Lifecycle of one manifest lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    Idle,
    SessionOpen,
    Polling { attempt: u32 },
    Found,
    Exhausted,
    /// The session could not be opened or observed.
    Failed,
}

/// Discovers the signed manifest URL by polling the traffic of a rendered page.
pub struct ManifestResolver {
    launcher: Arc<dyn BrowserLauncher>,
    config: ManifestConfig,
    token: CancellationToken,
    events: EventEmitter,
    state: Mutex<ResolverState>,
}

impl ManifestResolver {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        config: ManifestConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            launcher,
            config,
            token,
            events: EventEmitter::disabled(),
            state: Mutex::new(ResolverState::Idle),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self) -> ResolverState {
        *self.state.lock()
    }

    fn transition(&self, next: ResolverState) {
        let mut state = self.state.lock();
        debug!(from = ?*state, to = ?next, "Manifest resolver transition");
        *state = next;
    }

    /// Open a session on `page_url` and wait for the manifest request to show up.
    ///
    /// The session is closed before returning, whatever the outcome.
    pub async fn resolve(&self, page_url: &Url) -> Result<Url, DownloadError> {
        let session = match self
            .launcher
            .open(page_url, &self.config.browser)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                self.transition(ResolverState::Failed);
                return Err(e);
            }
        };
        self.transition(ResolverState::SessionOpen);

        let outcome = self.poll(session.as_ref(), page_url).await;
        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close browser session");
        }

        let manifest = outcome?;
        info!(url = %manifest, "Manifest URL resolved");
        self.events.emit(JobEvent::ManifestResolved {
            url: manifest.to_string(),
        });
        Ok(manifest)
    }

    async fn poll(
        &self,
        session: &dyn BrowserSession,
        page_url: &Url,
    ) -> Result<Url, DownloadError> {
        let policy = self.config.poll_policy();
        let suffix = self.config.path_suffix.as_str();

        let result = policy
            .run(&self.token, move |attempt| async move {
                self.transition(ResolverState::Polling { attempt });
                let urls = session.observed_urls().await?;
                debug!(attempt, observed = urls.len(), "Polling observed traffic");
                find_manifest_url(&urls, suffix).ok_or_else(|| {
                    DownloadError::ManifestNotYetAvailable {
                        suffix: suffix.to_string(),
                    }
                })
            })
            .await;

        match result {
            Ok(url) => {
                self.transition(ResolverState::Found);
                Ok(url)
            }
            Err(DownloadError::ManifestNotYetAvailable { .. }) => {
                self.transition(ResolverState::Exhausted);
                Err(DownloadError::AcquisitionFailed {
                    page_url: page_url.to_string(),
                    attempts: policy.max_attempts,
                })
            }
            Err(e) => {
                self.transition(ResolverState::Failed);
                Err(e)
            }
        }
    }
}

/// First URL in `urls` whose path ends with `suffix`. Query strings are ignored,
/// so signed URLs still match.
pub fn find_manifest_url(urls: &[String], suffix: &str) -> Option<Url> {
    urls.iter()
        .filter_map(|raw| Url::parse(raw).ok())
        .find(|url| url.path().ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrowserOptions;
    use crate::manifest::observer::TrafficObserver;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Probe {
        polls: AtomicU32,
        closed: AtomicBool,
        poll_times: Mutex<Vec<Instant>>,
    }

    /// Session whose traffic contains the manifest from poll `appears_at` onwards.
    struct FakeSession {
        probe: Arc<Probe>,
        appears_at: Option<u32>,
    }

    #[async_trait]
    impl TrafficObserver for FakeSession {
        async fn observed_urls(&self) -> Result<Vec<String>, DownloadError> {
            let poll = self.probe.polls.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.poll_times.lock().push(Instant::now());
            let mut urls = vec![
                "https://cdn.test/app.js".to_string(),
                "https://cdn.test/cover.jpg".to_string(),
            ];
            if self.appears_at.is_some_and(|at| poll >= at) {
                urls.insert(
                    0,
                    "https://media.test/book/index.m3u8?sig=abc&exp=1".to_string(),
                );
            }
            Ok(urls)
        }
    }

    #[async_trait]
    impl BrowserSession for FakeSession {
        async fn close(self: Box<Self>) -> Result<(), DownloadError> {
            self.probe.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeLauncher {
        probe: Arc<Probe>,
        appears_at: Option<u32>,
        fail_open: bool,
    }

    #[async_trait]
    impl BrowserLauncher for FakeLauncher {
        async fn open(
            &self,
            _page_url: &Url,
            _options: &BrowserOptions,
        ) -> Result<Box<dyn BrowserSession>, DownloadError> {
            if self.fail_open {
                return Err(DownloadError::browser("no browser"));
            }
            Ok(Box::new(FakeSession {
                probe: Arc::clone(&self.probe),
                appears_at: self.appears_at,
            }))
        }
    }

    fn resolver(appears_at: Option<u32>, fail_open: bool) -> (ManifestResolver, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let launcher = FakeLauncher {
            probe: Arc::clone(&probe),
            appears_at,
            fail_open,
        };
        let resolver = ManifestResolver::new(
            Arc::new(launcher),
            ManifestConfig::default(),
            CancellationToken::new(),
        );
        (resolver, probe)
    }

    fn page() -> Url {
        Url::parse("https://books.test/listen/some-title").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn never_matching_traffic_polls_the_full_budget() {
        let (resolver, probe) = resolver(None, false);
        let start = Instant::now();

        let err = resolver.resolve(&page()).await.unwrap_err();
        assert!(matches!(
            err,
            DownloadError::AcquisitionFailed { attempts: 20, .. }
        ));
        assert_eq!(probe.polls.load(Ordering::SeqCst), 20);
        assert_eq!(start.elapsed(), Duration::from_secs(95));

        let times = probe.poll_times.lock();
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(5));
        }
        assert!(probe.closed.load(Ordering::SeqCst));
        assert_eq!(resolver.state(), ResolverState::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn match_on_first_poll_returns_immediately() {
        let (resolver, probe) = resolver(Some(1), false);
        let start = Instant::now();

        let url = resolver.resolve(&page()).await.unwrap();
        assert_eq!(url.path(), "/book/index.m3u8");
        assert_eq!(url.query(), Some("sig=abc&exp=1"));
        assert_eq!(probe.polls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(probe.closed.load(Ordering::SeqCst));
        assert_eq!(resolver.state(), ResolverState::Found);
    }

    #[tokio::test(start_paused = true)]
    async fn late_match_is_found_after_waiting() {
        let (resolver, probe) = resolver(Some(4), false);
        let start = Instant::now();

        resolver.resolve(&page()).await.unwrap();
        assert_eq!(probe.polls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn launch_failure_is_reported_as_is() {
        let (resolver, probe) = resolver(Some(1), true);
        let err = resolver.resolve(&page()).await.unwrap_err();
        assert!(matches!(err, DownloadError::Browser { .. }));
        assert_eq!(probe.polls.load(Ordering::SeqCst), 0);
        assert_eq!(resolver.state(), ResolverState::Failed);
    }

    #[test]
    fn most_recent_match_wins_and_query_is_ignored() {
        let urls = vec![
            "not a url".to_string(),
            "https://cdn.test/player.m3u8.js".to_string(),
            "https://media.test/new/index.m3u8?sig=2".to_string(),
            "https://media.test/old/index.m3u8?sig=1".to_string(),
        ];
        let found = find_manifest_url(&urls, ".m3u8").unwrap();
        assert_eq!(found.as_str(), "https://media.test/new/index.m3u8?sig=2");
        assert_eq!(find_manifest_url(&urls[..2], ".m3u8"), None);
    }
}
