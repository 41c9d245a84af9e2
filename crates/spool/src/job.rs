// Job orchestration: manifest discovery through transcoding for one page URL.

use std::path::PathBuf;
use std::sync::Arc;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::client::create_client;
use crate::config::{JobConfig, OutputMode};
use crate::events::{EventEmitter, JobEvent};
use crate::fetcher::{HttpSegmentFetcher, SegmentFetcher};
use crate::key::{HttpKeyFetcher, KeyFetcher, KeyResolver};
use crate::manifest::{BrowserLauncher, ChromiumLauncher, ManifestResolver};
use crate::output::OutputAssembler;
use crate::pipeline::SegmentPipeline;
use crate::playlist::{HttpPlaylistSource, PlaylistSource};
use crate::transcode::{TranscodeOutcome, Transcoder};
use crate::DownloadError;

const DEFAULT_TITLE: &str = "output";
const MAX_TITLE_CHARS: usize = 200;

/// What a successful job produced.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub manifest_url: Url,
    /// Final artifacts, in manifest order for split output
    pub artifacts: Vec<PathBuf>,
    pub segments: usize,
    pub bytes: u64,
    pub keys_fetched: usize,
    pub transcode: TranscodeOutcome,
    /// Advisory problems that did not fail the job
    pub warnings: Vec<String>,
}

/// One download, from page URL to finished artifact.
///
/// Every collaborator is injectable; [`DownloadJob::new`] wires the HTTP and
/// Chromium defaults. A job owns a single cancellation token, so run it once.
pub struct DownloadJob {
    config: JobConfig,
    launcher: Arc<dyn BrowserLauncher>,
    playlists: Arc<dyn PlaylistSource>,
    key_fetcher: Arc<dyn KeyFetcher>,
    segment_fetcher: Arc<dyn SegmentFetcher>,
    token: CancellationToken,
    events: EventEmitter,
}

impl DownloadJob {
    pub fn new(config: JobConfig) -> Result<Self, DownloadError> {
        config.validate()?;
        let client = create_client(&config.http)?;
        Ok(Self::with_client(config, client))
    }

    fn with_client(config: JobConfig, client: Client) -> Self {
        Self {
            launcher: Arc::new(ChromiumLauncher::new()),
            playlists: Arc::new(HttpPlaylistSource::new(client.clone())),
            key_fetcher: Arc::new(HttpKeyFetcher::new(client.clone(), config.keys.clone())),
            segment_fetcher: Arc::new(HttpSegmentFetcher::new(client, config.segments.clone())),
            token: CancellationToken::new(),
            events: EventEmitter::disabled(),
            config,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn BrowserLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_playlist_source(mut self, playlists: Arc<dyn PlaylistSource>) -> Self {
        self.playlists = playlists;
        self
    }

    pub fn with_key_fetcher(mut self, key_fetcher: Arc<dyn KeyFetcher>) -> Self {
        self.key_fetcher = key_fetcher;
        self
    }

    pub fn with_segment_fetcher(mut self, segment_fetcher: Arc<dyn SegmentFetcher>) -> Self {
        self.segment_fetcher = segment_fetcher;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Token that aborts the job when cancelled, e.g. from a Ctrl-C handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn run(&self, page_url: &Url) -> Result<JobReport, DownloadError> {
        let config = &self.config;
        info!(page = %page_url, title = %config.output.title, "Download job started");

        let resolver = ManifestResolver::new(
            Arc::clone(&self.launcher),
            config.manifest.clone(),
            self.token.clone(),
        )
        .with_events(self.events.clone());
        let manifest_url = resolver.resolve(page_url).await?;

        let segments = self.playlists.load(&manifest_url).await?;
        if segments.is_empty() {
            return Err(DownloadError::playlist(format!(
                "manifest {manifest_url} lists no segments"
            )));
        }
        let total = segments.len();
        self.events.emit(JobEvent::PlaylistLoaded { segments: total });

        let keys = Arc::new(
            KeyResolver::new(
                Arc::clone(&self.key_fetcher),
                config.keys.retry_policy(),
                self.token.clone(),
            )
            .with_events(self.events.clone()),
        );
        let pipeline = SegmentPipeline::new(
            Arc::clone(&self.segment_fetcher),
            Arc::clone(&keys),
            config.segments.concurrency,
            config.segments.retry_policy(),
            self.token.clone(),
        )
        .with_events(self.events.clone());

        tokio::fs::create_dir_all(&config.output.directory)
            .await
            .map_err(|e| DownloadError::io(&config.output.directory, e))?;
        let mut output = OutputAssembler::create(config.output.clone(), total).await?;
        let summary = pipeline.run(segments, &mut output).await?;
        let finalized = output.finalize().await?;
        for path in &finalized.paths {
            self.events.emit(JobEvent::Finalized { path: path.clone() });
        }

        let mut artifacts = finalized.paths;
        let mut warnings = Vec::new();
        let transcode = match (config.output.mode, artifacts.as_slice()) {
            (OutputMode::Merge, [raw]) => {
                Transcoder::new(config.transcode.clone())
                    .transcode(raw, &self.token)
                    .await?
            }
            _ => TranscodeOutcome::Disabled,
        };
        match &transcode {
            TranscodeOutcome::Converted { path } => {
                self.events.emit(JobEvent::TranscodeFinished { path: path.clone() });
                if !config.transcode.keep_raw {
                    artifacts.clear();
                }
                artifacts.push(path.clone());
            }
            TranscodeOutcome::Skipped { reason } => {
                warn!(%reason, "Transcoding skipped");
                self.events.emit(JobEvent::TranscodeSkipped {
                    reason: reason.clone(),
                });
                warnings.push(reason.clone());
            }
            TranscodeOutcome::Disabled => {}
        }

        info!(
            segments = summary.segments,
            bytes = summary.bytes,
            keys = keys.fetch_count(),
            "Download job finished"
        );
        Ok(JobReport {
            manifest_url,
            artifacts,
            segments: summary.segments,
            bytes: summary.bytes,
            keys_fetched: keys.fetch_count(),
            transcode,
            warnings,
        })
    }
}

/// Replace characters that are invalid in file names and trim stray dots and spaces.
pub fn sanitize_filename(input: &str) -> String {
    const INVALID: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let replaced: String = input
        .chars()
        .map(|c| if INVALID.contains(&c) || c < ' ' { '_' } else { c })
        .collect();
    let trimmed = replaced.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        trimmed.chars().take(MAX_TITLE_CHARS).collect()
    }
}

/// Title of a page: its last non-empty path segment, decoded and sanitized.
pub fn title_from_url(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .unwrap_or_default();
    let decoded = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    sanitize_filename(&decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_invalid_characters() {
        assert_eq!(sanitize_filename("a/b:c*d"), "a_b_c_d");
        assert_eq!(sanitize_filename("  .hidden. "), "hidden");
        assert_eq!(sanitize_filename("..."), "output");
        assert_eq!(sanitize_filename(&"x".repeat(300)).len(), 200);
    }

    #[test]
    fn title_is_last_path_segment() {
        let url = Url::parse("https://books.test/listen/the-long-road?ref=home").unwrap();
        assert_eq!(title_from_url(&url), "the-long-road");

        let trailing = Url::parse("https://books.test/listen/the-long-road/").unwrap();
        assert_eq!(title_from_url(&trailing), "the-long-road");

        let encoded = Url::parse("https://books.test/listen/%D0%BA%D0%BD%D0%B8%D0%B3%D0%B0").unwrap();
        assert_eq!(title_from_url(&encoded), "книга");

        let root = Url::parse("https://books.test/").unwrap();
        assert_eq!(title_from_url(&root), "output");
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut config = JobConfig::default();
        config.segments.concurrency = 0;
        assert!(matches!(
            DownloadJob::new(config),
            Err(DownloadError::Configuration { .. })
        ));
    }
}
