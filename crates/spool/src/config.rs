use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// HTTP options shared by the manifest, key and segment transports.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Overall timeout for a single request (zero disables it)
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    pub follow_redirects: bool,

    pub user_agent: String,

    /// Extra headers merged over the defaults
    pub headers: HeaderMap,

    pub pool_max_idle_per_host: usize,

    pub pool_idle_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(0),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl DownloaderConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5,ru;q=0.3"),
        );
        default_headers
    }
}

/// How the signed manifest URL is discovered.
#[derive(Debug, Clone)]
pub struct ManifestConfig {
    /// Path suffix identifying the manifest among observed requests
    pub path_suffix: String,
    pub max_polls: u32,
    pub poll_interval: Duration,
    pub browser: BrowserOptions,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            path_suffix: ".m3u8".to_owned(),
            max_polls: 20,
            poll_interval: Duration::from_secs(5),
            browser: BrowserOptions::default(),
        }
    }
}

impl ManifestConfig {
    pub fn poll_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_polls, self.poll_interval)
    }
}

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Browser executable; `None` searches the usual Chromium/Chrome names on `PATH`
    pub executable: Option<PathBuf>,
    pub headless: bool,
    pub disable_images: bool,
    /// How long to wait for the DevTools endpoint after spawning the browser
    pub startup_timeout: Duration,
    pub extra_args: Vec<String>,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
            disable_images: true,
            startup_timeout: Duration::from_secs(20),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeyConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub download_timeout: Duration,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            download_timeout: Duration::from_secs(10),
        }
    }
}

impl KeyConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_attempts, self.retry_delay)
    }
}

#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Max concurrent segment downloads
    pub concurrency: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Per-attempt timeout covering the whole body
    pub download_timeout: Duration,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            download_timeout: Duration::from_secs(120),
        }
    }
}

impl SegmentConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_attempts, self.retry_delay)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Every segment appended to one artifact
    #[default]
    Merge,
    /// One file per segment, numbered in manifest order
    Split,
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub directory: PathBuf,
    /// File stem shared by every artifact of the job
    pub title: String,
    pub extension: String,
    pub mode: OutputMode,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            title: "output".to_owned(),
            extension: "mp3".to_owned(),
            mode: OutputMode::Merge,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    pub enabled: bool,
    pub program: PathBuf,
    /// Extension of the converted artifact
    pub target_extension: String,
    pub output_args: Vec<String>,
    /// Keep the raw merged artifact next to the converted one
    pub keep_raw: bool,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: PathBuf::from("ffmpeg"),
            target_extension: "m4a".to_owned(),
            output_args: vec!["-vn".to_owned(), "-c".to_owned(), "copy".to_owned()],
            keep_raw: false,
        }
    }
}

/// Everything one download job needs.
#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    pub http: DownloaderConfig,
    pub manifest: ManifestConfig,
    pub keys: KeyConfig,
    pub segments: SegmentConfig,
    pub output: OutputConfig,
    pub transcode: TranscodeConfig,
}

impl JobConfig {
    pub fn validate(&self) -> Result<(), crate::DownloadError> {
        if self.segments.concurrency == 0 {
            return Err(crate::DownloadError::configuration(
                "segment concurrency must be at least 1",
            ));
        }
        if self.manifest.max_polls == 0
            || self.keys.max_attempts == 0
            || self.segments.max_attempts == 0
        {
            return Err(crate::DownloadError::configuration(
                "attempt budgets must be at least 1",
            ));
        }
        if self.output.title.is_empty() {
            return Err(crate::DownloadError::configuration(
                "output title must not be empty",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_budgets() {
        let config = JobConfig::default();
        assert_eq!(config.manifest.max_polls, 20);
        assert_eq!(config.manifest.poll_interval, Duration::from_secs(5));
        assert_eq!(config.keys.max_attempts, 3);
        assert_eq!(config.output.extension, "mp3");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = JobConfig::default();
        config.segments.concurrency = 0;
        assert!(config.validate().is_err());
    }
}
