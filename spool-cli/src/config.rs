use crate::cli::Args;
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use spool_engine::{JobConfig, OutputMode};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = "spool";
const CONFIG_FILE: &str = "config.toml";

/// Settings read from the optional TOML file. Command-line flags win.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub download: DownloadSection,
    pub browser: BrowserSection,
    pub transcode: TranscodeSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSection {
    pub concurrency: usize,
    pub segment_attempts: u32,
    pub segment_retry_delay_secs: u64,
    pub key_attempts: u32,
    pub extension: String,
    pub user_agent: Option<String>,
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            concurrency: 4,
            segment_attempts: 3,
            segment_retry_delay_secs: 2,
            key_attempts: 3,
            extension: "mp3".to_string(),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub executable: Option<PathBuf>,
    pub headless: bool,
    pub manifest_polls: u32,
    pub poll_interval_secs: u64,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
            manifest_polls: 20,
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeSection {
    pub enabled: bool,
    pub program: PathBuf,
    pub extension: String,
    pub keep_raw: bool,
}

impl Default for TranscodeSection {
    fn default() -> Self {
        Self {
            enabled: true,
            program: PathBuf::from("ffmpeg"),
            extension: "m4a".to_string(),
            keep_raw: false,
        }
    }
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load `path`, or the default location when `None`. Only an explicitly
    /// named file has to exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            if required {
                return Err(AppError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Self::parse(&content)
            .map_err(|e| AppError::Config(format!("invalid config file {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Engine configuration for one job, with `args` applied on top.
    pub fn job_config(&self, args: &Args, directory: PathBuf, title: String) -> JobConfig {
        let mut config = JobConfig::default();

        if let Some(user_agent) = &self.download.user_agent {
            config.http.user_agent = user_agent.clone();
        }

        config.manifest.max_polls = self.browser.manifest_polls;
        config.manifest.poll_interval = Duration::from_secs(self.browser.poll_interval_secs);
        config.manifest.browser.executable =
            args.browser.clone().or_else(|| self.browser.executable.clone());
        config.manifest.browser.headless = self.browser.headless && !args.show_browser;

        config.keys.max_attempts = self.download.key_attempts;
        config.segments.concurrency = args.concurrency.unwrap_or(self.download.concurrency);
        config.segments.max_attempts = self.download.segment_attempts;
        config.segments.retry_delay = Duration::from_secs(self.download.segment_retry_delay_secs);

        config.output.directory = directory;
        config.output.title = title;
        config.output.extension = self.download.extension.clone();
        config.output.mode = if args.one_file {
            OutputMode::Merge
        } else {
            OutputMode::Split
        };

        config.transcode.enabled = self.transcode.enabled && !args.no_transcode;
        config.transcode.program = args
            .ffmpeg
            .clone()
            .unwrap_or_else(|| self.transcode.program.clone());
        config.transcode.target_extension = self.transcode.extension.clone();
        config.transcode.keep_raw = self.transcode.keep_raw;
        config
    }
}
