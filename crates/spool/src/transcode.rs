// Conversion of the merged artifact with an external ffmpeg-compatible tool.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::DownloadError;
use crate::config::TranscodeConfig;

/// Lines of tool stderr kept in a failure report.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeOutcome {
    Converted { path: PathBuf },
    /// The tool could not be found; the raw artifact is left untouched.
    Skipped { reason: String },
    Disabled,
}

impl TranscodeOutcome {
    pub fn warning(&self) -> Option<&str> {
        match self {
            Self::Skipped { reason } => Some(reason),
            _ => None,
        }
    }
}

pub struct Transcoder {
    config: TranscodeConfig,
}

impl Transcoder {
    pub fn new(config: TranscodeConfig) -> Self {
        Self { config }
    }

    pub fn target_path(&self, raw: &Path) -> PathBuf {
        raw.with_extension(&self.config.target_extension)
    }

    /// Convert `raw`. Only a missing tool is downgraded to [`TranscodeOutcome::Skipped`].
    pub async fn transcode(
        &self,
        raw: &Path,
        token: &CancellationToken,
    ) -> Result<TranscodeOutcome, DownloadError> {
        if !self.config.enabled {
            return Ok(TranscodeOutcome::Disabled);
        }

        let target = self.target_path(raw);
        if target == raw {
            return Err(DownloadError::configuration(format!(
                "transcode target {} is the raw artifact itself",
                target.display()
            )));
        }
        // Keep the real extension last so the tool still picks the right muxer.
        let partial = raw.with_extension(format!("part.{}", self.config.target_extension));

        let mut command = Command::new(&self.config.program);
        command
            .arg("-hide_banner")
            .arg("-nostdin")
            .arg("-y")
            .arg("-i")
            .arg(raw)
            .args(&self.config.output_args)
            .arg(&partial)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(program = %self.config.program.display(), input = %raw.display(), "Starting transcoder");

        let output = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            output = command.output() => output,
        };
        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let reason = format!(
                    "{} not found; raw artifact kept at {}",
                    self.config.program.display(),
                    raw.display()
                );
                warn!(%reason, "Transcoder unavailable");
                return Ok(TranscodeOutcome::Skipped { reason });
            }
            Err(e) => {
                return Err(DownloadError::TranscodeFailed {
                    status: "spawn failure".to_string(),
                    stderr: e.to_string(),
                });
            }
        };

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(DownloadError::TranscodeFailed {
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| DownloadError::io(&partial, e))?;
        if !self.config.keep_raw {
            tokio::fs::remove_file(raw)
                .await
                .map_err(|e| DownloadError::io(raw, e))?;
        }
        info!(path = %target.display(), "Transcode finished");
        Ok(TranscodeOutcome::Converted { path: target })
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
