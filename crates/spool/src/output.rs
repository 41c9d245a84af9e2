// Output assembly: the single writer of the job's artifacts.
//
// Everything is written under a `.part` name and only renamed to its final path
// once complete, so an interrupted job never leaves a file that looks finished.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use crate::DownloadError;
use crate::config::{OutputConfig, OutputMode};
use crate::pipeline::{DecryptedSegment, SegmentSink};

const PART_SUFFIX: &str = "part";

struct PartFile {
    part: PathBuf,
    target: PathBuf,
    writer: BufWriter<File>,
}

impl PartFile {
    async fn create(target: PathBuf) -> Result<Self, DownloadError> {
        let part = part_path(&target);
        let file = File::create(&part)
            .await
            .map_err(|e| DownloadError::io(&part, e))?;
        Ok(Self {
            part,
            target,
            writer: BufWriter::new(file),
        })
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), DownloadError> {
        self.writer
            .write_all(data)
            .await
            .map_err(|e| DownloadError::io(&self.part, e))
    }

    /// Flush, sync and move into place.
    async fn commit(mut self) -> Result<PathBuf, DownloadError> {
        self.writer
            .flush()
            .await
            .map_err(|e| DownloadError::io(&self.part, e))?;
        self.writer
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| DownloadError::io(&self.part, e))?;
        drop(self.writer);
        tokio::fs::rename(&self.part, &self.target)
            .await
            .map_err(|e| DownloadError::io(&self.target, e))?;
        Ok(self.target)
    }
}

/// `<name>.part` next to `target`.
pub fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(PART_SUFFIX);
    target.with_file_name(name)
}

/// Paths produced by a finalized output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedOutput {
    pub paths: Vec<PathBuf>,
    pub segments: usize,
    pub bytes: u64,
}

pub struct OutputAssembler {
    config: OutputConfig,
    expected: usize,
    written: usize,
    bytes: u64,
    merged: Option<PartFile>,
    completed: Vec<PathBuf>,
}

impl OutputAssembler {
    /// Prepare the output for `expected` segments. Merge mode opens its part file right away.
    pub async fn create(config: OutputConfig, expected: usize) -> Result<Self, DownloadError> {
        let merged = match config.mode {
            OutputMode::Merge => Some(PartFile::create(merged_path(&config)).await?),
            OutputMode::Split => None,
        };
        debug!(mode = ?config.mode, expected, "Output assembler ready");
        Ok(Self {
            config,
            expected,
            written: 0,
            bytes: 0,
            merged,
            completed: Vec::new(),
        })
    }

    /// Final path of the merged artifact.
    pub fn merged_path(&self) -> PathBuf {
        merged_path(&self.config)
    }

    /// Verify every segment arrived, then move the artifact(s) into place.
    pub async fn finalize(mut self) -> Result<FinalizedOutput, DownloadError> {
        if self.written != self.expected {
            return Err(DownloadError::IncompleteOutput {
                written: self.written,
                expected: self.expected,
            });
        }
        if let Some(merged) = self.merged.take() {
            self.completed.push(merged.commit().await?);
        }
        info!(
            segments = self.written,
            bytes = self.bytes,
            files = self.completed.len(),
            "Output finalized"
        );
        Ok(FinalizedOutput {
            paths: self.completed,
            segments: self.written,
            bytes: self.bytes,
        })
    }
}

#[async_trait]
impl SegmentSink for OutputAssembler {
    async fn accept(&mut self, segment: DecryptedSegment) -> Result<(), DownloadError> {
        if segment.index != self.written {
            return Err(DownloadError::Internal {
                reason: format!(
                    "segment #{} delivered while #{} was due",
                    segment.index + 1,
                    self.written + 1
                ),
            });
        }

        match self.merged.as_mut() {
            Some(merged) => merged.write(&segment.data).await?,
            None => {
                let target = split_path(&self.config, segment.index);
                let mut file = PartFile::create(target).await?;
                file.write(&segment.data).await?;
                self.completed.push(file.commit().await?);
            }
        }

        self.written += 1;
        self.bytes += segment.data.len() as u64;
        Ok(())
    }
}

fn merged_path(config: &OutputConfig) -> PathBuf {
    config
        .directory
        .join(format!("{}.{}", config.title, config.extension))
}

fn split_path(config: &OutputConfig, index: usize) -> PathBuf {
    config.directory.join(format!(
        "{}-{:03}.{}",
        config.title,
        index + 1,
        config.extension
    ))
}
