use std::path::PathBuf;

use tokio::sync::mpsc;

/// Progress notifications emitted while a job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    ManifestResolved {
        url: String,
    },
    PlaylistLoaded {
        segments: usize,
    },
    KeyFetched {
        uri: String,
    },
    SegmentStarted {
        /// 1-based manifest position
        index: usize,
        total: usize,
    },
    /// The segment was handed to the output, in manifest order.
    SegmentCompleted {
        index: usize,
        total: usize,
        bytes: u64,
    },
    Finalized {
        path: PathBuf,
    },
    TranscodeFinished {
        path: PathBuf,
    },
    TranscodeSkipped {
        reason: String,
    },
}

/// Optional sink for [`JobEvent`]s; a closed or missing receiver is ignored.
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    tx: Option<mpsc::UnboundedSender<JobEvent>>,
}

impl EventEmitter {
    pub fn new(tx: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: JobEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
