use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use spool_engine::JobEvent;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

/// Renders [`JobEvent`]s as a spinner, then a segment bar.
pub struct ProgressReporter {
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn spawn(mut events: UnboundedReceiver<JobEvent>, hidden: bool) -> Self {
        let handle = tokio::spawn(async move {
            let bar = if hidden {
                ProgressBar::hidden()
            } else {
                ProgressBar::new_spinner()
            };
            bar.set_style(spinner_style());
            bar.enable_steady_tick(Duration::from_millis(120));
            bar.set_message("Waiting for the page to request its playlist...");

            let mut renderer = Renderer { bar, bytes: 0 };
            while let Some(event) = events.recv().await {
                renderer.render(event);
            }
            renderer.bar.finish_and_clear();
        });
        Self { handle }
    }

    /// Wait until every event has been drawn. Returns once all senders are gone.
    pub async fn finish(self) {
        let _ = self.handle.await;
    }
}

struct Renderer {
    bar: ProgressBar,
    bytes: u64,
}

impl Renderer {
    fn render(&mut self, event: JobEvent) {
        match event {
            JobEvent::ManifestResolved { .. } => {
                self.bar.set_message("Playlist found, loading segments...");
            }
            JobEvent::PlaylistLoaded { segments } => {
                self.bar.set_length(segments as u64);
                self.bar.set_position(0);
                self.bar.set_style(bar_style());
                self.bar.set_message("");
            }
            JobEvent::SegmentCompleted { index, bytes, .. } => {
                self.bytes += bytes;
                self.bar.set_position(index as u64);
                self.bar.set_message(HumanBytes(self.bytes).to_string());
            }
            JobEvent::Finalized { path } => {
                self.bar.println(format!("Saved {}", path.display()));
            }
            JobEvent::TranscodeFinished { path } => {
                self.bar.println(format!("Converted to {}", path.display()));
            }
            // Reported once with the other job warnings after the run.
            JobEvent::TranscodeSkipped { .. }
            | JobEvent::KeyFetched { .. }
            | JobEvent::SegmentStarted { .. } => {}
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&[
            "▹▹▹▹▹",
            "▸▹▹▹▹",
            "▹▸▹▹▹",
            "▹▹▸▹▹",
            "▹▹▹▸▹",
            "▹▹▹▹▸",
            "▪▪▪▪▪",
        ])
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.yellow} [{bar:30.yellow/white}] segment {pos}/{len} {msg} ({elapsed})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ")
}
