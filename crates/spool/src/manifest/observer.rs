use async_trait::async_trait;
use url::Url;

use crate::DownloadError;
use crate::config::BrowserOptions;

/// A pollable view of the network requests a rendered page has issued.
#[async_trait]
pub trait TrafficObserver: Send + Sync {
    /// Request URLs observed so far, most recent first.
    async fn observed_urls(&self) -> Result<Vec<String>, DownloadError>;
}

/// A live browser session. Must be closed explicitly; implementations should
/// also release their resources when dropped.
#[async_trait]
pub trait BrowserSession: TrafficObserver {
    async fn close(self: Box<Self>) -> Result<(), DownloadError>;
}

/// Opens a session already navigated to the page.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn open(
        &self,
        page_url: &Url,
        options: &BrowserOptions,
    ) -> Result<Box<dyn BrowserSession>, DownloadError>;
}
