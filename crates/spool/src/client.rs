use reqwest::Client;
use reqwest::redirect::Policy;

use crate::{DownloadError, DownloaderConfig};

/// Build the HTTP client shared by the playlist, key and segment transports.
pub fn create_client(config: &DownloaderConfig) -> Result<Client, DownloadError> {
    let mut builder = Client::builder()
        .user_agent(config.user_agent.clone())
        .default_headers(config.headers.clone())
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .redirect(if config.follow_redirects {
            Policy::default()
        } else {
            Policy::none()
        });

    if !config.timeout.is_zero() {
        builder = builder.timeout(config.timeout);
    }

    builder
        .build()
        .map_err(|e| DownloadError::configuration(format!("failed to build HTTP client: {e}")))
}
