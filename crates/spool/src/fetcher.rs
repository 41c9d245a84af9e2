// Segment transport: opens a streamed body for one segment.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client, StatusCode};
use tracing::trace;

use crate::config::SegmentConfig;
use crate::playlist::SegmentDescriptor;
use crate::retry::is_transient_reqwest_error;
use crate::DownloadError;

/// Body chunks exactly as they come off the wire.
pub type ChunkStream = BoxStream<'static, Result<Bytes, DownloadError>>;

#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    /// Start one attempt at downloading `segment`.
    async fn open(&self, segment: &SegmentDescriptor) -> Result<ChunkStream, DownloadError>;
}

pub struct HttpSegmentFetcher {
    client: Client,
    config: SegmentConfig,
}

impl HttpSegmentFetcher {
    pub fn new(client: Client, config: SegmentConfig) -> Self {
        Self { client, config }
    }
}

fn transient(segment: &SegmentDescriptor, reason: impl Into<String>) -> DownloadError {
    DownloadError::SegmentFetchTransient {
        index: segment.index + 1,
        url: segment.uri.to_string(),
        reason: reason.into(),
    }
}

#[async_trait]
impl SegmentFetcher for HttpSegmentFetcher {
    async fn open(&self, segment: &SegmentDescriptor) -> Result<ChunkStream, DownloadError> {
        let response = self
            .client
            .get(segment.uri.clone())
            .timeout(self.config.download_timeout)
            .send()
            .await
            .map_err(|e| {
                if is_transient_reqwest_error(&e) {
                    transient(segment, e.to_string())
                } else {
                    DownloadError::SegmentRequestFailed {
                        index: segment.index + 1,
                        url: segment.uri.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(transient(segment, format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(DownloadError::SegmentRejected {
                index: segment.index + 1,
                url: segment.uri.to_string(),
                status,
            });
        }

        trace!(
            url = %segment.uri,
            http_version = ?response.version(),
            content_length = ?response.content_length(),
            "Segment response opened"
        );

        let failed = segment.clone();
        let stream = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| transient(&failed, e.to_string())));
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn descriptor(url: String) -> SegmentDescriptor {
        SegmentDescriptor {
            index: 0,
            sequence: 0,
            uri: Url::parse(&url).unwrap(),
            key: None,
        }
    }

    async fn collect(mut stream: ChunkStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn streams_successful_body() {
        let server = MockServer::start().await;
        let body: Vec<u8> = (0..50_000).map(|i| (i % 256) as u8).collect();
        Mock::given(method("GET"))
            .and(path("/seg1.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let fetcher = HttpSegmentFetcher::new(Client::new(), SegmentConfig::default());
        let stream = fetcher
            .open(&descriptor(format!("{}/seg1.ts", server.uri())))
            .await
            .unwrap();
        assert_eq!(collect(stream).await, body);
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = HttpSegmentFetcher::new(Client::new(), SegmentConfig::default());
        let err = fetcher
            .open(&descriptor(format!("{}/seg1.ts", server.uri())))
            .await
            .err()
            .unwrap();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn client_errors_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpSegmentFetcher::new(Client::new(), SegmentConfig::default());
        let err = fetcher
            .open(&descriptor(format!("{}/seg1.ts", server.uri())))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DownloadError::SegmentRejected { index: 1, .. }));
    }

    #[tokio::test]
    async fn redirect_loop_is_reported_as_a_segment_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/seg1.ts"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/seg1.ts"))
            .mount(&server)
            .await;

        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(2))
            .build()
            .unwrap();
        let err = HttpSegmentFetcher::new(client, SegmentConfig::default())
            .open(&descriptor(format!("{}/seg1.ts", server.uri())))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            DownloadError::SegmentRequestFailed { index: 1, .. }
        ));
        assert_eq!(err.stage(), crate::Stage::Segment);
    }
}
