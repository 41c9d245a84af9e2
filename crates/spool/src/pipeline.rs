// Segment pipeline: bounded parallel fetch + decrypt with strictly ordered delivery.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use crate::decrypt::{CbcStreamDecryptor, iv_from_sequence, parse_iv};
use crate::events::{EventEmitter, JobEvent};
use crate::fetcher::SegmentFetcher;
use crate::key::KeyResolver;
use crate::playlist::SegmentDescriptor;
use crate::retry::RetryPolicy;
use crate::DownloadError;

/// Plaintext of one segment on its way to the output.
#[derive(Debug, Clone)]
pub struct DecryptedSegment {
    /// 0-based manifest position
    pub index: usize,
    pub uri: Url,
    pub data: Bytes,
}

/// Receives decrypted segments in manifest order.
#[async_trait]
pub trait SegmentSink: Send {
    async fn accept(&mut self, segment: DecryptedSegment) -> Result<(), DownloadError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub segments: usize,
    pub bytes: u64,
    /// Largest number of completed segments held back waiting for a predecessor
    pub max_buffered: usize,
}

pub struct SegmentPipeline {
    fetcher: Arc<dyn SegmentFetcher>,
    keys: Arc<KeyResolver>,
    concurrency: usize,
    policy: RetryPolicy,
    token: CancellationToken,
    events: EventEmitter,
}

impl SegmentPipeline {
    pub fn new(
        fetcher: Arc<dyn SegmentFetcher>,
        keys: Arc<KeyResolver>,
        concurrency: usize,
        policy: RetryPolicy,
        token: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            keys,
            concurrency: concurrency.max(1),
            policy,
            token,
            events: EventEmitter::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Download every segment and hand it to `sink` in manifest order.
    ///
    /// In-flight plus held-back segments never exceed the concurrency limit.
    /// The first fatal error cancels the job token, drops all outstanding work
    /// and is returned as is.
    pub async fn run<S>(
        &self,
        segments: Vec<SegmentDescriptor>,
        sink: &mut S,
    ) -> Result<PipelineSummary, DownloadError>
    where
        S: SegmentSink + ?Sized,
    {
        if let Some((position, segment)) = segments
            .iter()
            .enumerate()
            .find(|(position, segment)| segment.index != *position)
        {
            return Err(DownloadError::playlist(format!(
                "segment at position {position} carries index {}",
                segment.index
            )));
        }

        let total = segments.len();
        info!(total, concurrency = self.concurrency, "Segment pipeline started");

        let mut queue = segments.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut reorder: BTreeMap<usize, DecryptedSegment> = BTreeMap::new();
        let mut next_due = 0usize;
        let mut summary = PipelineSummary::default();

        loop {
            while in_flight.len() + reorder.len() < self.concurrency {
                let Some(segment) = queue.next() else {
                    break;
                };
                self.events.emit(JobEvent::SegmentStarted {
                    index: segment.index + 1,
                    total,
                });
                in_flight.push(self.process(segment));
            }

            if in_flight.is_empty() {
                break;
            }

            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(DownloadError::Cancelled),
                Some(result) = in_flight.next() => result,
            };

            let segment = match result {
                Ok(segment) => segment,
                Err(err) => {
                    warn!(error = %err, in_flight = in_flight.len(), "Aborting segment pipeline");
                    self.token.cancel();
                    return Err(err);
                }
            };

            trace!(index = segment.index, next_due, "Segment completed");
            reorder.insert(segment.index, segment);

            while let Some(segment) = reorder.remove(&next_due) {
                let bytes = segment.data.len() as u64;
                if let Err(err) = sink.accept(segment).await {
                    self.token.cancel();
                    return Err(err);
                }
                next_due += 1;
                summary.segments += 1;
                summary.bytes += bytes;
                self.events.emit(JobEvent::SegmentCompleted {
                    index: next_due,
                    total,
                    bytes,
                });
            }
            summary.max_buffered = summary.max_buffered.max(reorder.len());
        }

        debug_assert!(reorder.is_empty());
        info!(
            segments = summary.segments,
            bytes = summary.bytes,
            "Segment pipeline finished"
        );
        Ok(summary)
    }

    #[instrument(skip(self, segment), fields(index = segment.index + 1))]
    async fn process(&self, segment: SegmentDescriptor) -> Result<DecryptedSegment, DownloadError> {
        let material = match &segment.key {
            Some(key) => {
                let raw = self.keys.resolve(&key.uri).await?;
                let iv = match &key.iv {
                    Some(hex) => parse_iv(hex)?,
                    None => iv_from_sequence(segment.sequence),
                };
                Some((raw, iv))
            }
            None => None,
        };

        let data = self
            .policy
            .run(&self.token, |attempt| {
                let segment = &segment;
                let material = material.as_ref();
                async move {
                    if attempt > 1 {
                        debug!(attempt, url = %segment.uri, "Retrying segment");
                    }
                    self.fetch_once(segment, material).await
                }
            })
            .await
            .map_err(|err| match err {
                DownloadError::SegmentFetchTransient { index, url, reason } => {
                    DownloadError::SegmentFetchExhausted {
                        index,
                        url,
                        attempts: self.policy.max_attempts,
                        reason,
                    }
                }
                other => other,
            })?;

        debug!(size = data.len(), "Segment downloaded");
        Ok(DecryptedSegment {
            index: segment.index,
            uri: segment.uri,
            data,
        })
    }

    /// One attempt: stream the body, decrypting as chunks arrive.
    async fn fetch_once(
        &self,
        segment: &SegmentDescriptor,
        material: Option<&(Bytes, [u8; 16])>,
    ) -> Result<Bytes, DownloadError> {
        let mut decryptor = material
            .map(|(key, iv)| CbcStreamDecryptor::new(key, iv))
            .transpose()?;

        let mut stream = self.fetcher.open(segment).await?;
        let mut out = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            match decryptor.as_mut() {
                Some(decryptor) => out.extend_from_slice(&decryptor.update(&chunk)),
                None => out.extend_from_slice(&chunk),
            }
        }
        if let Some(decryptor) = decryptor {
            out.extend_from_slice(&decryptor.finish()?);
        }
        Ok(out.freeze())
    }
}
