//! Spool: acquisition and reassembly of signed, segment-encrypted media streams.
//!
//! A job runs in four stages:
//!
//! - [`ManifestResolver`] renders the page in a headless browser and polls its
//!   network traffic until the signed `.m3u8` request shows up
//! - [`KeyResolver`] fetches each AES-128 key once, sharing in-flight fetches
//! - [`SegmentPipeline`] downloads and decrypts segments with bounded
//!   concurrency and delivers them strictly in manifest order
//! - [`OutputAssembler`] appends them to a `.part` file that is only renamed once
//!   every segment is written, after which [`Transcoder`] may convert it
//!
//! [`DownloadJob`] wires these together; every network-facing collaborator is a
//! trait so it can be replaced in tests.
//!
//! ## License
//!
//! This project is licensed under the [MIT](./LICENSE.MIT) or
//! [Apache-2.0](./LICENSE.Apache-2.0) license. You can choose between one of
//! them if you use this work.
//!
//! `SPDX-License-Identifier: MIT OR Apache-2.0`

pub mod client;
pub mod config;
pub mod decrypt;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod job;
pub mod key;
pub mod manifest;
pub mod output;
pub mod pipeline;
pub mod playlist;
pub mod retry;
pub mod transcode;

pub use client::create_client;
pub use config::{
    BrowserOptions, DownloaderConfig, JobConfig, KeyConfig, ManifestConfig, OutputConfig,
    OutputMode, SegmentConfig, TranscodeConfig,
};
pub use decrypt::CbcStreamDecryptor;
pub use error::{DownloadError, Stage};
pub use events::{EventEmitter, JobEvent};
pub use fetcher::{ChunkStream, HttpSegmentFetcher, SegmentFetcher};
pub use job::{DownloadJob, JobReport, sanitize_filename, title_from_url};
pub use key::{HttpKeyFetcher, KeyFetcher, KeyResolver};
pub use manifest::{
    BrowserLauncher, BrowserSession, ChromiumLauncher, ManifestResolver, ResolverState,
    TrafficObserver,
};
pub use output::{FinalizedOutput, OutputAssembler};
pub use pipeline::{DecryptedSegment, PipelineSummary, SegmentPipeline, SegmentSink};
pub use playlist::{HttpPlaylistSource, PlaylistSource, SegmentDescriptor, SegmentKey};
pub use retry::RetryPolicy;
pub use transcode::{TranscodeOutcome, Transcoder};
