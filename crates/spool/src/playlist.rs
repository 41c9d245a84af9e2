// Playlist loading: turns the signed manifest into an ordered list of segment descriptors.

use async_trait::async_trait;
use m3u8_rs::{Key, KeyMethod, Playlist};
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

use crate::DownloadError;

/// Where a segment's key lives and which IV it uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKey {
    pub uri: Url,
    /// Hex IV as written in the manifest, `None` when it must be derived
    /// from the media sequence number.
    pub iv: Option<String>,
}

/// One entry of the manifest. Its `index` defines the output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// 0-based manifest position
    pub index: usize,
    pub sequence: u64,
    pub uri: Url,
    /// `None` for segments served in the clear
    pub key: Option<SegmentKey>,
}

#[async_trait]
pub trait PlaylistSource: Send + Sync {
    async fn load(&self, url: &Url) -> Result<Vec<SegmentDescriptor>, DownloadError>;
}

pub struct HttpPlaylistSource {
    client: Client,
}

impl HttpPlaylistSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlaylistSource for HttpPlaylistSource {
    async fn load(&self, url: &Url) -> Result<Vec<SegmentDescriptor>, DownloadError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| DownloadError::playlist(format!("failed to fetch {url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::playlist(format!(
                "playlist request to {url} returned HTTP {status}"
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| DownloadError::playlist(format!("failed to read {url}: {e}")))?;

        let segments = parse_media_playlist(&body, url)?;
        info!(url = %url, segments = segments.len(), "Playlist loaded");
        Ok(segments)
    }
}

/// Parse a media playlist, resolving relative URIs against `base`.
///
/// An `EXT-X-KEY` tag applies to every following segment until the next one.
pub fn parse_media_playlist(
    input: &[u8],
    base: &Url,
) -> Result<Vec<SegmentDescriptor>, DownloadError> {
    let playlist = match m3u8_rs::parse_playlist_res(input) {
        Ok(Playlist::MediaPlaylist(pl)) => pl,
        Ok(Playlist::MasterPlaylist(_)) => {
            return Err(DownloadError::playlist(
                "expected a media playlist but got a master playlist",
            ));
        }
        Err(e) => {
            return Err(DownloadError::playlist(format!(
                "failed to parse playlist: {e}"
            )));
        }
    };

    // m3u8-rs drops `METHOD=NONE` tags, so the clear-text boundaries come from the raw text.
    let cleared = cleared_segments(input);
    let mut current_key: Option<Key> = None;
    let mut segments = Vec::with_capacity(playlist.segments.len());
    for (index, segment) in playlist.segments.iter().enumerate() {
        if cleared.get(index).copied().unwrap_or(false) {
            current_key = None;
        } else if let Some(key) = &segment.key {
            current_key = Some(key.clone());
        }
        let sequence = playlist.media_sequence + index as u64;
        let uri = join(base, &segment.uri)?;
        let key = match &current_key {
            None => None,
            Some(key) => segment_key(key, base)?,
        };
        segments.push(SegmentDescriptor {
            index,
            sequence,
            uri,
            key,
        });
    }

    debug!(
        segments = segments.len(),
        media_sequence = playlist.media_sequence,
        "Parsed media playlist"
    );
    Ok(segments)
}

/// For each segment URI line, whether the last `EXT-X-KEY` tag before it (and
/// after the previous segment) was `METHOD=NONE`.
fn cleared_segments(input: &[u8]) -> Vec<bool> {
    let text = String::from_utf8_lossy(input);
    let mut cleared = Vec::new();
    let mut pending = false;
    for line in text.lines().map(str::trim) {
        if let Some(attributes) = line.strip_prefix("#EXT-X-KEY:") {
            pending = attributes
                .split(',')
                .any(|attribute| attribute.trim().eq_ignore_ascii_case("METHOD=NONE"));
        } else if !line.is_empty() && !line.starts_with('#') {
            cleared.push(pending);
            pending = false;
        }
    }
    cleared
}

fn segment_key(key: &Key, base: &Url) -> Result<Option<SegmentKey>, DownloadError> {
    match &key.method {
        KeyMethod::None => Ok(None),
        KeyMethod::AES128 => {
            let uri = key
                .uri
                .as_deref()
                .ok_or_else(|| DownloadError::playlist("AES-128 key tag without URI"))?;
            Ok(Some(SegmentKey {
                uri: join(base, uri)?,
                iv: key.iv.clone(),
            }))
        }
        other => Err(DownloadError::decryption(format!(
            "unsupported encryption method {other:?}"
        ))),
    }
}

fn join(base: &Url, reference: &str) -> Result<Url, DownloadError> {
    base.join(reference).map_err(|e| {
        DownloadError::playlist(format!("cannot resolve `{reference}` against {base}: {e}"))
    })
}
