// Headless Chromium driven over the DevTools protocol.
//
// Only the network-observation side of the browser is used: the page is opened
// in a fresh target and every `Network.requestWillBeSent` URL is recorded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace};
use url::Url;

use super::observer::{BrowserLauncher, BrowserSession, TrafficObserver};
use crate::DownloadError;
use crate::config::BrowserOptions;

const BROWSER_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
];
const DEVTOOLS_BANNER: &str = "DevTools listening on ";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, DownloadError>>>>>;

#[derive(Debug, Deserialize)]
struct Incoming {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    result: Option<Value>,
    error: Option<ProtocolError>,
}

#[derive(Debug, Deserialize)]
struct ProtocolError {
    code: i64,
    message: String,
}

/// Launches a throwaway Chromium/Chrome instance per session.
#[derive(Debug, Default, Clone)]
pub struct ChromiumLauncher;

impl ChromiumLauncher {
    pub fn new() -> Self {
        Self
    }
}

/// Look for a Chromium-family executable on `PATH`.
pub fn find_browser() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find_map(|dir| {
        BROWSER_CANDIDATES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

/// Command line for one session using `profile_dir` as its user data directory.
pub fn browser_args(options: &BrowserOptions, profile_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "--remote-debugging-port=0".to_string(),
        format!("--user-data-dir={}", profile_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--mute-audio".to_string(),
        "--disable-gpu".to_string(),
    ];
    if options.headless {
        args.push("--headless=new".to_string());
    }
    if options.disable_images {
        args.push("--blink-settings=imagesEnabled=false".to_string());
    }
    args.extend(options.extra_args.iter().cloned());
    args.push("about:blank".to_string());
    args
}

fn parse_devtools_banner(line: &str) -> Option<&str> {
    line.find(DEVTOOLS_BANNER)
        .map(|pos| line[pos + DEVTOOLS_BANNER.len()..].trim())
        .filter(|url| url.starts_with("ws://"))
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn open(
        &self,
        page_url: &Url,
        options: &BrowserOptions,
    ) -> Result<Box<dyn BrowserSession>, DownloadError> {
        let program = match &options.executable {
            Some(program) => program.clone(),
            None => find_browser().ok_or_else(|| {
                DownloadError::browser("no Chromium or Chrome executable found on PATH")
            })?,
        };
        let profile = tempfile::Builder::new()
            .prefix("spool-profile-")
            .tempdir()
            .map_err(|e| DownloadError::io(std::env::temp_dir(), e))?;

        let mut child = Command::new(&program)
            .args(browser_args(options, profile.path()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DownloadError::browser(format!("failed to launch {}: {e}", program.display()))
            })?;
        debug!(program = %program.display(), pid = ?child.id(), "Browser launched");

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownloadError::browser("browser stderr was not captured"))?;
        let mut lines = BufReader::new(stderr).lines();

        let endpoint = tokio::time::timeout(options.startup_timeout, async {
            while let Some(line) = lines.next_line().await? {
                if let Some(url) = parse_devtools_banner(&line) {
                    return Ok(Some(url.to_string()));
                }
                trace!(line = %line, "browser stderr");
            }
            Ok::<_, std::io::Error>(None)
        })
        .await
        .map_err(|_| {
            DownloadError::browser(format!(
                "DevTools endpoint not announced within {:?}",
                options.startup_timeout
            ))
        })?
        .map_err(|e| DownloadError::browser(format!("failed to read browser output: {e}")))?
        .ok_or_else(|| {
            DownloadError::browser("browser exited before announcing its DevTools endpoint")
        })?;

        // Keep draining so a chatty browser never blocks on a full pipe.
        let drain = tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(line = %line, "browser stderr");
            }
        });

        let connection = match DevToolsConnection::connect(&endpoint).await {
            Ok(connection) => connection,
            Err(e) => {
                drain.abort();
                return Err(e);
            }
        };
        let session = ChromiumSession {
            child,
            connection,
            drain,
            _profile: profile,
        };

        if let Err(e) = session.connection.open_page(page_url).await {
            let _ = Box::new(session).close().await;
            return Err(e);
        }
        info!(page = %page_url, "Browser session opened");
        Ok(Box::new(session))
    }
}

/// A browser process plus its DevTools connection. The process is killed when
/// the session is closed or dropped, and the profile directory removed.
pub struct ChromiumSession {
    child: Child,
    connection: DevToolsConnection,
    drain: JoinHandle<()>,
    _profile: TempDir,
}

#[async_trait]
impl TrafficObserver for ChromiumSession {
    async fn observed_urls(&self) -> Result<Vec<String>, DownloadError> {
        Ok(self.connection.observed_urls())
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn close(mut self: Box<Self>) -> Result<(), DownloadError> {
        let _ = tokio::time::timeout(
            CLOSE_TIMEOUT,
            self.connection.call(None, "Browser.close", json!({})),
        )
        .await;
        self.connection.shutdown();
        self.drain.abort();
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "Browser already gone");
        }
        debug!("Browser session closed");
        Ok(())
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

/// Request/response multiplexing over one DevTools websocket.
struct DevToolsConnection {
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    pending: Pending,
    urls: Arc<Mutex<Vec<String>>>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl DevToolsConnection {
    async fn connect(endpoint: &str) -> Result<Self, DownloadError> {
        let (ws, _) = connect_async(endpoint).await.map_err(|e| {
            DownloadError::browser(format!("failed to connect to DevTools at {endpoint}: {e}"))
        })?;
        let (sink, stream) = ws.split();
        let pending = Pending::default();
        let urls = Arc::new(Mutex::new(Vec::new()));
        let reader = tokio::spawn(read_loop(stream, Arc::clone(&pending), Arc::clone(&urls)));
        Ok(Self {
            sink: tokio::sync::Mutex::new(sink),
            pending,
            urls,
            next_id: AtomicU64::new(1),
            reader,
        })
    }

    async fn call(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, DownloadError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut request = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            request["sessionId"] = Value::from(session_id);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        trace!(id, method, "DevTools call");
        if let Err(e) = self
            .sink
            .lock()
            .await
            .send(Message::text(request.to_string()))
            .await
        {
            self.pending.lock().remove(&id);
            return Err(DownloadError::browser(format!("failed to send {method}: {e}")));
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DownloadError::browser(format!(
                "DevTools connection closed during {method}"
            ))),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(DownloadError::browser(format!("{method} timed out")))
            }
        }
    }

    /// Open `page_url` in a new target with network tracking enabled.
    async fn open_page(&self, page_url: &Url) -> Result<(), DownloadError> {
        let target = self
            .call(None, "Target.createTarget", json!({ "url": "about:blank" }))
            .await?;
        let target_id = string_field(&target, "targetId")?;
        let attached = self
            .call(
                None,
                "Target.attachToTarget",
                json!({ "targetId": &target_id, "flatten": true }),
            )
            .await?;
        let session_id = string_field(&attached, "sessionId")?;

        self.call(Some(&session_id), "Network.enable", json!({}))
            .await?;
        let navigation = self
            .call(
                Some(&session_id),
                "Page.navigate",
                json!({ "url": page_url.as_str() }),
            )
            .await?;
        if let Some(error) = navigation.get("errorText").and_then(Value::as_str) {
            return Err(DownloadError::browser(format!(
                "navigation to {page_url} failed: {error}"
            )));
        }
        debug!(target_id = %target_id, page = %page_url, "Page navigation started");
        Ok(())
    }

    fn observed_urls(&self) -> Vec<String> {
        self.urls.lock().iter().rev().cloned().collect()
    }

    fn shutdown(&self) {
        self.reader.abort();
        self.pending.lock().clear();
    }
}

impl Drop for DevToolsConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn string_field(value: &Value, field: &str) -> Result<String, DownloadError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DownloadError::browser(format!("DevTools reply is missing `{field}`")))
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    pending: Pending,
    urls: Arc<Mutex<Vec<String>>>,
) {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "DevTools connection lost");
                break;
            }
        };
        let incoming: Incoming = match serde_json::from_str(text.as_str()) {
            Ok(incoming) => incoming,
            Err(e) => {
                trace!(error = %e, "Ignoring undecodable DevTools message");
                continue;
            }
        };

        if let Some(id) = incoming.id {
            let Some(tx) = pending.lock().remove(&id) else {
                continue;
            };
            let result = match incoming.error {
                Some(err) => Err(DownloadError::browser(format!(
                    "DevTools error {}: {}",
                    err.code, err.message
                ))),
                None => Ok(incoming.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(result);
        } else if incoming.method.as_deref() == Some("Network.requestWillBeSent") {
            if let Some(url) = incoming.params.pointer("/request/url").and_then(Value::as_str) {
                trace!(url, "Request observed");
                urls.lock().push(url.to_string());
            }
        }
    }
    // Fail any caller still waiting for a reply.
    pending.lock().clear();
}
