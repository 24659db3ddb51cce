//! RMI client
//!
//! A client owns one background worker at a time. The worker holds the
//! socket exclusively: it authenticates, drains a FIFO request queue,
//! interleaves outbound commands with heartbeats from either side, and
//! publishes results into locked stores the public getters snapshot.
//! Every read runs under an overall deadline split into short steps so a
//! stop request is observed within one step.

use crate::error::{Result, RmiError};
use crate::protocol::{self, FRAME_HEADER_SIZE};
use crate::types::{
    ClientConfig, ClientStatus, DownloadData, DownloadProgress, FileEntry, FileListing,
    ScreencapImage, VersionInfo,
};
use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Control replies (`OK`, `ERR ...`, `VERSION ...`) never exceed this
const MAX_CONTROL_REPLY_BYTES: usize = 256;

/// Screencap payloads above this edge length are rejected before decoding
const MAX_SCREENCAP_DIM: u32 = 4096;

/// Largest file the client will offer for upload
const MAX_UPLOAD_BYTES: u64 = u32::MAX as u64;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

const OK_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const VERSION_TIMEOUT: Duration = Duration::from_secs(3);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(15);
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(protocol::HEARTBEAT_INTERVAL_MS);
const HEARTBEAT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const READ_STEP: Duration = Duration::from_secs(1);
const QUEUE_WAIT: Duration = Duration::from_millis(100);

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);

/// Which parser runs against the frames following a request
enum ResponseKind {
    None,
    Ok { disconnect_after: bool },
    Version,
    List { path: String },
    Download { path: String },
    Screencap,
}

enum Request {
    Command {
        message: String,
        response: ResponseKind,
    },
    Upload {
        local_path: PathBuf,
        remote_path: String,
        restart_after: bool,
    },
}

enum Flow {
    Continue,
    Stop,
}

#[derive(Default)]
struct ScreencapStore {
    png: Vec<u8>,
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    revision: u64,
    save_counter: u64,
    last_path: Option<PathBuf>,
}

#[derive(Default)]
struct DownloadState {
    data: Vec<u8>,
    error: String,
    revision: u64,
    received: u64,
    total: u64,
    in_progress: bool,
}

#[derive(Default)]
struct TransferStore {
    listings: HashMap<String, FileListing>,
    downloads: HashMap<String, DownloadState>,
}

/// State shared between the public API and the worker. Four independent
/// locks; none is ever held across an await point.
struct Shared {
    status: AtomicU8,
    stop: AtomicBool,
    stop_notify: Notify,
    error: Mutex<String>,
    screencap: Mutex<ScreencapStore>,
    version: Mutex<VersionInfo>,
    transfers: Mutex<TransferStore>,
}

impl Shared {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(ClientStatus::Disconnected as u8),
            stop: AtomicBool::new(false),
            stop_notify: Notify::new(),
            error: Mutex::new(String::new()),
            screencap: Mutex::new(ScreencapStore::default()),
            version: Mutex::new(VersionInfo::default()),
            transfers: Mutex::new(TransferStore::default()),
        }
    }

    fn status(&self) -> ClientStatus {
        ClientStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: ClientStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    fn last_error(&self) -> String {
        self.error.lock().unwrap().clone()
    }

    fn set_error(&self, message: &str) {
        *self.error.lock().unwrap() = message.to_string();
    }

    fn clear_error(&self) {
        self.error.lock().unwrap().clear();
    }

    fn set_version_value(&self, value: i64) {
        let mut version = self.version.lock().unwrap();
        version.version = Some(value);
        version.error.clear();
        version.revision += 1;
    }

    fn set_version_error(&self, message: &str) {
        let mut version = self.version.lock().unwrap();
        version.error = message.to_string();
        version.revision += 1;
    }

    fn set_screencap(&self, png: Vec<u8>, pixels: Vec<u8>, width: u32, height: u32) {
        let mut store = self.screencap.lock().unwrap();
        store.png = png;
        store.pixels = pixels;
        store.width = width;
        store.height = height;
        store.last_path = None;
        store.revision += 1;
    }

    fn set_listing(&self, path: &str, entries: Vec<FileEntry>) {
        let mut transfers = self.transfers.lock().unwrap();
        let listing = transfers.listings.entry(path.to_string()).or_default();
        listing.entries = entries;
        listing.error.clear();
        listing.revision += 1;
    }

    fn set_listing_error(&self, path: &str, message: &str) {
        let mut transfers = self.transfers.lock().unwrap();
        let listing = transfers.listings.entry(path.to_string()).or_default();
        listing.entries.clear();
        listing.error = message.to_string();
        listing.revision += 1;
    }

    fn reset_download(&self, path: &str) {
        let mut transfers = self.transfers.lock().unwrap();
        let download = transfers.downloads.entry(path.to_string()).or_default();
        download.data.clear();
        download.error.clear();
        download.received = 0;
        download.total = 0;
        download.in_progress = true;
        download.revision += 1;
    }

    fn set_download_progress(&self, path: &str, received: u64, total: u64, in_progress: bool) {
        let mut transfers = self.transfers.lock().unwrap();
        let download = transfers.downloads.entry(path.to_string()).or_default();
        download.received = received;
        download.total = total;
        download.in_progress = in_progress;
        download.revision += 1;
    }

    fn complete_download(&self, path: &str, data: Vec<u8>) {
        let mut transfers = self.transfers.lock().unwrap();
        let download = transfers.downloads.entry(path.to_string()).or_default();
        download.total = data.len() as u64;
        download.received = download.total;
        download.data = data;
        download.error.clear();
        download.in_progress = false;
        download.revision += 1;
    }

    /// Record a failure that may have left partial progress behind
    fn fail_download(&self, path: &str, message: &str) {
        let mut transfers = self.transfers.lock().unwrap();
        let download = transfers.downloads.entry(path.to_string()).or_default();
        download.error = message.to_string();
        download.in_progress = false;
        download.revision += 1;
    }

    /// Record a download the server refused before any payload moved
    fn reject_download(&self, path: &str, message: &str) {
        let mut transfers = self.transfers.lock().unwrap();
        let download = transfers.downloads.entry(path.to_string()).or_default();
        download.data.clear();
        download.error = message.to_string();
        download.received = 0;
        download.total = 0;
        download.in_progress = false;
        download.revision += 1;
    }
}

/// RMI client: public request/snapshot API over a background worker
pub struct RmiClient {
    shared: Arc<Shared>,
    sender: Option<UnboundedSender<Request>>,
    worker: Option<JoinHandle<()>>,
    client_id: u32,
}

impl Default for RmiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RmiClient {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            sender: None,
            worker: None,
            client_id: NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Launch a worker for `config`. Returns false when a worker is
    /// already connecting or connected; a finished worker is joined first.
    pub async fn connect(&mut self, config: ClientConfig) -> bool {
        match self.shared.status() {
            ClientStatus::Connecting | ClientStatus::Connected => return false,
            _ => {}
        }
        self.join_worker().await;
        self.shared.clear_error();
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.set_status(ClientStatus::Connecting);

        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = Worker {
            shared: Arc::clone(&self.shared),
            requests: receiver,
            config,
        };
        self.sender = Some(sender);
        self.worker = Some(tokio::spawn(worker.run()));
        true
    }

    /// Stop the worker and join it. Pending reads observe the stop flag
    /// within one read step.
    pub async fn disconnect(&mut self) {
        self.shared.request_stop();
        self.join_worker().await;
        if self.shared.status() != ClientStatus::Error {
            self.shared.set_status(ClientStatus::Disconnected);
        }
    }

    async fn join_worker(&mut self) {
        self.sender = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }

    pub fn status(&self) -> ClientStatus {
        self.shared.status()
    }

    pub fn status_label(&self) -> &'static str {
        self.shared.status().label()
    }

    pub fn last_error(&self) -> String {
        self.shared.last_error()
    }

    pub fn send_screencap(&self) {
        self.queue_command(protocol::CMD_SCREENCAP.to_string(), ResponseKind::Screencap);
    }

    pub fn send_quit(&self) {
        self.queue_command(
            protocol::CMD_QUIT.to_string(),
            ResponseKind::Ok {
                disconnect_after: true,
            },
        );
    }

    pub fn send_restart(&self) {
        self.queue_command(
            protocol::CMD_RESTART.to_string(),
            ResponseKind::Ok {
                disconnect_after: true,
            },
        );
    }

    pub fn send_version(&self) {
        self.queue_command(protocol::CMD_VERSION.to_string(), ResponseKind::Version);
    }

    pub fn send_press(&self, keycode: i32) {
        self.queue_command(
            format!("{} {}", protocol::CMD_PRESS, keycode),
            ResponseKind::Ok {
                disconnect_after: false,
            },
        );
    }

    pub fn send_press_input(&self, keycode: i32) {
        self.queue_command(
            format!("{} {}", protocol::CMD_PRESS_INPUT, keycode),
            ResponseKind::Ok {
                disconnect_after: false,
            },
        );
    }

    pub fn send_open(&self, target: &str) {
        if self.shared.status() != ClientStatus::Connected {
            return;
        }
        let Some(target) = self.validated_path(target, "Open target") else {
            return;
        };
        self.queue_command(
            format!("{} {}", protocol::CMD_OPEN, target),
            ResponseKind::Ok {
                disconnect_after: false,
            },
        );
    }

    pub fn request_file_list(&self, path: &str) {
        if self.shared.status() != ClientStatus::Connected {
            return;
        }
        let Some(path) = self.validated_path(path, "File list") else {
            return;
        };
        self.queue_command(
            format!("{} {}", protocol::CMD_LIST, path),
            ResponseKind::List { path },
        );
    }

    pub fn request_download(&self, path: &str) {
        if self.shared.status() != ClientStatus::Connected {
            return;
        }
        let Some(path) = self.validated_path(path, "Download") else {
            return;
        };
        self.queue_command(
            format!("{} {}", protocol::CMD_DOWNLOAD, path),
            ResponseKind::Download { path },
        );
    }

    pub fn request_delete(&self, path: &str) {
        if self.shared.status() != ClientStatus::Connected {
            return;
        }
        let Some(path) = self.validated_path(path, "Delete") else {
            return;
        };
        self.queue_command(
            format!("{} {}", protocol::CMD_DELETE, path),
            ResponseKind::Ok {
                disconnect_after: false,
            },
        );
    }

    pub fn send_upload(&self, local_path: impl Into<PathBuf>, remote_path: &str) {
        self.queue_upload(local_path.into(), remote_path, false);
    }

    /// Upload, then ask the server to re-exec itself and stop cleanly
    pub fn send_upload_and_restart(&self, local_path: impl Into<PathBuf>, remote_path: &str) {
        self.queue_upload(local_path.into(), remote_path, true);
    }

    fn queue_upload(&self, local_path: PathBuf, remote_path: &str, restart_after: bool) {
        if self.shared.status() != ClientStatus::Connected {
            return;
        }
        if let Some(sender) = &self.sender {
            let _ = sender.send(Request::Upload {
                local_path,
                remote_path: remote_path.to_string(),
                restart_after,
            });
        }
    }

    fn queue_command(&self, message: String, response: ResponseKind) {
        if self.shared.status() != ClientStatus::Connected {
            return;
        }
        if let Some(sender) = &self.sender {
            let _ = sender.send(Request::Command { message, response });
        }
    }

    fn validated_path(&self, path: &str, what: &str) -> Option<String> {
        if path.is_empty() {
            self.shared.set_error(&format!("{} path is empty", what));
            return None;
        }
        if path.contains(char::is_whitespace) {
            self.shared
                .set_error(&format!("{} path must not contain whitespace", what));
            return None;
        }
        Some(path.to_string())
    }

    /// Revision of the screencap store; bumps on every new capture
    pub fn screencap_revision(&self) -> u64 {
        self.shared.screencap.lock().unwrap().revision
    }

    /// Decoded pixels of the most recent screencap
    pub fn screencap_image(&self) -> Option<ScreencapImage> {
        let store = self.shared.screencap.lock().unwrap();
        if store.pixels.is_empty() || store.width == 0 || store.height == 0 {
            return None;
        }
        Some(ScreencapImage {
            pixels: store.pixels.clone(),
            width: store.width,
            height: store.height,
            revision: store.revision,
        })
    }

    /// Raw PNG bytes of the most recent screencap
    pub fn screencap_png(&self) -> Option<(Vec<u8>, u64)> {
        let store = self.shared.screencap.lock().unwrap();
        if store.png.is_empty() {
            return None;
        }
        Some((store.png.clone(), store.revision))
    }

    /// Where the most recent screencap was saved, if it has been
    pub fn last_screencap_path(&self) -> Option<PathBuf> {
        self.shared.screencap.lock().unwrap().last_path.clone()
    }

    /// Write the most recent screencap PNG under `captures/` in the
    /// current directory
    pub fn save_last_screencap(&self) -> Result<PathBuf> {
        let (png, index) = {
            let mut store = self.shared.screencap.lock().unwrap();
            if store.png.is_empty() {
                drop(store);
                self.shared.set_error("No screencap data to save");
                return Err(RmiError::Io(std::io::Error::other(
                    "No screencap data to save",
                )));
            }
            store.save_counter += 1;
            (store.png.clone(), store.save_counter)
        };

        let capture_dir = std::env::current_dir()?.join("captures");
        std::fs::create_dir_all(&capture_dir)?;
        let file_path = capture_dir.join(format!(
            "screencap_client{}_{}.png",
            self.client_id, index
        ));
        if let Err(err) = std::fs::write(&file_path, &png) {
            self.shared
                .set_error(&format!("Failed to write screencap file: {}", err));
            return Err(err.into());
        }

        self.shared.screencap.lock().unwrap().last_path = Some(file_path.clone());
        self.shared.clear_error();
        Ok(file_path)
    }

    /// Snapshot of the server version store
    pub fn version_info(&self) -> VersionInfo {
        self.shared.version.lock().unwrap().clone()
    }

    /// Snapshot of the listing for `path`, if one was ever requested
    pub fn file_list(&self, path: &str) -> Option<FileListing> {
        self.shared
            .transfers
            .lock()
            .unwrap()
            .listings
            .get(path)
            .cloned()
    }

    /// Move the downloaded bytes for `path` out of the store
    pub fn take_download_data(&self, path: &str) -> Option<DownloadData> {
        let mut transfers = self.shared.transfers.lock().unwrap();
        let download = transfers.downloads.get_mut(path)?;
        Some(DownloadData {
            data: std::mem::take(&mut download.data),
            error: download.error.clone(),
            revision: download.revision,
        })
    }

    /// Byte-level progress of the download for `path`
    pub fn download_progress(&self, path: &str) -> Option<DownloadProgress> {
        let transfers = self.shared.transfers.lock().unwrap();
        let download = transfers.downloads.get(path)?;
        Some(DownloadProgress {
            received: download.received,
            total: download.total,
            in_progress: download.in_progress,
        })
    }
}

impl Drop for RmiClient {
    fn drop(&mut self) {
        self.shared.request_stop();
    }
}

struct Worker {
    shared: Arc<Shared>,
    requests: UnboundedReceiver<Request>,
    config: ClientConfig,
}

impl Worker {
    async fn run(mut self) {
        match self.session().await {
            Ok(()) => {
                if self.shared.status() != ClientStatus::Error {
                    self.shared.set_status(ClientStatus::Disconnected);
                }
            }
            Err(err) => {
                self.shared.set_error(&error_text(&err));
                self.shared.set_status(ClientStatus::Error);
            }
        }
    }

    async fn session(&mut self) -> Result<()> {
        let mut stream =
            TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
        self.authenticate(&mut stream).await?;
        self.shared.set_status(ClientStatus::Connected);
        debug!("connected to {}:{}", self.config.host, self.config.port);

        let mut last_outbound = Instant::now();
        loop {
            if self.shared.stopped() {
                return Ok(());
            }
            let shared = Arc::clone(&self.shared);
            let request = tokio::select! {
                _ = shared.stop_notify.notified() => None,
                request = self.requests.recv() => match request {
                    Some(request) => Some(request),
                    // all senders gone: the owning client was dropped
                    None => return Ok(()),
                },
                _ = tokio::time::sleep(QUEUE_WAIT) => None,
            };
            if self.shared.stopped() {
                return Ok(());
            }

            let Some(request) = request else {
                if last_outbound.elapsed() >= HEARTBEAT_INTERVAL {
                    self.heartbeat(&mut stream).await?;
                    last_outbound = Instant::now();
                }
                continue;
            };

            last_outbound = Instant::now();
            let flow = match request {
                Request::Command { message, response } => {
                    self.send_text_frame(&mut stream, &message).await?;
                    self.handle_response(&mut stream, response).await?
                }
                Request::Upload {
                    local_path,
                    remote_path,
                    restart_after,
                } => {
                    self.handle_upload(&mut stream, &local_path, &remote_path, restart_after)
                        .await?
                }
            };
            if let Flow::Stop = flow {
                self.shared.set_status(ClientStatus::Disconnected);
                self.shared.stop.store(true, Ordering::SeqCst);
                return Ok(());
            }
        }
    }

    async fn authenticate(&self, stream: &mut TcpStream) -> Result<()> {
        let login = format!(
            "{} {} {}",
            protocol::CMD_AUTH,
            self.config.username,
            self.config.password
        );
        self.send_text_frame(stream, &login).await?;
        let payload = self
            .receive_skipping_heartbeats(stream, OK_REPLY_TIMEOUT, MAX_CONTROL_REPLY_BYTES)
            .await?;
        if protocol::payload_equals(&payload, protocol::RESP_OK) {
            return Ok(());
        }
        if protocol::payload_starts_with(&payload, protocol::RESP_ERR_PREFIX) {
            return Err(RmiError::Protocol(protocol::payload_to_string(&payload)));
        }
        Err(RmiError::Protocol(format!(
            "Unexpected auth response: {}",
            protocol::payload_to_string(&payload)
        )))
    }

    async fn handle_response(
        &self,
        stream: &mut TcpStream,
        response: ResponseKind,
    ) -> Result<Flow> {
        match response {
            ResponseKind::None => Ok(Flow::Continue),
            ResponseKind::Ok { disconnect_after } => {
                let payload = self
                    .receive_skipping_heartbeats(stream, OK_REPLY_TIMEOUT, MAX_CONTROL_REPLY_BYTES)
                    .await?;
                if protocol::payload_equals(&payload, protocol::RESP_OK) {
                    if disconnect_after {
                        return Ok(Flow::Stop);
                    }
                } else {
                    self.shared.set_error(&reply_error_text(&payload));
                }
                Ok(Flow::Continue)
            }
            ResponseKind::Version => {
                // version failures never tear the session down
                let outcome = match self
                    .receive_skipping_heartbeats(stream, VERSION_TIMEOUT, MAX_CONTROL_REPLY_BYTES)
                    .await
                {
                    Ok(payload) => protocol::parse_version_payload(&payload),
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(version) => self.shared.set_version_value(version),
                    Err(err) => {
                        let message = error_text(&err);
                        self.shared.set_version_error(&message);
                        self.shared.set_error(&message);
                    }
                }
                Ok(Flow::Continue)
            }
            ResponseKind::List { path } => {
                let payload = self
                    .receive_skipping_heartbeats(stream, OK_REPLY_TIMEOUT, 0)
                    .await?;
                match protocol::parse_file_list(&payload) {
                    Ok(entries) => self.shared.set_listing(&path, entries),
                    Err(err) => self.shared.set_listing_error(&path, &error_text(&err)),
                }
                Ok(Flow::Continue)
            }
            ResponseKind::Download { path } => {
                self.shared.reset_download(&path);
                let ack = match self
                    .receive_skipping_heartbeats(stream, OK_REPLY_TIMEOUT, MAX_CONTROL_REPLY_BYTES)
                    .await
                {
                    Ok(ack) => ack,
                    Err(err) => {
                        self.shared.fail_download(&path, &error_text(&err));
                        return Err(err);
                    }
                };
                if protocol::payload_equals(&ack, protocol::RESP_OK) {
                    match self
                        .receive_download_payload(stream, TRANSFER_TIMEOUT, &path)
                        .await
                    {
                        Ok(data) => {
                            self.shared.complete_download(&path, data);
                            Ok(Flow::Continue)
                        }
                        Err(err) => {
                            self.shared.fail_download(&path, &error_text(&err));
                            Err(err)
                        }
                    }
                } else {
                    self.shared.reject_download(&path, &reply_error_text(&ack));
                    Ok(Flow::Continue)
                }
            }
            ResponseKind::Screencap => {
                self.receive_screencap(stream).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_upload(
        &self,
        stream: &mut TcpStream,
        local_path: &Path,
        remote_path: &str,
        restart_after: bool,
    ) -> Result<Flow> {
        if local_path.as_os_str().is_empty() || remote_path.is_empty() {
            self.shared.set_error("Upload requires local and remote paths");
            return Ok(Flow::Continue);
        }
        if remote_path.contains(char::is_whitespace) {
            self.shared
                .set_error("Upload remote path must not contain whitespace");
            return Ok(Flow::Continue);
        }

        let data = match tokio::fs::read(local_path).await {
            Ok(data) => data,
            Err(err) => {
                self.shared
                    .set_error(&format!("Unable to read upload file: {}", err));
                return Ok(Flow::Continue);
            }
        };
        if data.len() as u64 > MAX_UPLOAD_BYTES {
            self.shared.set_error("Upload file exceeds size limit");
            return Ok(Flow::Continue);
        }

        let command = format!(
            "{} {} {}",
            protocol::CMD_UPLOAD,
            remote_path,
            data.len()
        );
        self.send_text_frame(stream, &command).await?;
        self.send_frame_bytes(stream, &data).await?;

        let payload = self
            .receive_skipping_heartbeats(stream, OK_REPLY_TIMEOUT, MAX_CONTROL_REPLY_BYTES)
            .await?;
        if !protocol::payload_equals(&payload, protocol::RESP_OK) {
            self.shared.set_error(&reply_error_text(&payload));
            return Ok(Flow::Continue);
        }

        if restart_after {
            self.send_text_frame(stream, protocol::CMD_RESTART).await?;
            let payload = self
                .receive_skipping_heartbeats(stream, OK_REPLY_TIMEOUT, MAX_CONTROL_REPLY_BYTES)
                .await?;
            if protocol::payload_equals(&payload, protocol::RESP_OK) {
                return Ok(Flow::Stop);
            }
            self.shared.set_error(&reply_error_text(&payload));
        }
        Ok(Flow::Continue)
    }

    /// Idle keepalive: a non-`OK` reply is fatal to the session
    async fn heartbeat(&self, stream: &mut TcpStream) -> Result<()> {
        self.send_text_frame(stream, protocol::CMD_HEARTBEAT).await?;
        let payload = self
            .receive_skipping_heartbeats(stream, HEARTBEAT_REPLY_TIMEOUT, MAX_CONTROL_REPLY_BYTES)
            .await?;
        if protocol::payload_equals(&payload, protocol::RESP_OK) {
            return Ok(());
        }
        Err(RmiError::Protocol(reply_error_text(&payload)))
    }

    async fn receive_screencap(&self, stream: &mut TcpStream) -> Result<()> {
        let data = self
            .receive_skipping_heartbeats(stream, TRANSFER_TIMEOUT, 0)
            .await?;
        if protocol::payload_starts_with(&data, protocol::RESP_ERR_PREFIX) {
            self.shared.set_error(&protocol::payload_to_string(&data));
            return Ok(());
        }
        if data.len() < PNG_SIGNATURE.len() || data[..PNG_SIGNATURE.len()] != PNG_SIGNATURE {
            self.shared
                .set_error("Unexpected screencap payload (not a PNG)");
            return Ok(());
        }
        let Some((width, height)) = png_dimensions(&data) else {
            self.shared.set_error("Failed to parse PNG header");
            return Ok(());
        };
        if width == 0 || height == 0 {
            self.shared.set_error("Invalid PNG dimensions");
            return Ok(());
        }
        if width > MAX_SCREENCAP_DIM || height > MAX_SCREENCAP_DIM {
            self.shared.set_error("PNG dimensions exceed limit");
            return Ok(());
        }
        match image::load_from_memory_with_format(&data, image::ImageFormat::Png) {
            Ok(decoded) => {
                let rgba = decoded.to_rgba8();
                let (width, height) = (rgba.width(), rgba.height());
                self.shared.set_screencap(data, rgba.into_raw(), width, height);
            }
            Err(err) => {
                self.shared
                    .set_error(&format!("Failed to decode PNG screencap: {}", err));
            }
        }
        Ok(())
    }

    async fn send_text_frame(&self, stream: &mut TcpStream, text: &str) -> Result<()> {
        self.send_frame_bytes(stream, text.as_bytes()).await
    }

    async fn send_frame_bytes(&self, stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
        let length = u32::try_from(payload.len()).map_err(|_| RmiError::FrameTooLarge)?;
        stream.write_all(&protocol::write_be32(length)).await?;
        if !payload.is_empty() {
            stream.write_all(payload).await?;
        }
        Ok(())
    }

    /// Read exactly `buf.len()` bytes before `deadline`, observing the
    /// stop flag between steps
    async fn read_exact_deadline(
        &self,
        stream: &mut TcpStream,
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            if self.shared.stopped() {
                return Err(RmiError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RmiError::Timeout);
            }
            let step = READ_STEP.min(deadline - now);
            tokio::select! {
                _ = self.shared.stop_notify.notified() => continue,
                read = tokio::time::timeout(step, stream.read(&mut buf[offset..])) => {
                    match read {
                        Err(_) => continue,
                        Ok(Ok(0)) => return Err(RmiError::ConnectionClosed),
                        Ok(Ok(n)) => offset += n,
                        Ok(Err(err)) => return Err(err.into()),
                    }
                }
            }
        }
        Ok(())
    }

    /// Same as [`Self::read_exact_deadline`], publishing download progress
    /// after every chunk. `received` reports the partial count on failure.
    async fn read_exact_with_progress(
        &self,
        stream: &mut TcpStream,
        buf: &mut [u8],
        deadline: Instant,
        path: &str,
        received: &mut usize,
    ) -> Result<()> {
        let total = buf.len() as u64;
        let mut offset = 0;
        while offset < buf.len() {
            if self.shared.stopped() {
                *received = offset;
                return Err(RmiError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                *received = offset;
                return Err(RmiError::Timeout);
            }
            let step = READ_STEP.min(deadline - now);
            tokio::select! {
                _ = self.shared.stop_notify.notified() => continue,
                read = tokio::time::timeout(step, stream.read(&mut buf[offset..])) => {
                    match read {
                        Err(_) => continue,
                        Ok(Ok(0)) => {
                            *received = offset;
                            return Err(RmiError::ConnectionClosed);
                        }
                        Ok(Ok(n)) => {
                            offset += n;
                            self.shared
                                .set_download_progress(path, offset as u64, total, true);
                        }
                        Ok(Err(err)) => {
                            *received = offset;
                            return Err(err.into());
                        }
                    }
                }
            }
        }
        *received = offset;
        Ok(())
    }

    async fn receive_frame(
        &self,
        stream: &mut TcpStream,
        deadline: Instant,
        max_bytes: usize,
    ) -> Result<Vec<u8>> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.read_exact_deadline(stream, &mut header, deadline).await?;
        let length = protocol::read_be32(&header) as usize;
        if max_bytes > 0 && length > max_bytes {
            return Err(RmiError::FrameTooLarge);
        }
        let mut payload = vec![0u8; length];
        if length > 0 {
            self.read_exact_deadline(stream, &mut payload, deadline).await?;
        }
        Ok(payload)
    }

    /// Receive the next frame that is not a `HEARTBEAT`
    async fn receive_skipping_heartbeats(
        &self,
        stream: &mut TcpStream,
        timeout: Duration,
        max_bytes: usize,
    ) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.stopped() {
                return Err(RmiError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(RmiError::Timeout);
            }
            let payload = self.receive_frame(stream, deadline, max_bytes).await?;
            if protocol::payload_equals(&payload, protocol::CMD_HEARTBEAT) {
                continue;
            }
            return Ok(payload);
        }
    }

    /// Receive the download payload frame, skipping keepalives and
    /// reporting per-chunk progress for `path`
    async fn receive_download_payload(
        &self,
        stream: &mut TcpStream,
        timeout: Duration,
        path: &str,
    ) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let heartbeat_len = protocol::CMD_HEARTBEAT.len();
        loop {
            if self.shared.stopped() {
                return Err(RmiError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(RmiError::Timeout);
            }

            let mut header = [0u8; FRAME_HEADER_SIZE];
            self.read_exact_deadline(stream, &mut header, deadline).await?;
            let length = protocol::read_be32(&header) as usize;
            if length == 0 {
                self.shared.set_download_progress(path, 0, 0, false);
                return Ok(Vec::new());
            }

            let mut payload = vec![0u8; length];
            // a heartbeat-sized frame may be a keepalive; read it whole
            // and look at the payload before treating it as file data
            if length == heartbeat_len {
                self.read_exact_deadline(stream, &mut payload, deadline).await?;
                if protocol::payload_equals(&payload, protocol::CMD_HEARTBEAT) {
                    continue;
                }
                self.shared
                    .set_download_progress(path, length as u64, length as u64, false);
                return Ok(payload);
            }

            self.shared.set_download_progress(path, 0, length as u64, true);
            let mut received = 0;
            match self
                .read_exact_with_progress(stream, &mut payload, deadline, path, &mut received)
                .await
            {
                Ok(()) => {
                    self.shared
                        .set_download_progress(path, length as u64, length as u64, false);
                    return Ok(payload);
                }
                Err(err) => {
                    self.shared
                        .set_download_progress(path, received as u64, length as u64, false);
                    return Err(err);
                }
            }
        }
    }
}

/// Render an error the way it is shown to the user: wire-level `ERR ...`
/// payloads stay verbatim
fn error_text(err: &RmiError) -> String {
    match err {
        RmiError::Protocol(text) if text.starts_with(protocol::RESP_ERR_PREFIX) => text.clone(),
        other => other.to_string(),
    }
}

fn reply_error_text(payload: &[u8]) -> String {
    if protocol::payload_starts_with(payload, protocol::RESP_ERR_PREFIX) {
        protocol::payload_to_string(payload)
    } else {
        format!(
            "Unexpected response: {}",
            protocol::payload_to_string(payload)
        )
    }
}

/// Width and height from the IHDR chunk, which must open the PNG stream
fn png_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 24 || &data[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(data[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(data[20..24].try_into().ok()?);
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn send_frame(stream: &mut TcpStream, payload: &[u8]) {
        stream
            .write_all(&protocol::write_be32(payload.len() as u32))
            .await
            .unwrap();
        stream.write_all(payload).await.unwrap();
    }

    async fn recv_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        stream.read_exact(&mut header).await.unwrap();
        let length = protocol::read_be32(&header) as usize;
        let mut payload = vec![0u8; length];
        stream.read_exact(&mut payload).await.unwrap();
        payload
    }

    async fn listen() -> (TcpListener, ClientConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = ClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            username: "u16".to_string(),
            password: "p16".to_string(),
        };
        (listener, config)
    }

    async fn accept_and_auth(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let auth = recv_frame(&mut stream).await;
        assert_eq!(auth, b"AUTH u16 p16");
        send_frame(&mut stream, b"OK").await;
        stream
    }

    async fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn connects_authenticates_and_fetches_version() {
        let (listener, config) = listen().await;
        let mut client = RmiClient::new();
        assert!(client.connect(config).await);
        let mut server = accept_and_auth(&listener).await;

        let shared = Arc::clone(&client.shared);
        wait_until("connected", || {
            shared.status() == ClientStatus::Connected
        })
        .await;

        client.send_version();
        assert_eq!(recv_frame(&mut server).await, b"VERSION");
        send_frame(&mut server, b"VERSION 42").await;

        wait_until("version info", || {
            client.version_info().version == Some(42)
        })
        .await;
        assert!(client.version_info().error.is_empty());
        client.disconnect().await;
        assert_eq!(client.status(), ClientStatus::Disconnected);
    }

    #[tokio::test]
    async fn heartbeats_are_skipped_while_waiting_for_a_reply() {
        let (listener, config) = listen().await;
        let mut client = RmiClient::new();
        assert!(client.connect(config).await);
        let mut server = accept_and_auth(&listener).await;
        let shared = Arc::clone(&client.shared);
        wait_until("connected", || shared.status() == ClientStatus::Connected).await;

        client.send_version();
        assert_eq!(recv_frame(&mut server).await, b"VERSION");
        send_frame(&mut server, b"HEARTBEAT").await;
        send_frame(&mut server, b"VERSION 42").await;

        wait_until("version info", || {
            client.version_info().version == Some(42)
        })
        .await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn download_reports_progress_and_delivers_data() {
        let (listener, config) = listen().await;
        let mut client = RmiClient::new();
        assert!(client.connect(config).await);
        let mut server = accept_and_auth(&listener).await;
        let shared = Arc::clone(&client.shared);
        wait_until("connected", || shared.status() == ClientStatus::Connected).await;

        client.request_download("/tmp/f");
        assert_eq!(recv_frame(&mut server).await, b"DOWNLOAD /tmp/f");
        send_frame(&mut server, b"OK").await;
        send_frame(&mut server, b"hello").await;

        wait_until("download finished", || {
            client
                .download_progress("/tmp/f")
                .is_some_and(|progress| !progress.in_progress && progress.received == 5)
        })
        .await;

        let progress = client.download_progress("/tmp/f").unwrap();
        assert_eq!(progress.received, 5);
        assert_eq!(progress.total, 5);
        assert!(!progress.in_progress);

        let result = client.take_download_data("/tmp/f").unwrap();
        assert_eq!(result.data, b"hello");
        assert!(result.error.is_empty());
        // the data moves out of the store
        assert!(client.take_download_data("/tmp/f").unwrap().data.is_empty());
        client.disconnect().await;
    }

    #[tokio::test]
    async fn server_rejected_download_keeps_the_session_alive() {
        let (listener, config) = listen().await;
        let mut client = RmiClient::new();
        assert!(client.connect(config).await);
        let mut server = accept_and_auth(&listener).await;
        let shared = Arc::clone(&client.shared);
        wait_until("connected", || shared.status() == ClientStatus::Connected).await;

        client.request_download("/missing");
        assert_eq!(recv_frame(&mut server).await, b"DOWNLOAD /missing");
        send_frame(&mut server, b"ERR download").await;

        wait_until("download error", || {
            client
                .take_download_data("/missing")
                .is_some_and(|result| result.error == "ERR download")
        })
        .await;
        assert_eq!(client.status(), ClientStatus::Connected);

        client.send_version();
        assert_eq!(recv_frame(&mut server).await, b"VERSION");
        send_frame(&mut server, b"VERSION 1").await;
        wait_until("version info", || {
            client.version_info().version == Some(1)
        })
        .await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn list_reply_is_parsed_into_entries() {
        let (listener, config) = listen().await;
        let mut client = RmiClient::new();
        assert!(client.connect(config).await);
        let mut server = accept_and_auth(&listener).await;
        let shared = Arc::clone(&client.shared);
        wait_until("connected", || shared.status() == ClientStatus::Connected).await;

        client.request_file_list("/data");
        assert_eq!(recv_frame(&mut server).await, b"LIST /data");
        send_frame(&mut server, b"D\tbin\nF\thello.txt\t5\n").await;

        wait_until("listing", || {
            client.file_list("/data").is_some_and(|listing| listing.revision > 0)
        })
        .await;
        let listing = client.file_list("/data").unwrap();
        assert!(listing.error.is_empty());
        assert_eq!(listing.entries.len(), 2);
        assert_eq!(listing.entries[0].name, "bin");
        assert!(listing.entries[0].is_dir);
        assert_eq!(listing.entries[1].name, "hello.txt");
        assert_eq!(listing.entries[1].size, 5);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn rejected_auth_surfaces_the_server_error() {
        let (listener, config) = listen().await;
        let mut client = RmiClient::new();
        assert!(client.connect(config).await);
        let (mut server, _) = listener.accept().await.unwrap();
        recv_frame(&mut server).await;
        send_frame(&mut server, b"ERR auth failed").await;

        let shared = Arc::clone(&client.shared);
        wait_until("error status", || shared.status() == ClientStatus::Error).await;
        assert_eq!(client.last_error(), "ERR auth failed");
        // a failed worker can be relaunched
        client.disconnect().await;
        assert_eq!(client.status(), ClientStatus::Error);
    }

    #[tokio::test]
    async fn upload_sends_command_then_payload_frame() {
        let dir = tempfile::TempDir::new().unwrap();
        let local = dir.path().join("payload.bin");
        std::fs::write(&local, b"hello").unwrap();

        let (listener, config) = listen().await;
        let mut client = RmiClient::new();
        assert!(client.connect(config).await);
        let mut server = accept_and_auth(&listener).await;
        let shared = Arc::clone(&client.shared);
        wait_until("connected", || shared.status() == ClientStatus::Connected).await;

        client.send_upload(&local, "/remote/payload.bin");
        assert_eq!(
            recv_frame(&mut server).await,
            b"UPLOAD /remote/payload.bin 5"
        );
        assert_eq!(recv_frame(&mut server).await, b"hello");
        send_frame(&mut server, b"OK").await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.status(), ClientStatus::Connected);
        assert!(client.last_error().is_empty());
        client.disconnect().await;
    }

    #[tokio::test]
    async fn upload_and_restart_stops_after_the_restart_ok() {
        let dir = tempfile::TempDir::new().unwrap();
        let local = dir.path().join("rmi.new");
        std::fs::write(&local, b"image").unwrap();

        let (listener, config) = listen().await;
        let mut client = RmiClient::new();
        assert!(client.connect(config).await);
        let mut server = accept_and_auth(&listener).await;
        let shared = Arc::clone(&client.shared);
        wait_until("connected", || shared.status() == ClientStatus::Connected).await;

        client.send_upload_and_restart(&local, "/data/local/tmp/rmi");
        assert_eq!(
            recv_frame(&mut server).await,
            b"UPLOAD /data/local/tmp/rmi 5"
        );
        assert_eq!(recv_frame(&mut server).await, b"image");
        send_frame(&mut server, b"OK").await;
        assert_eq!(recv_frame(&mut server).await, b"RESTART");
        send_frame(&mut server, b"OK").await;

        wait_until("disconnected", || {
            shared.status() == ClientStatus::Disconnected
        })
        .await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn quit_disconnects_after_the_ok() {
        let (listener, config) = listen().await;
        let mut client = RmiClient::new();
        assert!(client.connect(config).await);
        let mut server = accept_and_auth(&listener).await;
        let shared = Arc::clone(&client.shared);
        wait_until("connected", || shared.status() == ClientStatus::Connected).await;

        client.send_quit();
        assert_eq!(recv_frame(&mut server).await, b"QUIT");
        send_frame(&mut server, b"OK").await;

        wait_until("disconnected", || {
            shared.status() == ClientStatus::Disconnected
        })
        .await;
        client.disconnect().await;
        assert_eq!(client.status(), ClientStatus::Disconnected);
    }

    #[tokio::test]
    async fn bad_version_reply_is_recoverable() {
        let (listener, config) = listen().await;
        let mut client = RmiClient::new();
        assert!(client.connect(config).await);
        let mut server = accept_and_auth(&listener).await;
        let shared = Arc::clone(&client.shared);
        wait_until("connected", || shared.status() == ClientStatus::Connected).await;

        client.send_version();
        assert_eq!(recv_frame(&mut server).await, b"VERSION");
        send_frame(&mut server, b"BOGUS").await;
        wait_until("version error", || !client.version_info().error.is_empty()).await;
        assert_eq!(client.status(), ClientStatus::Connected);

        client.send_version();
        assert_eq!(recv_frame(&mut server).await, b"VERSION");
        send_frame(&mut server, b"VERSION 7").await;
        wait_until("version info", || {
            client.version_info().version == Some(7)
        })
        .await;
        assert!(client.version_info().error.is_empty());
        client.disconnect().await;
    }

    #[tokio::test]
    async fn invalid_request_paths_never_touch_the_socket() {
        let (listener, config) = listen().await;
        let mut client = RmiClient::new();
        assert!(client.connect(config).await);
        let _server = accept_and_auth(&listener).await;
        let shared = Arc::clone(&client.shared);
        wait_until("connected", || shared.status() == ClientStatus::Connected).await;

        client.request_download("bad path");
        assert!(!client.last_error().is_empty());
        assert!(client.download_progress("bad path").is_none());

        client.request_file_list("");
        assert!(client.file_list("").is_none());
        assert_eq!(client.status(), ClientStatus::Connected);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn requests_before_connect_are_dropped() {
        let client = RmiClient::new();
        client.send_version();
        client.request_download("/tmp/f");
        assert_eq!(client.status(), ClientStatus::Disconnected);
        assert!(client.download_progress("/tmp/f").is_none());
    }

    #[tokio::test]
    async fn connect_while_connected_is_refused() {
        let (listener, config) = listen().await;
        let mut client = RmiClient::new();
        assert!(client.connect(config.clone()).await);
        let _server = accept_and_auth(&listener).await;
        let shared = Arc::clone(&client.shared);
        wait_until("connected", || shared.status() == ClientStatus::Connected).await;
        assert!(!client.connect(config).await);
        client.disconnect().await;
    }

    #[test]
    fn png_dimensions_come_from_the_ihdr_chunk() {
        let mut data = Vec::new();
        data.extend_from_slice(&PNG_SIGNATURE);
        data.extend_from_slice(&13u32.to_be_bytes());
        data.extend_from_slice(b"IHDR");
        data.extend_from_slice(&640u32.to_be_bytes());
        data.extend_from_slice(&480u32.to_be_bytes());
        assert_eq!(png_dimensions(&data), Some((640, 480)));
        assert_eq!(png_dimensions(&PNG_SIGNATURE), None);
    }
}
