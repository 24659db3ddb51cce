//! RMI command server
//!
//! Listens on a TCP port and serves one client at a time. A connection
//! starts unauthenticated: every frame that is not a matching `AUTH`
//! counts as a failed attempt and the third failure closes the session.
//! Once authenticated, commands are dispatched serially; whenever the
//! client stays quiet for the heartbeat interval the server emits a
//! `HEARTBEAT` frame of its own.

use crate::capture;
use crate::config::Credentials;
use crate::error::{Result, RmiError};
use crate::input;
use crate::protocol::{self, FRAME_HEADER_SIZE};
use crate::types::FileEntry;
use log::{debug, info, warn};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Control frames past this size are drained and the session is closed
const COMMAND_MAX_BYTES: u32 = 1024;

/// Cap on the accumulated `LIST` reply text
const LIST_MAX_BYTES: usize = 1024 * 1024;

/// Where the device bootstrap installs the server binary
const INSTALL_PATH: &str = "/data/local/tmp/rmi";

/// Number of allowed authentication attempts per connection
const AUTH_MAX_ATTEMPTS: u32 = 3;

/// Why the accept loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// A client sent `QUIT`
    Shutdown,
    /// A client sent `RESTART`; the caller should re-exec the process
    Restart,
}

enum SessionOutcome {
    Continue,
    Shutdown,
    Restart,
}

enum Inbound {
    Command(String),
    Empty,
    Closed,
    Oversized,
}

/// RMI server: accepts one connection at a time and dispatches commands
pub struct Server {
    port: u16,
    credentials: Credentials,
    heartbeat_interval: Duration,
    install_path: PathBuf,
}

impl Server {
    /// Create a server for `port` with the given credentials
    pub fn new(port: u16, credentials: Credentials) -> Self {
        Self {
            port,
            credentials,
            heartbeat_interval: Duration::from_millis(protocol::HEARTBEAT_INTERVAL_MS),
            install_path: PathBuf::from(INSTALL_PATH),
        }
    }

    /// Override the idle heartbeat cadence
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Override the expected install location of the server binary
    pub fn with_install_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.install_path = path.into();
        self
    }

    /// Bind the configured port and serve until `QUIT` or `RESTART`
    pub async fn run(&self) -> Result<ServerExit> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        info!("RMI command server listening on 0.0.0.0:{}", self.port);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<ServerExit> {
        loop {
            let (stream, addr) = listener.accept().await?;
            info!("client connected from {}", addr);
            match self.serve_client(stream).await {
                Ok(SessionOutcome::Continue) => {}
                Ok(SessionOutcome::Shutdown) => return Ok(ServerExit::Shutdown),
                Ok(SessionOutcome::Restart) => return Ok(ServerExit::Restart),
                Err(err) => warn!("session ended: {}", err),
            }
        }
    }

    async fn serve_client(&self, mut stream: TcpStream) -> Result<SessionOutcome> {
        let mut attempts = 0u32;
        let mut authed = false;

        loop {
            // poll for inbound data, emitting a heartbeat per idle interval
            loop {
                let waited =
                    tokio::time::timeout(self.heartbeat_interval, stream.readable()).await;
                match waited {
                    Ok(ready) => {
                        ready?;
                        break;
                    }
                    Err(_) => send_text(&mut stream, protocol::CMD_HEARTBEAT).await?,
                }
            }

            let command = match read_command(&mut stream).await? {
                Inbound::Command(command) => command,
                Inbound::Empty => continue,
                Inbound::Closed => {
                    info!("client disconnected");
                    return Ok(SessionOutcome::Continue);
                }
                Inbound::Oversized => {
                    warn!("oversized command frame; closing session");
                    return Ok(SessionOutcome::Continue);
                }
            };

            if !authed {
                if self.check_auth(&command) {
                    send_text(&mut stream, protocol::RESP_OK).await?;
                    authed = true;
                    continue;
                }
                attempts += 1;
                if attempts >= AUTH_MAX_ATTEMPTS {
                    send_text(&mut stream, "ERR auth failed").await?;
                    return Ok(SessionOutcome::Continue);
                }
                send_text(&mut stream, "ERR auth required").await?;
                continue;
            }

            match self.dispatch(&mut stream, &command).await? {
                SessionOutcome::Continue => {}
                outcome => return Ok(outcome),
            }
        }
    }

    fn check_auth(&self, command: &str) -> bool {
        let tokens = protocol::tokenize(command);
        matches!(tokens.as_slice(),
            [verb, username, password, ..]
                if *verb == protocol::CMD_AUTH
                    && self.credentials.matches(username, password))
    }

    async fn dispatch(&self, stream: &mut TcpStream, command: &str) -> Result<SessionOutcome> {
        let tokens = protocol::tokenize(command);
        let Some(&verb) = tokens.first() else {
            return Ok(SessionOutcome::Continue);
        };
        debug!("dispatching {}", verb);

        match verb {
            protocol::CMD_QUIT => {
                send_text(stream, protocol::RESP_OK).await?;
                return Ok(SessionOutcome::Shutdown);
            }
            protocol::CMD_RESTART => {
                if self.check_restart_permissions() {
                    send_text(stream, protocol::RESP_OK).await?;
                    return Ok(SessionOutcome::Restart);
                }
                send_text(stream, "ERR restart").await?;
            }
            protocol::CMD_VERSION => {
                let reply = format!(
                    "{}{}",
                    protocol::RESP_VERSION_PREFIX,
                    protocol::SERVER_VERSION
                );
                send_text(stream, &reply).await?;
            }
            protocol::CMD_HEARTBEAT => {
                send_text(stream, protocol::RESP_OK).await?;
            }
            protocol::CMD_PRESS => {
                let outcome = match parse_int(tokens.get(1)) {
                    Some(keycode) => input::press(keycode),
                    None => Err(RmiError::Protocol("missing keycode".into())),
                };
                reply_ok_or(stream, outcome, "ERR press").await?;
            }
            protocol::CMD_PRESS_INPUT => {
                let outcome = match parse_int(tokens.get(1)) {
                    Some(keycode) => input::press_input(keycode).await,
                    None => Err(RmiError::Protocol("missing keycode".into())),
                };
                reply_ok_or(stream, outcome, "ERR press").await?;
            }
            protocol::CMD_OPEN => {
                let outcome = match tokens.get(1) {
                    Some(target) => input::open_app(target).await,
                    None => Err(RmiError::Protocol("missing target".into())),
                };
                reply_ok_or(stream, outcome, "ERR open").await?;
            }
            protocol::CMD_UPLOAD => {
                let parsed = match (tokens.get(1), parse_size(tokens.get(2))) {
                    (Some(path), Some(size)) => Some((path.to_string(), size)),
                    _ => None,
                };
                match parsed {
                    Some((path, size)) => {
                        if self.receive_upload(stream, Path::new(&path), size).await? {
                            send_text(stream, protocol::RESP_OK).await?;
                        } else {
                            send_text(stream, "ERR upload").await?;
                        }
                    }
                    None => send_text(stream, "ERR upload").await?,
                }
            }
            protocol::CMD_LIST => {
                let listing = match tokens.get(1) {
                    Some(path) if !path.is_empty() => build_file_list(path).await.ok(),
                    _ => None,
                };
                match listing {
                    Some(text) => send_frame(stream, text.as_bytes()).await?,
                    None => send_text(stream, "ERR list").await?,
                }
            }
            protocol::CMD_DOWNLOAD => {
                match tokens.get(1) {
                    Some(path) if !path.is_empty() => {
                        self.send_download(stream, Path::new(path)).await?;
                    }
                    _ => send_text(stream, "ERR download").await?,
                }
            }
            protocol::CMD_DELETE => {
                let outcome = match tokens.get(1) {
                    Some(path) => remove_tree(Path::new(path)).await,
                    None => Err(RmiError::Protocol("missing path".into())),
                };
                reply_ok_or(stream, outcome, "ERR delete").await?;
            }
            protocol::CMD_SCREENCAP => {
                match capture::capture_png().await {
                    Ok(png) => send_frame(stream, &png).await?,
                    Err(err) => {
                        warn!("screencap failed: {}", err);
                        send_text(stream, "ERR screencap").await?;
                    }
                }
            }
            _ => {
                send_text(stream, "ERR unknown command").await?;
            }
        }
        Ok(SessionOutcome::Continue)
    }

    /// The binary must be installed as a regular file with mode 0777 for a
    /// re-exec to be worth attempting
    fn check_restart_permissions(&self) -> bool {
        match std::fs::metadata(&self.install_path) {
            Ok(meta) if meta.is_file() => {
                let mode = meta.permissions().mode() & 0o777;
                if mode == 0o777 {
                    true
                } else {
                    warn!(
                        "{} has mode {:o}, expected 777",
                        self.install_path.display(),
                        mode
                    );
                    false
                }
            }
            Ok(_) => {
                warn!("{} is not a regular file", self.install_path.display());
                false
            }
            Err(err) => {
                warn!("stat failed for {}: {}", self.install_path.display(), err);
                false
            }
        }
    }

    fn is_self_binary(&self, path: &Path) -> bool {
        if let Some(self_path) = self_binary_path() {
            if path == self_path {
                return true;
            }
        }
        path == self.install_path
    }

    /// Receive the upload data frame and write it to `path`.
    ///
    /// When the destination is this server's own binary, the image is
    /// staged to `<path>.new`, made executable, and renamed into place so
    /// an executable image exists at every instant.
    async fn receive_upload(
        &self,
        stream: &mut TcpStream,
        path: &Path,
        expected_len: u32,
    ) -> Result<bool> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        if stream.read_exact(&mut header).await.is_err() {
            return Ok(false);
        }
        let length = protocol::read_be32(&header);
        if length != expected_len {
            drain_bytes(stream, length).await?;
            return Ok(false);
        }

        let self_update = self.is_self_binary(path);
        let write_path = if self_update {
            let mut staged = path.as_os_str().to_owned();
            staged.push(".new");
            PathBuf::from(staged)
        } else {
            path.to_path_buf()
        };

        let mut file = match tokio::fs::File::create(&write_path).await {
            Ok(file) => file,
            Err(err) => {
                warn!("upload open failed for {}: {}", write_path.display(), err);
                drain_bytes(stream, length).await?;
                return Ok(false);
            }
        };

        let mut remaining = length as u64;
        let mut buf = [0u8; 4096];
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            stream.read_exact(&mut buf[..chunk]).await?;
            if let Err(err) = file.write_all(&buf[..chunk]).await {
                warn!("upload write failed: {}", err);
                drain_bytes(stream, (remaining - chunk as u64) as u32).await?;
                return Ok(false);
            }
            remaining -= chunk as u64;
        }

        if self_update {
            if let Err(err) = finish_self_update(file, &write_path, path).await {
                warn!("self-update failed: {}", err);
                let _ = tokio::fs::remove_file(&write_path).await;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Reply `OK` then stream the file as a second frame. Failures after
    /// the `OK` went out are fatal to the session; anything else gets an
    /// `ERR download`.
    async fn send_download(&self, stream: &mut TcpStream, path: &Path) -> Result<()> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() && meta.len() <= u32::MAX as u64 => meta,
            _ => {
                send_text(stream, "ERR download").await?;
                return Ok(());
            }
        };
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(_) => {
                send_text(stream, "ERR download").await?;
                return Ok(());
            }
        };

        let size = meta.len() as u32;
        send_text(stream, protocol::RESP_OK).await?;
        stream.write_all(&protocol::write_be32(size)).await?;

        let mut remaining = size as u64;
        let mut buf = [0u8; 4096];
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..chunk]).await?;
            if n == 0 {
                return Err(RmiError::Protocol("file shrank during download".into()));
            }
            stream.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        Ok(())
    }
}

/// Re-exec the current binary with its original arguments. Only returns
/// on failure.
pub fn restart_process() -> std::io::Error {
    use std::os::unix::process::CommandExt;
    let mut args = std::env::args_os();
    let Some(argv0) = args.next() else {
        return std::io::Error::other("missing argv");
    };
    std::process::Command::new(argv0).args(args).exec()
}

fn self_binary_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let text = exe.to_string_lossy();
    // /proc/self/exe grows a " (deleted)" suffix once the image is replaced
    match text.strip_suffix(" (deleted)") {
        Some(stripped) => Some(PathBuf::from(stripped.to_string())),
        None => Some(exe),
    }
}

async fn finish_self_update(mut file: tokio::fs::File, staged: &Path, path: &Path) -> Result<()> {
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::set_permissions(staged, std::fs::Permissions::from_mode(0o777)).await?;
    tokio::fs::rename(staged, path).await?;
    info!("replaced {} in place", path.display());
    Ok(())
}

async fn read_command(stream: &mut TcpStream) -> Result<Inbound> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(Inbound::Closed);
        }
        Err(err) => return Err(err.into()),
    }
    let length = protocol::read_be32(&header);
    if length == 0 {
        return Ok(Inbound::Empty);
    }
    if length >= COMMAND_MAX_BYTES {
        drain_bytes(stream, length).await?;
        return Ok(Inbound::Oversized);
    }
    let mut payload = vec![0u8; length as usize];
    match stream.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(Inbound::Closed);
        }
        Err(err) => return Err(err.into()),
    }
    Ok(Inbound::Command(
        String::from_utf8_lossy(&payload).into_owned(),
    ))
}

async fn drain_bytes(stream: &mut TcpStream, length: u32) -> Result<()> {
    let mut remaining = length as u64;
    let mut buf = [0u8; 4096];
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        stream.read_exact(&mut buf[..chunk]).await?;
        remaining -= chunk as u64;
    }
    Ok(())
}

async fn send_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    let length = u32::try_from(payload.len()).map_err(|_| RmiError::FrameTooLarge)?;
    stream.write_all(&protocol::write_be32(length)).await?;
    if !payload.is_empty() {
        stream.write_all(payload).await?;
    }
    Ok(())
}

async fn send_text(stream: &mut TcpStream, text: &str) -> Result<()> {
    send_frame(stream, text.as_bytes()).await
}

async fn reply_ok_or(
    stream: &mut TcpStream,
    outcome: Result<()>,
    error_reply: &str,
) -> Result<()> {
    match outcome {
        Ok(()) => send_text(stream, protocol::RESP_OK).await,
        Err(err) => {
            debug!("{}: {}", error_reply, err);
            send_text(stream, error_reply).await
        }
    }
}

fn parse_int(token: Option<&&str>) -> Option<i32> {
    token.and_then(|token| token.parse::<i32>().ok())
}

fn parse_size(token: Option<&&str>) -> Option<u32> {
    token.and_then(|token| token.parse::<u64>().ok())
        .filter(|size| *size <= u32::MAX as u64)
        .map(|size| size as u32)
}

async fn build_file_list(path: &str) -> Result<String> {
    let mut dir = tokio::fs::read_dir(path).await?;
    let mut text = String::new();
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        let file_entry = FileEntry {
            size: if meta.is_dir() { 0 } else { meta.len() },
            is_dir: meta.is_dir(),
            name,
        };
        if let Some(line) = protocol::format_list_entry(&file_entry) {
            if text.len() + line.len() > LIST_MAX_BYTES {
                return Err(RmiError::FrameTooLarge);
            }
            text.push_str(&line);
        }
    }
    Ok(text)
}

/// Recursively remove `path`. The filesystem root and empty paths are
/// refused outright.
async fn remove_tree(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() || path == Path::new("/") {
        return Err(RmiError::Protocol("refusing to delete".into()));
    }
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}
