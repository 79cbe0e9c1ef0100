//! Control channel to the external proxy server process.
//!
//! ```text
//! ┌────────────────────┐   Unix datagram   ┌────────────────────┐
//! │  ssmanager         │ ←───────────────→ │  ssserver          │
//! │  client_address    │   add / remove    │  manager_address   │
//! │                    │   ok / stat       │                    │
//! └────────────────────┘                   └────────────────────┘
//! ```
//!
//! The server creates its endpoint some time after launch, so connecting
//! follows a fixed backoff schedule before giving up.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixDatagram;
use tokio::process::{Child, Command as TokioCommand};

use crate::config::ManagerConfig;
use crate::protocol::MAX_FRAME_SIZE;
use crate::supervisor::error::ManagerError;
use crate::utils::remove_socket_file;

/// Host of the listener the server creates by default. Removed during the handshake.
pub const PLACEHOLDER_HOST: &str = "127.0.1.2";

/// Delays before each connect attempt.
pub const DEFAULT_BACKOFF: [Duration; 8] = [
    Duration::from_millis(10),
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(400),
    Duration::from_millis(800),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// The server endpoint does not exist yet, or exists with nobody bound.
fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

/// Run `attempt` once per entry in `schedule`, sleeping that entry's delay
/// first. Returns the 1-based attempt number that succeeded.
///
/// Non-retryable errors are returned immediately as [`ManagerError::Io`].
pub async fn connect_with_retry<F>(
    path: &Path,
    schedule: &[Duration],
    mut attempt: F,
) -> Result<usize, ManagerError>
where
    F: FnMut() -> io::Result<()>,
{
    for (i, delay) in schedule.iter().enumerate() {
        tokio::time::sleep(*delay).await;
        match attempt() {
            Ok(()) => {
                tracing::debug!("Connected to {:?} on attempt {}", path, i + 1);
                return Ok(i + 1);
            }
            Err(e) if is_retryable(&e) => {
                tracing::trace!("Connect attempt {} to {:?} failed: {}", i + 1, path, e);
            }
            Err(e) => return Err(ManagerError::Io(e)),
        }
    }

    tracing::error!("Cannot connect to proxy server process on {:?}", path);
    Err(ManagerError::ControlChannelUnreachable {
        path: path.to_path_buf(),
        attempts: schedule.len(),
    })
}

/// Launched server process plus the datagram endpoint connected to it.
///
/// Dropping the channel releases everything: the process is sent SIGTERM
/// and both socket files are removed.
pub struct ControlChannel {
    socket: Option<Arc<UnixDatagram>>,
    child: Option<Child>,
    manager_path: PathBuf,
    client_path: PathBuf,
}

impl ControlChannel {
    /// Launch the server, bind our endpoint and connect to the server's.
    pub async fn start(config: &ManagerConfig) -> Result<Self, ManagerError> {
        let child = spawn_server(config)?;

        let mut channel = Self {
            socket: None,
            child: Some(child),
            manager_path: config.manager_address.clone(),
            client_path: config.client_address.clone(),
        };

        // stale file from a previous run would make bind fail
        remove_socket_file(&channel.client_path);
        let socket = UnixDatagram::bind(&channel.client_path)?;

        let manager_path = channel.manager_path.clone();
        connect_with_retry(&manager_path, &config.backoff_schedule(), || {
            socket.connect(&manager_path)
        })
        .await?;

        channel.socket = Some(Arc::new(socket));
        tracing::info!(
            "Control channel connected: {:?} -> {:?}",
            channel.client_path,
            channel.manager_path
        );
        Ok(channel)
    }

    /// Shared handle for the receiver task.
    pub fn socket(&self) -> Result<Arc<UnixDatagram>, ManagerError> {
        self.socket.clone().ok_or(ManagerError::ChannelClosed)
    }

    /// Write one datagram to the server.
    pub async fn send(&self, frame: &[u8]) -> Result<(), ManagerError> {
        let socket = self.socket.as_ref().ok_or(ManagerError::ChannelClosed)?;
        socket.send(frame).await?;
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Close the endpoint, terminate the server and remove both socket
    /// files. Safe to call any number of times.
    pub fn shutdown(&mut self) {
        self.socket = None;
        if let Some(mut child) = self.child.take() {
            terminate(&mut child);
        }
        remove_socket_file(&self.manager_path);
        remove_socket_file(&self.client_path);
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Blocking read of one datagram of at most [`MAX_FRAME_SIZE`] bytes.
pub async fn receive_frame(socket: &UnixDatagram) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    let len = socket.recv(&mut buf).await?;
    buf.truncate(len);
    Ok(buf)
}

fn spawn_server(config: &ManagerConfig) -> Result<Child, ManagerError> {
    let stdio = || {
        if config.print_ss_log {
            Stdio::inherit()
        } else {
            Stdio::null()
        }
    };

    let mut cmd = TokioCommand::new(&config.ss_bin);
    cmd.arg("--manager-address")
        .arg(&config.manager_address)
        .args(["-s", PLACEHOLDER_HOST, "-p", "0"])
        .stdin(Stdio::null())
        .stdout(stdio())
        .stderr(stdio())
        .kill_on_drop(false);

    let child = cmd.spawn().map_err(|source| ManagerError::Spawn {
        program: config.ss_bin.display().to_string(),
        source,
    })?;
    tracing::info!(
        "Launched {:?} (pid: {:?}) with control path {:?}",
        config.ss_bin,
        child.id(),
        config.manager_address
    );
    Ok(child)
}

/// Ask the server to exit. Not waited on.
fn terminate(child: &mut Child) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => tracing::info!("Sent TERM signal to proxy server (pid: {})", pid),
        Err(e) => tracing::debug!("Failed to signal proxy server (pid: {}): {}", pid, e),
    }
}
