//! Readiness waits for Unix socket gRPC endpoints.
//!
//! Instead of sleeping between connection attempts, a waiter watches the
//! socket's directory and retries only when something there changes (the
//! socket being created, replaced or removed), bounded by a deadline.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use notify::Event;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Connection state of an endpoint while waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("Timed out after {timeout:?} waiting for {path}, last state: {last_state}")]
    Timeout {
        path: String,
        timeout: Duration,
        last_state: ConnectivityState,
    },
    #[error("Failed to watch the directory of {path}")]
    Watch { path: String },
}

impl ConnectivityError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectivityError::Timeout { .. })
    }
}

/// Opens a gRPC channel over the Unix socket at `socket_path`.
pub async fn connect(socket_path: &Path) -> Result<Channel, tonic::transport::Error> {
    let socket_path = socket_path.to_path_buf();

    // The URI is a placeholder, the connector ignores it
    Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move { UnixStream::connect(socket_path).await.map(TokioIo::new) }
        }))
        .await
}

/// Blocks until a channel to `socket_path` can be established or `timeout`
/// elapses.
///
/// The socket's directory does not have to exist yet: the wait watches the
/// nearest existing ancestor and moves down as the missing directories are
/// created.
pub async fn wait_for_ready(
    socket_path: &Path,
    timeout: Duration,
) -> Result<Channel, Report<ConnectivityError>> {
    let path = socket_path.display().to_string();

    let mut state = ConnectivityState::Idle;
    let result = tokio::time::timeout(timeout, connect_when_ready(socket_path, &mut state)).await;

    match result {
        Ok(Ok(channel)) => {
            info!("gRPC endpoint {path} is {state}");
            Ok(channel)
        }
        Ok(Err(report)) => Err(report),
        Err(_) => Err(Report::new(ConnectivityError::Timeout {
            path,
            timeout,
            last_state: state,
        })),
    }
}

async fn connect_when_ready(
    socket_path: &Path,
    state: &mut ConnectivityState,
) -> Result<Channel, Report<ConnectivityError>> {
    let path = socket_path.display().to_string();
    let mut watched: Option<DirectoryWatch> = None;

    loop {
        // Installed before each attempt, so a socket or directory that
        // appears in between still produces an event.
        let dir = nearest_existing_dir(socket_path);
        let watch = match watched.take() {
            Some(watch) if watch.dir == dir => watch,
            _ => {
                debug!("Watching {} for {path}", dir.display());
                DirectoryWatch::new(dir)
                    .change_context_lazy(|| ConnectivityError::Watch { path: path.clone() })?
            }
        };
        let watch = watched.insert(watch);

        *state = ConnectivityState::Connecting;
        match connect(socket_path).await {
            Ok(channel) => {
                *state = ConnectivityState::Ready;
                return Ok(channel);
            }
            Err(e) => {
                *state = ConnectivityState::TransientFailure;
                debug!("Connection to {path} not ready yet: {e:?}");
            }
        }

        loop {
            match watch.changes.recv().await {
                Some(event) if concerns(&event, socket_path) => break,
                Some(_) => continue,
                // No more events can arrive; only the deadline ends this wait
                None => std::future::pending::<()>().await,
            }
        }
    }
}

/// Closest directory on the way to `socket_path` that exists right now.
fn nearest_existing_dir(socket_path: &Path) -> PathBuf {
    socket_path
        .ancestors()
        .skip(1)
        .filter(|dir| !dir.as_os_str().is_empty())
        .find(|dir| dir.is_dir())
        .unwrap_or(Path::new("."))
        .to_path_buf()
}

/// An event matters if it touches the socket itself or one of the
/// directories leading to it.
fn concerns(event: &Event, socket_path: &Path) -> bool {
    // Rescan notifications come without paths
    event.paths.is_empty() || event.paths.iter().any(|p| socket_path.starts_with(p))
}

struct DirectoryWatch {
    dir: PathBuf,
    changes: mpsc::UnboundedReceiver<Event>,
    _watcher: RecommendedWatcher,
}

impl DirectoryWatch {
    fn new(dir: PathBuf) -> Result<Self, notify::Error> {
        let (watcher, changes) = watch_directory(&dir)?;
        Ok(Self {
            dir,
            changes,
            _watcher: watcher,
        })
    }
}

fn watch_directory(
    dir: &Path,
) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<Event>), notify::Error> {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                // Ignore errors if the waiter is already gone
                let _ = tx.send(event);
            }
            Err(e) => {
                warn!("Socket directory watch error: {e:?}");
            }
        },
        notify::Config::default(),
    )?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;

    Ok((watcher, rx))
}
