//! Startup sequence of one device plugin instance: bind, serve, wait until
//! the socket answers, then register with the kubelet.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::api::device_plugin_server::DevicePluginServer;
use super::connectivity;
use super::connectivity::ConnectivityError;
use super::registration;
use super::DevicePluginError;
use super::DevicePluginService;
use super::TenstorrentDevicePlugin;

/// A running gRPC server of one device plugin instance.
#[derive(Debug)]
pub struct PluginServer {
    socket_path: PathBuf,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl PluginServer {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Asks the server to stop; [`PluginServer::wait`] observes the exit.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Waits for the server to stop and removes its socket.
    pub async fn wait(self) -> Result<(), Report<DevicePluginError>> {
        let path = self.socket_path.display().to_string();
        let result = self.task.await;
        if let Err(e) = remove_socket(&self.socket_path) {
            warn!("Failed to remove socket {path}: {e}");
        }

        match result {
            Ok(Ok(())) => {
                info!("gRPC server on {path} stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(Report::new(e).change_context(DevicePluginError::Serve { path })),
            Err(e) => Err(Report::new(e).change_context(DevicePluginError::Serve { path })),
        }
    }

    /// Stops the server right away after a failed startup.
    async fn teardown(self) {
        self.shutdown.cancel();
        self.task.abort();
        let _ = self.task.await;
        if let Err(e) = remove_socket(&self.socket_path) {
            warn!(
                "Failed to remove socket {}: {e}",
                self.socket_path.display()
            );
        }
    }
}

impl TenstorrentDevicePlugin {
    /// Starts serving and registers with the kubelet.
    ///
    /// Succeeds only once the socket is reachable and the kubelet accepted
    /// the registration. On failure the server has already been torn down.
    #[tracing::instrument(skip(self, cancellation_token), fields(resource = %self.resource_name()))]
    pub async fn start(
        self: &Arc<Self>,
        cancellation_token: CancellationToken,
    ) -> Result<PluginServer, Report<DevicePluginError>> {
        let socket_path = self.socket_path();
        let path = socket_path.display().to_string();
        info!("start device plugin server: {path}");

        remove_socket(&socket_path)
            .change_context_lazy(|| DevicePluginError::Bind { path: path.clone() })?;

        let listener = UnixListener::bind(&socket_path)
            .change_context_lazy(|| DevicePluginError::Bind { path: path.clone() })?;
        info!("gRPC server socket established at {path}");

        // Child token: tearing this instance down leaves the others running,
        // cancelling the process token stops everything.
        let shutdown = cancellation_token.child_token();
        let service = DevicePluginService::new(self.clone(), shutdown.clone());

        let task = {
            let shutdown = shutdown.clone();
            let path = path.clone();
            tokio::spawn(async move {
                tonic::transport::Server::builder()
                    .add_service(DevicePluginServer::new(service))
                    .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                        shutdown.cancelled().await;
                        info!("shutting down gRPC server on {path}");
                    })
                    .await
            })
        };

        let server = PluginServer {
            socket_path: socket_path.clone(),
            shutdown,
            task,
        };

        let config = self.config();
        if let Err(e) = wait_for_server(&socket_path, config.server_start_timeout).await {
            server.teardown().await;
            return Err(e.change_context(DevicePluginError::ServerStart { path }));
        }

        let request =
            registration::register_request(self.endpoint(), self.resource_name(), self.options());
        if let Err(e) =
            registration::register(&config.kubelet_socket, request, config.register_timeout).await
        {
            server.teardown().await;
            return Err(e.change_context(DevicePluginError::Register {
                resource_name: self.resource_name().to_string(),
            }));
        }

        Ok(server)
    }
}

/// Blocks until the freshly bound server accepts a connection.
pub async fn wait_for_server(
    socket_path: &Path,
    timeout: Duration,
) -> Result<(), Report<ConnectivityError>> {
    // throwaway connection, dropped right away
    connectivity::wait_for_ready(socket_path, timeout)
        .await
        .map(drop)
}

/// Removes a socket file; a missing file is fine.
fn remove_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("removed socket {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
