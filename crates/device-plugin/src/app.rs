use std::sync::Arc;

use anyhow::Result;
use error_stack::Report;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonArgs;
use crate::device_plugin::DevicePluginError;
use crate::device_plugin::PluginConfig;
use crate::device_plugin::TenstorrentDevicePlugin;
use crate::discovery;
use crate::discovery::DiscoveryConfig;

type PluginTask = JoinHandle<Result<(), Report<DevicePluginError>>>;

/// Application core structure: one device plugin per discovered card type
pub struct Application {
    plugins: Vec<Arc<TenstorrentDevicePlugin>>,
}

impl Application {
    /// Discovers the cards on this host and prepares one plugin per card type.
    pub fn new(daemon_args: DaemonArgs) -> Result<Self> {
        let groups = discovery::discover(&DiscoveryConfig::from(&daemon_args))
            .map_err(|e| anyhow::anyhow!("device discovery failed: {e:?}"))?;

        let plugin_config = PluginConfig::from(&daemon_args);
        let plugins = groups
            .into_iter()
            .map(|(card_type, devices)| {
                TenstorrentDevicePlugin::new(&card_type, devices, plugin_config.clone())
            })
            .collect();

        Ok(Self::with_plugins(plugins))
    }

    pub fn with_plugins(plugins: Vec<Arc<TenstorrentDevicePlugin>>) -> Self {
        Self { plugins }
    }

    pub fn plugins(&self) -> &[Arc<TenstorrentDevicePlugin>] {
        &self.plugins
    }

    /// Run application, start all plugins and wait for a shutdown signal
    pub async fn run(&self) -> Result<()> {
        let mut tasks = Tasks::new();
        tasks.spawn_plugins(&self.plugins);
        tasks.wait_for_completion(shutdown_signal()).await
    }
}

/// Task manager, owns one task per device plugin and the cancellation token
/// shared by all of them
pub struct Tasks {
    tasks: Vec<PluginTask>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Starts every plugin on its own task; a failing plugin does not hold
    /// up or stop the others.
    pub fn spawn_plugins(&mut self, plugins: &[Arc<TenstorrentDevicePlugin>]) {
        for plugin in plugins {
            let plugin = plugin.clone();
            let token = self.cancellation_token.clone();

            let task = tokio::spawn(async move {
                let resource_name = plugin.resource_name().to_string();
                tracing::info!("Starting device plugin for resource {resource_name}");

                let result = match plugin.start(token).await {
                    Ok(server) => {
                        tracing::info!(
                            "Device plugin for {resource_name} registered, serving on {}",
                            server.socket_path().display()
                        );
                        server.wait().await
                    }
                    Err(e) => Err(e),
                };

                match &result {
                    Ok(()) => tracing::info!("Device plugin for {resource_name} stopped"),
                    Err(e) => tracing::error!("Device plugin for {resource_name} failed: {e:?}"),
                }
                result
            });
            self.tasks.push(task);
        }
    }

    /// Waits until `shutdown` resolves or every plugin task has ended.
    ///
    /// Fails if all plugins stopped on their own and at least one of them
    /// failed, since nothing would be left to serve.
    pub async fn wait_for_completion(
        &mut self,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<()> {
        let tasks = std::mem::take(&mut self.tasks);

        if tasks.is_empty() {
            tracing::warn!("No Tenstorrent devices discovered, nothing to advertise");
            shutdown.await;
            return Ok(());
        }

        let mut all_tasks = futures::future::join_all(tasks);

        tokio::select! {
            results = &mut all_tasks => {
                let failed = results
                    .iter()
                    .filter(|r| !matches!(r, Ok(Ok(()))))
                    .count();
                if failed > 0 {
                    return Err(anyhow::anyhow!(
                        "all device plugins stopped, {failed} of {} failed",
                        results.len()
                    ));
                }
                return Ok(());
            }
            _ = shutdown => {}
        }

        tracing::info!("Cancelling all device plugins...");
        self.cancellation_token.cancel();
        all_tasks.await;

        Ok(())
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
