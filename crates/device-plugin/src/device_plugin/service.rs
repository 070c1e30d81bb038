use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::api;
use super::api::device_plugin_server::DevicePlugin;
use super::api::AllocateRequest;
use super::api::AllocateResponse;
use super::api::ContainerAllocateRequest;
use super::api::ContainerAllocateResponse;
use super::api::DevicePluginOptions;
use super::api::DeviceSpec;
use super::api::Empty;
use super::api::ListAndWatchResponse;
use super::api::PreStartContainerRequest;
use super::api::PreStartContainerResponse;
use super::api::PreferredAllocationRequest;
use super::api::PreferredAllocationResponse;
use super::endpoint_name;
use super::PluginConfig;
use crate::device::Device;
use crate::device::DeviceHealth;

/// Environment variable listing the card IDs granted to a container.
pub const VISIBLE_DEVICES_ENV: &str = "TT_VISIBLE_DEVICES";
const DEVICE_PERMISSIONS: &str = "rw";

/// Device plugin for one Tenstorrent card type (e.g. `n150`).
#[derive(Debug)]
pub struct TenstorrentDevicePlugin {
    /// card type as reported by the driver
    card_type: String,
    /// fully qualified resource name (e.g. "tenstorrent.com/n150")
    resource_name: String,
    /// socket file name inside the device plugin directory
    endpoint: String,
    /// current device list; every change wakes the open ListAndWatch streams
    devices: watch::Sender<Vec<Device>>,
    options: DevicePluginOptions,
    config: PluginConfig,
}

impl TenstorrentDevicePlugin {
    pub fn new(card_type: &str, devices: Vec<Device>, config: PluginConfig) -> Arc<Self> {
        let (devices, _) = watch::channel(devices);

        Arc::new(Self {
            card_type: card_type.to_string(),
            resource_name: format!("{}/{}", config.resource_domain, card_type),
            endpoint: endpoint_name(card_type),
            devices,
            options: DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: false,
            },
            config,
        })
    }

    pub fn card_type(&self) -> &str {
        &self.card_type
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn options(&self) -> DevicePluginOptions {
        self.options
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Full path of the socket this instance serves on.
    pub fn socket_path(&self) -> PathBuf {
        self.config.device_plugin_dir.join(&self.endpoint)
    }

    /// Snapshot of the current device list.
    pub fn devices(&self) -> Vec<Device> {
        self.devices.borrow().clone()
    }

    /// Updates the health of one device.
    ///
    /// Returns `true` if the device exists and its health actually changed,
    /// in which case every open ListAndWatch stream sends a fresh list.
    pub fn set_device_health(&self, device_id: &str, health: DeviceHealth) -> bool {
        let changed = self.devices.send_if_modified(|devices| {
            match devices.iter_mut().find(|d| d.id == device_id) {
                Some(device) if device.health != health => {
                    device.health = health;
                    true
                }
                _ => false,
            }
        });

        if changed {
            info!(
                resource = %self.resource_name,
                "device {device_id} is now {health}"
            );
        }
        changed
    }

    /// Grants every container request the device nodes it asked for.
    ///
    /// Requests are answered independently and in order; a request naming an
    /// unknown device fails without short-circuiting the others, and the
    /// error lists every failing request.
    ///
    /// v1beta1 has no per-container error field, so any failure fails the
    /// whole `Allocate` RPC with `InvalidArgument` and the valid requests get
    /// no response either. The kubelet then rejects the pod at admission.
    pub fn allocate(&self, request: &AllocateRequest) -> Result<AllocateResponse, AllocationError> {
        let known = self.devices.borrow().clone();

        let outcomes: Vec<Result<ContainerAllocateResponse, ContainerAllocationFailure>> = request
            .container_requests
            .iter()
            .enumerate()
            .map(|(index, container_req)| self.allocate_container(&known, index, container_req))
            .collect();

        let failures: Vec<ContainerAllocationFailure> = outcomes
            .iter()
            .filter_map(|outcome| outcome.as_ref().err().cloned())
            .collect();
        if !failures.is_empty() {
            return Err(AllocationError {
                resource_name: self.resource_name.clone(),
                failures,
            });
        }

        Ok(AllocateResponse {
            container_responses: outcomes.into_iter().filter_map(Result::ok).collect(),
        })
    }

    fn allocate_container(
        &self,
        known: &[Device],
        index: usize,
        container_req: &ContainerAllocateRequest,
    ) -> Result<ContainerAllocateResponse, ContainerAllocationFailure> {
        let unknown_ids: Vec<String> = container_req
            .devices_ids
            .iter()
            .filter(|id| !known.iter().any(|d| &d.id == *id))
            .cloned()
            .collect();
        if !unknown_ids.is_empty() {
            return Err(ContainerAllocationFailure { index, unknown_ids });
        }

        let devices = container_req
            .devices_ids
            .iter()
            .map(|id| self.device_spec(id))
            .collect();

        let mut envs = HashMap::new();
        envs.insert(
            VISIBLE_DEVICES_ENV.to_string(),
            container_req.devices_ids.join(","),
        );

        Ok(ContainerAllocateResponse {
            envs,
            devices,
            ..Default::default()
        })
    }

    /// Same path on the host and in the container.
    fn device_spec(&self, device_id: &str) -> DeviceSpec {
        let path = self.config.device_dir.join(device_id).display().to_string();
        debug!("Allocating: {path}");

        DeviceSpec {
            container_path: path.clone(),
            host_path: path,
            permissions: DEVICE_PERMISSIONS.to_string(),
        }
    }
}

/// One container request that could not be satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerAllocationFailure {
    /// position of the request in the AllocateRequest
    pub index: usize,
    pub unknown_ids: Vec<String>,
}

#[derive(Debug, Error)]
#[error("allocation for {resource_name} failed: {}", describe_failures(.failures))]
pub struct AllocationError {
    pub resource_name: String,
    pub failures: Vec<ContainerAllocationFailure>,
}

fn describe_failures(failures: &[ContainerAllocationFailure]) -> String {
    failures
        .iter()
        .map(|f| {
            format!(
                "container request {} asks for unknown devices {:?}",
                f.index, f.unknown_ids
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// gRPC facade of a [`TenstorrentDevicePlugin`].
#[derive(Debug)]
pub struct DevicePluginService {
    device_plugin: Arc<TenstorrentDevicePlugin>,
    /// ends every ListAndWatch stream when cancelled
    cancellation_token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        device_plugin: Arc<TenstorrentDevicePlugin>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            device_plugin,
            cancellation_token,
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");

        Ok(Response::new(self.device_plugin.options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Sends the full device list on open and again on every change, until
    /// the plugin is cancelled or the kubelet hangs up.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        let resource_name = self.device_plugin.resource_name().to_string();
        info!(resource = %resource_name, "kubelet opened ListAndWatch");

        let (tx, rx) = mpsc::unbounded_channel();
        let mut devices_rx = self.device_plugin.devices.subscribe();
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            loop {
                let devices: Vec<api::Device> = devices_rx
                    .borrow_and_update()
                    .iter()
                    .map(api::Device::from)
                    .collect();

                info!(
                    resource = %resource_name,
                    "ListAndWatch: sending {} device(s)",
                    devices.len()
                );
                if let Err(e) = tx.send(Ok(ListAndWatchResponse { devices })) {
                    error!(resource = %resource_name, "failed to send device list: {e}");
                    return;
                }

                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!(resource = %resource_name, "ListAndWatch stopped");
                        return;
                    }
                    _ = tx.closed() => {
                        info!(resource = %resource_name, "kubelet closed ListAndWatch");
                        return;
                    }
                    changed = devices_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        Err(Status::unimplemented(
            "method GetPreferredAllocation not implemented",
        ))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!(
            resource = %self.device_plugin.resource_name(),
            "Received Allocate request for {:?}",
            req.container_requests
        );

        match self.device_plugin.allocate(&req) {
            Ok(response) => Ok(Response::new(response)),
            Err(e) => {
                error!("{e}");
                Err(Status::invalid_argument(e.to_string()))
            }
        }
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.into_inner());

        Ok(Response::new(PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use test_log::test;
    use tokio_stream::StreamExt;
    use tonic::Code;

    use super::*;

    fn plugin(ids: &[&str]) -> Arc<TenstorrentDevicePlugin> {
        let devices = ids.iter().map(|id| Device::healthy(*id)).collect();
        TenstorrentDevicePlugin::new("n150", devices, PluginConfig::default())
    }

    fn container_request(ids: &[&str]) -> ContainerAllocateRequest {
        ContainerAllocateRequest {
            devices_ids: ids.iter().map(|id| id.to_string()).collect(),
        }
    }

    fn device_ids(response: &ListAndWatchResponse) -> Vec<(&str, &str)> {
        response
            .devices
            .iter()
            .map(|d| (d.id.as_str(), d.health.as_str()))
            .collect()
    }

    #[test]
    fn resource_and_endpoint_derive_from_card_type() {
        let plugin = plugin(&["0"]);

        assert_eq!(plugin.resource_name(), "tenstorrent.com/n150");
        assert_eq!(plugin.endpoint(), "tenstorrent-n150.sock");
        assert_eq!(
            plugin.socket_path(),
            PathBuf::from("/var/lib/kubelet/device-plugins/tenstorrent-n150.sock")
        );
    }

    #[test]
    fn allocate_answers_each_container_in_order() {
        let plugin = plugin(&["0", "1"]);
        let request = AllocateRequest {
            container_requests: vec![container_request(&["1"]), container_request(&["0"])],
        };

        let response = plugin.allocate(&request).expect("allocation should succeed");

        assert_eq!(response.container_responses.len(), 2);
        let first = &response.container_responses[0];
        assert_eq!(
            first.devices,
            vec![DeviceSpec {
                container_path: "/dev/tenstorrent/1".to_string(),
                host_path: "/dev/tenstorrent/1".to_string(),
                permissions: "rw".to_string(),
            }]
        );
        assert_eq!(first.envs[VISIBLE_DEVICES_ENV], "1");
        let second = &response.container_responses[1];
        assert_eq!(second.devices[0].host_path, "/dev/tenstorrent/0");
        assert_eq!(second.envs[VISIBLE_DEVICES_ENV], "0");
    }

    #[test]
    fn allocate_grants_multiple_devices_to_one_container() {
        let plugin = plugin(&["0", "1", "2"]);
        let request = AllocateRequest {
            container_requests: vec![container_request(&["2", "0"])],
        };

        let response = plugin.allocate(&request).expect("allocation should succeed");

        let paths: Vec<&str> = response.container_responses[0]
            .devices
            .iter()
            .map(|d| d.host_path.as_str())
            .collect();
        assert_eq!(paths, vec!["/dev/tenstorrent/2", "/dev/tenstorrent/0"]);
        assert_eq!(
            response.container_responses[0].envs[VISIBLE_DEVICES_ENV],
            "2,0"
        );
    }

    #[test]
    fn allocate_reports_only_the_failing_container_requests() {
        let plugin = plugin(&["0", "1"]);
        let request = AllocateRequest {
            container_requests: vec![
                container_request(&["0"]),
                container_request(&["7", "1"]),
                container_request(&["1"]),
                container_request(&["9"]),
            ],
        };

        let err = plugin.allocate(&request).expect_err("allocation should fail");

        assert_eq!(
            err.failures,
            vec![
                ContainerAllocationFailure {
                    index: 1,
                    unknown_ids: vec!["7".to_string()],
                },
                ContainerAllocationFailure {
                    index: 3,
                    unknown_ids: vec!["9".to_string()],
                },
            ]
        );
        assert!(err.to_string().contains("container request 1"));
    }

    #[test(tokio::test)]
    async fn allocate_rpc_maps_unknown_device_to_invalid_argument() {
        let service = DevicePluginService::new(plugin(&["0"]), CancellationToken::new());
        let request = AllocateRequest {
            container_requests: vec![container_request(&["5"])],
        };

        let status = service
            .allocate(Request::new(request))
            .await
            .expect_err("allocate should fail");

        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[test(tokio::test)]
    async fn allocate_rpc_with_one_bad_request_names_only_that_request() {
        let service = DevicePluginService::new(plugin(&["0", "1"]), CancellationToken::new());
        let request = AllocateRequest {
            container_requests: vec![
                container_request(&["0"]),
                container_request(&["7"]),
                container_request(&["1"]),
            ],
        };

        let status = service
            .allocate(Request::new(request))
            .await
            .expect_err("allocate should fail");

        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("container request 1"));
        assert!(!status.message().contains("container request 0"));
        assert!(!status.message().contains("container request 2"));
    }

    #[test(tokio::test)]
    async fn options_advertise_no_optional_calls() {
        let service = DevicePluginService::new(plugin(&["0"]), CancellationToken::new());

        let options = service
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .expect("options should succeed")
            .into_inner();

        assert!(!options.pre_start_required);
        assert!(!options.get_preferred_allocation_available);
    }

    #[test(tokio::test)]
    async fn preferred_allocation_is_unimplemented() {
        let service = DevicePluginService::new(plugin(&["0"]), CancellationToken::new());

        let status = service
            .get_preferred_allocation(Request::new(PreferredAllocationRequest::default()))
            .await
            .expect_err("preferred allocation should be unimplemented");

        assert_eq!(status.code(), Code::Unimplemented);
    }

    #[test(tokio::test)]
    async fn pre_start_container_is_a_no_op() {
        let service = DevicePluginService::new(plugin(&["0"]), CancellationToken::new());

        service
            .pre_start_container(Request::new(PreStartContainerRequest {
                devices_ids: vec!["0".to_string()],
            }))
            .await
            .expect("pre-start should succeed");
    }

    #[test(tokio::test)]
    async fn list_and_watch_sends_initial_list_then_waits() {
        let service = DevicePluginService::new(plugin(&["0", "1"]), CancellationToken::new());

        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("stream should open")
            .into_inner();

        let first = stream
            .next()
            .await
            .expect("stream should yield")
            .expect("item should be ok");
        assert_eq!(
            device_ids(&first),
            vec![("0", "Healthy"), ("1", "Healthy")]
        );

        let next = tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
        assert!(next.is_err(), "no push expected without a change");
    }

    #[test(tokio::test)]
    async fn list_and_watch_pushes_health_changes() {
        let plugin = plugin(&["0", "1"]);
        let service = DevicePluginService::new(plugin.clone(), CancellationToken::new());

        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("stream should open")
            .into_inner();
        stream
            .next()
            .await
            .expect("initial list")
            .expect("initial list should not fail");

        assert!(plugin.set_device_health("1", DeviceHealth::Unhealthy));
        let update = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("update should arrive")
            .expect("stream should yield")
            .expect("item should be ok");
        assert_eq!(
            device_ids(&update),
            vec![("0", "Healthy"), ("1", "Unhealthy")]
        );

        // Same health again is not a change
        assert!(!plugin.set_device_health("1", DeviceHealth::Unhealthy));
        assert!(!plugin.set_device_health("42", DeviceHealth::Unhealthy));
        let next = tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
        assert!(next.is_err(), "no push expected without a change");
    }

    #[test(tokio::test)]
    async fn list_and_watch_ends_on_cancellation() {
        let token = CancellationToken::new();
        let service = DevicePluginService::new(plugin(&["0"]), token.clone());

        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("stream should open")
            .into_inner();
        stream
            .next()
            .await
            .expect("initial list")
            .expect("initial list should not fail");

        token.cancel();
        let end = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream should end after cancellation");
        assert!(end.is_none());
    }

    #[test(tokio::test)]
    async fn list_and_watch_can_be_reopened() {
        let service = DevicePluginService::new(plugin(&["0"]), CancellationToken::new());

        for _ in 0..2 {
            let mut stream = service
                .list_and_watch(Request::new(Empty {}))
                .await
                .expect("stream should open")
                .into_inner();
            let first = stream
                .next()
                .await
                .expect("stream should yield")
                .expect("item should be ok");
            assert_eq!(device_ids(&first), vec![("0", "Healthy")]);
        }
    }

    #[test]
    fn devices_snapshot_reflects_health_updates() {
        let plugin = plugin(&["0", "1"]);

        assert!(plugin.set_device_health("0", DeviceHealth::Unhealthy));

        assert_eq!(
            plugin.devices(),
            vec![
                Device {
                    id: "0".to_string(),
                    health: DeviceHealth::Unhealthy,
                },
                Device::healthy("1"),
            ]
        );
    }
}
