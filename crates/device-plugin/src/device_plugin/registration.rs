//! Registration handshake with the kubelet.

use std::path::Path;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tonic::transport::Channel;
use tonic::Request;
use tracing::info;

use super::api::registration_client::RegistrationClient;
use super::api::DevicePluginOptions;
use super::api::RegisterRequest;
use super::connectivity;
use super::connectivity::ConnectivityError;
use super::API_VERSION;

/// Connects to the kubelet registration socket, waiting at most `timeout`
/// for it to accept connections.
pub async fn dial(
    kubelet_socket: &Path,
    timeout: Duration,
) -> Result<Channel, Report<ConnectivityError>> {
    info!("Dialing kubelet socket: {}", kubelet_socket.display());

    connectivity::wait_for_ready(kubelet_socket, timeout).await
}

/// Builds the request announcing `resource_name` served on `endpoint`.
pub fn register_request(
    endpoint: &str,
    resource_name: &str,
    options: DevicePluginOptions,
) -> RegisterRequest {
    RegisterRequest {
        version: API_VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(options),
    }
}

/// Errors of a single registration attempt.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("kubelet registration socket is unreachable")]
    Unreachable,
    #[error("kubelet rejected the registration")]
    Rejected,
    #[error("kubelet did not answer the registration within {timeout:?}")]
    Timeout { timeout: Duration },
}

impl RegistrationError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RegistrationError::Timeout { .. })
    }
}

/// Sends exactly one `Register` call to the kubelet.
///
/// `timeout` bounds both the wait for the socket and the call itself.
pub async fn register(
    kubelet_socket: &Path,
    request: RegisterRequest,
    timeout: Duration,
) -> Result<(), Report<RegistrationError>> {
    let channel = dial(kubelet_socket, timeout)
        .await
        .change_context(RegistrationError::Unreachable)?;
    let mut client = RegistrationClient::new(channel);

    info!("Registering with kubelet on endpoint {}", request.endpoint);
    info!("Registering resource {}", request.resource_name);
    info!("Registering with device plugin API version {}", request.version);

    tokio::time::timeout(timeout, client.register(Request::new(request)))
        .await
        .map_err(|_| Report::new(RegistrationError::Timeout { timeout }))?
        .change_context(RegistrationError::Rejected)?;

    info!("successfully registered device plugin with kubelet");
    Ok(())
}
