//! Endpoint resolution
//!
//! Two-stage discovery: ask the configured address which servers it hosts,
//! then ask the first server's first discovery URL for its endpoints and
//! take the first one. Retrying is the session manager's job.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;
use uabridge_core::Endpoint;
use uabridge_protocol::UaClient;

use crate::error::DiscoveryError;

#[derive(Clone)]
pub struct EndpointResolver {
    client: Arc<dyn UaClient>,
    timeout: Duration,
}

impl EndpointResolver {
    pub fn new(client: Arc<dyn UaClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Resolve `address` to a single endpoint. Both discovery calls share
    /// one timeout budget.
    pub async fn resolve(&self, address: &str) -> Result<Endpoint, DiscoveryError> {
        match timeout(self.timeout, self.discover(address)).await {
            Ok(result) => result,
            Err(_) => Err(DiscoveryError::Timeout(self.timeout)),
        }
    }

    async fn discover(&self, address: &str) -> Result<Endpoint, DiscoveryError> {
        let servers = self
            .client
            .find_servers(address)
            .await
            .map_err(|source| DiscoveryError::Unreachable {
                address: address.to_string(),
                source,
            })?;

        let server = servers
            .into_iter()
            .next()
            .ok_or_else(|| DiscoveryError::NoServers(address.to_string()))?;
        debug!(
            "Discovered server {} ({})",
            server.application_name, server.application_uri
        );

        let discovery_url = server
            .discovery_urls
            .into_iter()
            .next()
            .ok_or_else(|| DiscoveryError::NoDiscoveryUrl(server.application_uri.clone()))?;

        let endpoints = self
            .client
            .get_endpoints(&discovery_url)
            .await
            .map_err(|source| DiscoveryError::Unreachable {
                address: discovery_url.clone(),
                source,
            })?;

        let endpoint = endpoints
            .into_iter()
            .next()
            .ok_or(DiscoveryError::NoEndpoints(discovery_url))?;
        debug!(
            "Selected endpoint {} ({:?}, {})",
            endpoint.url, endpoint.security_mode, endpoint.security_policy
        );
        Ok(endpoint)
    }
}
