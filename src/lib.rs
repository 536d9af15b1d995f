pub mod error;
pub mod onboarding;
pub mod types;
pub mod udp;
pub mod validator;

pub use error::{OnboardError, Result, ValidationError};
pub use onboarding::{
    ConnectionState, MemoryServerStore, Navigator, OnboardingController, OnboardingSnapshot,
    ServerStore,
};
pub use types::{
    BroadcastTargets, DISCOVERY_PORT, DISCOVERY_QUERY, DiscoveredServer, DiscoveryConfig,
    DiscoveryEvent, DiscoveryServiceStatus, SERVER_MARKER, ValidatorConfig,
};
pub use udp::{BroadcastDiscoveryService, interface_broadcast_addresses, subnet_broadcast};
pub use validator::{
    ConnectionValidator, HttpResponse, HttpTransport, ReqwestTransport, TransportError,
    ValidatedServer, normalize,
};

use std::sync::Arc;
use tokio::sync::broadcast;

/// Server Discovery Trait.
///
/// Defines the interface the onboarding flow uses to find servers on the
/// local network.
pub trait DiscoveryService: Sync + Send {
    /// Starts a discovery round.
    ///
    /// Returns immediately; servers show up through [`servers`](Self::servers)
    /// and [`subscribe`](Self::subscribe) as replies arrive. Calling this
    /// while a round is running does nothing.
    fn start_discovery(&self) -> Result<()>;

    /// Subscribes to discovery events.
    ///
    /// Returns a `broadcast::Receiver` to receive [`DiscoveryEvent`]s.
    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent>;

    /// Servers found in the current round, in the order they were first seen.
    fn servers(&self) -> Vec<DiscoveredServer>;

    /// Asks every listener to stop.
    ///
    /// Listeners exit at their next loop iteration, at most one receive
    /// timeout later.
    fn stop_discovery(&self) -> Result<()>;

    /// Refreshes discovered servers.
    ///
    /// Re-sends `ServerFound` events for all currently known servers.
    /// This can be useful for new subscribers to get the current state.
    fn refresh_services(&self) -> Result<()>;

    /// Stops discovery and waits until every socket is closed.
    ///
    /// This blocks the calling thread for up to one receive timeout; async
    /// callers should run it through `tokio::task::spawn_blocking`.
    fn shutdown(&self) -> Result<()>;

    /// Gets the current operational status of the discovery component.
    fn status(&self) -> DiscoveryServiceStatus;
}

/// Creates a discovery component instance.
///
/// # Arguments
/// * `config` - Ports, payload, timeouts and target addresses.
///
/// # Returns
/// A `Result` containing an `Arc` to a component that implements the `DiscoveryService` trait,
/// or an `OnboardError` if the configuration is invalid.
pub fn create_discovery_service(config: DiscoveryConfig) -> Result<Arc<dyn DiscoveryService>> {
    let service = udp::BroadcastDiscoveryService::new(config)?;
    Ok(Arc::new(service))
}
