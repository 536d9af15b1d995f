use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::time::Duration;

/// UDP port Jellyfin servers listen on for discovery queries.
pub const DISCOVERY_PORT: u16 = 7359;

/// Query payload a Jellyfin server answers with an announcement.
pub const DISCOVERY_QUERY: &str = "Who is JellyfinServer?";

/// Substring a genuine Jellyfin web client page contains.
pub const SERVER_MARKER: &str = "Jellyfin";

/// Represents the events emitted while discovering servers.
#[derive(Clone, Debug)]
pub enum DiscoveryEvent {
    /// A server not seen before in this discovery round replied.
    ServerFound(DiscoveredServer),
    /// A discovery round has started.
    DiscoveryStarted,
    /// Every listener of the discovery round has exited.
    DiscoveryStopped,
}

/// Represents the current operational status of the discovery component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryServiceStatus {
    /// No listener is running.
    Stopped,
    /// Listeners are broadcasting and receiving replies.
    Running,
    /// A stop was requested and listeners are winding down.
    Stopping,
}

/// One server announcement, decoded from a discovery reply.
///
/// The reply is a JSON object such as
/// `{"Address":"http://192.168.1.20:8096","Id":"b2c1...","Name":"Living Room","EndpointAddress":null}`.
///
/// Two records are the same server when `id` and `name` match. `address`
/// depends on which interface the reply came through and is not part of
/// the identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveredServer {
    /// Base URL the server advertises for its web client.
    pub address: String,
    /// Server id, stable across restarts.
    pub id: String,
    /// Friendly server name.
    pub name: String,
    /// Optional endpoint address some server versions include.
    #[serde(default)]
    pub endpoint_address: Option<String>,
}

impl DiscoveredServer {
    /// Parses a discovery reply payload.
    pub fn from_datagram(payload: &[u8]) -> serde_json::Result<Self> {
        let text = String::from_utf8_lossy(payload);
        serde_json::from_str(text.trim_end_matches('\0').trim())
    }
}

impl PartialEq for DiscoveredServer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.name == other.name
    }
}

impl Eq for DiscoveredServer {}

impl Hash for DiscoveredServer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.name.hash(state);
    }
}

/// Which broadcast addresses a discovery round queries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BroadcastTargets {
    /// `255.255.255.255` plus the subnet broadcast address of every IPv4
    /// interface address.
    Interfaces,
    /// Exactly these addresses.
    Fixed(Vec<Ipv4Addr>),
}

/// Configuration for broadcast discovery.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Destination UDP port of the query.
    pub port: u16,

    /// ASCII query payload.
    pub query: String,

    /// How long a listener waits for a reply before re-sending the query.
    /// A stop request is also observed within this interval.
    pub receive_timeout: Duration,

    /// Receive buffer size in bytes. Longer replies are truncated and
    /// will fail to parse.
    pub buffer_size: usize,

    /// Broadcast addresses to query.
    pub targets: BroadcastTargets,

    /// Capacity of the event channel returned by `subscribe`.
    pub event_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DISCOVERY_PORT,
            query: DISCOVERY_QUERY.to_string(),
            receive_timeout: Duration::from_secs(5),
            buffer_size: 1024,
            targets: BroadcastTargets::Interfaces,
            event_capacity: 100,
        }
    }
}

/// Configuration for validating a server address.
#[derive(Clone, Debug)]
pub struct ValidatorConfig {
    /// Substring the response body must contain.
    pub marker: String,

    /// Redirect hops followed before giving up.
    pub max_redirects: u32,

    /// Upper bound for each HTTP request, including reading the body.
    pub request_timeout: Duration,

    /// `User-Agent` header sent with validation requests.
    pub user_agent: String,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            marker: SERVER_MARKER.to_string(),
            max_redirects: 10,
            request_timeout: Duration::from_secs(10),
            user_agent: format!("jellyfin-onboard/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}
