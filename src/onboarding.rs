use std::sync::{Arc, PoisonError, RwLock};

use log::{error, info, warn};
use tokio::sync::watch;
use url::Url;

use crate::DiscoveryService;
use crate::error::{OnboardError, Result};
use crate::types::DiscoveredServer;
use crate::validator::{ConnectionValidator, HttpTransport, normalize};

/// Where onboarding currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    None,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// Whether the UI may start a new connection attempt.
    pub fn accept_connections(self) -> bool {
        !matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    /// Whether the last attempt failed and its diagnostic should be shown.
    pub fn connect_error(self) -> bool {
        self == ConnectionState::Error
    }
}

/// Everything a UI binds to, published as one value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnboardingSnapshot {
    pub state: ConnectionState,
    /// Diagnostic of the last failed attempt; empty unless `state` is `Error`.
    pub error_message: String,
    /// Address text as entered, or its normalized form once submitted.
    pub uri_string: String,
}

/// Persists the active server address.
pub trait ServerStore: Send + Sync {
    fn set_active_server(&self, address: &Url) -> Result<()>;
}

/// Hands off to the web client once a server is connected.
pub trait Navigator: Send + Sync {
    fn navigate(&self, address: &Url);
}

/// [`ServerStore`] keeping the address in memory.
#[derive(Debug, Default)]
pub struct MemoryServerStore {
    active: RwLock<Option<Url>>,
}

impl MemoryServerStore {
    pub fn active_server(&self) -> Option<Url> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ServerStore for MemoryServerStore {
    fn set_active_server(&self, address: &Url) -> Result<()> {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(address.clone());
        Ok(())
    }
}

/// Drives the `None -> Connecting -> {Connected | Error}` state machine.
///
/// Validation outcomes are folded into an [`OnboardingSnapshot`] that UIs
/// observe through [`subscribe`](Self::subscribe). The controller does not
/// guard against overlapping submits; the UI disables its connect control
/// while [`accept_connections`](Self::accept_connections) is false.
pub struct OnboardingController<T: HttpTransport> {
    validator: ConnectionValidator<T>,
    store: Arc<dyn ServerStore>,
    navigator: Option<Arc<dyn Navigator>>,
    discovery: Option<Arc<dyn DiscoveryService>>,
    snapshot: watch::Sender<OnboardingSnapshot>,
}

impl<T: HttpTransport> OnboardingController<T> {
    pub fn new(validator: ConnectionValidator<T>, store: Arc<dyn ServerStore>) -> Self {
        let (snapshot, _) = watch::channel(OnboardingSnapshot::default());
        OnboardingController {
            validator,
            store,
            navigator: None,
            discovery: None,
            snapshot,
        }
    }

    pub fn with_navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn DiscoveryService>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<OnboardingSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> OnboardingSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn accept_connections(&self) -> bool {
        self.state().accept_connections()
    }

    pub fn connect_error(&self) -> bool {
        self.state().connect_error()
    }

    pub fn error_message(&self) -> String {
        self.snapshot.borrow().error_message.clone()
    }

    pub fn uri_string(&self) -> String {
        self.snapshot.borrow().uri_string.clone()
    }

    pub fn set_uri_string(&self, uri_string: impl Into<String>) {
        let uri_string = uri_string.into();
        self.snapshot.send_modify(|s| s.uri_string = uri_string);
    }

    /// Connects to the address currently held in `uri_string`.
    pub async fn connect(&self) -> ConnectionState {
        let input = self.uri_string();
        self.submit(&input).await
    }

    /// Validates `input`, commits the resolved address and navigates on
    /// success. Returns the state the attempt ended in.
    pub async fn submit(&self, input: &str) -> ConnectionState {
        // Malformed input is kept as typed; validation reports it.
        let uri_string = match normalize(input) {
            Ok(url) => url.to_string(),
            Err(_) => input.to_string(),
        };

        self.snapshot.send_modify(|s| {
            s.state = ConnectionState::Connecting;
            s.error_message.clear();
            s.uri_string = uri_string.clone();
        });
        info!("Connecting to {}", uri_string);

        let outcome = match self.validator.validate(&uri_string).await {
            Ok(validated) => self.commit(&validated.address).map(|()| validated.address),
            Err(e) => Err(OnboardError::Validation(e)),
        };

        match outcome {
            Ok(address) => {
                self.snapshot.send_modify(|s| {
                    s.state = ConnectionState::Connected;
                    s.uri_string = address.to_string();
                });
                info!("Connected to {}", address);
                if let Some(navigator) = &self.navigator {
                    navigator.navigate(&address);
                }
                ConnectionState::Connected
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", uri_string, e);
                self.snapshot.send_modify(|s| {
                    s.state = ConnectionState::Error;
                    s.error_message = e.to_string();
                });
                ConnectionState::Error
            }
        }
    }

    /// Connects to a server picked from the discovered list.
    pub async fn select_discovered(&self, server: &DiscoveredServer) -> ConnectionState {
        self.submit(&server.address).await
    }

    /// Starts filling the discovered server list. No-op without an
    /// attached discovery service.
    pub fn discover_servers(&self) -> Result<()> {
        match &self.discovery {
            Some(discovery) => discovery.start_discovery(),
            None => Ok(()),
        }
    }

    pub fn discovered_servers(&self) -> Vec<DiscoveredServer> {
        self.discovery
            .as_ref()
            .map(|d| d.servers())
            .unwrap_or_default()
    }

    /// Ends onboarding: shuts down discovery and releases its sockets.
    ///
    /// The blocking shutdown runs on the blocking pool, so the runtime keeps
    /// serving other tasks while listeners drain.
    pub async fn finish(&self) -> Result<()> {
        let Some(discovery) = self.discovery.clone() else {
            return Ok(());
        };

        tokio::task::spawn_blocking(move || discovery.shutdown())
            .await
            .map_err(|e| {
                OnboardError::ShutdownError(format!("Discovery shutdown task failed: {}", e))
            })?
    }

    fn commit(&self, address: &Url) -> Result<()> {
        self.store.set_active_server(address).map_err(|e| {
            error!("Failed to save active server {}: {}", address, e);
            e
        })
    }
}
