use std::sync::Arc;
use std::time::Duration;

use jellyfin_onboard::{
    ConnectionState, ConnectionValidator, DiscoveryConfig, MemoryServerStore, Navigator,
    OnboardingController, ValidatorConfig, create_discovery_service,
};
use log::{error, info};
use url::Url;

struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate(&self, address: &Url) {
        info!("Opening web client at {}", address);
    }
}

/// Connects to the address given on the command line, or to the first
/// server found on the local network.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let store = Arc::new(MemoryServerStore::default());
    let validator = ConnectionValidator::with_config(ValidatorConfig::default())?;
    let controller = OnboardingController::new(validator, store.clone())
        .with_navigator(Arc::new(LogNavigator))
        .with_discovery(create_discovery_service(DiscoveryConfig::default())?);

    let mut updates = controller.subscribe();
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            info!(
                "State: {:?} (accepting input: {}) {}",
                snapshot.state,
                snapshot.state.accept_connections(),
                snapshot.error_message
            );
        }
    });

    let state = match std::env::args().nth(1) {
        Some(address) => controller.submit(&address).await,
        None => {
            controller.discover_servers()?;
            info!("Looking for servers on the local network...");

            let mut found = None;
            for _ in 0..20 {
                if let Some(server) = controller.discovered_servers().into_iter().next() {
                    found = Some(server);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }

            match found {
                Some(server) => {
                    info!("Selecting '{}'", server.name);
                    controller.select_discovered(&server).await
                }
                None => {
                    error!("No server found");
                    ConnectionState::None
                }
            }
        }
    };

    controller.finish().await?;

    match state {
        ConnectionState::Connected => {
            info!("Saved server: {:?}", store.active_server().map(String::from));
        }
        _ => error!("Onboarding did not complete: {}", controller.error_message()),
    }

    Ok(())
}
