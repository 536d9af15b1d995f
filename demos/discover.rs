use std::time::Duration;

use jellyfin_onboard::{DiscoveryConfig, DiscoveryEvent, DiscoveryService, create_discovery_service};
use log::{error, info, warn};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let service = create_discovery_service(DiscoveryConfig::default())?;

    // Subscribe before starting so no ServerFound event is missed.
    let mut receiver = service.subscribe();
    service.start_discovery()?;

    tokio::spawn(async move {
        while let Ok(event) = receiver.recv().await {
            match event {
                DiscoveryEvent::ServerFound(server) => {
                    info!("Found '{}' at {}", server.name, server.address);
                    info!("  - id: {}", server.id);
                    if let Some(endpoint) = &server.endpoint_address {
                        info!("  - endpoint: {}", endpoint);
                    }
                }
                DiscoveryEvent::DiscoveryStarted => info!("Discovery started"),
                DiscoveryEvent::DiscoveryStopped => warn!("Discovery stopped"),
            }
        }
    });

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        _ = signal::ctrl_c() => info!("Interrupted"),
    }

    let servers = service.servers();
    info!("{} server(s) found", servers.len());
    for server in &servers {
        info!("  {} ({})", server.name, server.address);
    }

    match tokio::task::spawn_blocking(move || service.shutdown()).await {
        Ok(Err(e)) => error!("Shutdown failed: {}", e),
        Err(e) => error!("Shutdown task failed: {}", e),
        Ok(Ok(())) => {}
    }

    Ok(())
}
