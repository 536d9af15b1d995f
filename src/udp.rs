use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};

use if_addrs::IfAddr;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc};

use crate::DiscoveryService;
use crate::error::{OnboardError, Result};
use crate::types::{
    BroadcastTargets, DiscoveredServer, DiscoveryConfig, DiscoveryEvent, DiscoveryServiceStatus,
};

/// Internal state for the broadcast discovery service.
struct BroadcastServiceState {
    /// Current operational status of the discovery service.
    status: DiscoveryServiceStatus,
    /// Threads of the current (or last) discovery round.
    round: Option<DiscoveryRound>,
}

/// The threads spawned by one `start_discovery` call.
struct DiscoveryRound {
    /// Set to ask every listener of this round to exit.
    stop: Arc<AtomicBool>,
    listeners: Vec<JoinHandle<()>>,
    aggregator: Option<JoinHandle<()>>,
}

impl DiscoveryRound {
    /// Waits for every thread of the round. Returns the number of threads
    /// that panicked.
    fn join(self) -> usize {
        let mut panicked = 0;
        for handle in self.listeners.into_iter().chain(self.aggregator) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        panicked
    }
}

/// UDP broadcast based discovery of Jellyfin servers.
///
/// Every discovery round spawns one [`BroadcastListener`] thread per
/// broadcast address and a single aggregator thread. Listeners only decode
/// replies and forward them over a channel; the aggregator is the only
/// writer of the discovered server list, which keeps the list free of
/// duplicates no matter how many listeners hear the same server.
pub struct BroadcastDiscoveryService {
    config: DiscoveryConfig,
    sender: broadcast::Sender<DiscoveryEvent>,
    discovered_servers: Arc<RwLock<Vec<DiscoveredServer>>>,
    state: Arc<RwLock<BroadcastServiceState>>,
}

impl BroadcastDiscoveryService {
    /// Creates a new `BroadcastDiscoveryService` instance.
    ///
    /// # Errors
    /// Returns `OnboardError::ConfigError` if the configuration is invalid.
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        if config.query.is_empty() || !config.query.is_ascii() {
            return Err(OnboardError::ConfigError(
                "Discovery query must be non-empty ASCII".into(),
            ));
        }

        if config.receive_timeout.is_zero() {
            return Err(OnboardError::ConfigError(
                "Receive timeout cannot be zero".into(),
            ));
        }

        if config.buffer_size == 0 {
            return Err(OnboardError::ConfigError(
                "Receive buffer size cannot be zero".into(),
            ));
        }

        if matches!(&config.targets, BroadcastTargets::Fixed(list) if list.is_empty()) {
            return Err(OnboardError::ConfigError(
                "Fixed broadcast target list cannot be empty".into(),
            ));
        }

        let (sender, _) = broadcast::channel(config.event_capacity.max(1));

        Ok(BroadcastDiscoveryService {
            config,
            sender,
            discovered_servers: Arc::new(RwLock::new(Vec::new())),
            state: Arc::new(RwLock::new(BroadcastServiceState {
                status: DiscoveryServiceStatus::Stopped,
                round: None,
            })),
        })
    }

    /// Consumes decoded replies until every listener of the round has
    /// dropped its sender, then marks the service stopped.
    fn run_aggregator(
        mut receiver: mpsc::UnboundedReceiver<DiscoveredServer>,
        servers: Arc<RwLock<Vec<DiscoveredServer>>>,
        sender: broadcast::Sender<DiscoveryEvent>,
        state: Arc<RwLock<BroadcastServiceState>>,
    ) {
        debug!("Discovery aggregator started");

        while let Some(server) = receiver.blocking_recv() {
            if merge_server(&servers, &server) {
                info!(
                    "Discovered server '{}' ({}) at {}",
                    server.name, server.id, server.address
                );
                if sender.send(DiscoveryEvent::ServerFound(server)).is_err() {
                    debug!("No subscribers for ServerFound event");
                }
            }
        }

        write_lock(&state).status = DiscoveryServiceStatus::Stopped;
        debug!("All discovery listeners exited");

        if sender.send(DiscoveryEvent::DiscoveryStopped).is_err() {
            debug!("No subscribers for DiscoveryStopped event");
        }
    }
}

impl DiscoveryService for BroadcastDiscoveryService {
    fn start_discovery(&self) -> Result<()> {
        // Held until the round is stored, so a concurrent stop always finds
        // the stop flag of the round it is stopping.
        let mut state_guard = write_lock(&self.state);

        match state_guard.status {
            DiscoveryServiceStatus::Running => return Ok(()),
            DiscoveryServiceStatus::Stopping => {
                return Err(OnboardError::StateError(
                    "Discovery is currently stopping, cannot start a new round.".into(),
                ));
            }
            DiscoveryServiceStatus::Stopped => {}
        }

        // A stopped round's threads have already exited, this only reaps them.
        // None of them takes the state lock on the way out.
        if let Some(round) = state_guard.round.take() {
            round.join();
        }

        write_lock(&self.discovered_servers).clear();

        let targets = resolve_targets(&self.config.targets);
        info!(
            "Starting server discovery on UDP port {} for {} broadcast address(es)",
            self.config.port,
            targets.len()
        );

        if self.sender.send(DiscoveryEvent::DiscoveryStarted).is_err() {
            debug!("No subscribers for DiscoveryStarted event");
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = Vec::with_capacity(targets.len());

        for target in targets {
            let listener = match BroadcastListener::bind(target, &self.config) {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("Failed to open discovery socket for {}: {}", target, e);
                    continue;
                }
            };

            match listener.spawn(tx.clone(), Arc::clone(&stop)) {
                Ok(handle) => listeners.push(handle),
                Err(e) => warn!("Failed to spawn discovery listener for {}: {}", target, e),
            }
        }

        // The aggregator ends once the last listener drops its sender.
        drop(tx);

        // The aggregator takes the state lock only after every listener has
        // exited; if that happens early it waits until the round is stored.
        let servers = Arc::clone(&self.discovered_servers);
        let sender = self.sender.clone();
        let state = Arc::clone(&self.state);
        let aggregator = thread::Builder::new()
            .name("discovery-aggregator".to_string())
            .spawn(move || Self::run_aggregator(rx, servers, sender, state));

        match aggregator {
            Ok(handle) => {
                state_guard.status = DiscoveryServiceStatus::Running;
                state_guard.round = Some(DiscoveryRound {
                    stop,
                    listeners,
                    aggregator: Some(handle),
                });
                Ok(())
            }
            Err(e) => {
                // Listeners see the stop flag or a closed channel; the next
                // start or shutdown reaps them.
                error!("Failed to spawn discovery aggregator: {}", e);
                stop.store(true, Ordering::SeqCst);
                state_guard.status = DiscoveryServiceStatus::Stopped;
                state_guard.round = Some(DiscoveryRound {
                    stop,
                    listeners,
                    aggregator: None,
                });
                Err(OnboardError::IoError(e))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.sender.subscribe()
    }

    fn servers(&self) -> Vec<DiscoveredServer> {
        read_lock(&self.discovered_servers).clone()
    }

    fn stop_discovery(&self) -> Result<()> {
        let mut state_guard = write_lock(&self.state);

        match state_guard.status {
            DiscoveryServiceStatus::Stopped | DiscoveryServiceStatus::Stopping => Ok(()),
            DiscoveryServiceStatus::Running => {
                state_guard.status = DiscoveryServiceStatus::Stopping;
                if let Some(round) = &state_guard.round {
                    round.stop.store(true, Ordering::SeqCst);
                }
                info!("Stopping server discovery");
                Ok(())
            }
        }
    }

    fn refresh_services(&self) -> Result<()> {
        debug!("Refreshing discovered servers");

        for server in self.servers() {
            if let Err(e) = self.sender.send(DiscoveryEvent::ServerFound(server)) {
                warn!("Failed to send refreshed ServerFound event: {}", e);
            }
        }

        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        info!("Shutting down server discovery");

        self.stop_discovery()?;

        // Join outside the lock: the aggregator takes it on its way out.
        let round = write_lock(&self.state).round.take();
        let panicked = round.map_or(0, DiscoveryRound::join);

        // Only a round whose aggregator never reported back is still
        // stopping here; a round started meanwhile is left running.
        let mut state_guard = write_lock(&self.state);
        if state_guard.status == DiscoveryServiceStatus::Stopping {
            state_guard.status = DiscoveryServiceStatus::Stopped;
        }
        drop(state_guard);

        if panicked > 0 {
            let error_msg = format!("{} discovery thread(s) panicked", panicked);
            error!("{}", error_msg);
            return Err(OnboardError::ShutdownError(error_msg));
        }

        info!("Server discovery shut down");
        Ok(())
    }

    fn status(&self) -> DiscoveryServiceStatus {
        read_lock(&self.state).status
    }
}

impl Drop for BroadcastDiscoveryService {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Error during automatic shutdown in drop: {}", e);
        }
    }
}

/// Sends the discovery query to one broadcast address and forwards every
/// parsable reply to the aggregator.
///
/// The listener owns its socket; the socket is closed when [`run`] returns,
/// whichever way it returns.
///
/// [`run`]: BroadcastListener::run
pub(crate) struct BroadcastListener {
    socket: UdpSocket,
    target: SocketAddrV4,
    query: Vec<u8>,
    buffer_size: usize,
}

impl BroadcastListener {
    /// Opens a broadcast-enabled socket on an ephemeral port.
    pub(crate) fn bind(broadcast_address: Ipv4Addr, config: &DiscoveryConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(config.receive_timeout))?;

        Ok(BroadcastListener {
            socket,
            target: SocketAddrV4::new(broadcast_address, config.port),
            query: config.query.as_bytes().to_vec(),
            buffer_size: config.buffer_size,
        })
    }

    pub(crate) fn spawn(
        self,
        tx: mpsc::UnboundedSender<DiscoveredServer>,
        stop: Arc<AtomicBool>,
    ) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("discovery-{}", self.target.ip()))
            .spawn(move || self.run(&tx, &stop))
    }

    /// Query loop: send the query, then read replies until a receive times
    /// out, which triggers the next query.
    fn run(self, tx: &mpsc::UnboundedSender<DiscoveredServer>, stop: &AtomicBool) {
        let mut buf = vec![0u8; self.buffer_size];

        'query: while !stop.load(Ordering::SeqCst) {
            if let Err(e) = self.socket.send_to(&self.query, self.target) {
                warn!("Broadcast address {} failed to send: {}", self.target, e);
                break;
            }
            debug!("Sent discovery query to {}", self.target);

            loop {
                if stop.load(Ordering::SeqCst) {
                    break 'query;
                }

                let (len, src) = match self.socket.recv_from(&mut buf) {
                    Ok(pair) => pair,
                    Err(e) if is_timeout_error(&e) => continue 'query,
                    Err(e) => {
                        warn!("Broadcast address {} failed to receive: {}", self.target, e);
                        break 'query;
                    }
                };

                match DiscoveredServer::from_datagram(&buf[..len]) {
                    Ok(server) => {
                        debug!("Reply from {}: {:?}", src, server);
                        if tx.send(server).is_err() {
                            // Aggregator gone, nobody wants the results.
                            break 'query;
                        }
                    }
                    Err(e) => {
                        debug!("Dropping unparsable discovery reply from {}: {}", src, e);
                    }
                }
            }
        }

        debug!("Discovery listener for {} exited", self.target);
    }
}

/// Appends `server` unless an equal record is already present.
/// Returns whether it was added.
fn merge_server(servers: &RwLock<Vec<DiscoveredServer>>, server: &DiscoveredServer) -> bool {
    let mut servers_guard = write_lock(servers);
    if servers_guard.contains(server) {
        return false;
    }
    servers_guard.push(server.clone());
    true
}

/// Computes the directed broadcast address of the subnet `address` lives in.
pub fn subnet_broadcast(address: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(address) | !u32::from(netmask))
}

/// An IPv4 address bound to a local interface.
struct InterfaceAddress {
    name: String,
    up: bool,
    ip: Ipv4Addr,
    netmask: Ipv4Addr,
}

/// Subnet broadcast address of every IPv4 address bound to a local interface
/// whose operational status is up.
///
/// Duplicates are kept when several interfaces share a subnet.
pub fn interface_broadcast_addresses() -> io::Result<Vec<Ipv4Addr>> {
    let interfaces = if_addrs::get_if_addrs()?;

    let addresses: Vec<InterfaceAddress> = interfaces
        .into_iter()
        .filter_map(|iface| {
            let up = iface.is_oper_up();
            match iface.addr {
                IfAddr::V4(v4) => Some(InterfaceAddress {
                    name: iface.name,
                    up,
                    ip: v4.ip,
                    netmask: v4.netmask,
                }),
                IfAddr::V6(_) => None,
            }
        })
        .collect();

    Ok(subnet_broadcasts(&addresses))
}

fn subnet_broadcasts(addresses: &[InterfaceAddress]) -> Vec<Ipv4Addr> {
    addresses
        .iter()
        .filter_map(|address| {
            if !address.up {
                debug!(
                    "Skipping interface {} ({}): not operationally up",
                    address.name, address.ip
                );
                return None;
            }

            let broadcast = subnet_broadcast(address.ip, address.netmask);
            debug!(
                "Interface {}: {} / {} -> {}",
                address.name, address.ip, address.netmask, broadcast
            );
            Some(broadcast)
        })
        .collect()
}

fn resolve_targets(targets: &BroadcastTargets) -> Vec<Ipv4Addr> {
    match targets {
        BroadcastTargets::Fixed(list) => list.clone(),
        BroadcastTargets::Interfaces => {
            let mut addresses = vec![Ipv4Addr::BROADCAST];
            match interface_broadcast_addresses() {
                Ok(found) => addresses.extend(found),
                Err(e) => warn!(
                    "Failed to enumerate network interfaces, using global broadcast only: {}",
                    e
                ),
            }
            addresses
        }
    }
}

/// Returns `true` for the errors a read timeout produces.
fn is_timeout_error(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn server(id: &str, name: &str, address: &str) -> DiscoveredServer {
        DiscoveredServer {
            address: address.to_string(),
            id: id.to_string(),
            name: name.to_string(),
            endpoint_address: None,
        }
    }

    fn loopback_config(port: u16) -> DiscoveryConfig {
        DiscoveryConfig {
            port,
            receive_timeout: Duration::from_millis(200),
            targets: BroadcastTargets::Fixed(vec![Ipv4Addr::LOCALHOST]),
            ..DiscoveryConfig::default()
        }
    }

    /// Answers every discovery query with `replies`, until `stop` is set.
    fn spawn_responder(replies: Vec<Vec<u8>>) -> (u16, Arc<AtomicBool>, JoinHandle<usize>) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let mut queries = 0;
            let mut buf = [0u8; 256];
            while !stop_flag.load(Ordering::SeqCst) {
                let Ok((len, src)) = socket.recv_from(&mut buf) else {
                    continue;
                };
                assert_eq!(&buf[..len], b"Who is JellyfinServer?");
                queries += 1;
                for reply in &replies {
                    socket.send_to(reply, src).unwrap();
                }
            }
            queries
        });

        (port, stop, handle)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn computes_subnet_broadcast() {
        let cases = [
            ("192.168.1.37", "255.255.255.0", "192.168.1.255"),
            ("10.1.2.3", "255.0.0.0", "10.255.255.255"),
            ("172.16.5.9", "255.255.240.0", "172.16.15.255"),
            ("192.168.7.7", "255.255.255.255", "192.168.7.7"),
        ];

        for (address, mask, expected) in cases {
            assert_eq!(
                subnet_broadcast(address.parse().unwrap(), mask.parse().unwrap()),
                expected.parse::<Ipv4Addr>().unwrap(),
                "{} / {}",
                address,
                mask
            );
        }
    }

    #[test]
    fn interface_targets_start_with_global_broadcast() {
        let targets = resolve_targets(&BroadcastTargets::Interfaces);
        assert_eq!(targets[0], Ipv4Addr::BROADCAST);

        let fixed = vec![Ipv4Addr::new(10, 0, 0, 255)];
        assert_eq!(resolve_targets(&BroadcastTargets::Fixed(fixed.clone())), fixed);
    }

    #[test]
    fn down_interfaces_are_not_targeted() {
        let address = |name: &str, up: bool, ip: [u8; 4], netmask: [u8; 4]| InterfaceAddress {
            name: name.to_string(),
            up,
            ip: Ipv4Addr::from(ip),
            netmask: Ipv4Addr::from(netmask),
        };
        let addresses = [
            address("eth0", true, [192, 168, 1, 37], [255, 255, 255, 0]),
            address("wlan0", false, [10, 1, 2, 3], [255, 0, 0, 0]),
            address("eth1", true, [192, 168, 1, 40], [255, 255, 255, 0]),
        ];

        assert_eq!(
            subnet_broadcasts(&addresses),
            vec![Ipv4Addr::new(192, 168, 1, 255), Ipv4Addr::new(192, 168, 1, 255)]
        );
    }

    #[test]
    fn merge_keeps_first_seen_and_order() {
        let servers = RwLock::new(Vec::new());

        assert!(merge_server(&servers, &server("1", "Den", "http://a:8096")));
        assert!(merge_server(&servers, &server("2", "Attic", "http://b:8096")));
        assert!(!merge_server(&servers, &server("1", "Den", "http://c:8096")));

        let servers = servers.into_inner().unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].address, "http://a:8096");
        assert_eq!(servers[1].id, "2");
    }

    #[test]
    fn rejects_invalid_config() {
        let empty_query = DiscoveryConfig {
            query: String::new(),
            ..DiscoveryConfig::default()
        };
        assert!(matches!(
            BroadcastDiscoveryService::new(empty_query),
            Err(OnboardError::ConfigError(_))
        ));

        let zero_timeout = DiscoveryConfig {
            receive_timeout: Duration::ZERO,
            ..DiscoveryConfig::default()
        };
        assert!(BroadcastDiscoveryService::new(zero_timeout).is_err());

        let no_targets = DiscoveryConfig {
            targets: BroadcastTargets::Fixed(Vec::new()),
            ..DiscoveryConfig::default()
        };
        assert!(BroadcastDiscoveryService::new(no_targets).is_err());
    }

    #[test]
    fn listener_forwards_parsable_replies_only() {
        let (port, responder_stop, responder) = spawn_responder(vec![
            b"not json".to_vec(),
            br#"{"Address":"http://127.0.0.1:8096","Id":"a1","Name":"Den"}"#.to_vec(),
        ]);
        let config = loopback_config(port);
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let listener = BroadcastListener::bind(Ipv4Addr::LOCALHOST, &config).unwrap();
        let handle = listener.spawn(tx, Arc::clone(&stop)).unwrap();

        let received = rx.blocking_recv().unwrap();
        assert_eq!(received.id, "a1");
        assert_eq!(received.address, "http://127.0.0.1:8096");

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        responder_stop.store(true, Ordering::SeqCst);
        responder.join().unwrap();

        // Everything still queued is a valid record; garbage never made it.
        while let Ok(server) = rx.try_recv() {
            assert_eq!(server.id, "a1");
        }
    }

    #[test]
    fn listener_rebroadcasts_after_quiet_period() {
        // Replies never come, so each receive times out and re-sends.
        let (port, responder_stop, responder) = spawn_responder(Vec::new());
        let config = loopback_config(port);
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = BroadcastListener::bind(Ipv4Addr::LOCALHOST, &config)
            .unwrap()
            .spawn(tx, Arc::clone(&stop))
            .unwrap();

        thread::sleep(Duration::from_millis(700));
        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        responder_stop.store(true, Ordering::SeqCst);

        assert!(responder.join().unwrap() >= 2);
    }

    #[test]
    fn stop_releases_blocked_listener_within_timeout() {
        let (port, responder_stop, responder) = spawn_responder(Vec::new());
        let config = loopback_config(port);
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = BroadcastListener::bind(Ipv4Addr::LOCALHOST, &config)
            .unwrap()
            .spawn(tx, Arc::clone(&stop))
            .unwrap();
        thread::sleep(Duration::from_millis(50));

        let stopped_at = Instant::now();
        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();

        assert!(stopped_at.elapsed() < config.receive_timeout * 2);
        responder_stop.store(true, Ordering::SeqCst);
        responder.join().unwrap();
    }

    #[test]
    fn discovery_round_deduplicates_across_listeners() {
        let reply_a = br#"{"Address":"http://127.0.0.1:8096","Id":"a1","Name":"Den"}"#.to_vec();
        let reply_a_other_path =
            br#"{"Address":"http://10.0.0.5:8096","Id":"a1","Name":"Den"}"#.to_vec();
        let reply_b = br#"{"Address":"http://127.0.0.1:8920","Id":"b2","Name":"Attic"}"#.to_vec();
        let (port, responder_stop, responder) = spawn_responder(vec![
            reply_a,
            b"\x00\x01garbage".to_vec(),
            reply_a_other_path,
            reply_b,
        ]);

        // Three listeners all aimed at the same responder.
        let config = DiscoveryConfig {
            targets: BroadcastTargets::Fixed(vec![Ipv4Addr::LOCALHOST; 3]),
            ..loopback_config(port)
        };
        let service = BroadcastDiscoveryService::new(config).unwrap();
        let mut events = service.subscribe();

        service.start_discovery().unwrap();
        assert_eq!(service.status(), DiscoveryServiceStatus::Running);

        assert!(wait_until(|| service.servers().len() >= 2));
        // Let the listeners re-send a few times.
        thread::sleep(Duration::from_millis(500));

        let servers = service.servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers.iter().filter(|s| s.id == "a1").count(), 1);
        assert!(servers.iter().all(|s| s.name != "garbage"));

        service.shutdown().unwrap();
        assert_eq!(service.status(), DiscoveryServiceStatus::Stopped);

        let mut found = 0;
        let mut saw_started = false;
        let mut saw_stopped = false;
        while let Ok(event) = events.try_recv() {
            match event {
                DiscoveryEvent::ServerFound(_) => found += 1,
                DiscoveryEvent::DiscoveryStarted => saw_started = true,
                DiscoveryEvent::DiscoveryStopped => saw_stopped = true,
            }
        }
        assert_eq!(found, 2);
        assert!(saw_started);
        assert!(saw_stopped);

        responder_stop.store(true, Ordering::SeqCst);
        responder.join().unwrap();
    }

    #[test]
    fn start_while_running_is_a_no_op_and_restart_clears_results() {
        let reply = br#"{"Address":"http://127.0.0.1:8096","Id":"a1","Name":"Den"}"#.to_vec();
        let (port, responder_stop, responder) = spawn_responder(vec![reply]);
        let service = BroadcastDiscoveryService::new(loopback_config(port)).unwrap();

        service.start_discovery().unwrap();
        assert!(wait_until(|| service.servers().len() == 1));
        service.start_discovery().unwrap();
        assert_eq!(service.servers().len(), 1);

        service.shutdown().unwrap();
        // Stopping again is harmless.
        service.stop_discovery().unwrap();
        service.shutdown().unwrap();

        responder_stop.store(true, Ordering::SeqCst);
        responder.join().unwrap();

        // No responder any more: a fresh round starts empty.
        let silent = UdpSocket::bind((Ipv4Addr::LOCALHOST, port));
        service.start_discovery().unwrap();
        assert!(service.servers().is_empty());
        service.shutdown().unwrap();
        drop(silent);
    }

    #[test]
    fn round_ends_when_every_listener_fails() {
        // Port 0 is never a valid destination, so every send fails.
        let config = DiscoveryConfig {
            port: 0,
            ..loopback_config(0)
        };
        let service = BroadcastDiscoveryService::new(config).unwrap();

        service.start_discovery().unwrap();
        assert!(wait_until(
            || service.status() == DiscoveryServiceStatus::Stopped
        ));
        assert!(service.servers().is_empty());
        service.shutdown().unwrap();
    }

    #[test]
    fn stop_racing_start_always_ends_the_round() {
        let (port, responder_stop, responder) = spawn_responder(Vec::new());
        // Many listeners make the start slow enough to overlap with the stop.
        let config = DiscoveryConfig {
            targets: BroadcastTargets::Fixed(vec![Ipv4Addr::LOCALHOST; 64]),
            ..loopback_config(port)
        };
        let receive_timeout = config.receive_timeout;
        let service = Arc::new(BroadcastDiscoveryService::new(config).unwrap());

        for round in 0..10 {
            let starter = {
                let service = Arc::clone(&service);
                thread::spawn(move || service.start_discovery())
            };

            // Keep stopping until the start has returned and its round is
            // no longer running.
            loop {
                service.stop_discovery().unwrap();
                if starter.is_finished()
                    && service.status() != DiscoveryServiceStatus::Running
                {
                    break;
                }
                thread::yield_now();
            }
            starter.join().unwrap().unwrap();

            assert!(
                wait_until(|| service.status() == DiscoveryServiceStatus::Stopped),
                "round {} never stopped",
                round
            );

            let shutdown_at = Instant::now();
            service.shutdown().unwrap();
            assert!(shutdown_at.elapsed() < receive_timeout * 4);
        }

        // The service is still usable afterwards.
        service.start_discovery().unwrap();
        assert_eq!(service.status(), DiscoveryServiceStatus::Running);
        service.shutdown().unwrap();
        assert_eq!(service.status(), DiscoveryServiceStatus::Stopped);

        responder_stop.store(true, Ordering::SeqCst);
        responder.join().unwrap();
    }
}
