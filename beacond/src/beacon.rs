//! The per-host beacon.
//!
//! One loop per host owns the UDP broadcast socket, the control listener and
//! the [`ServiceTable`]. Everything else reaches it by message passing: the
//! control server and [`BeaconHandle`] push [`Request`]s onto a channel that
//! the loop drains once per tick.
//!
//! Each tick, in order:
//! 1. take new control requests, up to `max_pending` held at once
//! 2. unless paused, broadcast the next advert that is due
//! 3. wait up to `poll_timeout` for one incoming advert
//! 4. sweep expired records
//! 5. run every pending command; answer those that reached a final result
//!
//! Pending commands are revisited every tick in arrival order, so a
//! `discover` waiting for a name does not hold back requests behind it.
//! With `max_pending = 1` later requests stay queued on the channel until
//! the pending one completes.

use std::collections::VecDeque;
use std::io;
use std::net::{
    Ipv4Addr, SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream,
    UdpSocket as StdUdpSocket,
};
use std::ops::ControlFlow;
use std::thread;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use shared::protocol::{
    expect_address, expect_services, Advert, Command, Reply, Wait, ADVERT_DATAGRAM_LIMIT,
};
use shared::{DiscoveryError, Result};
use crate::address::{self, AddressResolver};
use crate::config::{BeaconConfig, Config};
use crate::control;
use crate::hash;
use crate::table::{Placement, ServiceTable};

const REQUEST_QUEUE: usize = 256;

/// A control request on its way to the loop
pub struct Request {
    pub command: Command,
    pub reply: oneshot::Sender<Option<Reply>>,
}

/// What a handler produced this tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Not resolvable yet; try again next tick
    Pending,
    Value(Reply),
    /// Final, with nothing to report
    Absent,
}

struct PendingCommand {
    command: Command,
    submitted_at: Instant,
    reply: oneshot::Sender<Option<Reply>>,
}

/// Directory state plus the command handlers. Holds no sockets.
pub struct Directory {
    table: ServiceTable,
    resolver: AddressResolver,
    paused: bool,
}

impl Directory {
    pub fn new(resolver: AddressResolver) -> Self {
        Self {
            table: ServiceTable::new(),
            resolver,
            paused: false,
        }
    }

    pub fn table(&self) -> &ServiceTable {
        &self.table
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn dispatch(&mut self, command: &Command, submitted_at: Instant, now: Instant) -> Result<Outcome> {
        match command {
            Command::Advertise { name, address, fail_if_exists, ttl } => {
                self.advertise(name, address.as_deref(), *fail_if_exists, *ttl, now)
            }
            Command::Unadvertise { name } => {
                tracing::debug!("Unadvertise {}", name);
                self.table.remove_advertised(name);
                Ok(Outcome::Absent)
            }
            Command::Discover { name, wait } => Ok(self.discover(name, *wait, submitted_at, now)),
            Command::DiscoverAll => Ok(Outcome::Value(Reply::Services(self.table.snapshot_all()))),
            Command::Pause => {
                tracing::debug!("Pause");
                self.paused = true;
                Ok(Outcome::Absent)
            }
            Command::Resume => {
                tracing::debug!("Resume");
                self.paused = false;
                Ok(Outcome::Absent)
            }
            Command::Reset => {
                tracing::debug!("Reset");
                self.table.reset();
                self.paused = false;
                Ok(Outcome::Absent)
            }
            Command::Stop => {
                tracing::debug!("Stop");
                Ok(Outcome::Absent)
            }
        }
    }

    fn advertise(
        &mut self,
        name: &str,
        address: Option<&str>,
        fail_if_exists: bool,
        ttl: Option<Duration>,
        now: Instant,
    ) -> Result<Outcome> {
        tracing::debug!(
            "Advertise {} on {:?} fail_if_exists={} ttl={:?}",
            name,
            address,
            fail_if_exists,
            ttl
        );
        let address = self.resolver.resolve(address.unwrap_or(""))?;
        Advert {
            name: name.to_string(),
            address: address.clone(),
            ttl,
        }
        .encode()?;

        match self.table.put_advertised(name, &address, ttl, fail_if_exists, now) {
            Placement::Rejected => Ok(Outcome::Absent),
            Placement::Inserted | Placement::Superseded => Ok(Outcome::Value(Reply::Address(address))),
        }
    }

    fn discover(&self, name: &str, wait: Wait, submitted_at: Instant, now: Instant) -> Outcome {
        if let Some(address) = self.table.lookup(name) {
            return Outcome::Value(Reply::Address(address.to_string()));
        }
        if wait.has_elapsed(submitted_at, now) {
            Outcome::Absent
        } else {
            Outcome::Pending
        }
    }
}

struct BeaconLoop {
    directory: Directory,
    socket: UdpSocket,
    broadcast_to: Vec<SocketAddr>,
    requests: mpsc::Receiver<Request>,
    pending: VecDeque<PendingCommand>,
    config: BeaconConfig,
    hash_tx: watch::Sender<String>,
    cancel: CancellationToken,
}

impl BeaconLoop {
    async fn run(mut self) {
        tracing::info!(
            "Starting discovery on broadcast port {} and control port {}",
            self.config.broadcast_port,
            self.config.control_port
        );

        while !self.cancel.is_cancelled() {
            if self.tick().await.is_break() {
                break;
            }
        }

        self.finish();
        tracing::info!("Ending discovery");
    }

    async fn tick(&mut self) -> ControlFlow<()> {
        self.poll_requests();

        if !self.directory.paused {
            self.broadcast_one_advert().await;
        }

        self.listen_for_one_advert().await;

        self.directory.table.sweep_expired(Instant::now());

        let flow = self.process_pending();
        self.publish_hash();
        flow
    }

    fn poll_requests(&mut self) {
        while self.pending.len() < self.config.max_pending {
            match self.requests.try_recv() {
                Ok(Request { command, reply }) => {
                    tracing::debug!("Received command {:?}", command);
                    self.pending.push_back(PendingCommand {
                        command,
                        submitted_at: Instant::now(),
                        reply,
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn broadcast_one_advert(&mut self) {
        let now = Instant::now();
        let interval = self.config.broadcast_interval();
        let Some(advert) = self.directory.table.next_due_to_advertise(now, interval) else {
            return;
        };

        // Count our own advert as heard, whether or not the OS loops it back.
        self.directory
            .table
            .put_discovered(&advert.name, &advert.address, advert.ttl, now);

        let message = match advert.encode() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Not broadcasting {}: {}", advert.name, e);
                return;
            }
        };
        for target in &self.broadcast_to {
            tracing::debug!("Advertising {} on {}", advert.name, target);
            if let Err(e) = self.socket.send_to(&message, target).await {
                tracing::debug!("Failed to broadcast to {}: {}", target, e);
            }
        }
    }

    async fn listen_for_one_advert(&mut self) {
        let mut buf = [0u8; ADVERT_DATAGRAM_LIMIT];
        let received =
            tokio::time::timeout(self.config.poll_timeout(), self.socket.recv_from(&mut buf)).await;

        match received {
            Err(_elapsed) => {}
            Ok(Err(e)) => tracing::debug!("Broadcast receive failed: {}", e),
            Ok(Ok((len, source))) => match Advert::decode(&buf[..len]) {
                Ok(advert) => {
                    tracing::debug!("Advert for {} at {} from {}", advert.name, advert.address, source);
                    self.directory.table.put_discovered(
                        &advert.name,
                        &advert.address,
                        advert.ttl,
                        Instant::now(),
                    );
                }
                Err(e) => tracing::debug!("Ignoring malformed advert from {}: {}", source, e),
            },
        }
    }

    fn process_pending(&mut self) -> ControlFlow<()> {
        let now = Instant::now();
        let mut flow = ControlFlow::Continue(());
        let mut still_pending = VecDeque::with_capacity(self.pending.len());

        while let Some(pending) = self.pending.pop_front() {
            if pending.reply.is_closed() {
                tracing::debug!("Dropping {} whose caller has gone", pending.command.verb());
                continue;
            }
            if flow.is_break() {
                still_pending.push_back(pending);
                continue;
            }

            let outcome = self
                .directory
                .dispatch(&pending.command, pending.submitted_at, now)
                .unwrap_or_else(|e| {
                    tracing::error!("Problem calling {:?}: {}", pending.command, e);
                    Outcome::Absent
                });

            let reply = match outcome {
                Outcome::Pending => {
                    still_pending.push_back(pending);
                    continue;
                }
                Outcome::Value(reply) => Some(reply),
                Outcome::Absent => None,
            };

            if pending.command == Command::Stop {
                flow = ControlFlow::Break(());
            }
            tracing::debug!("Sending response {:?} to {}", reply, pending.command.verb());
            let _ = pending.reply.send(reply);
        }

        self.pending = still_pending;
        flow
    }

    fn publish_hash(&mut self) {
        if self.directory.table.take_changed() {
            let new_hash = hash::compute_hash(&self.directory.table.snapshot_all());
            self.hash_tx.send_replace(new_hash);
        }
    }

    /// Answer whatever is still waiting with `null` and stop the control server.
    fn finish(&mut self) {
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            self.pending.push_back(PendingCommand {
                command: request.command,
                submitted_at: Instant::now(),
                reply: request.reply,
            });
        }
        for pending in self.pending.drain(..) {
            let _ = pending.reply.send(None);
        }
        self.cancel.cancel();
    }
}

/// Cheap, cloneable way in to a beacon running in this process.
#[derive(Clone)]
pub struct BeaconHandle {
    tx: mpsc::Sender<Request>,
    hash_rx: watch::Receiver<String>,
    cancel: CancellationToken,
}

fn beacon_stopped() -> DiscoveryError {
    DiscoveryError::Io(io::Error::new(io::ErrorKind::NotConnected, "beacon has stopped"))
}

impl BeaconHandle {
    /// Send one command and wait for its final reply
    pub async fn request(&self, command: Command) -> Result<Option<Reply>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request { command, reply })
            .await
            .map_err(|_| beacon_stopped())?;
        rx.await.map_err(|_| beacon_stopped())
    }

    /// Returns the resolved address, or `None` if `fail_if_exists` refused it.
    pub async fn advertise(
        &self,
        name: &str,
        address: Option<&str>,
        fail_if_exists: bool,
        ttl: Option<Duration>,
    ) -> Result<Option<String>> {
        let reply = self
            .request(Command::Advertise {
                name: name.to_string(),
                address: address.map(str::to_string),
                fail_if_exists,
                ttl,
            })
            .await?;
        expect_address(reply)
    }

    pub async fn unadvertise(&self, name: &str) -> Result<()> {
        self.request(Command::Unadvertise { name: name.to_string() }).await?;
        Ok(())
    }

    pub async fn discover(&self, name: &str, wait: Wait) -> Result<Option<String>> {
        let reply = self
            .request(Command::Discover {
                name: name.to_string(),
                wait,
            })
            .await?;
        expect_address(reply)
    }

    pub async fn discover_all(&self) -> Result<Vec<(String, String)>> {
        expect_services(self.request(Command::DiscoverAll).await?)
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(Command::Pause).await.map(drop)
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(Command::Resume).await.map(drop)
    }

    pub async fn reset(&self) -> Result<()> {
        self.request(Command::Reset).await.map(drop)
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await.map(drop)
    }

    /// Current directory hash
    pub fn hash(&self) -> String {
        self.hash_rx.borrow().clone()
    }

    pub fn subscribe_hash(&self) -> watch::Receiver<String> {
        self.hash_rx.clone()
    }

    /// Resolves once the loop has ended
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A beacon whose loop runs on a thread owned by this process. Dropping it
/// stops the loop and joins the thread.
pub struct LocalBeacon {
    handle: BeaconHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl LocalBeacon {
    pub fn handle(&self) -> BeaconHandle {
        self.handle.clone()
    }

    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.handle.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Beacon thread panicked");
            }
        }
    }
}

impl Drop for LocalBeacon {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

pub enum Launch {
    /// This process now hosts the host's beacon
    Local(LocalBeacon),
    /// Another process already does; talk to it over the control port
    Remote,
}

/// Start this host's beacon unless another process already runs one.
///
/// Binds are retried `bind_attempts` times, `bind_retry` apart, to ride out
/// sockets the OS has not released yet. If the broadcast port stays busy and
/// the control port answers, the existing beacon is used.
pub fn start(config: &Config) -> Result<Launch> {
    config
        .validate()
        .map_err(|e| DiscoveryError::InvalidConfig(e.to_string()))?;
    let beacon = &config.beacon;

    let socket = match bind_with_retry(beacon, || bind_broadcast_socket(beacon.broadcast_port)) {
        Ok(socket) => socket,
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            if control_port_answers(beacon.control_port) {
                tracing::warn!("Beacon already active on this machine");
                return Ok(Launch::Remote);
            }
            return Err(DiscoveryError::AlreadyBound {
                port: beacon.broadcast_port,
                source: e,
            });
        }
        Err(e) => return Err(e.into()),
    };

    let listener = bind_with_retry(beacon, || {
        StdTcpListener::bind((Ipv4Addr::LOCALHOST, beacon.control_port))
    })
    .map_err(|e| match e.kind() {
        io::ErrorKind::AddrInUse => DiscoveryError::AlreadyBound {
            port: beacon.control_port,
            source: e,
        },
        _ => DiscoveryError::Io(e),
    })?;
    listener.set_nonblocking(true)?;

    let broadcast_to: Vec<SocketAddr> = address::broadcast_addresses()
        .into_iter()
        .map(|ip| SocketAddr::from((ip, beacon.broadcast_port)))
        .collect();

    let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
    let (hash_tx, hash_rx) = watch::channel(hash::compute_hash(&[]));
    let cancel = CancellationToken::new();

    let handle = BeaconHandle {
        tx: tx.clone(),
        hash_rx,
        cancel: cancel.clone(),
    };

    let directory = Directory::new(AddressResolver::new(&config.addresses));
    let beacon_config = beacon.clone();
    let thread = thread::Builder::new()
        .name("beacon".to_string())
        .spawn(move || {
            // Marks the beacon stopped however this thread ends, panics included
            let _stopped = cancel.clone().drop_guard();
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!("Failed to build beacon runtime: {}", e);
                    cancel.cancel();
                    return;
                }
            };

            runtime.block_on(async move {
                let (socket, listener) =
                    match (UdpSocket::from_std(socket), TcpListener::from_std(listener)) {
                        (Ok(socket), Ok(listener)) => (socket, listener),
                        (Err(e), _) | (_, Err(e)) => {
                            tracing::error!("Failed to register beacon sockets: {}", e);
                            cancel.cancel();
                            return;
                        }
                    };

                let server = tokio::spawn(control::serve(listener, tx, cancel.clone()));

                BeaconLoop {
                    directory,
                    socket,
                    broadcast_to,
                    requests: rx,
                    pending: VecDeque::new(),
                    config: beacon_config,
                    hash_tx,
                    cancel,
                }
                .run()
                .await;

                let _ = server.await;
            });
        })?;

    Ok(Launch::Local(LocalBeacon {
        handle,
        thread: Some(thread),
    }))
}

fn bind_broadcast_socket(port: u16) -> io::Result<StdUdpSocket> {
    let socket = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn bind_with_retry<T>(config: &BeaconConfig, mut bind: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let mut tries_left = config.bind_attempts;
    loop {
        match bind() {
            Ok(bound) => return Ok(bound),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && tries_left > 1 => {
                tries_left -= 1;
                tracing::warn!("{}; {} tries remaining", e, tries_left);
                thread::sleep(config.bind_retry());
            }
            Err(e) => return Err(e),
        }
    }
}

fn control_port_answers(port: u16) -> bool {
    StdTcpStream::connect_timeout(
        &SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        Duration::from_millis(500),
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressConfig;

    fn directory() -> Directory {
        Directory::new(AddressResolver::new(&AddressConfig::default()))
    }

    fn advertise(name: &str, address: &str, fail_if_exists: bool) -> Command {
        Command::Advertise {
            name: name.to_string(),
            address: Some(address.to_string()),
            fail_if_exists,
            ttl: Some(Duration::from_secs(20)),
        }
    }

    fn test_config(control_port: u16) -> Config {
        let mut config = Config::default();
        config.beacon.control_port = control_port;
        config.beacon.broadcast_port = control_port + 1;
        config.beacon.broadcast_interval_ms = 200;
        config.beacon.advert_ttl_ms = 1_000;
        config.beacon.poll_timeout_ms = 20;
        config.beacon.bind_attempts = 2;
        config.beacon.bind_retry_ms = 50;
        config
    }

    fn start_local(config: &Config) -> LocalBeacon {
        match start(config).unwrap() {
            Launch::Local(beacon) => beacon,
            Launch::Remote => panic!("expected to own the beacon ports"),
        }
    }

    #[test]
    fn test_dispatch_advertise_then_discover() {
        let mut directory = directory();
        let now = Instant::now();

        let outcome = directory
            .dispatch(&advertise("echo", "10.0.0.1:5000", false), now, now)
            .unwrap();
        assert_eq!(outcome, Outcome::Value(Reply::Address("10.0.0.1:5000".to_string())));

        let discover = Command::Discover {
            name: "echo".to_string(),
            wait: Wait::For(Duration::ZERO),
        };
        assert_eq!(
            directory.dispatch(&discover, now, now).unwrap(),
            Outcome::Value(Reply::Address("10.0.0.1:5000".to_string()))
        );
    }

    #[test]
    fn test_dispatch_discover_waits_until_deadline() {
        let mut directory = directory();
        let submitted = Instant::now();
        let discover = Command::Discover {
            name: "missing".to_string(),
            wait: Wait::For(Duration::from_secs(2)),
        };

        assert_eq!(directory.dispatch(&discover, submitted, submitted).unwrap(), Outcome::Pending);
        let later = submitted + Duration::from_millis(1_999);
        assert_eq!(directory.dispatch(&discover, submitted, later).unwrap(), Outcome::Pending);
        let deadline = submitted + Duration::from_secs(2);
        assert_eq!(directory.dispatch(&discover, submitted, deadline).unwrap(), Outcome::Absent);

        let forever = Command::Discover {
            name: "missing".to_string(),
            wait: Wait::Forever,
        };
        let much_later = submitted + Duration::from_secs(86_400);
        assert_eq!(directory.dispatch(&forever, submitted, much_later).unwrap(), Outcome::Pending);
    }

    #[test]
    fn test_dispatch_fail_if_exists_is_absent() {
        let mut directory = directory();
        let now = Instant::now();

        directory.dispatch(&advertise("echo", "10.0.0.1:5000", false), now, now).unwrap();
        let outcome = directory
            .dispatch(&advertise("echo", "10.0.0.2:5000", true), now, now)
            .unwrap();
        assert_eq!(outcome, Outcome::Absent);
    }

    #[test]
    fn test_dispatch_bad_address_is_an_error() {
        let mut directory = directory();
        let now = Instant::now();
        let result = directory.dispatch(&advertise("echo", "10.0.0.1:99999", false), now, now);
        assert!(matches!(result, Err(DiscoveryError::AddressOutOfRange(_))));
        assert_eq!(directory.table().discovered_len(), 0);
    }

    #[test]
    fn test_dispatch_oversized_advert_is_an_error() {
        let mut directory = directory();
        let now = Instant::now();
        let name = "n".repeat(ADVERT_DATAGRAM_LIMIT);
        let result = directory.dispatch(&advertise(&name, "10.0.0.1:5000", false), now, now);
        assert!(matches!(result, Err(DiscoveryError::Protocol(_))));
    }

    #[test]
    fn test_dispatch_pause_resume_reset() {
        let mut directory = directory();
        let now = Instant::now();

        directory.dispatch(&Command::Pause, now, now).unwrap();
        assert!(directory.is_paused());
        directory.dispatch(&Command::Resume, now, now).unwrap();
        assert!(!directory.is_paused());

        directory.dispatch(&advertise("echo", "10.0.0.1:5000", false), now, now).unwrap();
        directory.dispatch(&Command::Pause, now, now).unwrap();
        directory.dispatch(&Command::Reset, now, now).unwrap();
        assert!(!directory.is_paused());
        assert_eq!(
            directory.dispatch(&Command::DiscoverAll, now, now).unwrap(),
            Outcome::Value(Reply::Services(Vec::new()))
        );
    }

    #[tokio::test]
    async fn test_advertise_is_discovered_through_the_loop() {
        let beacon = start_local(&test_config(42110));
        let handle = beacon.handle();

        let address = handle
            .advertise("svc", Some("10.0.0.1:5000"), false, Some(Duration::from_secs(20)))
            .await
            .unwrap();
        assert_eq!(address.as_deref(), Some("10.0.0.1:5000"));

        let all = handle.discover_all().await.unwrap();
        assert!(all.contains(&("svc".to_string(), "10.0.0.1:5000".to_string())));

        let found = handle.discover("svc", Wait::For(Duration::ZERO)).await.unwrap();
        assert_eq!(found.as_deref(), Some("10.0.0.1:5000"));
        assert_ne!(handle.hash(), hash::compute_hash(&[]));

        beacon.shutdown();
    }

    #[tokio::test]
    async fn test_pending_discover_does_not_block_advertise() {
        let beacon = start_local(&test_config(42120));
        let handle = beacon.handle();

        let waiter = handle.clone();
        let discovery =
            tokio::spawn(async move { waiter.discover("late", Wait::For(Duration::from_secs(5))).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        handle
            .advertise("late", Some("10.0.0.2:6000"), false, None)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        let found = discovery.await.unwrap().unwrap();
        assert_eq!(found.as_deref(), Some("10.0.0.2:6000"));

        beacon.shutdown();
    }

    #[tokio::test]
    async fn test_single_slot_serialises_callers() {
        let mut config = test_config(42130);
        config.beacon.max_pending = 1;
        let beacon = start_local(&config);
        let handle = beacon.handle();

        let waiter = handle.clone();
        let discovery = tokio::spawn(async move {
            waiter.discover("late", Wait::For(Duration::from_millis(600))).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        handle
            .advertise("late", Some("10.0.0.2:6000"), false, None)
            .await
            .unwrap();
        assert!(
            started.elapsed() >= Duration::from_millis(400),
            "advertise should wait behind the pending discover"
        );
        assert_eq!(discovery.await.unwrap().unwrap(), None);

        beacon.shutdown();
    }

    #[tokio::test]
    async fn test_paused_advert_expires_then_returns_on_resume() {
        let beacon = start_local(&test_config(42140));
        let handle = beacon.handle();
        let pair = ("fleeting".to_string(), "10.0.0.3:7000".to_string());

        handle
            .advertise("fleeting", Some("10.0.0.3:7000"), false, Some(Duration::from_millis(1_000)))
            .await
            .unwrap();
        handle.pause().await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(handle.discover_all().await.unwrap().contains(&pair), "expired too early");

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(!handle.discover_all().await.unwrap().contains(&pair), "should have expired");

        handle.resume().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(handle.discover_all().await.unwrap().contains(&pair));

        beacon.shutdown();
    }

    #[tokio::test]
    async fn test_received_advert_is_discovered_and_expires() {
        let config = test_config(42150);
        let beacon = start_local(&config);
        let handle = beacon.handle();

        let sender = StdUdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let advert = Advert {
            name: "remote".to_string(),
            address: "10.9.9.9:5555".to_string(),
            ttl: Some(Duration::from_millis(300)),
        };
        sender
            .send_to(&advert.encode().unwrap(), (Ipv4Addr::LOCALHOST, config.beacon.broadcast_port))
            .unwrap();

        let found = handle
            .discover("remote", Wait::For(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some("10.9.9.9:5555"));

        tokio::time::sleep(Duration::from_millis(600)).await;
        let found = handle.discover("remote", Wait::For(Duration::ZERO)).await.unwrap();
        assert_eq!(found, None);

        beacon.shutdown();
    }

    #[tokio::test]
    async fn test_advert_with_huge_ttl_does_not_stop_beacon() {
        let config = test_config(42190);
        let beacon = start_local(&config);
        let handle = beacon.handle();

        let sender = StdUdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sender
            .send_to(
                br#"["forever", "10.9.9.9:5555", 1.8e19]"#,
                (Ipv4Addr::LOCALHOST, config.beacon.broadcast_port),
            )
            .unwrap();

        let found = handle
            .discover("forever", Wait::For(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some("10.9.9.9:5555"));

        let address = handle
            .advertise("mine", Some("10.0.0.1:5000"), false, Some(Duration::from_secs(u64::MAX)))
            .await
            .unwrap();
        assert_eq!(address.as_deref(), Some("10.0.0.1:5000"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_stopped());
        assert_eq!(handle.discover_all().await.unwrap().len(), 2);

        beacon.shutdown();
    }

    #[tokio::test]
    async fn test_ending_thread_marks_beacon_stopped() {
        let beacon = start_local(&test_config(42200));
        let handle = beacon.handle();
        assert!(!handle.is_stopped());

        beacon.shutdown();
        assert!(handle.is_stopped());
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let mut config = test_config(42210);
        config.beacon.max_pending = 0;
        assert!(matches!(start(&config), Err(DiscoveryError::InvalidConfig(_))));

        let mut config = test_config(42210);
        config.beacon.advert_ttl_ms = config.beacon.broadcast_interval_ms;
        assert!(matches!(start(&config), Err(DiscoveryError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_hash_subscribers_see_changes() {
        let beacon = start_local(&test_config(42220));
        let handle = beacon.handle();
        let mut hashes = handle.subscribe_hash();
        let empty = hashes.borrow_and_update().clone();

        handle
            .advertise("watched", Some("10.0.0.4:4000"), false, None)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), hashes.changed())
            .await
            .unwrap()
            .unwrap();

        let current = hashes.borrow_and_update().clone();
        assert_ne!(current, empty);
        assert_eq!(
            current,
            hash::compute_hash(&[("watched".to_string(), "10.0.0.4:4000".to_string())])
        );

        beacon.shutdown();
    }

    #[tokio::test]
    async fn test_second_start_hands_off_to_running_beacon() {
        let config = test_config(42160);
        let beacon = start_local(&config);

        assert!(matches!(start(&config).unwrap(), Launch::Remote));

        beacon.shutdown();
    }

    #[tokio::test]
    async fn test_stop_ends_loop_and_releases_ports() {
        let config = test_config(42170);
        let beacon = start_local(&config);
        let handle = beacon.handle();

        handle.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle.stopped())
            .await
            .unwrap();
        assert!(handle.discover_all().await.is_err());
        beacon.shutdown();

        let again = start_local(&config);
        again.shutdown();
    }

    #[tokio::test]
    async fn test_busy_broadcast_port_without_beacon_is_already_bound() {
        let config = test_config(42180);
        let _squatter = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.beacon.broadcast_port)).unwrap();

        assert!(matches!(
            start(&config),
            Err(DiscoveryError::AlreadyBound { port: 42181, .. })
        ));
    }
}
