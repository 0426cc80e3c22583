use std::io;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use beacond::address::AddressResolver;
use beacond::{Config, Launch, LocalBeacon};
use shared::protocol::{expect_address, expect_services, Advert, Command, Reply, Wait};
use shared::types::filter_group;
use shared::{DiscoveryError, Result};
use crate::advertisement::Advertisement;
use crate::channel::ControlChannel;

/// How to advertise a name. The default picks an address on this machine
/// and a port from the dynamic range, replaces any earlier advert of the
/// same name, and expires with the configured TTL.
#[derive(Debug, Clone, Default)]
pub struct AdvertiseOptions {
    address: Option<String>,
    fail_if_exists: bool,
    ttl: Option<Option<Duration>>,
}

impl AdvertiseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// `ip`, `ip:port`, `host`, `host:port`, a bare port or an IP pattern
    /// such as `192.168.*`.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Refuse with [`DiscoveryError::AlreadyAdvertised`] rather than replace.
    pub fn fail_if_exists(mut self) -> Self {
        self.fail_if_exists = true;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(Some(ttl));
        self
    }

    pub fn never_expires(mut self) -> Self {
        self.ttl = Some(None);
        self
    }
}

/// Blocking access to this host's beacon.
///
/// Creating a client starts the beacon in this process unless another
/// process on the machine already runs one, in which case every request is
/// routed to it over the control port.
pub struct BeaconClient {
    config: Config,
    channel: ControlChannel,
    resolver: AddressResolver,
    local: Mutex<Option<LocalBeacon>>,
    cancel: CancellationToken,
}

impl BeaconClient {
    pub fn new(config: Config) -> Result<Self> {
        let client = Self {
            channel: ControlChannel::new(config.beacon.control_port, config.client.reply_timeout()),
            resolver: AddressResolver::new(&config.addresses),
            local: Mutex::new(None),
            cancel: CancellationToken::new(),
            config,
        };
        client.ensure_beacon()?;
        Ok(client)
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(Config::default())
    }

    /// Whether the beacon runs on a thread of this process.
    pub fn is_beacon_local(&self) -> bool {
        self.local_beacon()
            .as_ref()
            .is_some_and(|beacon| !beacon.handle().is_stopped())
    }

    /// Cancelling this token interrupts any wait in progress, and every
    /// later one, with [`DiscoveryError::Interrupted`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn advertise(&self, name: &str) -> Result<Advertisement> {
        self.advertise_with(name, AdvertiseOptions::new())
    }

    pub fn advertise_with(&self, name: &str, options: AdvertiseOptions) -> Result<Advertisement> {
        let address = self.resolver.resolve(options.address.as_deref().unwrap_or(""))?;
        let ttl = options.ttl.unwrap_or(Some(self.config.beacon.advert_ttl()));

        // Fail here, not in the beacon, if the advert could never be sent
        Advert {
            name: name.to_string(),
            address: address.clone(),
            ttl,
        }
        .encode()?;

        let reply = self.request(
            Command::Advertise {
                name: name.to_string(),
                address: Some(address),
                fail_if_exists: options.fail_if_exists,
                ttl,
            },
            Duration::ZERO,
        )?;

        match expect_address(reply)? {
            Some(address) => {
                tracing::info!("Advertising {} on {}", name, address);
                Ok(Advertisement::new(name.to_string(), address, self.channel.clone()))
            }
            None => Err(DiscoveryError::AlreadyAdvertised(name.to_string())),
        }
    }

    pub fn unadvertise(&self, name: &str) -> Result<()> {
        self.request(Command::Unadvertise { name: name.to_string() }, Duration::ZERO)?;
        Ok(())
    }

    /// Wait up to the configured default for `name` to be advertised.
    pub fn discover(&self, name: &str) -> Result<Option<String>> {
        self.discover_for(name, Wait::For(self.config.client.discover_wait()))
    }

    /// The beacon is asked in bursts so the wait stays interruptible.
    pub fn discover_for(&self, name: &str, wait: Wait) -> Result<Option<String>> {
        let started = Instant::now();
        loop {
            self.check_cancelled(started)?;
            let burst = self.next_burst(wait, started);
            let reply = self.request(
                Command::Discover {
                    name: name.to_string(),
                    wait: Wait::For(burst),
                },
                burst,
            )?;
            if let Some(address) = expect_address(reply)? {
                return Ok(Some(address));
            }
            if wait.has_elapsed(started, Instant::now()) {
                tracing::debug!("Gave up discovering {} after {:?}", name, started.elapsed());
                return Ok(None);
            }
        }
    }

    pub fn discover_all(&self) -> Result<Vec<(String, String)>> {
        self.discover_all_for(Wait::For(self.config.client.discover_wait()))
    }

    /// Every known `(name, address)`, waiting until there is at least one
    /// or `wait` runs out.
    pub fn discover_all_for(&self, wait: Wait) -> Result<Vec<(String, String)>> {
        let started = Instant::now();
        loop {
            self.check_cancelled(started)?;
            let services = expect_services(self.request(Command::DiscoverAll, Duration::ZERO)?)?;
            if !services.is_empty() || wait.has_elapsed(started, Instant::now()) {
                return Ok(services);
            }
            thread::sleep(self.next_burst(wait, started));
        }
    }

    /// Services named `group` + `separator` + anything, skipping `exclude`.
    /// Answers with what is known right now.
    pub fn discover_group(
        &self,
        group: &str,
        separator: &str,
        exclude: &[&str],
    ) -> Result<Vec<(String, String)>> {
        let services = expect_services(self.request(Command::DiscoverAll, Duration::ZERO)?)?;
        Ok(filter_group(services, group, separator, exclude))
    }

    pub fn pause(&self) -> Result<()> {
        self.request(Command::Pause, Duration::ZERO).map(drop)
    }

    pub fn resume(&self) -> Result<()> {
        self.request(Command::Resume, Duration::ZERO).map(drop)
    }

    /// Forget every advertised and discovered name, and resume if paused.
    pub fn reset(&self) -> Result<()> {
        self.request(Command::Reset, Duration::ZERO).map(drop)
    }

    /// Stop the host's beacon, wherever it runs. The next request from a
    /// client starts a new one.
    pub fn stop_beacon(&self) -> Result<()> {
        self.request(Command::Stop, Duration::ZERO)?;
        if let Some(beacon) = self.local_beacon().take() {
            beacon.shutdown();
        }
        Ok(())
    }

    /// Retries once after restarting the beacon if nothing is listening.
    fn request(&self, command: Command, hold: Duration) -> Result<Option<Reply>> {
        match self.channel.request(&command, hold) {
            Err(DiscoveryError::Io(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                tracing::warn!(
                    "No beacon on control port {}, starting one",
                    self.config.beacon.control_port
                );
                self.ensure_beacon()?;
                self.channel.request(&command, hold)
            }
            other => other,
        }
    }

    fn ensure_beacon(&self) -> Result<()> {
        let mut local = self.local_beacon();
        if local.as_ref().is_some_and(|beacon| !beacon.handle().is_stopped()) {
            return Ok(());
        }
        // A stopped beacon is joined before its ports are bound again
        if let Some(stopped) = local.take() {
            stopped.shutdown();
        }

        match beacond::start(&self.config)? {
            Launch::Local(beacon) => {
                tracing::info!("Beacon running in this process");
                *local = Some(beacon);
            }
            Launch::Remote => tracing::debug!("Using the beacon of another process"),
        }
        Ok(())
    }

    fn local_beacon(&self) -> MutexGuard<'_, Option<LocalBeacon>> {
        self.local.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_cancelled(&self, started: Instant) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(DiscoveryError::Interrupted(started.elapsed()));
        }
        Ok(())
    }

    fn next_burst(&self, wait: Wait, started: Instant) -> Duration {
        let burst = self.config.client.burst();
        match wait.remaining(started.elapsed()) {
            Some(left) => left.min(burst),
            None => burst,
        }
    }
}
