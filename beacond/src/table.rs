use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use shared::protocol::Advert;
use shared::types::filter_group;

/// A service this host advertises, or one it has discovered.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub name: String,
    pub address: String,
    /// `None` never expires
    pub ttl: Option<Duration>,
    pub expires_at: Option<Instant>,
    /// Only meaningful for records in the advertised ring
    pub next_advertise_at: Instant,
}

impl ServiceRecord {
    pub fn new(name: &str, address: &str, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            ttl,
            // A TTL past the end of the clock never expires
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
            next_advertise_at: now,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn advert(&self) -> Advert {
        Advert {
            name: self.name.clone(),
            address: self.address.clone(),
            ttl: self.ttl,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Inserted,
    Superseded,
    Rejected,
}

/// The beacon's directory: a ring of names this host broadcasts, and every
/// name currently known, keyed by name.
#[derive(Debug, Default)]
pub struct ServiceTable {
    advertised: VecDeque<ServiceRecord>,
    discovered: HashMap<String, ServiceRecord>,
    changed: bool,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start advertising `name`, replacing any advert of the same name unless
    /// `fail_if_exists` is set. The name is discovered immediately.
    pub fn put_advertised(
        &mut self,
        name: &str,
        address: &str,
        ttl: Option<Duration>,
        fail_if_exists: bool,
        now: Instant,
    ) -> Placement {
        let placement = match self.advertised.iter().position(|r| r.name == name) {
            Some(i) if fail_if_exists => {
                tracing::error!(
                    "Service {} already advertised on {}",
                    name,
                    self.advertised[i].address
                );
                return Placement::Rejected;
            }
            Some(i) => {
                if let Some(old) = self.advertised.remove(i) {
                    tracing::warn!("Superseding service {} which was advertised on {}", name, old.address);
                }
                Placement::Superseded
            }
            None => Placement::Inserted,
        };

        self.advertised.push_back(ServiceRecord::new(name, address, ttl, now));
        self.put_discovered(name, address, ttl, now);
        placement
    }

    /// Insert or refresh a discovered record. Returns true if the name is new
    /// or its address changed.
    pub fn put_discovered(
        &mut self,
        name: &str,
        address: &str,
        ttl: Option<Duration>,
        now: Instant,
    ) -> bool {
        let record = ServiceRecord::new(name, address, ttl, now);
        let changed = match self.discovered.insert(name.to_string(), record) {
            Some(old) => old.address != address,
            None => true,
        };
        self.changed |= changed;
        changed
    }

    /// Stop advertising `name`. The discovered record it created goes with it,
    /// unless another advert has since taken the name over.
    pub fn remove_advertised(&mut self, name: &str) -> bool {
        let Some(i) = self.advertised.iter().position(|r| r.name == name) else {
            tracing::warn!("No advert found for {}", name);
            return false;
        };
        if let Some(record) = self.advertised.remove(i) {
            if self
                .discovered
                .get(name)
                .is_some_and(|found| found.address == record.address)
            {
                self.discovered.remove(name);
                self.changed = true;
            }
        }
        true
    }

    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.discovered.get(name).map(|r| r.address.as_str())
    }

    /// Drop every discovered record whose expiry has passed.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .discovered
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.name.clone())
            .collect();

        for name in &expired {
            if let Some(record) = self.discovered.remove(name) {
                tracing::warn!("Removing advert for {} at {} which expired", name, record.address);
            }
        }
        self.changed |= !expired.is_empty();
        expired
    }

    /// The first advertised record in ring order whose broadcast is due. It is
    /// rescheduled `interval` from now and moved to the back of the ring.
    pub fn next_due_to_advertise(&mut self, now: Instant, interval: Duration) -> Option<Advert> {
        let i = self.advertised.iter().position(|r| r.next_advertise_at <= now)?;
        let mut record = self.advertised.remove(i)?;
        record.next_advertise_at = now + interval;
        let advert = record.advert();
        self.advertised.push_back(record);
        Some(advert)
    }

    /// Every known `(name, address)`, ordered by name
    pub fn snapshot_all(&self) -> Vec<(String, String)> {
        let mut all: Vec<(String, String)> = self
            .discovered
            .values()
            .map(|r| (r.name.clone(), r.address.clone()))
            .collect();
        all.sort();
        all
    }

    pub fn snapshot_group(
        &self,
        group: &str,
        separator: &str,
        exclude: &[&str],
    ) -> Vec<(String, String)> {
        filter_group(self.snapshot_all(), group, separator, exclude)
    }

    pub fn reset(&mut self) {
        self.changed |= !self.discovered.is_empty();
        self.advertised.clear();
        self.discovered.clear();
    }

    pub fn advertised_len(&self) -> usize {
        self.advertised.len()
    }

    pub fn discovered_len(&self) -> usize {
        self.discovered.len()
    }

    /// Whether the visible directory changed since the last call
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }
}
