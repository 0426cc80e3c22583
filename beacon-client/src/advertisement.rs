use std::time::Duration;
use shared::protocol::Command;
use shared::{DiscoveryError, Result};
use crate::channel::ControlChannel;

/// A name this process is advertising. Dropping it retracts the advert,
/// best-effort; use [`Advertisement::detach`] to keep it for the life of
/// the beacon instead.
pub struct Advertisement {
    name: String,
    address: String,
    channel: ControlChannel,
    active: bool,
}

impl Advertisement {
    pub(crate) fn new(name: String, address: String, channel: ControlChannel) -> Self {
        Self {
            name,
            address,
            channel,
            active: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stop advertising now, reporting any failure.
    pub fn retract(mut self) -> Result<()> {
        self.active = false;
        unadvertise(&self.channel, &self.name)
    }

    /// Keep advertising after this guard is gone; returns the address.
    pub fn detach(mut self) -> String {
        self.active = false;
        std::mem::take(&mut self.address)
    }
}

impl Drop for Advertisement {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        match unadvertise(&self.channel, &self.name) {
            Ok(()) => {}
            Err(DiscoveryError::TimedOut(_)) => {
                tracing::warn!("Timed out trying to unadvertise {}", self.name)
            }
            Err(e) => tracing::warn!("Failed to unadvertise {}: {}", self.name, e),
        }
    }
}

fn unadvertise(channel: &ControlChannel, name: &str) -> Result<()> {
    channel.request(
        &Command::Unadvertise {
            name: name.to_string(),
        },
        Duration::ZERO,
    )?;
    Ok(())
}

impl std::fmt::Debug for Advertisement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Advertisement")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("active", &self.active)
            .finish()
    }
}
