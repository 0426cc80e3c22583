//! Blocking client for the host's discovery beacon.
//!
//! ```no_run
//! use beacon_client::{BeaconClient, Wait};
//! use std::time::Duration;
//!
//! let client = BeaconClient::with_defaults()?;
//! let chat = client.advertise("chat/alice")?;
//! println!("listening on {}", chat.address());
//!
//! if let Some(peer) = client.discover_for("chat/bob", Wait::For(Duration::from_secs(5)))? {
//!     println!("bob is at {peer}");
//! }
//! # Ok::<(), beacon_client::DiscoveryError>(())
//! ```

mod advertisement;
mod channel;
mod client;

pub use advertisement::Advertisement;
pub use channel::ControlChannel;
pub use client::{AdvertiseOptions, BeaconClient};
pub use beacond::Config;
pub use shared::protocol::Wait;
pub use shared::types::DEFAULT_GROUP_SEPARATOR;
pub use shared::{DiscoveryError, Result};
