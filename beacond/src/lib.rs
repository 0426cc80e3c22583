//! Per-host discovery beacon: broadcasts adverts for local services, keeps
//! an expiring directory of everything heard on the LAN, and answers local
//! control requests.

pub mod address;
pub mod api;
pub mod beacon;
pub mod config;
pub mod control;
pub mod hash;
pub mod table;

pub use beacon::{start, BeaconHandle, Launch, LocalBeacon};
pub use config::Config;
