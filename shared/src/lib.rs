//! Vocabulary shared by the beacon daemon and its clients: the control
//! protocol, the advert datagram and the error taxonomy.

pub mod error;
pub mod protocol;
pub mod types;

pub use error::{DiscoveryError, Result};
