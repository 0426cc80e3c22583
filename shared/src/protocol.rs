use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::error::{DiscoveryError, Result};

/// Well-known local port on which a host's beacon answers control requests
pub const DEFAULT_CONTROL_PORT: u16 = 9998;

/// Well-known UDP port adverts are broadcast to and received on
pub const DEFAULT_BROADCAST_PORT: u16 = 9999;

/// Upper bound on one advert datagram
pub const ADVERT_DATAGRAM_LIMIT: usize = 256;

/// Upper bound on one length-delimited control frame
pub const MAX_CONTROL_FRAME: usize = 64 * 1024;

/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// How long a caller is prepared to wait for a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    For(Duration),
    Forever,
}

impl Wait {
    /// `None` on the wire means forever.
    pub fn from_secs(secs: Option<f64>) -> Result<Self> {
        match secs {
            None => Ok(Wait::Forever),
            Some(secs) => duration_from_secs(secs).map(Wait::For),
        }
    }

    pub fn as_secs(&self) -> Option<f64> {
        match self {
            Wait::For(d) => Some(d.as_secs_f64()),
            Wait::Forever => None,
        }
    }

    pub fn has_elapsed(&self, started_at: Instant, now: Instant) -> bool {
        match self {
            Wait::For(d) => now.saturating_duration_since(started_at) >= *d,
            Wait::Forever => false,
        }
    }

    /// Time left after `elapsed`, `None` when waiting forever.
    pub fn remaining(&self, elapsed: Duration) -> Option<Duration> {
        match self {
            Wait::For(d) => Some(d.saturating_sub(elapsed)),
            Wait::Forever => None,
        }
    }
}

fn duration_from_secs(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| DiscoveryError::Protocol(format!("invalid duration {secs}: {e}")))
}

/// A control request. The set of verbs is closed: every variant maps to one
/// wire verb and back.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Advertise {
        name: String,
        address: Option<String>,
        fail_if_exists: bool,
        ttl: Option<Duration>,
    },
    Unadvertise {
        name: String,
    },
    Discover {
        name: String,
        wait: Wait,
    },
    DiscoverAll,
    Pause,
    Resume,
    Reset,
    Stop,
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Advertise { .. } => "advertise",
            Command::Unadvertise { .. } => "unadvertise",
            Command::Discover { .. } => "discover",
            Command::DiscoverAll => "discover_all",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Reset => "reset",
            Command::Stop => "stop",
        }
    }

    /// `[verb, params...]`
    pub fn to_frame(&self) -> Value {
        let mut frame = vec![Value::from(self.verb())];
        match self {
            Command::Advertise { name, address, fail_if_exists, ttl } => {
                frame.push(Value::from(name.as_str()));
                frame.push(address.as_deref().map_or(Value::Null, Value::from));
                frame.push(Value::Bool(*fail_if_exists));
                frame.push(ttl.map_or(Value::Null, |t| Value::from(t.as_secs_f64())));
            }
            Command::Unadvertise { name } => frame.push(Value::from(name.as_str())),
            Command::Discover { name, wait } => {
                frame.push(Value::from(name.as_str()));
                frame.push(wait.as_secs().map_or(Value::Null, Value::from));
            }
            Command::DiscoverAll
            | Command::Pause
            | Command::Resume
            | Command::Reset
            | Command::Stop => {}
        }
        Value::Array(frame)
    }

    pub fn from_frame(frame: Value) -> Result<Self> {
        let Value::Array(items) = frame else {
            return Err(DiscoveryError::Protocol("control frame must be an array".into()));
        };
        let mut items = items.into_iter();
        let verb = match items.next() {
            Some(Value::String(verb)) => verb,
            _ => return Err(DiscoveryError::Protocol("control frame has no verb".into())),
        };
        let params: Vec<Value> = items.collect();

        let command = match (verb.as_str(), params.as_slice()) {
            ("advertise", [name, address, fail_if_exists, ttl]) => Command::Advertise {
                name: string_param(name, "name")?,
                address: optional_string_param(address, "address")?,
                fail_if_exists: fail_if_exists.as_bool().ok_or_else(|| {
                    DiscoveryError::Protocol("fail_if_exists must be a boolean".into())
                })?,
                ttl: optional_secs_param(ttl, "ttl")?
                    .map(duration_from_secs)
                    .transpose()?,
            },
            ("unadvertise", [name]) => Command::Unadvertise {
                name: string_param(name, "name")?,
            },
            ("discover", [name, wait]) => Command::Discover {
                name: string_param(name, "name")?,
                wait: Wait::from_secs(optional_secs_param(wait, "wait")?)?,
            },
            ("discover_all", []) => Command::DiscoverAll,
            ("pause", []) => Command::Pause,
            ("resume", []) => Command::Resume,
            ("reset", []) => Command::Reset,
            ("stop", []) => Command::Stop,
            (verb, params) => {
                return Err(DiscoveryError::Protocol(format!(
                    "no verb {verb} taking {} parameters",
                    params.len()
                )))
            }
        };
        Ok(command)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_frame())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::from_frame(serde_json::from_slice(bytes)?)
    }
}

fn string_param(value: &Value, what: &str) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| DiscoveryError::Protocol(format!("{what} must be a string")))
}

fn optional_string_param(value: &Value, what: &str) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        other => string_param(other, what).map(Some),
    }
}

fn optional_secs_param(value: &Value, what: &str) -> Result<Option<f64>> {
    match value {
        Value::Null => Ok(None),
        other => other
            .as_f64()
            .map(Some)
            .ok_or_else(|| DiscoveryError::Protocol(format!("{what} must be a number of seconds"))),
    }
}

/// A final control reply. Verbs with nothing to report, and lookups that
/// found nothing, reply with JSON `null` (`None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Address(String),
    Services(Vec<(String, String)>),
}

pub fn encode_reply(reply: Option<&Reply>) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&reply)?)
}

pub fn decode_reply(bytes: &[u8]) -> Result<Option<Reply>> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Reply to `advertise` or `discover`: an address, or nothing.
pub fn expect_address(reply: Option<Reply>) -> Result<Option<String>> {
    match reply {
        None => Ok(None),
        Some(Reply::Address(address)) => Ok(Some(address)),
        Some(other) => Err(DiscoveryError::Protocol(format!(
            "expected an address, got {other:?}"
        ))),
    }
}

/// Reply to `discover_all`. A `null` reply (failed handler) reads as empty.
pub fn expect_services(reply: Option<Reply>) -> Result<Vec<(String, String)>> {
    match reply {
        None => Ok(Vec::new()),
        Some(Reply::Services(services)) => Ok(services),
        Some(other) => Err(DiscoveryError::Protocol(format!(
            "expected a list of services, got {other:?}"
        ))),
    }
}

/// A broadcast announcing one name at one address.
#[derive(Debug, Clone, PartialEq)]
pub struct Advert {
    pub name: String,
    pub address: String,
    pub ttl: Option<Duration>,
}

impl Advert {
    /// Encodes as `[name, address, ttl_secs|null]`, refusing anything that
    /// would not fit in one advert datagram.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(&(
            &self.name,
            &self.address,
            self.ttl.map(|t| t.as_secs_f64()),
        ))?;
        if bytes.len() > ADVERT_DATAGRAM_LIMIT {
            return Err(DiscoveryError::Protocol(format!(
                "advert for {} is {} bytes, limit is {}",
                self.name,
                bytes.len(),
                ADVERT_DATAGRAM_LIMIT
            )));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (name, address, ttl): (String, String, Option<f64>) = serde_json::from_slice(bytes)?;
        Ok(Self {
            name,
            address,
            ttl: ttl.map(duration_from_secs).transpose()?,
        })
    }
}
