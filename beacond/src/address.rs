use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::sync::Mutex;
use rand::seq::SliceRandom;
use regex::Regex;
use shared::{DiscoveryError, Result};
use crate::config::AddressConfig;

/// Some ISP resolvers answer every failed lookup with this landing page.
const HIJACKED_LOOKUP: Ipv4Addr = Ipv4Addr::new(92, 242, 132, 15);

/// Turns partial addresses (nothing, a port, an IP, an IP pattern, a
/// hostname, or `ip:port`) into a concrete `ip:port`.
///
/// Ports left unspecified are drawn from a shuffled pool of dynamic ports,
/// each handed out at most once per resolver.
pub struct AddressResolver {
    prefer: Vec<String>,
    port_range: (u16, u16),
    ports: Mutex<Vec<u16>>,
}

impl AddressResolver {
    pub fn new(config: &AddressConfig) -> Self {
        let mut ports: Vec<u16> = (config.dynamic_port_start..=config.dynamic_port_end).collect();
        ports.shuffle(&mut rand::thread_rng());
        Self {
            prefer: config.prefer.clone(),
            port_range: (config.dynamic_port_start, config.dynamic_port_end),
            ports: Mutex::new(ports),
        }
    }

    pub fn resolve(&self, input: &str) -> Result<String> {
        let (host, port) = split_address(input.trim());
        let ip = self.resolve_host(host)?;
        let port = if port.is_empty() {
            self.allocate_port()?
        } else {
            parse_port(port)?
        };
        Ok(format!("{ip}:{port}"))
    }

    fn resolve_host(&self, host: &str) -> Result<Ipv4Addr> {
        if host.is_empty() {
            return pick_ipv4(&local_ipv4_addresses()?, &self.prefer);
        }
        if is_ip_pattern(host) {
            if host.contains(['*', '?']) {
                return pick_ipv4(&local_ipv4_addresses()?, &[host.to_string()]);
            }
            return host
                .parse()
                .map_err(|e: std::net::AddrParseError| DiscoveryError::invalid_address(host, e.to_string()));
        }
        lookup_host(host)
    }

    fn allocate_port(&self) -> Result<u16> {
        let mut ports = self.ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ports.pop().ok_or_else(|| {
            DiscoveryError::AddressOutOfRange(format!(
                "dynamic port pool {}-{} is exhausted",
                self.port_range.0, self.port_range.1
            ))
        })
    }
}

fn split_address(address: &str) -> (&str, &str) {
    if let Some((host, port)) = address.split_once(':') {
        (host, port)
    } else if !address.is_empty() && address.bytes().all(|b| b.is_ascii_digit()) {
        ("", address)
    } else {
        (address, "")
    }
}

fn parse_port(text: &str) -> Result<u16> {
    let port: u32 = text
        .parse()
        .map_err(|_| DiscoveryError::invalid_address(text, "port must be a number"))?;
    u16::try_from(port).map_err(|_| {
        DiscoveryError::AddressOutOfRange(format!("port {port} must be in range 0 - 65535"))
    })
}

/// Dotted IPv4 outline where any segment may use `*`/`?` wildcards.
fn is_ip_pattern(host: &str) -> bool {
    let segments: Vec<&str> = host.split('.').collect();
    let well_formed = segments.len() <= 4
        && segments.iter().all(|s| {
            !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || b == b'*' || b == b'?')
        });
    well_formed && (segments.len() == 4 || host.contains(['*', '?']))
}

/// Anchored regex for a shell-style pattern where `*` matches any run and
/// `?` one character.
fn wildcard(pattern: &str) -> Option<Regex> {
    let body = regex::escape(pattern).replace(r"\*", ".*").replace(r"\?", ".");
    match Regex::new(&format!("^{body}$")) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!("Ignoring address preference {}: {}", pattern, e);
            None
        }
    }
}

/// Choose the best local address.
///
/// With a stated preference the address must match one of the patterns,
/// earlier patterns ranking higher. Without one, private addresses beat
/// other routable ones and loopback comes last. Ties go to the numerically
/// lowest address.
pub fn pick_ipv4(candidates: &[Ipv4Addr], prefer: &[String]) -> Result<Ipv4Addr> {
    let patterns: Vec<Option<Regex>> = prefer.iter().map(|p| wildcard(p)).collect();
    let tier = |ip: &Ipv4Addr| -> usize {
        if prefer.is_empty() {
            if ip.is_loopback() {
                2
            } else if ip.is_private() {
                0
            } else {
                1
            }
        } else {
            let text = ip.to_string();
            patterns
                .iter()
                .position(|re| re.as_ref().is_some_and(|re| re.is_match(&text)))
                .unwrap_or(prefer.len())
        }
    };

    let best = candidates
        .iter()
        .copied()
        .min_by_key(|ip| (tier(ip), ip.octets()))
        .ok_or_else(|| {
            DiscoveryError::AddressOutOfRange("no IPv4 address is bound to any interface".into())
        })?;

    if !prefer.is_empty() && tier(&best) == prefer.len() {
        return Err(DiscoveryError::AddressOutOfRange(format!(
            "no address matches any of: {}",
            prefer.join(", ")
        )));
    }
    Ok(best)
}

fn lookup_host(host: &str) -> Result<Ipv4Addr> {
    let ip = (host, 0)
        .to_socket_addrs()
        .map_err(|e| DiscoveryError::invalid_address(host, e.to_string()))?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| DiscoveryError::invalid_address(host, "no IPv4 address"))?;

    reject_hijacked(host, ip)
}

fn reject_hijacked(host: &str, ip: Ipv4Addr) -> Result<Ipv4Addr> {
    if ip == HIJACKED_LOOKUP {
        return Err(DiscoveryError::invalid_address(
            host,
            "resolver answered with a known DNS-hijack address",
        ));
    }
    Ok(ip)
}

/// IPv4 addresses bound to this host's interfaces
pub fn local_ipv4_addresses() -> Result<Vec<Ipv4Addr>> {
    let addresses = if_addrs::get_if_addrs()?
        .into_iter()
        .filter_map(|iface| match iface.addr {
            if_addrs::IfAddr::V4(v4) => Some(v4.ip),
            if_addrs::IfAddr::V6(_) => None,
        })
        .collect();
    Ok(addresses)
}

/// The limited broadcast address followed by every interface's directed
/// broadcast address.
pub fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut addresses = vec![Ipv4Addr::BROADCAST];
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            for iface in interfaces {
                if let if_addrs::IfAddr::V4(v4) = iface.addr {
                    if let Some(broadcast) = v4.broadcast {
                        if !addresses.contains(&broadcast) {
                            addresses.push(broadcast);
                        }
                    }
                }
            }
        }
        Err(e) => tracing::warn!("Failed to enumerate interfaces: {}", e),
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> AddressResolver {
        AddressResolver::new(&AddressConfig::default())
    }

    fn ips(list: &[&str]) -> Vec<Ipv4Addr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_full_address_round_trips() {
        let resolver = resolver();
        let once = resolver.resolve("192.168.1.1:1234").unwrap();
        assert_eq!(once, "192.168.1.1:1234");
        assert_eq!(resolver.resolve(&once).unwrap(), once);
    }

    #[test]
    fn test_generated_address_round_trips() {
        let resolver = resolver();
        let once = resolver.resolve("").unwrap();
        assert_eq!(resolver.resolve(&once).unwrap(), once);
    }

    #[test]
    fn test_missing_port_comes_from_dynamic_pool() {
        let resolver = resolver();
        let first = resolver.resolve("10.1.2.3").unwrap();
        let second = resolver.resolve("10.1.2.3").unwrap();
        let port = |a: &str| a.rsplit(':').next().unwrap().parse::<u16>().unwrap();
        assert!(port(&first) >= 0xC000);
        assert!(port(&second) >= 0xC000);
        assert_ne!(first, second, "Ports must not be handed out twice");
    }

    #[test]
    fn test_bare_port_uses_local_address() {
        let address = resolver().resolve("1234").unwrap();
        assert!(address.ends_with(":1234"));
        let ip: Ipv4Addr = address.split(':').next().unwrap().parse().unwrap();
        assert!(local_ipv4_addresses().unwrap().contains(&ip));
    }

    #[test]
    fn test_port_validation() {
        assert!(matches!(
            resolver().resolve("10.0.0.1:65536"),
            Err(DiscoveryError::AddressOutOfRange(_))
        ));
        assert!(matches!(
            resolver().resolve("10.0.0.1:http"),
            Err(DiscoveryError::InvalidAddress { .. })
        ));
        assert_eq!(resolver().resolve("10.0.0.1:65535").unwrap(), "10.0.0.1:65535");
    }

    #[test]
    fn test_hostname_resolution() {
        let address = resolver().resolve("localhost:4000").unwrap();
        assert_eq!(address, "127.0.0.1:4000");
        assert!(matches!(
            resolver().resolve("no-such-host.invalid:4000"),
            Err(DiscoveryError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_pool_exhaustion() {
        let resolver = AddressResolver::new(&AddressConfig {
            dynamic_port_start: 60000,
            dynamic_port_end: 60000,
            prefer: Vec::new(),
        });
        assert_eq!(resolver.resolve("10.0.0.1").unwrap(), "10.0.0.1:60000");
        assert!(matches!(
            resolver.resolve("10.0.0.1"),
            Err(DiscoveryError::AddressOutOfRange(_))
        ));
    }

    #[test]
    fn test_default_preference_ranks_private_first() {
        let candidates = ips(&["127.0.0.1", "8.8.4.4", "192.168.0.20", "10.0.0.7"]);
        assert_eq!(pick_ipv4(&candidates, &[]).unwrap(), Ipv4Addr::new(10, 0, 0, 7));

        let candidates = ips(&["127.0.0.1", "8.8.4.4"]);
        assert_eq!(pick_ipv4(&candidates, &[]).unwrap(), Ipv4Addr::new(8, 8, 4, 4));

        let candidates = ips(&["127.0.0.1"]);
        assert_eq!(pick_ipv4(&candidates, &[]).unwrap(), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_stated_preference_must_match() {
        let candidates = ips(&["10.0.0.7", "192.168.0.20", "192.168.0.3"]);
        let prefer = vec!["192.168.*".to_string()];
        assert_eq!(pick_ipv4(&candidates, &prefer).unwrap(), Ipv4Addr::new(192, 168, 0, 3));

        let prefer = vec!["172.16.*".to_string(), "10.*".to_string()];
        assert_eq!(pick_ipv4(&candidates, &prefer).unwrap(), Ipv4Addr::new(10, 0, 0, 7));

        let prefer = vec!["172.16.*".to_string()];
        assert!(matches!(
            pick_ipv4(&candidates, &prefer),
            Err(DiscoveryError::AddressOutOfRange(_))
        ));
        assert!(pick_ipv4(&[], &[]).is_err());
    }

    #[test]
    fn test_ip_patterns() {
        assert!(is_ip_pattern("192.168.*"));
        assert!(is_ip_pattern("10.0.0.1"));
        assert!(is_ip_pattern("*"));
        assert!(!is_ip_pattern("10.0.0"));
        assert!(!is_ip_pattern("example.com"));
        let hits = |pattern: &str, ip: &str| wildcard(pattern).unwrap().is_match(ip);
        assert!(hits("192.168.*", "192.168.1.7"));
        assert!(hits("10.?.0.1", "10.4.0.1"));
        assert!(!hits("192.168.*", "10.168.1.7"));
        assert!(!hits("10.0.0.1", "10.0.0.10"));
        assert!(!hits("10.0.0.1", "10x0x0x1"));
        assert!(hits("*.1", "10.0.0.1"));
    }

    #[test]
    fn test_hijacked_lookup_is_rejected() {
        assert!(matches!(
            reject_hijacked("typo.example", Ipv4Addr::new(92, 242, 132, 15)),
            Err(DiscoveryError::InvalidAddress { address, .. }) if address == "typo.example"
        ));
        assert_eq!(
            reject_hijacked("example.org", Ipv4Addr::new(93, 184, 216, 34)).unwrap(),
            Ipv4Addr::new(93, 184, 216, 34)
        );
    }

    #[test]
    fn test_malformed_ip_is_invalid() {
        assert!(matches!(
            resolver().resolve("10.0.0.300:80"),
            Err(DiscoveryError::InvalidAddress { .. })
        ));
    }
}
