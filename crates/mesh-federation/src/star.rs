//! Stars and local star detection

use std::collections::BTreeSet;
use std::net::{IpAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};

/// One dispatcher in the federation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Star {
    /// Star name, unique within the federation
    pub name: String,
    /// Base URL of the star's dispatcher
    pub url: String,
}

impl Star {
    /// Create a star from name and URL
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

impl std::fmt::Display for Star {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.url)
    }
}

/// Whether `url` refers to the dispatcher that `local_url` belongs to
///
/// Ports must match. Hosts match by name, or by the addresses they
/// resolve to: two names resolving to a common address are the same
/// machine, and two names that both point at this machine (loopback,
/// unspecified, or the machine's own hostname and addresses) are too.
/// A configured star list usually contains the local star under its
/// public name, and this is how it gets recognized.
pub fn refers_to_local(url: &str, local_url: &str) -> bool {
    let (host, port) = host_and_port(url);
    let (local_host, local_port) = host_and_port(local_url);
    if port != local_port {
        return false;
    }
    if host.eq_ignore_ascii_case(&local_host) {
        return true;
    }
    let addresses = resolved_addresses(&host, port);
    let local_addresses = resolved_addresses(&local_host, port);
    if addresses.intersection(&local_addresses).next().is_some() {
        return true;
    }
    points_to_this_machine(&host, &addresses) && points_to_this_machine(&local_host, &local_addresses)
}

/// Addresses a host resolves to; empty when resolution fails
fn resolved_addresses(host: &str, port: u16) -> BTreeSet<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return BTreeSet::from([ip]);
    }
    (host, port)
        .to_socket_addrs()
        .map(|addrs| addrs.map(|addr| addr.ip()).collect())
        .unwrap_or_default()
}

/// Whether a host and its resolved addresses identify this machine
fn points_to_this_machine(host: &str, addresses: &BTreeSet<IpAddr>) -> bool {
    if addresses.iter().any(|ip| ip.is_loopback() || ip.is_unspecified()) {
        return true;
    }
    let Some(own_name) = hostname::get().ok().and_then(|name| name.into_string().ok()) else {
        return false;
    };
    if own_name.eq_ignore_ascii_case(host) {
        return true;
    }
    let own_addresses = resolved_addresses(&own_name, 0);
    addresses.iter().any(|ip| own_addresses.contains(ip))
}

/// Extract host and port from a URL, defaulting the port by scheme
pub fn host_and_port(url: &str) -> (String, u16) {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("http", url),
    };
    let authority = rest.split(['/', '?']).next().unwrap_or("");
    let default_port = if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 };
    match authority.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().unwrap_or(default_port),
        ),
        None => (authority.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_port_parsing() {
        assert_eq!(host_and_port("http://star-a:9000/x"), ("star-a".to_string(), 9000));
        assert_eq!(host_and_port("https://star-a"), ("star-a".to_string(), 443));
        assert_eq!(host_and_port("star-a:8080"), ("star-a".to_string(), 8080));
        assert_eq!(host_and_port("http://star-a"), ("star-a".to_string(), 80));
    }

    #[test]
    fn same_host_and_port_is_local() {
        assert!(refers_to_local("http://star-a:9000", "http://STAR-A:9000"));
        assert!(!refers_to_local("http://star-a:9000", "http://star-a:9001"));
        assert!(!refers_to_local("http://star-b:9000", "http://star-a:9000"));
    }

    #[test]
    fn loopback_hosts_are_local() {
        assert!(refers_to_local("http://127.0.0.1:9000", "http://localhost:9000"));
        assert!(!refers_to_local("http://127.0.0.1:9000", "http://localhost:9001"));
    }

    #[test]
    fn hosts_resolving_to_a_common_address_are_local() {
        // localhost resolves to an address the literal also names
        assert!(refers_to_local("http://localhost:9000", "http://127.0.0.1:9000"));
        assert!(refers_to_local("http://0.0.0.0:9000", "http://localhost:9000"));
    }

    #[test]
    fn unresolvable_distinct_names_are_not_local() {
        assert!(!refers_to_local(
            "http://no-such-host-aaa.invalid:9000",
            "http://no-such-host-bbb.invalid:9000"
        ));
    }

    #[test]
    fn the_machines_own_hostname_is_local() {
        let own = hostname::get().unwrap().into_string().unwrap();
        assert!(refers_to_local(
            &format!("http://{own}:9000"),
            "http://127.0.0.1:9000"
        ));
    }
}
