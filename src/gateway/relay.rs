use std::fmt::{Display, Formatter};
use std::net::{SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use tracing::{debug, warn};

/// One resolved relay address. Candidates are tried in the order the resolver returned them.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct RelayCandidate(pub SocketAddrV4);

impl Display for RelayCandidate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait RelayResolver: Send + Sync {
    async fn resolve(&self, relay: &str, port: u16) -> anyhow::Result<Vec<RelayCandidate>>;
}

/// Resolves through the system resolver. Only IPv4 results are usable for the tunnel, the
///  rest is skipped.
pub struct DnsRelayResolver {}

#[async_trait]
impl RelayResolver for DnsRelayResolver {
    async fn resolve(&self, relay: &str, port: u16) -> anyhow::Result<Vec<RelayCandidate>> {
        let mut result = Vec::new();
        for addr in tokio::net::lookup_host((relay, port)).await? {
            match addr {
                SocketAddr::V4(addr) => {
                    if !result.contains(&RelayCandidate(addr)) {
                        result.push(RelayCandidate(addr));
                    }
                }
                SocketAddr::V6(addr) => {
                    debug!("skipping IPv6 relay address {} for {}", addr, relay);
                }
            }
        }
        if result.is_empty() {
            warn!("relay {} has no IPv4 address", relay);
        }
        Ok(result)
    }
}

/// A fixed list of relays, ignoring the configured relay name
pub struct StaticRelayResolver {
    candidates: Vec<RelayCandidate>,
}

impl StaticRelayResolver {
    pub fn new(candidates: Vec<RelayCandidate>) -> StaticRelayResolver {
        StaticRelayResolver { candidates }
    }

    pub fn from_addrs(addrs: &[SocketAddr]) -> StaticRelayResolver {
        let candidates = addrs.iter()
            .filter_map(|addr| match addr {
                SocketAddr::V4(addr) => Some(RelayCandidate(*addr)),
                SocketAddr::V6(_) => None,
            })
            .collect();
        StaticRelayResolver::new(candidates)
    }
}

#[async_trait]
impl RelayResolver for StaticRelayResolver {
    async fn resolve(&self, _relay: &str, _port: u16) -> anyhow::Result<Vec<RelayCandidate>> {
        Ok(self.candidates.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use super::*;

    #[tokio::test]
    async fn test_dns_resolver_ip_literal() {
        let resolver = DnsRelayResolver {};
        let candidates = resolver.resolve("127.0.0.1", 2268).await.unwrap();
        assert_eq!(candidates, vec![RelayCandidate(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2268))]);
    }

    #[tokio::test]
    async fn test_dns_resolver_ipv6_only() {
        let resolver = DnsRelayResolver {};
        let candidates = resolver.resolve("::1", 2268).await.unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_static_resolver_skips_ipv6() {
        let resolver = StaticRelayResolver::from_addrs(&[
            "[::1]:2268".parse().unwrap(),
            "192.0.2.1:2268".parse().unwrap(),
            "192.0.2.2:3000".parse().unwrap(),
        ]);
        let candidates = resolver.resolve("ignored", 2268).await.unwrap();
        assert_eq!(candidates, vec![
            RelayCandidate(SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 2268)),
            RelayCandidate(SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 2), 3000)),
        ]);
    }
}
