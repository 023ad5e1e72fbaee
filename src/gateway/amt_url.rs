use std::net::Ipv4Addr;

use anyhow::{anyhow, bail};

use crate::gateway::group_spec::GroupSpec;

pub const DEFAULT_MULTICAST_PORT: u16 = 1234;

/// `amt://[source@]group[:port]` - what to receive, and on which UDP port the multicast
///  stream arrives
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AmtUrl {
    pub group: GroupSpec,
    pub port: u16,
}

impl AmtUrl {
    pub fn parse(url: &str) -> anyhow::Result<AmtUrl> {
        let Some(location) = url.strip_prefix("amt://") else {
            bail!("not an amt:// URL: {}", url);
        };
        let location = location.trim_end_matches('/');

        let (source, group_and_port) = match location.split_once('@') {
            Some((source, rest)) => (Some(source), rest),
            None => (None, location),
        };

        let (group, port) = match group_and_port.split_once(':') {
            Some((group, port)) => {
                let port = port.parse::<u16>()
                    .map_err(|e| anyhow!("invalid port in {}: {}", url, e))?;
                (group, port)
            }
            None => (group_and_port, DEFAULT_MULTICAST_PORT),
        };

        let group = parse_ip(group, "group", url)?;
        if !group.is_multicast() {
            bail!("{} is not a multicast group address", group);
        }

        let group = match source {
            Some(source) => {
                let source = parse_ip(source, "source", url)?;
                if source.is_multicast() || source.is_broadcast() {
                    bail!("{} is not a valid multicast source", source);
                }
                GroupSpec::ssm(group, source)
            }
            None => GroupSpec::asm(group),
        };

        Ok(AmtUrl { group, port })
    }
}

fn parse_ip(s: &str, what: &str, url: &str) -> anyhow::Result<Ipv4Addr> {
    s.parse::<Ipv4Addr>()
        .map_err(|_| anyhow!("{} must be an IPv4 literal in {}, was '{}'", what, url, s))
}
