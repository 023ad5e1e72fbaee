use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::wire::data_frame::TUNNEL_HEADER_LEN;
use crate::wire::AMT_PORT;

/// Public anycast relay, reachable from most networks
pub const DEFAULT_RELAY: &str = "amt-relay.m2icast.net";

#[derive(Debug, Clone)]
pub struct AmtConfig {
    /// Relay to tunnel through: an IP address or a name that resolves to one or more relay
    ///  addresses (typically an anycast address). Resolved addresses are tried in order.
    pub relay: String,
    pub relay_port: u16,

    /// How long to wait for native multicast before falling back to AMT. In tunnel mode, the
    ///  same timeout bounds each read - a relay that stays silent for this long ends the stream.
    pub native_timeout: Duration,
    /// Deadline for each step of the relay handshake, and for the first data packet after
    ///  joining
    pub handshake_timeout: Duration,

    /// Expected maximum size of a multicast UDP payload. Receive buffers add the tunnel
    ///  overhead on top of this.
    pub mtu: usize,

    pub tunnel_bind_addr: SocketAddr,
}

impl AmtConfig {
    pub fn default_config() -> AmtConfig {
        AmtConfig {
            relay: DEFAULT_RELAY.to_string(),
            relay_port: AMT_PORT,
            native_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            mtu: 1500,
            tunnel_bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.relay.trim().is_empty() {
            bail!("no AMT relay configured");
        }
        if self.native_timeout.is_zero() {
            bail!("native multicast timeout must be positive");
        }
        if self.handshake_timeout.is_zero() {
            bail!("AMT handshake timeout must be positive");
        }
        if self.mtu < 576 || self.mtu > 65_535 {
            bail!("MTU must be between 576 and 65535, was {}", self.mtu);
        }
        if !self.tunnel_bind_addr.is_ipv4() {
            bail!("AMT tunnel requires an IPv4 bind address, was {}", self.tunnel_bind_addr);
        }
        Ok(())
    }

    /// large enough for a full-size payload plus tunnel encapsulation
    pub fn recv_buf_len(&self) -> usize {
        self.mtu + TUNNEL_HEADER_LEN
    }
}
