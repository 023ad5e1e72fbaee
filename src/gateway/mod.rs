//! The gateway (client) side of Automatic Multicast Tunneling (RFC 7450).
//!
//! A [receiver::PacketReceiver] first waits for the multicast stream to arrive natively. If it
//!  does not, the gateway falls back to tunneling through a relay:
//!
//! ```ascii
//!  gateway                                  relay
//!     |---- relay discovery (nonce) ---------->|
//!     |<--- relay advertisement (nonce, IP) ---|
//!     |---- request (nonce) ------------------>|
//!     |<--- membership query (MAC, nonce) -----|
//!     |---- membership update (join) --------->|
//!     |<--- multicast data --------------------|
//!     |          ...                           |
//!     |---- membership update (renewal) ------>|   every QQIC seconds
//!     |          ...                           |
//!     |---- membership update (leave) -------->|
//! ```
//!
//! Relay candidates are tried in order: a candidate that misses a handshake deadline, echoes
//!  the wrong nonce, or does not deliver data after the join is abandoned for the next one.

pub mod amt_url;
pub mod cancel;
pub mod error;
pub mod group_spec;
pub mod handshake;
pub mod membership_timer;
pub mod multicast;
pub mod nonce;
pub mod payload;
pub mod receiver;
pub mod relay;
pub mod session;
pub mod session_manager;

use std::sync::Arc;

use tracing::info;

use crate::config::AmtConfig;
use crate::gateway::amt_url::AmtUrl;
use crate::gateway::membership_timer::TokioMembershipTimer;
use crate::gateway::multicast::{MulticastMembership, NativeMulticastSocket};
use crate::gateway::receiver::PacketReceiver;
use crate::gateway::relay::DnsRelayResolver;
use crate::gateway::session_manager::SessionManager;

/// Opens a receiver for an `amt://[source@]group[:port]` URL with the production
///  collaborators: system DNS for the relay, socket options for joins, tokio for timers.
///
/// This must be called from within a tokio runtime.
pub fn open_amt_source(config: AmtConfig, url: &str) -> anyhow::Result<PacketReceiver> {
    config.validate()?;
    let url = AmtUrl::parse(url)?;

    let native = NativeMulticastSocket::open(url.group, url.port)?;
    let membership: Arc<dyn MulticastMembership> = native.membership;
    let session_manager = SessionManager::new(config.clone(), membership.clone(), Arc::new(TokioMembershipTimer::new()));

    info!("opened AMT source {} on port {}, relay {}", url.group, url.port, config.relay);
    Ok(PacketReceiver::new(
        config,
        url.group,
        native.socket,
        membership,
        Arc::new(DnsRelayResolver {}),
        session_manager,
    ))
}
