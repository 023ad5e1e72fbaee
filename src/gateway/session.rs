use std::net::SocketAddrV4;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::gateway::group_spec::GroupSpec;
use crate::gateway::payload::Payload;
use crate::gateway::relay::RelayCandidate;
use crate::wire::membership_update::encode_membership_update;
use crate::wire::relay_messages::RelayParameters;

/// An established tunnel: handshake completed, group joined, and data seen flowing
#[derive(Debug)]
pub struct Session {
    /// connected to `relay`
    pub socket: Arc<UdpSocket>,
    pub relay: SocketAddrV4,
    pub candidate: RelayCandidate,
    pub group: GroupSpec,
    pub nonce: u32,
    pub parameters: RelayParameters,
    /// distinguishes this session from the ones it replaced, so that stale renewals can
    ///  recognize themselves
    pub epoch: u64,
    pub last_renewal: Instant,
}

impl Session {
    pub fn membership_update(&self, leave: bool) -> Bytes {
        encode_membership_update(self.parameters.response_mac, self.nonce, self.group.group, self.group.source, leave)
    }
}

/// What [crate::gateway::session_manager::SessionManager::connect] reports to the receiver
#[derive(Debug)]
pub struct EstablishedSession {
    pub relay: SocketAddrV4,
    pub candidate: RelayCandidate,
    pub parameters: RelayParameters,
    /// the data packet that verified the tunnel: it is regular payload and must be delivered
    pub first_payload: Payload,
}
