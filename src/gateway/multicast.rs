use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::gateway::group_spec::GroupSpec;

/// OS-level group membership, i.e. the host's own IGMP state. Joining a group that is
///  already joined (or leaving one that is not) is a no-op.
#[cfg_attr(test, automock)]
pub trait MulticastMembership: Send + Sync + 'static {
    fn join(&self, group: &GroupSpec) -> anyhow::Result<()>;
    fn leave(&self, group: &GroupSpec) -> anyhow::Result<()>;
}

/// Joins and leaves through socket options on a UDP socket, on the default interface
pub struct SocketMembership {
    socket: Arc<UdpSocket>,
    joined: Mutex<Vec<GroupSpec>>,
}

impl SocketMembership {
    pub fn new(socket: Arc<UdpSocket>) -> SocketMembership {
        SocketMembership {
            socket,
            joined: Default::default(),
        }
    }

    pub fn is_joined(&self, group: &GroupSpec) -> bool {
        self.joined.lock()
            .map(|joined| joined.contains(group))
            .unwrap_or(false)
    }
}

impl MulticastMembership for SocketMembership {
    fn join(&self, group: &GroupSpec) -> anyhow::Result<()> {
        let mut joined = self.joined.lock()
            .map_err(|_| anyhow!("multicast membership state poisoned"))?;
        if joined.contains(group) {
            return Ok(());
        }

        let socket = SockRef::from(&*self.socket);
        let result = if group.is_ssm() {
            socket.join_ssm_v4(&group.source, &group.group, &Ipv4Addr::UNSPECIFIED)
        }
        else {
            socket.join_multicast_v4(&group.group, &Ipv4Addr::UNSPECIFIED)
        };
        result.with_context(|| format!("joining {}", group))?;

        debug!("joined multicast group {}", group);
        joined.push(*group);
        Ok(())
    }

    fn leave(&self, group: &GroupSpec) -> anyhow::Result<()> {
        let mut joined = self.joined.lock()
            .map_err(|_| anyhow!("multicast membership state poisoned"))?;
        let Some(idx) = joined.iter().position(|g| g == group) else {
            return Ok(());
        };
        joined.remove(idx);

        let socket = SockRef::from(&*self.socket);
        let result = if group.is_ssm() {
            socket.leave_ssm_v4(&group.source, &group.group, &Ipv4Addr::UNSPECIFIED)
        }
        else {
            socket.leave_multicast_v4(&group.group, &Ipv4Addr::UNSPECIFIED)
        };
        result.with_context(|| format!("leaving {}", group))?;

        debug!("left multicast group {}", group);
        Ok(())
    }
}

/// The socket on which native multicast arrives, bound to the stream's UDP port and joined
///  to the group right away
pub struct NativeMulticastSocket {
    pub socket: Arc<UdpSocket>,
    pub membership: Arc<SocketMembership>,
}

impl NativeMulticastSocket {
    pub fn open(group: GroupSpec, port: u16) -> anyhow::Result<NativeMulticastSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
            .with_context(|| format!("binding native multicast socket to port {}", port))?;

        let socket = Arc::new(UdpSocket::from_std(socket.into())?);
        let membership = Arc::new(SocketMembership::new(socket.clone()));
        membership.join(&group)?;

        info!("listening for native multicast {} on port {}", group, port);
        Ok(NativeMulticastSocket { socket, membership })
    }
}
