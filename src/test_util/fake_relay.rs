use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::bail;
use bytes::Buf;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::gateway::relay::RelayCandidate;
use crate::wire::data_frame::encode_data;
use crate::wire::membership_update::{decode_membership_update, MembershipUpdate};
use crate::wire::relay_messages::{encode_advertisement, encode_membership_query};
use crate::wire::{AmtMessageType, NONCE_LEN};

pub const FAKE_RELAY_MAC: [u8; 6] = [0x02, 0x00, 0x5e, 0x10, 0x20, 0x30];
/// unicast source address written into tunneled data frames
pub const STREAM_SOURCE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
pub const STREAM_PORT: u16 = 1234;

#[derive(Debug, Clone)]
pub struct FakeRelayBehavior {
    pub qqic: u8,
    /// added to the nonce echoed in the membership query, anything but 0 breaks the handshake
    pub query_nonce_offset: u32,
    /// payloads sent as data frames in response to the gateway's first join
    pub payloads_after_join: Vec<Vec<u8>>,
    /// cut each data frame sent after the join to this many bytes
    pub truncate_frames_to: Option<usize>,
}
impl Default for FakeRelayBehavior {
    fn default() -> Self {
        FakeRelayBehavior {
            qqic: 125,
            query_nonce_offset: 0,
            payloads_after_join: Vec::new(),
            truncate_frames_to: None,
        }
    }
}
impl FakeRelayBehavior {
    pub fn streaming(payload: &[u8]) -> FakeRelayBehavior {
        FakeRelayBehavior {
            payloads_after_join: vec![payload.to_vec()],
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct FakeRelayState {
    gateway: Option<SocketAddr>,
    group: Option<Ipv4Addr>,
    num_discoveries: usize,
    updates: Vec<MembershipUpdate>,
}

/// The relay side of the AMT protocol on a loopback UDP socket. It advertises itself
///  (127.0.0.1), answers requests with a membership query, records all membership updates
///  it receives, and can stream data frames to the gateway.
pub struct FakeRelay {
    addr: SocketAddrV4,
    socket: Arc<UdpSocket>,
    state: Arc<RwLock<FakeRelayState>>,
    handle: JoinHandle<()>,
}

impl FakeRelay {
    pub async fn start(behavior: FakeRelayBehavior) -> anyhow::Result<FakeRelay> {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?);
        let addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => bail!("fake relay bound to IPv6 address {}", addr),
        };
        let state: Arc<RwLock<FakeRelayState>> = Default::default();

        let handle = tokio::spawn(Self::serve(socket.clone(), state.clone(), behavior));
        Ok(FakeRelay { addr, socket, state, handle })
    }

    pub fn candidate(&self) -> RelayCandidate {
        RelayCandidate(self.addr)
    }

    pub async fn updates(&self) -> Vec<MembershipUpdate> {
        self.state.read().await
            .updates.clone()
    }

    pub async fn num_discoveries(&self) -> usize {
        self.state.read().await
            .num_discoveries
    }

    pub async fn send_payload(&self, payload: &[u8]) -> anyhow::Result<()> {
        let state = self.state.read().await;
        let (Some(gateway), Some(group)) = (state.gateway, state.group) else {
            bail!("no gateway joined yet");
        };
        self.socket.send_to(&encode_data(STREAM_SOURCE, group, STREAM_PORT, payload), gateway).await?;
        Ok(())
    }

    pub async fn send_raw(&self, frame: &[u8]) -> anyhow::Result<()> {
        let Some(gateway) = self.state.read().await.gateway else {
            bail!("no gateway contacted the relay yet");
        };
        self.socket.send_to(frame, gateway).await?;
        Ok(())
    }

    async fn serve(socket: Arc<UdpSocket>, state: Arc<RwLock<FakeRelayState>>, behavior: FakeRelayBehavior) {
        let mut buf = vec![0u8; 65536];
        let mut has_joined = false;

        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("fake relay: receive failed, shutting down: {}", e);
                    return;
                }
            };
            let frame = &buf[..len];
            trace!("fake relay: received {:?} from {}", frame, from);

            if let Err(e) = Self::on_frame(&socket, &state, &behavior, &mut has_joined, frame, from).await {
                warn!("fake relay: error handling frame from {}: {}", from, e);
            }
        }
    }

    async fn on_frame(socket: &UdpSocket, state: &RwLock<FakeRelayState>, behavior: &FakeRelayBehavior, has_joined: &mut bool, frame: &[u8], from: SocketAddr) -> anyhow::Result<()> {
        match AmtMessageType::of(frame) {
            Some(AmtMessageType::RelayDiscovery) => {
                let nonce = nonce_of(frame)?;
                {
                    let mut state = state.write().await;
                    state.num_discoveries += 1;
                    state.gateway = Some(from);
                }
                socket.send_to(&encode_advertisement(nonce, Ipv4Addr::LOCALHOST), from).await?;
            }
            Some(AmtMessageType::Request) => {
                let nonce = nonce_of(frame)?.wrapping_add(behavior.query_nonce_offset);
                state.write().await.gateway = Some(from);
                let query = encode_membership_query(FAKE_RELAY_MAC, nonce, 100, Ipv4Addr::UNSPECIFIED, 2, behavior.qqic);
                socket.send_to(&query, from).await?;
            }
            Some(AmtMessageType::MembershipUpdate) => {
                let update = decode_membership_update(frame)?;
                debug!("fake relay: membership update {:?}", update);
                let is_first_join = !*has_joined && !update.record.record_type.is_leave();

                let group = update.record.group;
                {
                    let mut state = state.write().await;
                    state.gateway = Some(from);
                    state.group = Some(group);
                    state.updates.push(update);
                }

                if is_first_join {
                    *has_joined = true;
                    for payload in &behavior.payloads_after_join {
                        let data = encode_data(STREAM_SOURCE, group, STREAM_PORT, payload);
                        let len = behavior.truncate_frames_to
                            .unwrap_or(data.len())
                            .min(data.len());
                        socket.send_to(&data[..len], from).await?;
                    }
                }
            }
            other => {
                debug!("fake relay: ignoring {:?} frame from {}", other, from);
            }
        }
        Ok(())
    }
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn nonce_of(frame: &[u8]) -> anyhow::Result<u32> {
    if frame.len() < 4 + NONCE_LEN {
        bail!("frame too short for a nonce: {} bytes", frame.len());
    }
    Ok((&frame[4..]).get_u32())
}

/// A relay address that swallows everything sent to it. Keep the socket alive for as long as
///  the candidate is in use.
pub async fn silent_relay() -> anyhow::Result<(UdpSocket, RelayCandidate)> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    match socket.local_addr()? {
        SocketAddr::V4(addr) => Ok((socket, RelayCandidate(addr))),
        SocketAddr::V6(addr) => bail!("silent relay bound to IPv6 address {}", addr),
    }
}
