use std::marker::PhantomData;
use std::net::SocketAddrV4;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::gateway::cancel::{poll_bounded, CancelWatcher, PollOutcome};
use crate::gateway::error::AmtError;
use crate::gateway::nonce::NonceSource;
use crate::gateway::relay::RelayCandidate;
use crate::wire::relay_messages::{decode_advertisement, decode_membership_query, encode_discovery, encode_request, RelayParameters};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HandshakeState {
    Idle,
    DiscoverySent,
    AdvertisementReceived,
    RequestSent,
    QueryReceived,
    Failed,
}
impl HandshakeState {
    fn name(&self) -> &'static str {
        match self {
            HandshakeState::Idle => "Idle",
            HandshakeState::DiscoverySent => "DiscoverySent",
            HandshakeState::AdvertisementReceived => "AdvertisementReceived",
            HandshakeState::RequestSent => "RequestSent",
            HandshakeState::QueryReceived => "QueryReceived",
            HandshakeState::Failed => "Failed",
        }
    }
}

/// Runs the relay discovery / request / query exchange against a single relay candidate.
///
/// Each step has to be called in order, and each is bounded by the deadline passed to it.
///  Any failure moves the engine to [HandshakeState::Failed], and the candidate is done.
pub struct HandshakeEngine<'a, N: NonceSource> {
    socket: &'a UdpSocket,
    candidate: RelayCandidate,
    cancel: CancelWatcher,
    state: HandshakeState,
    nonce: u32,
    relay: Option<SocketAddrV4>,
    buf: Vec<u8>,
    _nonce_source: PhantomData<fn() -> N>,
}

impl<'a, N: NonceSource> HandshakeEngine<'a, N> {
    pub fn new(socket: &'a UdpSocket, candidate: RelayCandidate, cancel: CancelWatcher, recv_buf_len: usize) -> HandshakeEngine<'a, N> {
        HandshakeEngine {
            socket,
            candidate,
            cancel,
            state: HandshakeState::Idle,
            nonce: 0,
            relay: None,
            buf: vec![0; recv_buf_len],
            _nonce_source: Default::default(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    /// The relay address the candidate advertised, available after [HandshakeEngine::discover]
    pub fn relay(&self) -> Option<SocketAddrV4> {
        self.relay
    }

    /// Sends a relay discovery with a fresh nonce and waits for the matching advertisement.
    ///  On success, the socket is connected to the advertised relay.
    pub async fn discover(&mut self, deadline: Instant) -> Result<u32, AmtError> {
        self.check_state(HandshakeState::Idle)?;
        let result = self.do_discover(deadline).await;
        self.on_step_result(result, HandshakeState::AdvertisementReceived)
    }

    async fn do_discover(&mut self, deadline: Instant) -> Result<u32, AmtError> {
        self.nonce = N::next_nonce();
        debug!("sending relay discovery to {} with nonce {:#010x}", self.candidate, self.nonce);
        self.socket.send_to(&encode_discovery(self.nonce), self.candidate.0).await?;
        self.state = HandshakeState::DiscoverySent;

        loop {
            let (len, from) = match poll_bounded(self.socket.recv_from(&mut self.buf), deadline, &mut self.cancel).await? {
                PollOutcome::Data(data) => data,
                PollOutcome::Timeout => return Err(AmtError::HandshakeTimeout("relay advertisement")),
                PollOutcome::Cancelled => return Err(AmtError::Cancelled),
            };
            trace!("received {:?} from {} while waiting for advertisement", &self.buf[..len], from);

            match decode_advertisement(&self.buf[..len]) {
                Ok(adv) if adv.nonce != self.nonce => {
                    warn!("ignoring relay advertisement from {} with nonce {:#010x}, expected {:#010x}", from, adv.nonce, self.nonce);
                }
                Ok(adv) if adv.relay.is_unspecified() || adv.relay.is_multicast() => {
                    warn!("ignoring relay advertisement from {} with invalid relay address {}", from, adv.relay);
                }
                Ok(adv) => {
                    let relay = SocketAddrV4::new(adv.relay, self.candidate.0.port());
                    debug!("relay candidate {} advertised relay {}", self.candidate, relay);
                    self.socket.connect(relay).await?;
                    self.relay = Some(relay);
                    return Ok(self.nonce);
                }
                Err(e) => {
                    warn!("discarding packet from {} while waiting for relay advertisement: {}", from, e);
                }
            }
        }
    }

    /// Sends the request for a membership query. No reply is awaited here, that is
    ///  [HandshakeEngine::query_membership]'s job.
    pub async fn request(&mut self, deadline: Instant) -> Result<(), AmtError> {
        self.check_state(HandshakeState::AdvertisementReceived)?;
        let result = self.do_request(deadline).await;
        self.on_step_result(result, HandshakeState::RequestSent)
    }

    async fn do_request(&mut self, deadline: Instant) -> Result<(), AmtError> {
        debug!("sending request to relay {:?}", self.relay);
        let request = encode_request(self.nonce);
        match poll_bounded(self.socket.send(&request), deadline, &mut self.cancel).await? {
            PollOutcome::Data(_) => Ok(()),
            PollOutcome::Timeout => Err(AmtError::HandshakeTimeout("sending request")),
            PollOutcome::Cancelled => Err(AmtError::Cancelled),
        }
    }

    /// Waits for the relay's membership query. A query that does not echo the handshake nonce
    ///  fails the candidate right away.
    pub async fn query_membership(&mut self, deadline: Instant) -> Result<RelayParameters, AmtError> {
        self.check_state(HandshakeState::RequestSent)?;
        let result = self.do_query_membership(deadline).await;
        self.on_step_result(result, HandshakeState::QueryReceived)
    }

    async fn do_query_membership(&mut self, deadline: Instant) -> Result<RelayParameters, AmtError> {
        loop {
            let len = match poll_bounded(self.socket.recv(&mut self.buf), deadline, &mut self.cancel).await? {
                PollOutcome::Data(len) => len,
                PollOutcome::Timeout => return Err(AmtError::HandshakeTimeout("membership query")),
                PollOutcome::Cancelled => return Err(AmtError::Cancelled),
            };
            trace!("received {:?} while waiting for membership query", &self.buf[..len]);

            match decode_membership_query(&self.buf[..len]) {
                Ok(params) if params.request_nonce != self.nonce => {
                    return Err(AmtError::NonceMismatch {
                        expected: self.nonce,
                        received: params.request_nonce,
                    });
                }
                Ok(params) => {
                    debug!("membership query from relay {:?}: {:?}", self.relay, params);
                    return Ok(params);
                }
                Err(e) => {
                    warn!("discarding packet while waiting for membership query: {}", e);
                }
            }
        }
    }

    fn check_state(&mut self, expected: HandshakeState) -> Result<(), AmtError> {
        if self.state != expected {
            let actual = self.state.name();
            self.state = HandshakeState::Failed;
            return Err(AmtError::HandshakeOutOfOrder(actual));
        }
        Ok(())
    }

    fn on_step_result<T>(&mut self, result: Result<T, AmtError>, next_state: HandshakeState) -> Result<T, AmtError> {
        self.state = match &result {
            Ok(_) => next_state,
            Err(_) => HandshakeState::Failed,
        };
        result
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use super::*;
    use crate::gateway::cancel::CancelSignal;
    use crate::gateway::nonce::{MockNonceSource, RngNonceSource, MOCK_NONCE_MUTEX};
    use crate::wire::relay_messages::{encode_advertisement, encode_membership_query, DISCOVERY_LEN, REQUEST_LEN};

    const MAC: [u8; 6] = [1, 2, 3, 4, 5, 6];
    const GROUP: Ipv4Addr = Ipv4Addr::new(239, 1, 1, 1);

    async fn relay_socket() -> (UdpSocket, RelayCandidate) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, RelayCandidate(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)))
    }

    async fn gateway_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    fn nonce_of(frame: &[u8]) -> u32 {
        u32::from_be_bytes(frame[4..8].try_into().unwrap())
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_handshake() {
        let _lock = MOCK_NONCE_MUTEX.lock();
        let ctx = MockNonceSource::next_nonce_context();
        ctx.expect().return_const(0x1234_5678u32);

        let (relay, candidate) = relay_socket().await;
        let relay_task = tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (len, gateway) = relay.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, DISCOVERY_LEN);
            assert_eq!(buf[0], 1);
            assert_eq!(nonce_of(&buf), 0x1234_5678);

            // stale advertisement first, then garbage, then the right one
            relay.send_to(&encode_advertisement(0x1111_1111, Ipv4Addr::LOCALHOST), gateway).await.unwrap();
            relay.send_to(&[2, 0, 0], gateway).await.unwrap();
            relay.send_to(&encode_advertisement(0x1234_5678, Ipv4Addr::LOCALHOST), gateway).await.unwrap();

            let (len, _) = relay.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, REQUEST_LEN);
            assert_eq!(buf[0], 3);
            assert_eq!(nonce_of(&buf), 0x1234_5678);

            relay.send_to(&encode_membership_query(MAC, 0x1234_5678, 100, GROUP, 2, 30), gateway).await.unwrap();
        });

        let socket = gateway_socket().await;
        let mut engine = HandshakeEngine::<MockNonceSource>::new(&socket, candidate, CancelSignal::new().watcher(), 1500);
        assert_eq!(engine.state(), HandshakeState::Idle);

        assert_eq!(engine.discover(deadline()).await.unwrap(), 0x1234_5678);
        assert_eq!(engine.state(), HandshakeState::AdvertisementReceived);
        assert_eq!(engine.relay(), Some(candidate.0));

        engine.request(deadline()).await.unwrap();
        assert_eq!(engine.state(), HandshakeState::RequestSent);

        let params = engine.query_membership(deadline()).await.unwrap();
        assert_eq!(engine.state(), HandshakeState::QueryReceived);
        assert_eq!(params.response_mac, MAC);
        assert_eq!(params.request_nonce, 0x1234_5678);
        assert_eq!(params.qqic, 30);
        assert_eq!(params.renewal_interval(), Duration::from_secs(30));

        relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_query_nonce_mismatch() {
        let (relay, candidate) = relay_socket().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (_, gateway) = relay.recv_from(&mut buf).await.unwrap();
            let nonce = nonce_of(&buf);
            relay.send_to(&encode_advertisement(nonce, Ipv4Addr::LOCALHOST), gateway).await.unwrap();
            relay.recv_from(&mut buf).await.unwrap();
            relay.send_to(&encode_membership_query(MAC, nonce.wrapping_add(1), 100, GROUP, 2, 30), gateway).await.unwrap();
        });

        let socket = gateway_socket().await;
        let mut engine = HandshakeEngine::<RngNonceSource>::new(&socket, candidate, CancelSignal::new().watcher(), 1500);
        let nonce = engine.discover(deadline()).await.unwrap();
        engine.request(deadline()).await.unwrap();

        match engine.query_membership(deadline()).await {
            Err(AmtError::NonceMismatch { expected, received }) => {
                assert_eq!(expected, nonce);
                assert_eq!(received, nonce.wrapping_add(1));
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(engine.state(), HandshakeState::Failed);
    }

    #[tokio::test]
    async fn test_discovery_timeout() {
        let (_silent_relay, candidate) = relay_socket().await;

        let socket = gateway_socket().await;
        let mut engine = HandshakeEngine::<RngNonceSource>::new(&socket, candidate, CancelSignal::new().watcher(), 1500);

        let result = engine.discover(Instant::now() + Duration::from_millis(100)).await;
        assert!(matches!(result, Err(AmtError::HandshakeTimeout(_))));
        assert_eq!(engine.state(), HandshakeState::Failed);
    }

    #[tokio::test]
    async fn test_discovery_cancelled() {
        let (_silent_relay, candidate) = relay_socket().await;
        let cancel = CancelSignal::new();
        cancel.cancel();

        let socket = gateway_socket().await;
        let mut engine = HandshakeEngine::<RngNonceSource>::new(&socket, candidate, cancel.watcher(), 1500);
        assert!(matches!(engine.discover(deadline()).await, Err(AmtError::Cancelled)));
    }

    #[tokio::test]
    async fn test_out_of_order() {
        let (_relay, candidate) = relay_socket().await;
        let socket = gateway_socket().await;
        let mut engine = HandshakeEngine::<RngNonceSource>::new(&socket, candidate, CancelSignal::new().watcher(), 1500);

        assert!(matches!(engine.request(deadline()).await, Err(AmtError::HandshakeOutOfOrder("Idle"))));
        assert_eq!(engine.state(), HandshakeState::Failed);
        assert!(matches!(engine.discover(deadline()).await, Err(AmtError::HandshakeOutOfOrder("Failed"))));
    }
}
