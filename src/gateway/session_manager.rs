use std::marker::PhantomData;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::AmtConfig;
use crate::gateway::cancel::{poll_bounded, CancelSignal, PollOutcome};
use crate::gateway::error::AmtError;
use crate::gateway::group_spec::GroupSpec;
use crate::gateway::handshake::HandshakeEngine;
use crate::gateway::membership_timer::{MembershipTimer, RenewalFuture};
use crate::gateway::multicast::MulticastMembership;
use crate::gateway::nonce::{NonceSource, RngNonceSource};
use crate::gateway::payload::Payload;
use crate::gateway::relay::RelayCandidate;
use crate::gateway::session::{EstablishedSession, Session};
use crate::wire::data_frame::decode_data;
use crate::wire::membership_update::encode_membership_update;

#[derive(Default)]
struct SessionSlot {
    session: Option<Session>,
    /// set by `leave`, after which no new session is established
    closed: bool,
}

struct SessionManagerInner<N: NonceSource + 'static> {
    config: AmtConfig,
    membership: Arc<dyn MulticastMembership>,
    timer: Arc<dyn MembershipTimer>,
    cancel: CancelSignal,
    /// held by `connect` for its full duration, by renewal and by `leave`
    slot: Mutex<SessionSlot>,
    next_epoch: AtomicU64,
    _nonce_source: PhantomData<fn() -> N>,
}

/// Owns the tunnel session: establishes it against a list of relay candidates, keeps the
///  group membership alive with periodic updates, and tears it down.
///
/// The manager is a cheap handle, clones share the same session.
pub struct SessionManager<N: NonceSource + 'static = RngNonceSource> {
    inner: Arc<SessionManagerInner<N>>,
}

impl<N: NonceSource + 'static> Clone for SessionManager<N> {
    fn clone(&self) -> Self {
        SessionManager {
            inner: self.inner.clone(),
        }
    }
}

impl<N: NonceSource + 'static> SessionManager<N> {
    pub fn new(config: AmtConfig, membership: Arc<dyn MulticastMembership>, timer: Arc<dyn MembershipTimer>) -> SessionManager<N> {
        SessionManager {
            inner: Arc::new(SessionManagerInner {
                config,
                membership,
                timer,
                cancel: CancelSignal::new(),
                slot: Default::default(),
                next_epoch: AtomicU64::new(1),
                _nonce_source: Default::default(),
            }),
        }
    }

    /// fires when the session is left, interrupting any socket wait tied to it
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.inner.cancel
    }

    /// Tries the candidates in order until one completes the handshake, accepts the join and
    ///  delivers data. Any failure of a single candidate only moves on to the next one.
    pub async fn connect(&self, candidates: &[RelayCandidate], group: GroupSpec) -> Result<EstablishedSession, AmtError> {
        self.inner.connect(candidates, group).await
    }

    /// Sends a membership update to keep the session for `epoch` alive, and schedules the next
    ///  one. This is what the renewal timer calls; it does nothing if that session is gone.
    pub async fn renew(&self, epoch: u64) {
        self.inner.renew(epoch).await
    }

    /// Leaves the group and releases the tunnel. Calling this more than once is harmless.
    pub async fn leave(&self) {
        self.inner.leave().await
    }

    pub async fn tunnel_socket(&self) -> Option<Arc<UdpSocket>> {
        self.inner.slot.lock().await
            .session.as_ref()
            .map(|s| s.socket.clone())
    }

    pub async fn current_relay(&self) -> Option<SocketAddrV4> {
        self.inner.slot.lock().await
            .session.as_ref()
            .map(|s| s.relay)
    }

    pub async fn current_epoch(&self) -> Option<u64> {
        self.inner.slot.lock().await
            .session.as_ref()
            .map(|s| s.epoch)
    }

    pub async fn last_renewal(&self) -> Option<Instant> {
        self.inner.slot.lock().await
            .session.as_ref()
            .map(|s| s.last_renewal)
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.slot.lock().await
            .session.is_some()
    }
}

impl<N: NonceSource + 'static> SessionManagerInner<N> {
    async fn connect(self: &Arc<Self>, candidates: &[RelayCandidate], group: GroupSpec) -> Result<EstablishedSession, AmtError> {
        let mut slot = self.slot.lock().await;
        if slot.closed || self.cancel.is_cancelled() {
            return Err(AmtError::Cancelled);
        }
        if candidates.is_empty() {
            return Err(AmtError::AddressResolution("no relay candidates".to_string()));
        }

        if let Some(previous) = slot.session.take() {
            self.timer.disarm();
            info!("replacing AMT session with relay {}", previous.relay);
            self.send_leave(&previous).await;
            if let Err(e) = self.membership.leave(&previous.group) {
                warn!("leaving {} failed: {}", previous.group, e);
            }
        }

        for candidate in candidates {
            // a renewal for some previous session must not interfere with the new one
            self.timer.disarm();

            match self.try_candidate(*candidate, group).await {
                Ok((session, first_payload)) => {
                    let established = EstablishedSession {
                        relay: session.relay,
                        candidate: session.candidate,
                        parameters: session.parameters,
                        first_payload,
                    };
                    let interval = session.parameters.renewal_interval();
                    let epoch = session.epoch;

                    info!("AMT session #{} established with relay {} (candidate {}) for {}, renewing every {:?}", epoch, session.relay, candidate, group, interval);
                    slot.session = Some(session);
                    self.timer.arm(interval, renewal_callback(Arc::downgrade(self), epoch));
                    return Ok(established);
                }
                Err(AmtError::Cancelled) => {
                    debug!("connect cancelled while trying relay candidate {}", candidate);
                    return Err(AmtError::Cancelled);
                }
                Err(e) => {
                    warn!("relay candidate {} failed: {}", candidate, e);
                }
            }
        }

        error!("none of the {} relay candidates is responding", candidates.len());
        Err(AmtError::NoRelayResponding)
    }

    async fn try_candidate(&self, candidate: RelayCandidate, group: GroupSpec) -> Result<(Session, Payload), AmtError> {
        let socket = UdpSocket::bind(self.config.tunnel_bind_addr).await?;
        let handshake_deadline = || Instant::now() + self.config.handshake_timeout;

        let (nonce, relay, parameters) = {
            let mut handshake = HandshakeEngine::<N>::new(&socket, candidate, self.cancel.watcher(), self.config.recv_buf_len());
            let nonce = handshake.discover(handshake_deadline()).await?;
            handshake.request(handshake_deadline()).await?;
            let parameters = handshake.query_membership(handshake_deadline()).await?;
            (nonce, handshake.relay().unwrap_or(candidate.0), parameters)
        };

        self.membership.join(&group)
            .map_err(|e| AmtError::Join(e.to_string()))?;

        let update = encode_membership_update(parameters.response_mac, nonce, group.group, group.source, false);
        let verified = match socket.send(&update).await {
            Ok(_) => self.await_first_data(&socket, handshake_deadline()).await,
            Err(e) => Err(e.into()),
        };
        let first_payload = match verified {
            Ok(payload) => payload,
            Err(e) => {
                if let Err(leave_err) = self.membership.leave(&group) {
                    warn!("undoing join of {} failed: {}", group, leave_err);
                }
                return Err(e);
            }
        };

        let session = Session {
            socket: Arc::new(socket),
            relay,
            candidate,
            group,
            nonce,
            parameters,
            epoch: self.next_epoch.fetch_add(1, Ordering::AcqRel),
            last_renewal: Instant::now(),
        };
        Ok((session, first_payload))
    }

    /// The first data frame proves that the relay actually forwards the group. It is regular
    ///  payload and is handed on rather than dropped.
    async fn await_first_data(&self, socket: &UdpSocket, deadline: Instant) -> Result<Payload, AmtError> {
        let mut buf = vec![0u8; self.config.recv_buf_len()];
        let mut cancel = self.cancel.watcher();

        loop {
            let len = match poll_bounded(socket.recv(&mut buf), deadline, &mut cancel).await? {
                PollOutcome::Data(len) => len,
                PollOutcome::Timeout => return Err(AmtError::HandshakeTimeout("first multicast data")),
                PollOutcome::Cancelled => return Err(AmtError::Cancelled),
            };

            match decode_data(&buf[..len]) {
                Ok(frame) => {
                    if frame.truncated {
                        warn!("first data frame from relay is truncated ({} bytes)", len);
                    }
                    return Ok(Payload::new(frame.payload, frame.truncated));
                }
                Err(e) => {
                    debug!("discarding frame while waiting for first multicast data: {}", e);
                }
            }
        }
    }

    async fn renew(self: &Arc<Self>, epoch: u64) {
        let mut slot = self.slot.lock().await;
        let Some(session) = slot.session.as_mut() else {
            debug!("no AMT session, skipping renewal #{}", epoch);
            return;
        };
        if session.epoch != epoch {
            debug!("skipping renewal for replaced AMT session #{}", epoch);
            return;
        }

        trace!("renewing membership {} with relay {}", session.group, session.relay);
        if let Err(e) = session.socket.send(&session.membership_update(false)).await {
            // the next renewal may well get through, so we keep the schedule
            warn!("sending membership renewal to relay {} failed: {}", session.relay, e);
        }
        session.last_renewal = Instant::now();

        self.timer.arm(session.parameters.renewal_interval(), renewal_callback(Arc::downgrade(self), epoch));
    }

    async fn leave(&self) {
        // cancel first: a pending connect holds the lock until it notices
        self.cancel.cancel();

        let mut slot = self.slot.lock().await;
        self.timer.disarm();
        slot.closed = true;

        if let Some(session) = slot.session.take() {
            self.send_leave(&session).await;
            if let Err(e) = self.membership.leave(&session.group) {
                warn!("leaving {} failed: {}", session.group, e);
            }
            info!("AMT session #{} with relay {} closed", session.epoch, session.relay);
        }
    }

    async fn send_leave(&self, session: &Session) {
        if let Err(e) = session.socket.send(&session.membership_update(true)).await {
            warn!("sending leave for {} to relay {} failed: {}", session.group, session.relay, e);
        }
    }
}

fn renewal_callback<N: NonceSource + 'static>(inner: Weak<SessionManagerInner<N>>, epoch: u64) -> RenewalFuture {
    Box::pin(async move {
        if let Some(inner) = inner.upgrade() {
            inner.renew(epoch).await;
        }
    })
}
