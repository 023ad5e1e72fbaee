use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::AmtConfig;
use crate::gateway::cancel::{poll_bounded, CancelWatcher, PollOutcome};
use crate::gateway::error::AmtError;
use crate::gateway::group_spec::GroupSpec;
use crate::gateway::multicast::MulticastMembership;
use crate::gateway::nonce::{NonceSource, RngNonceSource};
use crate::gateway::payload::{Payload, PayloadSink};
use crate::gateway::relay::RelayResolver;
use crate::gateway::session_manager::SessionManager;
use crate::wire::data_frame::decode_data;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReceiverMode {
    /// waiting for multicast to arrive natively
    Native,
    /// receiving through an AMT relay
    Tunnel,
    Closed,
}

#[derive(Debug, Eq, PartialEq)]
pub enum Received {
    Payload(Payload),
    Eof,
}

/// Receives a multicast stream, natively if possible and through an AMT tunnel otherwise.
///
/// The receiver starts out listening on the native socket. If nothing arrives before the
///  deadline, it resolves the configured relay and establishes a tunnel, and stays in tunnel
///  mode from then on. A tunnel that stays silent for a full receive deadline is treated as
///  the end of the stream.
pub struct PacketReceiver<N: NonceSource + 'static = RngNonceSource> {
    config: AmtConfig,
    group: GroupSpec,
    native_socket: Arc<UdpSocket>,
    native_membership: Arc<dyn MulticastMembership>,
    resolver: Arc<dyn RelayResolver>,
    session_manager: SessionManager<N>,
    mode: ReceiverMode,
    tunnel_socket: Option<Arc<UdpSocket>>,
    cancel: CancelWatcher,
    buf: Vec<u8>,
}

impl<N: NonceSource + 'static> PacketReceiver<N> {
    pub fn new(
        config: AmtConfig,
        group: GroupSpec,
        native_socket: Arc<UdpSocket>,
        native_membership: Arc<dyn MulticastMembership>,
        resolver: Arc<dyn RelayResolver>,
        session_manager: SessionManager<N>,
    ) -> PacketReceiver<N> {
        let cancel = session_manager.cancel_signal().watcher();
        let buf = vec![0u8; config.recv_buf_len()];
        PacketReceiver {
            config,
            group,
            native_socket,
            native_membership,
            resolver,
            session_manager,
            mode: ReceiverMode::Native,
            tunnel_socket: None,
            cancel,
            buf,
        }
    }

    pub fn mode(&self) -> ReceiverMode {
        self.mode
    }

    pub fn group(&self) -> GroupSpec {
        self.group
    }

    pub fn session_manager(&self) -> &SessionManager<N> {
        &self.session_manager
    }

    /// [PacketReceiver::receive] with the configured timeout
    pub async fn receive_next(&mut self) -> Result<Received, AmtError> {
        self.receive(Instant::now() + self.config.native_timeout).await
    }

    pub async fn receive(&mut self, deadline: Instant) -> Result<Received, AmtError> {
        loop {
            match self.mode {
                ReceiverMode::Closed => return Ok(Received::Eof),
                ReceiverMode::Native => {
                    match poll_bounded(self.native_socket.recv(&mut self.buf), deadline, &mut self.cancel).await? {
                        PollOutcome::Data(len) => {
                            trace!("received {} bytes of native multicast", len);
                            return Ok(Received::Payload(Payload::new(&self.buf[..len], false)));
                        }
                        PollOutcome::Timeout => {
                            info!("no native multicast for {} before the deadline, falling back to AMT", self.group);
                            match self.start_tunnel().await {
                                Ok(payload) => return Ok(Received::Payload(payload)),
                                Err(AmtError::Cancelled) => {
                                    self.mode = ReceiverMode::Closed;
                                    return Ok(Received::Eof);
                                }
                                Err(e) => {
                                    error!("could not establish AMT tunnel for {}: {}", self.group, e);
                                    self.mode = ReceiverMode::Closed;
                                    return Err(e);
                                }
                            }
                        }
                        PollOutcome::Cancelled => {
                            self.mode = ReceiverMode::Closed;
                            return Ok(Received::Eof);
                        }
                    }
                }
                ReceiverMode::Tunnel => {
                    let Some(socket) = self.tunnel_socket.clone() else {
                        self.mode = ReceiverMode::Closed;
                        return Ok(Received::Eof);
                    };

                    let len = match poll_bounded(socket.recv(&mut self.buf), deadline, &mut self.cancel).await? {
                        PollOutcome::Data(len) => len,
                        PollOutcome::Timeout => {
                            warn!("no data from AMT relay before the deadline, ending the stream");
                            self.mode = ReceiverMode::Closed;
                            return Ok(Received::Eof);
                        }
                        PollOutcome::Cancelled => {
                            self.mode = ReceiverMode::Closed;
                            return Ok(Received::Eof);
                        }
                    };

                    match decode_data(&self.buf[..len]) {
                        Ok(frame) => {
                            if frame.truncated {
                                warn!("truncated data frame ({} bytes), delivering it as corrupted", len);
                            }
                            return Ok(Received::Payload(Payload::new(frame.payload, frame.truncated)));
                        }
                        Err(e) => {
                            debug!("discarding frame from relay: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn start_tunnel(&mut self) -> Result<Payload, AmtError> {
        let candidates = self.resolver.resolve(&self.config.relay, self.config.relay_port).await
            .map_err(|e| AmtError::AddressResolution(format!("{}: {}", self.config.relay, e)))?;
        if candidates.is_empty() {
            return Err(AmtError::AddressResolution(self.config.relay.clone()));
        }
        debug!("relay {} resolved to {:?}", self.config.relay, candidates);

        let established = self.session_manager.connect(&candidates, self.group).await?;
        self.tunnel_socket = self.session_manager.tunnel_socket().await;
        self.mode = ReceiverMode::Tunnel;
        Ok(established.first_payload)
    }

    /// Receives until the end of the stream, handing every payload to `sink`. The receiver is
    ///  closed when this returns.
    pub async fn pump(&mut self, sink: &dyn PayloadSink) -> anyhow::Result<()> {
        let result = self.do_pump(sink).await;
        self.close().await;
        result
    }

    async fn do_pump(&mut self, sink: &dyn PayloadSink) -> anyhow::Result<()> {
        loop {
            match self.receive_next().await? {
                Received::Payload(payload) => sink.deliver(payload).await?,
                Received::Eof => return Ok(()),
            }
        }
    }

    /// A handle for closing the receiver while it is blocked in [PacketReceiver::receive]
    pub fn close_handle(&self) -> CloseHandle<N> {
        CloseHandle {
            session_manager: self.session_manager.clone(),
            native_membership: self.native_membership.clone(),
            group: self.group,
        }
    }

    pub async fn close(&mut self) {
        self.close_handle().close().await;
        self.mode = ReceiverMode::Closed;
        self.tunnel_socket = None;
    }
}

pub struct CloseHandle<N: NonceSource + 'static = RngNonceSource> {
    session_manager: SessionManager<N>,
    native_membership: Arc<dyn MulticastMembership>,
    group: GroupSpec,
}

impl<N: NonceSource + 'static> CloseHandle<N> {
    /// Leaves the tunnel session if there is one, and the native group. A pending receive
    ///  returns [Received::Eof].
    pub async fn close(&self) {
        self.session_manager.leave().await;
        if let Err(e) = self.native_membership.leave(&self.group) {
            warn!("leaving native multicast group {} failed: {}", self.group, e);
        }
    }
}
