//! UDP endpoint
//!
//! Runs the handshake and transport loop for one peer over a UDP socket.
//! Each tunnel is an actor: a spawned task owns the socket and the
//! [`PeerSessions`], and callers talk to it through a [`TunnelHandle`]
//! over mpsc channels. No session state is shared between tasks.
//!
//! The actor also:
//! - retransmits initiations per [`RetryPolicy`], each time with a fresh session
//! - stores cookies and retries immediately when a responder is under load
//! - rekeys (initiator) and answers rekey initiations (responder)
//! - sends persistent and passive keepalives

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use tai64::Tai64N;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::config::TunnelConfig;
use crate::crypto::noise::Role;
use crate::crypto::x25519::KeyPair;
use crate::error::{ConfigError, MalformedMessage, NetworkError, ProtocolError, Result};
use crate::protocol::cookie::CookieState;
use crate::protocol::handshake::HandshakeSession;
use crate::protocol::messages::{
    CookieReply, HandshakeInitiation, HandshakeResponse, TransportData, WireMessage, DEFAULT_MTU,
    MAX_DATAGRAM_LEN,
};
use crate::protocol::peer::{Responder, ResponderOutcome};
use crate::protocol::session::{generate_index, PeerSessions, RetryPolicy, SessionTimers};

/// How often the actor checks its timers
const TIMER_TICK: Duration = Duration::from_millis(250);

/// Tunnel behaviour knobs
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub retry: RetryPolicy,
    pub timers: SessionTimers,
    /// Send a keepalive whenever nothing was sent for this long
    pub persistent_keepalive: Option<Duration>,
    /// Largest plaintext accepted for sending and receiving
    pub mtu: usize,
    /// Depth of the command and delivery queues; payloads arriving while
    /// the delivery queue is full are dropped
    pub queue_depth: usize,
}

impl EndpointOptions {
    /// Persistent keepalive interval, treating zero as off
    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.persistent_keepalive.filter(|every| !every.is_zero())
    }
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timers: SessionTimers::default(),
            persistent_keepalive: None,
            mtu: DEFAULT_MTU,
            queue_depth: 256,
        }
    }
}

/// The remote side an initiator connects to
#[derive(Clone)]
pub struct PeerTarget {
    pub public_key: [u8; 32],
    pub preshared_key: Option<[u8; 32]>,
    pub addr: SocketAddr,
}

impl std::fmt::Debug for PeerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTarget")
            .field("public_key", &&self.public_key[..8])
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// Who the tunnel ended up talking to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub public_key: [u8; 32],
    pub addr: SocketAddr,
}

enum Command {
    Send {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Caller's side of a running tunnel
#[derive(Debug)]
pub struct TunnelHandle {
    commands: mpsc::Sender<Command>,
    incoming: mpsc::Receiver<Vec<u8>>,
    peer: PeerInfo,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send { payload, .. } => write!(f, "Send({} bytes)", payload.len()),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl TunnelHandle {
    pub fn peer(&self) -> PeerInfo {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Encrypt and send a payload to the peer
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Send {
                payload: payload.to_vec(),
                reply,
            })
            .await
            .map_err(|_| NetworkError::TunnelClosed)?;
        response.await.map_err(|_| NetworkError::TunnelClosed)?
    }

    /// Next decrypted payload from the peer, or `None` once the tunnel stops
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.incoming.recv().await
    }

    /// Stop the actor and wipe its sessions
    pub async fn shutdown(self) -> Result<()> {
        // The actor may already be gone
        let _ = self.commands.send(Command::Shutdown).await;
        self.task.await.map_err(|e| NetworkError::ReceiveFailed {
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

/// Bind a UDP socket for an endpoint
pub async fn bind(addr: SocketAddr) -> Result<UdpSocket> {
    UdpSocket::bind(addr).await.map_err(|e| {
        NetworkError::BindFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Handshake with `peer` as initiator and return the running tunnel
pub async fn connect(
    socket: UdpSocket,
    identity: Arc<KeyPair>,
    peer: PeerTarget,
    options: EndpointOptions,
) -> Result<TunnelHandle> {
    tracing::info!("Connecting to {}", peer.addr);
    let actor = |ready, incoming| TunnelActor {
        role: Role::Initiator,
        identity,
        peer_public: Some(peer.public_key),
        preshared_key: peer.preshared_key,
        peer_addr: Some(peer.addr),
        responder: None,
        sessions: PeerSessions::with_timers(options.timers),
        cookies: CookieState::new(),
        options: options.clone(),
        incoming,
        ready: Some(ready),
        socket,
    };
    spawn(actor, &options).await
}

/// Wait for a valid initiation from one of the responder's peers
pub async fn accept(
    socket: UdpSocket,
    responder: Responder,
    options: EndpointOptions,
) -> Result<TunnelHandle> {
    tracing::info!(
        "Waiting for initiations on {:?} ({} peers)",
        socket.local_addr().ok(),
        responder.peer_count()
    );
    let actor = |ready, incoming| TunnelActor {
        role: Role::Responder,
        identity: Arc::clone(responder.identity()),
        peer_public: None,
        preshared_key: None,
        peer_addr: None,
        responder: Some(responder),
        sessions: PeerSessions::with_timers(options.timers),
        cookies: CookieState::new(),
        options: options.clone(),
        incoming,
        ready: Some(ready),
        socket,
    };
    spawn(actor, &options).await
}

/// Connect to the first peer of a tunnel configuration
pub async fn connect_with_config(config: &TunnelConfig) -> Result<TunnelHandle> {
    config.validate()?;
    let peer = config.peers.first().ok_or_else(|| ConfigError::MissingField {
        field: "[Peer] section".to_string(),
    })?;
    let endpoint = peer.endpoint.as_ref().ok_or(NetworkError::NoEndpoint)?;
    let addr = endpoint.resolve().await?;

    let bind_addr: SocketAddr = match addr {
        SocketAddr::V4(_) => ([0, 0, 0, 0], config.interface.listen_port.unwrap_or(0)).into(),
        SocketAddr::V6(_) => (
            [0u16; 8],
            config.interface.listen_port.unwrap_or(0),
        )
            .into(),
    };
    let socket = bind(bind_addr).await?;

    let options = EndpointOptions {
        persistent_keepalive: peer
            .persistent_keepalive
            .filter(|&secs| secs > 0)
            .map(|secs| Duration::from_secs(secs.into())),
        mtu: config.mtu().into(),
        ..EndpointOptions::default()
    };
    let target = PeerTarget {
        public_key: peer.public_key,
        preshared_key: peer.preshared_key,
        addr,
    };

    let identity = Arc::new(KeyPair::from_private(config.interface.private_key));
    connect(socket, identity, target, options).await
}

async fn spawn<F>(build: F, options: &EndpointOptions) -> Result<TunnelHandle>
where
    F: FnOnce(oneshot::Sender<Result<PeerInfo>>, mpsc::Sender<Vec<u8>>) -> TunnelActor,
{
    let (command_tx, command_rx) = mpsc::channel(options.queue_depth);
    let (incoming_tx, incoming_rx) = mpsc::channel(options.queue_depth);
    let (ready_tx, ready_rx) = oneshot::channel();

    let actor = build(ready_tx, incoming_tx);
    let local_addr = actor.socket.local_addr()?;
    let task = tokio::spawn(actor.run(command_rx));

    let peer = match ready_rx.await {
        Ok(result) => result?,
        Err(_) => return Err(NetworkError::TunnelClosed.into()),
    };

    Ok(TunnelHandle {
        commands: command_tx,
        incoming: incoming_rx,
        peer,
        local_addr,
        task,
    })
}

/// Task that owns one peer's sessions
struct TunnelActor {
    socket: UdpSocket,
    role: Role,
    identity: Arc<KeyPair>,
    peer_public: Option<[u8; 32]>,
    preshared_key: Option<[u8; 32]>,
    peer_addr: Option<SocketAddr>,
    responder: Option<Responder>,
    sessions: PeerSessions,
    cookies: CookieState,
    options: EndpointOptions,
    incoming: mpsc::Sender<Vec<u8>>,
    ready: Option<oneshot::Sender<Result<PeerInfo>>>,
}

impl TunnelActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        if self.role == Role::Initiator {
            if let Err(e) = self.start_handshake(1).await {
                self.finish(Err(e));
                return;
            }
        }

        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let mut timers = interval(TIMER_TICK);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Send { payload, reply }) => {
                            // The caller may have stopped waiting
                            let _ = reply.send(self.send_data(&payload).await);
                        }
                        Some(Command::Shutdown) | None => {
                            tracing::info!("Tunnel shutting down");
                            break;
                        }
                    }
                }

                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => {
                            if let Err(e) = self.handle_datagram(&buf[..len], from).await {
                                tracing::debug!("Dropped datagram from {}: {}", from, e);
                            }
                        }
                        Err(e) => {
                            tracing::warn!("UDP recv error: {}", e);
                        }
                    }
                }

                _ = timers.tick() => {
                    if let Err(e) = self.on_timer().await {
                        tracing::warn!("Tunnel stopped: {}", e);
                        self.finish(Err(e));
                        break;
                    }
                }
            }
        }

        self.sessions.clear();
    }

    /// Report the first outcome to whoever is waiting in connect/accept
    fn finish(&mut self, result: Result<PeerInfo>) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(result);
        }
    }

    fn peer_info(&self) -> Option<PeerInfo> {
        Some(PeerInfo {
            public_key: self.peer_public?,
            addr: self.peer_addr?,
        })
    }

    async fn send_to_peer(&self, bytes: &[u8]) -> Result<()> {
        let addr = self.peer_addr.ok_or(NetworkError::NoEndpoint)?;
        self.socket
            .send_to(bytes, addr)
            .await
            .map_err(|e| NetworkError::SendFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn send_data(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.options.mtu {
            return Err(MalformedMessage::Oversized {
                limit: self.options.mtu,
                got: payload.len(),
            }
            .into());
        }
        self.send_transport(payload).await
    }

    async fn send_transport(&mut self, payload: &[u8]) -> Result<()> {
        let session = self.sessions.current_mut().ok_or(ProtocolError::NoSession)?;
        let packet = session.encrypt_packet(payload)?;
        self.send_to_peer(&packet.encode()).await?;
        self.sessions.mark_sent();
        Ok(())
    }

    /// Send a fresh initiation; every attempt uses a new session and index
    async fn start_handshake(&mut self, attempt: u32) -> Result<()> {
        let peer_public = self.peer_public.ok_or(ProtocolError::NoSession)?;
        let cookie = self.cookies.get_cookie().copied();

        let mut session = HandshakeSession::new_initiator(
            Arc::clone(&self.identity),
            peer_public,
            self.preshared_key,
            generate_index(),
        );
        let initiation =
            session.create_initiation_with(&mut OsRng, Tai64N::now(), cookie.as_ref())?;

        tracing::info!(
            "Sending handshake initiation (attempt {}/{})",
            attempt,
            self.options.retry.max_attempts
        );
        self.send_to_peer(&initiation.encode()).await?;
        self.sessions.set_pending(session, attempt);
        Ok(())
    }

    /// Retry after a failed attempt, or give up when attempts are exhausted
    async fn retry_handshake(&mut self, attempt: u32) -> Result<()> {
        let max_attempts = self.options.retry.max_attempts;
        if attempt >= max_attempts {
            tracing::warn!("Handshake gave up after {} attempts", max_attempts);
            if self.sessions.current().is_none() {
                return Err(ProtocolError::HandshakeTimeout {
                    attempts: max_attempts,
                }
                .into());
            }
            return Ok(());
        }
        self.start_handshake(attempt + 1).await
    }

    async fn on_timer(&mut self) -> Result<()> {
        self.sessions.expire();

        if self.role == Role::Initiator {
            if let Some(pending) = self.sessions.pending() {
                if pending.sent_at.elapsed() >= self.options.retry.retransmit_after {
                    let attempt = pending.attempt;
                    self.sessions.cancel_pending();
                    tracing::debug!("No handshake response, retransmitting");
                    self.retry_handshake(attempt).await?;
                }
            } else if self.sessions.needs_rekey() {
                tracing::info!("Session needs rekey, initiating new handshake...");
                self.start_handshake(1).await?;
            } else if self.sessions.current().is_none() && self.ready.is_none() {
                tracing::info!("Session expired, initiating new handshake...");
                self.start_handshake(1).await?;
            }
        }

        if self.sessions.current().is_some() {
            let persistent_due = self
                .options
                .keepalive_interval()
                .map_or(false, |every| self.sessions.idle_for(every));
            if persistent_due || self.sessions.owes_keepalive() {
                tracing::debug!("Sending keepalive");
                if let Err(e) = self.send_transport(&[]).await {
                    tracing::warn!("Keepalive error: {}", e);
                }
            }
        }

        Ok(())
    }

    async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) -> Result<()> {
        match WireMessage::decode_bounded(data, self.options.mtu)? {
            WireMessage::TransportData(packet) => self.handle_transport(packet, from).await,
            WireMessage::HandshakeResponse(response) => self.handle_response(response, from).await,
            WireMessage::CookieReply(reply) => self.handle_cookie_reply(reply).await,
            WireMessage::HandshakeInitiation(initiation) => {
                self.handle_initiation(initiation, from).await
            }
        }
    }

    async fn handle_transport(&mut self, packet: TransportData, from: SocketAddr) -> Result<()> {
        let session = self
            .sessions
            .find_by_index(packet.receiver_index)
            .ok_or(ProtocolError::InvalidReceiverIndex {
                index: packet.receiver_index,
            })?;
        let plaintext = session.decrypt_packet(&packet)?;

        if self.peer_addr != Some(from) {
            tracing::info!("Peer endpoint changed to {}", from);
            self.peer_addr = Some(from);
        }

        if plaintext.is_empty() {
            tracing::trace!("Received keepalive");
            return Ok(());
        }

        self.sessions.mark_received();
        // Never wait on the reader: a full queue drops the payload
        match self.incoming.try_send(plaintext) {
            Ok(()) => {}
            Err(TrySendError::Full(payload)) => {
                tracing::warn!("Receive queue full, dropping {} byte payload", payload.len());
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Receiver dropped, discarding payload");
            }
        }
        Ok(())
    }

    async fn handle_response(&mut self, response: HandshakeResponse, from: SocketAddr) -> Result<()> {
        if self.role != Role::Initiator {
            return Ok(());
        }
        let pending = self
            .sessions
            .take_pending(response.receiver_index)
            .ok_or(ProtocolError::InvalidReceiverIndex {
                index: response.receiver_index,
            })?;
        let attempt = pending.attempt;
        let mut session = pending.session;

        if let Err(e) = session.process_response(&response) {
            tracing::warn!("Handshake response rejected: {}", e);
            return self.retry_handshake(attempt).await;
        }

        self.peer_addr = Some(from);
        self.sessions.establish(session);

        // Confirm the new keys to the responder right away
        if let Err(e) = self.send_transport(&[]).await {
            tracing::warn!("Failed to confirm session: {}", e);
        }

        if let Some(peer) = self.peer_info() {
            self.finish(Ok(peer));
        }
        Ok(())
    }

    async fn handle_cookie_reply(&mut self, reply: CookieReply) -> Result<()> {
        let (Some(pending), Some(peer_public)) = (self.sessions.pending(), self.peer_public) else {
            return Ok(());
        };
        if pending.session.local_index() != reply.receiver_index {
            return Err(ProtocolError::InvalidReceiverIndex {
                index: reply.receiver_index,
            }
            .into());
        }
        let last_mac1 = *pending
            .session
            .last_mac1()
            .ok_or(ProtocolError::NoSession)?;
        let attempt = pending.attempt;

        self.cookies
            .process_cookie_reply(&reply, &last_mac1, &peer_public)?;
        tracing::info!("Received cookie, retrying handshake...");

        self.sessions.cancel_pending();
        self.retry_handshake(attempt).await
    }

    async fn handle_initiation(
        &mut self,
        initiation: HandshakeInitiation,
        from: SocketAddr,
    ) -> Result<()> {
        let Some(responder) = self.responder.as_mut() else {
            tracing::debug!("Ignoring initiation from {} (initiator endpoint)", from);
            return Ok(());
        };

        match responder.handle_initiation(&initiation, from)? {
            ResponderOutcome::Cookie(reply) => {
                self.socket
                    .send_to(&reply.encode(), from)
                    .await
                    .map_err(|e| NetworkError::SendFailed {
                        reason: e.to_string(),
                    })?;
                Ok(())
            }
            ResponderOutcome::Established {
                peer,
                response,
                session,
            } => {
                if self.peer_public.map_or(false, |bound| bound != peer) {
                    tracing::warn!("Ignoring initiation from a different peer at {}", from);
                    return Ok(());
                }

                self.peer_public = Some(peer);
                self.peer_addr = Some(from);
                self.send_to_peer(&response.encode()).await?;
                self.sessions.establish(session);

                if let Some(info) = self.peer_info() {
                    self.finish(Ok(info));
                }
                Ok(())
            }
        }
    }
}
