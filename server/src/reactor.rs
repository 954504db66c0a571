//! Readiness-driven network reactor
//!
//! One task owns the listener and every connected socket. Each iteration
//! makes bounded progress and never blocks on any single peer: at most
//! `accept_cap` accepts, one non-blocking read per connection, a drain of the
//! driver's command queue, one non-blocking write per connection, then a
//! sweep of timed-out and finished sessions. A slow or stalled peer costs one
//! `WouldBlock` per phase and nothing more.
//!
//! The reactor speaks to the tick driver only through channels: decoded
//! events flow out through `inbound`, frames and lifecycle orders flow back
//! through `commands`. The reactor never touches world state and the driver
//! never touches a socket.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use protocol::frames::LoginResponse;

use crate::gateway::{HostGateway, Verdict};
use crate::session::{
    CredentialVault, LoginRequest, PendingFrame, Session, SessionEvent, SessionId,
};
use crate::world::EntityId;

const READ_CHUNK: usize = 4096;

/// Decoded traffic flowing from the reactor to the tick driver
#[derive(Debug)]
pub enum InboundEvent {
    Frame(PendingFrame),
    Login {
        session: SessionId,
        request: LoginRequest,
    },
    SessionClosed {
        session: SessionId,
    },
}

/// Orders flowing from the tick driver back to the reactor
#[derive(Debug)]
pub enum ReactorCommand {
    /// Queue one game frame on a logged-in session
    Send {
        session: SessionId,
        opcode: u8,
        payload: Vec<u8>,
    },
    /// Login accepted: raw response block, then ciphered frames
    CompleteLogin {
        session: SessionId,
        entity: EntityId,
        response: Vec<u8>,
    },
    /// Login refused with the given status code
    RejectLogin {
        session: SessionId,
        code: LoginResponse,
    },
    /// Drop the session once its write buffer drains
    Disconnect { session: SessionId },
    /// Tick boundary marker; queued bytes should hit the sockets now
    Flush,
}

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Most sockets accepted in one iteration
    pub accept_cap: usize,
    /// Idle sessions past this are swept
    pub idle_timeout: Duration,
    /// Pause between iterations when nothing is ready
    pub wait: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            accept_cap: 16,
            idle_timeout: Duration::from_secs(30),
            wait: Duration::from_millis(10),
        }
    }
}

struct Connection {
    session: Session,
    stream: TcpStream,
}

pub struct Reactor {
    listener: TcpListener,
    connections: HashMap<SessionId, Connection>,
    next_session: SessionId,
    gateway: HostGateway,
    vault: Arc<dyn CredentialVault>,
    inbound: UnboundedSender<InboundEvent>,
    commands: UnboundedReceiver<ReactorCommand>,
    config: ReactorConfig,
    /// Set when the driver's command channel closes
    shutdown: bool,
}

impl Reactor {
    pub async fn bind(
        addr: SocketAddr,
        gateway: HostGateway,
        vault: Arc<dyn CredentialVault>,
        inbound: UnboundedSender<InboundEvent>,
        commands: UnboundedReceiver<ReactorCommand>,
        config: ReactorConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            connections: HashMap::new(),
            next_session: 1,
            gateway,
            vault,
            inbound,
            commands,
            config,
            shutdown: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Runs iterations until the driver hangs up
    pub async fn run(mut self) {
        let mut cadence = tokio::time::interval(self.config.wait);
        loop {
            cadence.tick().await;
            self.iterate().await;
            if self.shutdown {
                info!("command channel closed, reactor stopping");
                return;
            }
        }
    }

    /// One full reactor pass. Public so tests can drive it deterministically.
    pub async fn iterate(&mut self) {
        self.accept_phase().await;
        self.read_phase();
        self.command_phase();
        self.write_phase();
        self.sweep_phase();
    }

    /// Accepts at most `accept_cap` pending sockets, polling the listener
    /// exactly once per accept so an empty backlog costs one `Pending`.
    async fn accept_phase(&mut self) {
        for _ in 0..self.config.accept_cap {
            let accepted = poll_fn(|cx| match self.listener.poll_accept(cx) {
                Poll::Ready(result) => Poll::Ready(Some(result)),
                Poll::Pending => Poll::Ready(None),
            })
            .await;

            match accepted {
                Some(Ok((stream, addr))) => self.admit(stream, addr),
                Some(Err(e)) => {
                    warn!("accept failed: {}", e);
                    break;
                }
                None => break,
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) {
        match self.gateway.check(addr.ip()) {
            Verdict::Allowed => {}
            verdict => {
                debug!("refusing {} ({:?})", addr, verdict);
                return; // socket dropped, closing it
            }
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", addr, e);
        }

        let id = self.next_session;
        self.next_session += 1;
        debug!("session {} connected from {}", id, addr);
        self.connections.insert(
            id,
            Connection {
                session: Session::new(id, addr),
                stream,
            },
        );
    }

    /// One non-blocking read per connection; decoded events go straight to
    /// the driver.
    fn read_phase(&mut self) {
        let mut buf = [0u8; READ_CHUNK];
        let inbound = &self.inbound;
        let vault = &*self.vault;

        for conn in self.connections.values_mut() {
            match conn.stream.try_read(&mut buf) {
                Ok(0) => {
                    debug!("session {}: peer closed", conn.session.id);
                    conn.session.disconnect();
                    conn.session.write_buffer.clear();
                }
                Ok(n) => match conn.session.on_bytes(&buf[..n], vault) {
                    Ok(events) => forward_events(inbound, conn.session.id, events),
                    Err(e) => {
                        warn!("session {}: {}", conn.session.id, e);
                        conn.session.disconnect();
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!("session {}: read failed: {}", conn.session.id, e);
                    conn.session.disconnect();
                    conn.session.write_buffer.clear();
                }
            }
        }
    }

    fn command_phase(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.apply(command),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.shutdown = true;
                    return;
                }
            }
        }
    }

    fn apply(&mut self, command: ReactorCommand) {
        match command {
            ReactorCommand::Send {
                session,
                opcode,
                payload,
            } => {
                if let Some(conn) = self.connections.get_mut(&session) {
                    conn.session.queue_frame(opcode, &payload);
                }
            }
            ReactorCommand::CompleteLogin {
                session,
                entity,
                response,
            } => {
                if let Some(conn) = self.connections.get_mut(&session) {
                    conn.session.complete_login(entity, &response);
                    // Frames the client pipelined behind its credential
                    // block are already buffered; decode them now that the
                    // stage allows it instead of waiting for the next read.
                    match conn.session.on_bytes(&[], &*self.vault) {
                        Ok(events) => forward_events(&self.inbound, session, events),
                        Err(e) => {
                            warn!("session {}: {}", session, e);
                            conn.session.disconnect();
                        }
                    }
                }
            }
            ReactorCommand::RejectLogin { session, code } => {
                if let Some(conn) = self.connections.get_mut(&session) {
                    conn.session.reject_login(code);
                }
            }
            ReactorCommand::Disconnect { session } => {
                if let Some(conn) = self.connections.get_mut(&session) {
                    conn.session.disconnect();
                }
            }
            // Writes happen unconditionally in the write phase; the marker
            // exists so the driver can force an iteration's worth of output
            // without waiting for traffic.
            ReactorCommand::Flush => {}
        }
    }

    /// One non-blocking write per connection with pending output. A partial
    /// write keeps the remainder buffered for the next pass.
    fn write_phase(&mut self) {
        for conn in self.connections.values_mut() {
            if !conn.session.has_pending_writes() {
                continue;
            }
            match conn.stream.try_write(&conn.session.write_buffer) {
                Ok(n) => {
                    conn.session.write_buffer.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!("session {}: write failed: {}", conn.session.id, e);
                    conn.session.disconnect();
                    conn.session.write_buffer.clear();
                }
            }
        }
    }

    /// Times out idle sessions, then removes every disconnected session
    /// whose output has fully drained.
    fn sweep_phase(&mut self) {
        self.gateway.prune();

        let timeout = self.config.idle_timeout;
        for conn in self.connections.values_mut() {
            if conn.session.stage != crate::session::Stage::Disconnected
                && conn.session.is_timed_out(timeout)
            {
                warn!("session {}: idle timeout", conn.session.id);
                conn.session.disconnect();
                conn.session.write_buffer.clear();
            }
        }

        let finished: Vec<SessionId> = self
            .connections
            .iter()
            .filter(|(_, conn)| {
                conn.session.stage == crate::session::Stage::Disconnected
                    && !conn.session.has_pending_writes()
            })
            .map(|(&id, _)| id)
            .collect();

        for id in finished {
            if let Some(conn) = self.connections.remove(&id) {
                self.gateway.release(conn.session.addr.ip());
                debug!("session {} torn down", id);
                let _ = self.inbound.send(InboundEvent::SessionClosed { session: id });
            }
        }
    }
}

fn forward_events(
    inbound: &UnboundedSender<InboundEvent>,
    session: SessionId,
    events: Vec<SessionEvent>,
) {
    for event in events {
        let event = match event {
            SessionEvent::Frame(frame) => InboundEvent::Frame(frame),
            SessionEvent::Login(request) => InboundEvent::Login { session, request },
        };
        let _ = inbound.send(event);
    }
}
