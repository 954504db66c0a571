//! Per-connection protocol state machine
//!
//! A session owns the read/write buffers for one socket and nothing else;
//! the reactor owns the socket itself. Bytes go in through [`Session::on_bytes`]
//! and come out as fully-framed [`PendingFrame`]s or a [`LoginRequest`],
//! regardless of how the bytes were split across reads.
//!
//! Stage progression is monotonic: `Connected` (awaiting the opening
//! handshake opcode) to `AwaitingCredentials` (nonce issued, waiting for the
//! credential block) to `LoggedIn` (cipher pair installed, game frames
//! flowing) with `Disconnected` terminal from any stage.
//!
//! The decode cursor is the part that makes non-blocking reads safe: a
//! partially-received frame parks its opcode and declared length in the
//! cursor, which survives until the payload is complete. The cursor is reset
//! only when a frame completes or the connection drops.

use log::{debug, warn};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;

use protocol::cipher::CipherPair;
use protocol::codec::{CodecError, Reader};
use protocol::frames::{
    self, inbound_length, outbound_length, FrameLength, LoginResponse, CREDENTIAL_MAGIC,
    HANDSHAKE_OPCODE, LOGIN_OPCODE_NEW, LOGIN_OPCODE_RECONNECT,
};

use crate::world::EntityId;

pub type SessionId = u64;

/// Largest payload a variable-length outbound frame can carry
const MAX_VARIABLE_PAYLOAD: usize = 255;

/// Protocol-level failures; all of them are fatal for the session only
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake violation: {0}")]
    Handshake(&'static str),
    #[error("protocol desync: {0}")]
    Desync(&'static str),
    #[error("malformed credential block: {0}")]
    Codec(#[from] CodecError),
}

/// Opens the sealed credential blob inside the login block. The production
/// implementation wraps the launcher's asymmetric key; the default is the
/// development pass-through.
pub trait CredentialVault: Send + Sync {
    fn open(&self, sealed: &[u8]) -> Option<Vec<u8>>;
}

/// Treats the sealed blob as plaintext
pub struct PassthroughVault;

impl CredentialVault for PassthroughVault {
    fn open(&self, sealed: &[u8]) -> Option<Vec<u8>> {
        Some(sealed.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connected,
    AwaitingCredentials,
    LoggedIn,
    Disconnected,
}

/// Partial-frame state carried across non-blocking reads
#[derive(Debug, Default)]
struct DecodeCursor {
    opcode: Option<u8>,
    length: Option<usize>,
}

/// One complete inbound game frame awaiting application by the tick driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFrame {
    pub session: SessionId,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// Parsed credential block, handed to the driver for validation
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub revision: u32,
    pub low_memory: bool,
    pub seed: [u32; 4],
    pub uid: u32,
    pub username: String,
    pub password: String,
    pub reconnecting: bool,
}

/// What one decode pass produced
pub enum SessionEvent {
    Frame(PendingFrame),
    Login(LoginRequest),
}

enum Step {
    /// Not enough buffered bytes; wait for the next readiness event
    Blocked,
    /// Made progress without producing an event
    Advanced,
    Emit(SessionEvent),
}

pub struct Session {
    pub id: SessionId,
    pub addr: SocketAddr,
    pub stage: Stage,
    pub write_buffer: Vec<u8>,
    /// Set after login completes; index into the world's slot table
    pub bound_entity: Option<EntityId>,
    pub last_read: Instant,
    read_buffer: Vec<u8>,
    cursor: DecodeCursor,
    cipher: Option<CipherPair>,
    /// Login-window nonce issued in the handshake reply; the credential
    /// block must echo it as the server half of the seed
    nonce: Option<u64>,
    /// A credential block has been forwarded and the driver has not yet
    /// promoted or rejected the session
    login_pending: bool,
}

impl Session {
    pub fn new(id: SessionId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            stage: Stage::Connected,
            write_buffer: Vec::new(),
            bound_entity: None,
            last_read: Instant::now(),
            read_buffer: Vec::new(),
            cursor: DecodeCursor::default(),
            cipher: None,
            nonce: None,
            login_pending: false,
        }
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_read.elapsed() > timeout
    }

    /// Feeds freshly-read bytes through the state machine, producing every
    /// event that is now complete. Incomplete trailing data stays buffered.
    pub fn on_bytes(
        &mut self,
        data: &[u8],
        vault: &dyn CredentialVault,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        self.last_read = Instant::now();
        self.read_buffer.extend_from_slice(data);

        let mut events = Vec::new();
        loop {
            let step = match self.stage {
                Stage::Disconnected => {
                    self.read_buffer.clear();
                    break;
                }
                Stage::Connected => self.try_handshake()?,
                Stage::AwaitingCredentials => {
                    if self.login_pending {
                        Step::Blocked
                    } else {
                        self.try_credentials(vault)?
                    }
                }
                Stage::LoggedIn => self.try_frame()?,
            };

            match step {
                Step::Blocked => break,
                Step::Advanced => continue,
                Step::Emit(event) => events.push(event),
            }
        }
        Ok(events)
    }

    /// Connected: expect the opening opcode plus the client's name hash,
    /// reply with a status byte and the login-window nonce.
    fn try_handshake(&mut self) -> Result<Step, SessionError> {
        if self.read_buffer.len() < 2 {
            return Ok(Step::Blocked);
        }
        if self.read_buffer[0] != HANDSHAKE_OPCODE {
            return Err(SessionError::Handshake("unexpected opening opcode"));
        }
        self.read_buffer.drain(..2);

        let nonce: u64 = rand::random();
        self.nonce = Some(nonce);
        self.write_buffer.push(LoginResponse::ExchangeKeys.as_u8());
        self.write_buffer.extend_from_slice(&nonce.to_be_bytes());

        self.stage = Stage::AwaitingCredentials;
        debug!("session {}: handshake complete, nonce issued", self.id);
        Ok(Step::Advanced)
    }

    /// AwaitingCredentials: a login opcode, a 1-byte block length, then the
    /// credential block itself. Nothing is consumed until the whole block is
    /// buffered.
    fn try_credentials(&mut self, vault: &dyn CredentialVault) -> Result<Step, SessionError> {
        if self.read_buffer.len() < 2 {
            return Ok(Step::Blocked);
        }
        let opcode = self.read_buffer[0];
        let reconnecting = match opcode {
            LOGIN_OPCODE_NEW => false,
            LOGIN_OPCODE_RECONNECT => true,
            _ => {
                self.reject_login(LoginResponse::LoginRejected);
                return Err(SessionError::Handshake("unexpected login opcode"));
            }
        };

        let block_len = self.read_buffer[1] as usize;
        if self.read_buffer.len() < 2 + block_len {
            return Ok(Step::Blocked);
        }
        let block: Vec<u8> = self.read_buffer.drain(..2 + block_len).skip(2).collect();

        match self.parse_credentials(&block, reconnecting, vault) {
            Ok(request) => {
                self.cipher = Some(CipherPair::server(&request.seed));
                self.login_pending = true;
                debug!("session {}: credential block accepted", self.id);
                Ok(Step::Emit(SessionEvent::Login(request)))
            }
            Err(e) => {
                self.reject_login(LoginResponse::LoginRejected);
                Err(e)
            }
        }
    }

    fn parse_credentials(
        &self,
        block: &[u8],
        reconnecting: bool,
        vault: &dyn CredentialVault,
    ) -> Result<LoginRequest, SessionError> {
        let mut reader = Reader::new(block);
        let revision = reader.read_u32()?;
        let low_memory = reader.read_u8()? == 1;
        let sealed_len = reader.read_u16()? as usize;
        let sealed = reader.read_bytes(sealed_len)?;

        let opened = vault
            .open(sealed)
            .ok_or(SessionError::Desync("credential blob failed to open"))?;
        let mut reader = Reader::new(&opened);

        if reader.read_u8()? != CREDENTIAL_MAGIC {
            return Err(SessionError::Desync("bad credential magic"));
        }
        let seed = [
            reader.read_u32()?,
            reader.read_u32()?,
            reader.read_u32()?,
            reader.read_u32()?,
        ];
        let nonce = self.nonce.ok_or(SessionError::Desync("no nonce issued"))?;
        if seed[2] != (nonce >> 32) as u32 || seed[3] != nonce as u32 {
            return Err(SessionError::Desync("server seed half mismatch"));
        }
        let uid = reader.read_u32()?;
        let username = reader.read_cstring()?;
        let password = reader.read_cstring()?;

        Ok(LoginRequest {
            revision,
            low_memory,
            seed,
            uid,
            username,
            password,
            reconnecting,
        })
    }

    /// LoggedIn: the readiness-driven frame decode loop. The cursor keeps
    /// opcode and declared length across calls so a frame split over any
    /// number of reads still comes out exactly once.
    fn try_frame(&mut self) -> Result<Step, SessionError> {
        let opcode = match self.cursor.opcode {
            Some(opcode) => opcode,
            None => {
                if self.read_buffer.is_empty() {
                    return Ok(Step::Blocked);
                }
                let wire = self.read_buffer[0];
                let cipher = self
                    .cipher
                    .as_mut()
                    .ok_or(SessionError::Desync("logged in without cipher pair"))?;
                let opcode = cipher.decode.decode_opcode(wire);
                self.cursor.opcode = Some(opcode);
                self.read_buffer.drain(..1);
                opcode
            }
        };

        let length = match self.cursor.length {
            Some(length) => length,
            None => {
                let length = match inbound_length(opcode) {
                    FrameLength::Fixed(n) => n,
                    FrameLength::VariableByte => {
                        // Length prefix not here yet: consume nothing, keep
                        // the cursor, wait for more data.
                        if self.read_buffer.is_empty() {
                            return Ok(Step::Blocked);
                        }
                        let prefix = self.read_buffer[0] as usize;
                        self.read_buffer.drain(..1);
                        prefix
                    }
                    FrameLength::Unassigned => {
                        warn!(
                            "session {}: unassigned opcode {}, dropping",
                            self.id, opcode
                        );
                        0
                    }
                };
                self.cursor.length = Some(length);
                length
            }
        };
        if self.read_buffer.len() < length {
            return Ok(Step::Blocked);
        }

        let payload: Vec<u8> = self.read_buffer.drain(..length).collect();
        self.cursor = DecodeCursor::default();

        if inbound_length(opcode) == FrameLength::Unassigned {
            return Ok(Step::Advanced);
        }
        Ok(Step::Emit(SessionEvent::Frame(PendingFrame {
            session: self.id,
            opcode,
            payload,
        })))
    }

    /// Appends one outgoing frame, obfuscating the opcode with the encode
    /// keystream. Only valid once logged in.
    pub fn queue_frame(&mut self, opcode: u8, payload: &[u8]) {
        if self.stage != Stage::LoggedIn {
            return;
        }
        let cipher = match self.cipher.as_mut() {
            Some(cipher) => cipher,
            None => return,
        };
        match outbound_length(opcode) {
            FrameLength::Fixed(expected) => {
                if payload.len() != expected {
                    warn!(
                        "session {}: dropping outbound opcode {} with wrong length {}",
                        self.id,
                        opcode,
                        payload.len()
                    );
                    return;
                }
                self.write_buffer.push(cipher.encode.encode_opcode(opcode));
            }
            FrameLength::VariableByte => {
                if payload.len() > MAX_VARIABLE_PAYLOAD {
                    warn!(
                        "session {}: dropping oversized outbound opcode {} ({} bytes)",
                        self.id,
                        opcode,
                        payload.len()
                    );
                    return;
                }
                self.write_buffer.push(cipher.encode.encode_opcode(opcode));
                self.write_buffer.push(payload.len() as u8);
            }
            FrameLength::Unassigned => {
                warn!(
                    "session {}: refusing to send untabled opcode {}",
                    self.id, opcode
                );
                return;
            }
        }
        self.write_buffer.extend_from_slice(payload);
    }

    /// Driver accepted the login: send the raw success block and start
    /// decoding game frames.
    pub fn complete_login(&mut self, entity: EntityId, response: &[u8]) {
        if self.stage != Stage::AwaitingCredentials {
            return;
        }
        self.write_buffer.extend_from_slice(response);
        self.bound_entity = Some(entity);
        self.login_pending = false;
        self.stage = Stage::LoggedIn;
    }

    /// Login refused: send the rejection code and enter the terminal stage
    pub fn reject_login(&mut self, code: LoginResponse) {
        self.write_buffer.push(code.as_u8());
        self.disconnect();
    }

    /// Terminal; all further events for this session are no-ops
    pub fn disconnect(&mut self) {
        self.stage = Stage::Disconnected;
        self.read_buffer.clear();
        self.cursor = DecodeCursor::default();
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_buffer.is_empty()
    }
}

/// Builds the raw login success block sent before ciphered frames begin
pub fn login_success_block(rights: u8, entity_index: u16) -> Vec<u8> {
    let mut block = Vec::with_capacity(5);
    block.push(LoginResponse::Success.as_u8());
    block.push(rights);
    block.push(0); // flagged
    block.extend_from_slice(&entity_index.to_be_bytes());
    block
}

/// Client-side mirror of the credential block layout; shared with the
/// integration tests.
pub fn seal_credentials(
    revision: u32,
    seed: &[u32; 4],
    uid: u32,
    username: &str,
    password: &str,
) -> Vec<u8> {
    use protocol::codec::Writer;

    let mut sealed = Writer::new();
    sealed.put_u8(CREDENTIAL_MAGIC);
    for word in seed {
        sealed.put_u32(*word);
    }
    sealed.put_u32(uid);
    sealed.put_cstring(username);
    sealed.put_cstring(password);

    let mut block = Writer::new();
    block.put_u32(revision);
    block.put_u8(0); // low memory
    block.put_u16(sealed.len() as u16);
    block.put_bytes(sealed.as_bytes());

    let mut wire = Vec::with_capacity(block.len() + 2);
    wire.push(frames::LOGIN_OPCODE_NEW);
    wire.push(block.len() as u8);
    wire.extend_from_slice(block.as_bytes());
    wire
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::frames::{inbound, SUPPORTED_REVISION};

    fn test_addr() -> SocketAddr {
        "127.0.0.1:43594".parse().unwrap()
    }

    fn new_session() -> Session {
        Session::new(1, test_addr())
    }

    /// Runs the handshake and returns the client-side seed derived from the
    /// issued nonce.
    fn handshake(session: &mut Session) -> [u32; 4] {
        let events = session.on_bytes(&[HANDSHAKE_OPCODE, 0], &PassthroughVault).unwrap();
        assert!(events.is_empty());
        assert_eq!(session.stage, Stage::AwaitingCredentials);

        // Reply: status byte + 8-byte nonce
        assert_eq!(session.write_buffer.len(), 9);
        assert_eq!(session.write_buffer[0], LoginResponse::ExchangeKeys.as_u8());
        let mut nonce_bytes = [0u8; 8];
        nonce_bytes.copy_from_slice(&session.write_buffer[1..9]);
        let nonce = u64::from_be_bytes(nonce_bytes);
        session.write_buffer.clear();

        [0xAAAA_0001, 0xBBBB_0002, (nonce >> 32) as u32, nonce as u32]
    }

    fn login(session: &mut Session) -> (LoginRequest, CipherPair) {
        let seed = handshake(session);
        let wire = seal_credentials(SUPPORTED_REVISION, &seed, 7, "alice", "hunter2");
        let mut events = session.on_bytes(&wire, &PassthroughVault).unwrap();
        assert_eq!(events.len(), 1);
        let request = match events.remove(0) {
            SessionEvent::Login(request) => request,
            _ => panic!("expected login event"),
        };

        let entity = EntityId {
            index: 0,
            generation: 0,
        };
        session.complete_login(entity, &login_success_block(0, 1));
        assert_eq!(session.stage, Stage::LoggedIn);
        session.write_buffer.clear();

        (request, CipherPair::client(&seed))
    }

    /// Client-side framing helper
    fn frame(client: &mut CipherPair, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut wire = vec![client.encode.encode_opcode(opcode)];
        if inbound_length(opcode) == FrameLength::VariableByte {
            wire.push(payload.len() as u8);
        }
        wire.extend_from_slice(payload);
        wire
    }

    fn frames_of(events: Vec<SessionEvent>) -> Vec<PendingFrame> {
        events
            .into_iter()
            .map(|e| match e {
                SessionEvent::Frame(f) => f,
                _ => panic!("expected frame event"),
            })
            .collect()
    }

    #[test]
    fn test_handshake_issues_nonce() {
        let mut session = new_session();
        handshake(&mut session);
    }

    #[test]
    fn test_handshake_waits_for_both_bytes() {
        let mut session = new_session();
        let events = session.on_bytes(&[HANDSHAKE_OPCODE], &PassthroughVault).unwrap();
        assert!(events.is_empty());
        assert_eq!(session.stage, Stage::Connected);

        session.on_bytes(&[0], &PassthroughVault).unwrap();
        assert_eq!(session.stage, Stage::AwaitingCredentials);
    }

    #[test]
    fn test_bad_opening_opcode_is_fatal() {
        let mut session = new_session();
        assert!(session.on_bytes(&[99, 0], &PassthroughVault).is_err());
    }

    #[test]
    fn test_login_request_parsed() {
        let mut session = new_session();
        let (request, _) = login(&mut session);
        assert_eq!(request.username, "alice");
        assert_eq!(request.password, "hunter2");
        assert_eq!(request.revision, SUPPORTED_REVISION);
        assert_eq!(request.uid, 7);
        assert!(!request.reconnecting);
    }

    #[test]
    fn test_wrong_nonce_echo_rejected() {
        let mut session = new_session();
        handshake(&mut session);

        let bad_seed = [1, 2, 3, 4];
        let wire = seal_credentials(SUPPORTED_REVISION, &bad_seed, 0, "alice", "pw");
        assert!(session.on_bytes(&wire, &PassthroughVault).is_err());

        assert_eq!(session.stage, Stage::Disconnected);
        assert_eq!(
            session.write_buffer.last(),
            Some(&LoginResponse::LoginRejected.as_u8())
        );
    }

    #[test]
    fn test_fixed_frame_decode() {
        let mut session = new_session();
        let (_, mut client) = login(&mut session);

        let wire = frame(&mut client, inbound::BUTTON_CLICK, &[0x09, 0x9A]);
        let events = session.on_bytes(&wire, &PassthroughVault).unwrap();
        let frames = frames_of(events);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, inbound::BUTTON_CLICK);
        assert_eq!(frames[0].payload, vec![0x09, 0x9A]);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut session = new_session();
        let (_, mut client) = login(&mut session);

        let wire = frame(&mut client, inbound::WALK, &[1, 2, 3, 4, 5]);

        // Opcode only
        let events = session.on_bytes(&wire[..1], &PassthroughVault).unwrap();
        assert!(events.is_empty());

        // Length prefix and part of the payload
        let events = session.on_bytes(&wire[1..4], &PassthroughVault).unwrap();
        assert!(events.is_empty());

        // Rest of the payload: exactly one frame, exactly now
        let events = session.on_bytes(&wire[4..], &PassthroughVault).unwrap();
        let frames = frames_of(events);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut session = new_session();
        let (_, mut client) = login(&mut session);

        let mut wire = frame(&mut client, inbound::IDLE, &[]);
        wire.extend(frame(&mut client, inbound::BUTTON_CLICK, &[0, 1]));

        let events = session.on_bytes(&wire, &PassthroughVault).unwrap();
        let frames = frames_of(events);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].opcode, inbound::IDLE);
        assert_eq!(frames[1].opcode, inbound::BUTTON_CLICK);
    }

    #[test]
    fn test_unassigned_opcode_does_not_desync() {
        let mut session = new_session();
        let (_, mut client) = login(&mut session);

        // An opcode with no table entry, then a well-known frame
        let mut wire = frame(&mut client, 1, &[]);
        wire.extend(frame(&mut client, inbound::BUTTON_CLICK, &[7, 8]));

        let events = session.on_bytes(&wire, &PassthroughVault).unwrap();
        let frames = frames_of(events);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, inbound::BUTTON_CLICK);
        assert_eq!(frames[0].payload, vec![7, 8]);
    }

    #[test]
    fn test_tabled_but_unhandled_opcode_preserves_framing() {
        let mut session = new_session();
        let (_, mut client) = login(&mut session);

        // Opcode 36 is declared Fixed(4) but has no content handler; its
        // four payload bytes must be consumed so the next frame decodes.
        let mut wire = frame(&mut client, 36, &[9, 9, 9, 9]);
        wire.extend(frame(&mut client, inbound::IDLE, &[]));

        let events = session.on_bytes(&wire, &PassthroughVault).unwrap();
        let frames = frames_of(events);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].opcode, 36);
        assert_eq!(frames[1].opcode, inbound::IDLE);
    }

    #[test]
    fn test_frames_pipelined_behind_credentials() {
        let mut session = new_session();
        let seed = handshake(&mut session);

        // Credential block and a game frame arrive in the same read
        let mut client = CipherPair::client(&seed);
        let mut wire = seal_credentials(SUPPORTED_REVISION, &seed, 7, "alice", "pw");
        wire.push(client.encode.encode_opcode(inbound::BUTTON_CLICK));
        wire.extend_from_slice(&[0x09, 0x9A]);

        // Until the login is promoted only the login event comes out
        let events = session.on_bytes(&wire, &PassthroughVault).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SessionEvent::Login(_)));

        let entity = EntityId {
            index: 0,
            generation: 0,
        };
        session.complete_login(entity, &login_success_block(0, 1));

        // Promotion alone, with no further socket reads, releases the
        // parked frame.
        let events = session.on_bytes(&[], &PassthroughVault).unwrap();
        let frames = frames_of(events);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, inbound::BUTTON_CLICK);
        assert_eq!(frames[0].payload, vec![0x09, 0x9A]);
    }

    #[test]
    fn test_outbound_frame_obfuscation() {
        let mut session = new_session();
        let (_, mut client) = login(&mut session);

        session.queue_frame(frames::outbound::SERVER_MESSAGE, b"hey\0");

        // First byte decodes with the client's decode stream
        let opcode = client.decode.decode_opcode(session.write_buffer[0]);
        assert_eq!(opcode, frames::outbound::SERVER_MESSAGE);
        assert_eq!(session.write_buffer[1], 4); // length prefix
        assert_eq!(&session.write_buffer[2..], b"hey\0");
    }

    #[test]
    fn test_disconnected_is_terminal() {
        let mut session = new_session();
        let (_, mut client) = login(&mut session);
        session.disconnect();

        let wire = frame(&mut client, inbound::IDLE, &[]);
        let events = session.on_bytes(&wire, &PassthroughVault).unwrap();
        assert!(events.is_empty());

        session.queue_frame(frames::outbound::SERVER_MESSAGE, b"late\0");
        assert!(session.write_buffer.is_empty());
    }

    #[test]
    fn test_timeout_watch() {
        let mut session = new_session();
        assert!(!session.is_timed_out(Duration::from_secs(1)));

        session.last_read = Instant::now() - Duration::from_secs(2);
        assert!(session.is_timed_out(Duration::from_secs(1)));

        // Any successful read resets the watch
        session.on_bytes(&[], &PassthroughVault).unwrap();
        assert!(!session.is_timed_out(Duration::from_secs(1)));
    }
}
