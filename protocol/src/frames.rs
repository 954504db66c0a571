//! Static frame tables and protocol constants shared by both ends
//!
//! A game frame on the wire is `[obfuscated opcode][optional 1-byte length
//! prefix][payload]`. Fixed-length opcodes carry no prefix; their payload
//! length comes from the table below, which the client and server must agree
//! on exactly.

/// Client revision both ends must declare
pub const SUPPORTED_REVISION: u32 = 317;

/// Opening opcode of the login handshake
pub const HANDSHAKE_OPCODE: u8 = 14;
/// Credential submission for a fresh login
pub const LOGIN_OPCODE_NEW: u8 = 16;
/// Credential submission when reconnecting after a drop
pub const LOGIN_OPCODE_RECONNECT: u8 = 18;
/// First byte of a well-formed opened credential blob
pub const CREDENTIAL_MAGIC: u8 = 10;

/// Inbound game opcodes the content layer understands
pub mod inbound {
    pub const IDLE: u8 = 0;
    pub const FOCUS_CHANGE: u8 = 3;
    pub const PUBLIC_CHAT: u8 = 4;
    pub const CAMERA_MOVE: u8 = 86;
    pub const COMMAND: u8 = 103;
    pub const REGION_LOADED: u8 = 121;
    pub const CLOSE_INTERFACE: u8 = 130;
    pub const WALK: u8 = 164;
    pub const BUTTON_CLICK: u8 = 185;
    pub const IDLE_LOGOUT: u8 = 202;
    pub const MOUSE_CLICK: u8 = 241;
    pub const MINIMAP_WALK: u8 = 248;
}

/// Outbound opcodes the server emits
pub mod outbound {
    pub const PLAYER_UPDATE: u8 = 81;
    pub const LOGOUT: u8 = 109;
    pub const SERVER_MESSAGE: u8 = 253;
}

/// Declared payload length of an inbound opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLength {
    /// Payload is exactly this many bytes
    Fixed(usize),
    /// Payload length arrives as a 1-byte prefix after the opcode
    VariableByte,
    /// No client we support sends this opcode
    Unassigned,
}

/// Looks up the declared payload length for an inbound opcode.
///
/// Unassigned opcodes still reach the decode loop (a desynced or hostile
/// client can send anything); the session logs and drops them.
pub fn inbound_length(opcode: u8) -> FrameLength {
    use FrameLength::*;
    match opcode {
        inbound::IDLE => Fixed(0),
        inbound::FOCUS_CHANGE => Fixed(1),
        inbound::PUBLIC_CHAT => VariableByte,
        inbound::CAMERA_MOVE => Fixed(4),
        inbound::COMMAND => VariableByte,
        inbound::REGION_LOADED => Fixed(0),
        inbound::CLOSE_INTERFACE => Fixed(0),
        inbound::WALK => VariableByte,
        inbound::BUTTON_CLICK => Fixed(2),
        inbound::IDLE_LOGOUT => Fixed(0),
        inbound::MOUSE_CLICK => Fixed(4),
        inbound::MINIMAP_WALK => VariableByte,
        // Opcodes sent by stock clients that this server ignores but must
        // still frame over: anti-cheat timings and window events.
        77 | 78 | 165 | 189 | 210 | 226 | 244 => VariableByte,
        36 => Fixed(4),
        246 => Fixed(6),
        _ => Unassigned,
    }
}

/// Declared payload length for an outbound opcode. Variable-length frames
/// get a 1-byte prefix written after the obfuscated opcode.
pub fn outbound_length(opcode: u8) -> FrameLength {
    use FrameLength::*;
    match opcode {
        outbound::PLAYER_UPDATE => VariableByte,
        outbound::SERVER_MESSAGE => VariableByte,
        outbound::LOGOUT => Fixed(0),
        _ => Unassigned,
    }
}

/// Status codes closing out a login attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginResponse {
    ExchangeKeys = 0,
    Success = 2,
    InvalidCredentials = 3,
    AccountOnline = 5,
    RevisionMismatch = 6,
    WorldFull = 7,
    LoginRejected = 11,
}

impl LoginResponse {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::ExchangeKeys),
            2 => Some(Self::Success),
            3 => Some(Self::InvalidCredentials),
            5 => Some(Self::AccountOnline),
            6 => Some(Self::RevisionMismatch),
            7 => Some(Self::WorldFull),
            11 => Some(Self::LoginRejected),
            _ => None,
        }
    }
}
