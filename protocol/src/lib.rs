//! Wire-level primitives shared by the server and by test clients.
//!
//! This crate is deliberately free of I/O and async code. It contains the
//! byte/bit packet codec, the ISAAC stream cipher pair used to obfuscate
//! opcodes, and the static frame tables both ends of the connection agree on.

pub mod cipher;
pub mod codec;
pub mod frames;

pub use cipher::{CipherPair, Isaac};
pub use codec::{CodecError, Reader, Writer};
pub use frames::{FrameLength, LoginResponse};
