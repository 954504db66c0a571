//! # World Server Library
//!
//! Authoritative server for the tick-based multiplayer world. All game state
//! lives here; clients submit intents over TCP and receive synchronized state
//! deltas back. A client can never assert a position, a chat line, or a
//! login - it can only ask, and the server decides.
//!
//! ## Architecture
//!
//! Two long-lived tasks and a channel pair between them:
//!
//! - The **reactor** ([`reactor`]) owns the listener and every socket. It
//!   runs short, bounded iterations: accept a capped batch, one non-blocking
//!   read per connection, apply driver commands, one non-blocking write per
//!   connection, sweep the dead. Protocol decoding happens here, in each
//!   connection's [`session`] state machine, so the driver only ever sees
//!   whole frames.
//! - The **driver** ([`driver`]) owns the [`world`] and advances it at a
//!   fixed period. Each tick drains the reactor's events, runs the
//!   [`scheduler`] pass, fans entity updates out over the [`pipeline`]'s
//!   worker threads behind a [`barrier`], and flushes.
//!
//! Admission control sits in front of everything ([`gateway`]): banned and
//! flooding addresses are dropped before a session exists for them.
//!
//! Frame formats, the byte/bit codec, and the keystream cipher live in the
//! `protocol` crate so tests and tools can speak the wire format without
//! linking the server.

pub mod barrier;
pub mod content;
pub mod driver;
pub mod gateway;
pub mod pipeline;
pub mod reactor;
pub mod scheduler;
pub mod session;
pub mod world;
