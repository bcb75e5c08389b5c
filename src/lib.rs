//! The networked protocol engine for the Palisade board game.
//!
//! Every participant of a game — human client, AI client, game server,
//! admin console, metaserver — talks the same private, line-oriented
//! text protocol. This crate is the engine they all share: the
//! asynchronous connection layer, the listening endpoint, the
//! stack-based protocol dispatcher, and the compact line format that
//! carries game commands. Board geometry, game rules, AI decisions,
//! and all GUI code live elsewhere and consume this crate through its
//! handler traits.
//!
//! # Organization
//! - [`codec`] encodes and decodes game values to and from wire lines
//! - [`Session`] frames one connection into lines and tracks liveness
//! - [`Service`] accepts inbound connections and spawns Sessions
//! - [`Machine`] dispatches events and lines through a stack of
//!   [`State`]s, one machine per logical actor
//! - [`Shutdown`] coordinates stopping several endpoints at once
//!
//! # Structure of a participant
//!
//! A client creates a [`Machine`], gives it states for each protocol
//! phase, and calls [`Machine::connect`]. A server calls
//! [`Service::listen`] with an [`Acceptor`] that builds a machine per
//! accepted connection. From then on everything is event-driven: lines
//! arrive in order, the current state decodes them with
//! [`Machine::recv`], transitions with push/pop/goto, and replies
//! through the attached session.

pub mod codec;

pub mod machine;
pub use machine::{Event, Machine, MachineDriver, State};

pub mod service;
pub use service::{Acceptor, Service, StopMode};

pub mod session;
pub use session::{Session, SessionHandler};

pub mod shutdown;
pub use shutdown::Shutdown;

/// Version of the wire protocol. Participants exchange it during their
/// opening handshake and refuse to talk across versions.
pub const PROTOCOL_VERSION: u32 = 14;
