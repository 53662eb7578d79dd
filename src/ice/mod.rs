//! Threaded ICE agent.
//!
//! One [`Agent`] runs a dedicated thread that owns the sockets of all its streams,
//! drives the connectivity checks and runs queued tasks. Streams are numbered from 1
//! and each has a number of components, each with its own check list.

#![allow(clippy::new_without_default)]
#![allow(clippy::bool_to_int_with_if)]

use std::fmt;
use std::io;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod agent;
pub use agent::{Agent, AgentConfig, AgentEvent, AgentHandler};
pub use agent::{DataCallback, LocalCandidate, WeakAgent};

mod candidate;
pub use candidate::{Candidate, CandidateKind};

mod checklist;
mod gather;
mod id;
mod pair;
mod sha1;
mod stun;

use id::Id;

/// Errors from the ICE agent.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum IceError {
    #[error("ICE bad candidate: {0}")]
    BadCandidate(String),

    #[error("ICE unknown stream: {0}")]
    UnknownStream(u32),

    #[error("ICE unknown component {1} in stream {0}")]
    UnknownComponent(u32, u16),

    #[error("ICE no usable pair for stream {0} component {1}")]
    NotConnected(u32, u16),

    #[error("ICE agent is shut down")]
    Shutdown,

    #[error("ICE io: {0}")]
    Io(#[from] io::Error),
}

/// ICE dialect.
///
/// The dialects differ in how short term credentials are exchanged. In the
/// standard mode they are per stream, in the others every candidate carries its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Compatibility {
    /// RFC 5245 (ICE draft 19).
    #[default]
    Rfc5245,
    /// Google Talk.
    Google,
    /// MSN Messenger.
    Msn,
    /// Office Communicator 2007.
    Oc2007,
}

impl Compatibility {
    /// Whether credentials are per stream (as opposed to per candidate).
    pub fn is_rfc(&self) -> bool {
        *self == Compatibility::Rfc5245
    }
}

/// State of one component of an agent stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentState {
    /// No activity yet.
    Disconnected,
    /// Gathering local candidates.
    Gathering,
    /// Checking candidate pairs.
    Connecting,
    /// At least one pair works.
    Connected,
    /// A pair is nominated and used.
    Ready,
    /// No pair can work.
    Failed,
}

/// Short term credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IceCreds {
    /// Username fragment.
    pub ufrag: String,
    /// Password.
    pub pass: String,
}

impl IceCreds {
    /// Creates a new instance of `IceCreds` with random values for the username fragment and password.
    pub fn new() -> Self {
        // The values MUST be unguessable, with at least 128 bits of
        // random number generator output used to generate the password, and
        // at least 24 bits of output to generate the username fragment.
        let ufrag = Id::<4>::random().to_string();
        let pass = Id::<22>::random().to_string();
        IceCreds { ufrag, pass }
    }
}

/// An outgoing datagram.
pub struct Transmit {
    /// Local socket to send from.
    pub source: SocketAddr,
    /// Where to send it.
    pub destination: SocketAddr,
    /// The data.
    pub contents: Vec<u8>,
}

impl fmt::Debug for Transmit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transmit")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("len", &self.contents.len())
            .finish()
    }
}
