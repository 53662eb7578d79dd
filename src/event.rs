//! Messages posted on the conference bus.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::candidate::Candidate;
use crate::codec::Codec;
use crate::error::{ErrorKind, FsError};
use crate::id::{SessionId, StreamId};
use crate::transmitter::StreamState;

/// Object an error originates from.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    Conference,
    Session(SessionId),
    Stream(StreamId),
}

/// Events from the conference, its sessions and streams.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// An asynchronous error.
    Error {
        /// Originating object.
        src: EventSource,
        /// Error tag.
        code: ErrorKind,
        /// Error text.
        message: String,
    },

    /// A local candidate to be sent to the peer.
    NewLocalCandidate {
        /// The stream.
        stream: StreamId,
        /// The candidate, with credentials for ICE.
        candidate: Candidate,
    },

    /// The candidate pair used for a component changed.
    NewActiveCandidatePair {
        /// The stream.
        stream: StreamId,
        /// The local side.
        local: Candidate,
        /// The remote side.
        remote: Candidate,
    },

    /// All local candidates found so far have been sent as [`Event::NewLocalCandidate`].
    ///
    /// This comes exactly once per stream transmitter.
    LocalCandidatesPrepared {
        /// The stream.
        stream: StreamId,
    },

    /// A component changed state.
    ComponentStateChanged {
        /// The stream.
        stream: StreamId,
        /// The component, from 1.
        component: u16,
        /// The new state.
        state: StreamState,
    },

    /// The session started sending with another codec.
    SendCodecChanged {
        /// The session.
        session: SessionId,
        /// The codec now sent.
        codec: Codec,
        /// Codecs enabled alongside, like telephone-event.
        secondary_codecs: Vec<Codec>,
    },

    /// The negotiated codecs changed. Read them with [`crate::Session::codecs()`].
    CodecsChanged {
        /// The session.
        session: SessionId,
    },

    /// The codecs the session can receive changed.
    RecvCodecsChanged {
        /// The session.
        session: SessionId,
        /// The codecs.
        codecs: Vec<Codec>,
    },
}

impl Event {
    /// The structure name of the message.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Error { .. } => "farstream-error",
            Event::NewLocalCandidate { .. } => "farstream-new-local-candidate",
            Event::NewActiveCandidatePair { .. } => "farstream-new-active-candidate-pair",
            Event::LocalCandidatesPrepared { .. } => "farstream-local-candidates-prepared",
            Event::ComponentStateChanged { .. } => "farstream-component-state-changed",
            Event::SendCodecChanged { .. } => "farstream-send-codec-changed",
            Event::CodecsChanged { .. } => "farstream-codecs-changed",
            Event::RecvCodecsChanged { .. } => "farstream-recv-codecs-changed",
        }
    }

    pub(crate) fn error(src: EventSource, err: &FsError) -> Event {
        Event::Error {
            src,
            code: err.kind(),
            message: err.message().to_string(),
        }
    }
}

/// The message bus of a conference.
///
/// All clones share the same queue. Posting never blocks.
#[derive(Debug, Clone)]
pub struct Bus {
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

impl Bus {
    pub(crate) fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Bus { tx, rx }
    }

    pub(crate) fn post(&self, event: Event) {
        trace!("Post {}: {:?}", event.name(), event);
        // The bus owns a receiver, the send can't fail.
        let _ = self.tx.send(event);
    }

    /// Take the next event, if any.
    pub fn pop(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.rx.recv_timeout(timeout) {
            Ok(v) => Some(v),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Wait for an event matching `f`, dropping the others.
    pub fn wait_for(&self, timeout: Duration, mut f: impl FnMut(&Event) -> bool) -> Option<Event> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            let ev = self.recv_timeout(left)?;
            if f(&ev) {
                return Some(ev);
            }
        }
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether there are no queued events.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
