//! Transmitters move packets between the session and the network.
//!
//! A [`Transmitter`] exists once per session and transmitter kind. It owns the
//! network source and sink of the session. For every stream it makes a
//! [`StreamTransmitter`] that finds local candidates, takes the remote ones and
//! reports the connection state.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::candidate::Candidate;
use crate::config::{check_components, StreamTransmitterConfig};
use crate::error::FsError;
use crate::ice::ComponentState;
use crate::id::StreamId;
use crate::participant::Participant;
use crate::thread::InternalThreads;

mod endpoint;
pub use endpoint::{NetworkSink, NetworkSource, ReceivedPacket};
pub(crate) use endpoint::{OutputId, PacketOutput};

mod multicast;
mod nice;
mod rawudp;
mod shm;

pub use multicast::{MulticastStreamTransmitter, MulticastTransmitter};
pub use nice::{NiceStreamTransmitter, NiceTransmitter};
pub use rawudp::{RawUdpStreamTransmitter, RawUdpTransmitter};
pub use shm::{ShmStreamTransmitter, ShmTransmitter};

/// Connection state of one component of a stream.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Disconnected,
    Gathering,
    Connecting,
    Connected,
    Ready,
    Failed,
}

impl StreamState {
    /// Connected or ready.
    pub fn is_connected(&self) -> bool {
        matches!(self, StreamState::Connected | StreamState::Ready)
    }
}

impl From<ComponentState> for StreamState {
    fn from(v: ComponentState) -> Self {
        match v {
            ComponentState::Disconnected => StreamState::Disconnected,
            ComponentState::Gathering => StreamState::Gathering,
            ComponentState::Connecting => StreamState::Connecting,
            ComponentState::Connected => StreamState::Connected,
            ComponentState::Ready => StreamState::Ready,
            ComponentState::Failed => StreamState::Failed,
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Events from a [`StreamTransmitter`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum StreamTransmitterEvent {
    NewLocalCandidate(Candidate),
    LocalCandidatesPrepared,
    NewActiveCandidatePair { local: Candidate, remote: Candidate },
    StateChanged { component: u16, state: StreamState },
    /// The component is connected, the sender should start with a key unit.
    KeyUnitRequested { component: u16 },
    Error(FsError),
}

/// Receiver of [`StreamTransmitterEvent`].
///
/// Events are delivered without any transmitter lock held. For ICE they come from
/// the agent thread.
pub trait StreamTransmitterHandler: Send + Sync {
    /// Handle an event.
    fn handle_event(&self, event: StreamTransmitterEvent);
}

pub(crate) fn emit(handler: &Weak<dyn StreamTransmitterHandler>, event: StreamTransmitterEvent) {
    match handler.upgrade() {
        Some(h) => h.handle_event(event),
        None => trace!("Stream transmitter event without handler: {:?}", event),
    }
}

/// Parameters to build a transmitter.
#[derive(Debug, Clone)]
pub struct TransmitterParams {
    /// Number of components, 1..=255.
    pub components: u16,
    /// IP type of service.
    pub tos: u8,
    /// Timestamp received packets.
    pub do_timestamp: bool,
    /// Registry the transmitter threads enter.
    pub threads: InternalThreads,
}

impl TransmitterParams {
    /// Parameters with timestamps on and a new thread registry.
    pub fn new(components: u16, tos: u8) -> Self {
        TransmitterParams {
            components,
            tos,
            do_timestamp: true,
            threads: InternalThreads::new(),
        }
    }
}

/// A network backend of a session.
pub trait Transmitter: Send + Sync + fmt::Debug {
    /// Kind name, like `rawudp`.
    fn kind(&self) -> &'static str;

    /// Number of components.
    fn components(&self) -> u16;

    /// Received packets.
    fn source(&self) -> &NetworkSource;

    /// Packets to send.
    fn sink(&self) -> &NetworkSink;

    /// Current type of service.
    fn tos(&self) -> u8;

    /// Change the type of service on every socket.
    fn set_tos(&self, tos: u8);

    /// Make the stream transmitter for one stream.
    ///
    /// The config variant must match the kind of this transmitter.
    fn new_stream_transmitter(
        &self,
        participant: &Participant,
        stream: StreamId,
        config: StreamTransmitterConfig,
        handler: Weak<dyn StreamTransmitterHandler>,
    ) -> Result<StreamTransmitter, FsError>;
}

/// Per stream connectivity of one of the transmitter kinds.
#[allow(missing_docs)]
#[derive(Debug)]
pub enum StreamTransmitter {
    RawUdp(RawUdpStreamTransmitter),
    Nice(NiceStreamTransmitter),
    Multicast(MulticastStreamTransmitter),
    Shm(ShmStreamTransmitter),
}

macro_rules! dispatch {
    ($self:ident, $v:ident => $e:expr) => {
        match $self {
            StreamTransmitter::RawUdp($v) => $e,
            StreamTransmitter::Nice($v) => $e,
            StreamTransmitter::Multicast($v) => $e,
            StreamTransmitter::Shm($v) => $e,
        }
    };
}

impl StreamTransmitter {
    /// Kind name of the transmitter.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamTransmitter::RawUdp(_) => "rawudp",
            StreamTransmitter::Nice(_) => "nice",
            StreamTransmitter::Multicast(_) => "multicast",
            StreamTransmitter::Shm(_) => "shm",
        }
    }

    /// Start finding local candidates. Reported by events.
    pub fn gather_local_candidates(&self) -> Result<(), FsError> {
        dispatch!(self, v => v.gather_local_candidates())
    }

    /// Add candidates from the peer.
    pub fn add_remote_candidates(&self, candidates: Vec<Candidate>) -> Result<(), FsError> {
        dispatch!(self, v => v.add_remote_candidates(candidates))
    }

    /// Use these candidates, one per component, without checks.
    pub fn force_remote_candidates(&self, candidates: Vec<Candidate>) -> Result<(), FsError> {
        dispatch!(self, v => v.force_remote_candidates(candidates))
    }

    /// Whether packets pushed in the sink go out for this stream.
    pub fn sending(&self) -> bool {
        dispatch!(self, v => v.sending())
    }

    /// Start or stop sending for this stream.
    pub fn set_sending(&self, sending: bool) {
        dispatch!(self, v => v.set_sending(sending))
    }

    /// Release everything. Can be called more than once.
    pub fn stop(&self) {
        dispatch!(self, v => v.stop())
    }
}

impl Drop for StreamTransmitter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds a transmitter.
pub type TransmitterFactory = fn(&TransmitterParams) -> Result<Arc<dyn Transmitter>, FsError>;

static REGISTRY: Lazy<RwLock<HashMap<String, TransmitterFactory>>> = Lazy::new(|| {
    let mut m: HashMap<String, TransmitterFactory> = HashMap::new();
    m.insert("rawudp".into(), |p| Ok(Arc::new(RawUdpTransmitter::new(p)?)));
    m.insert("nice".into(), |p| Ok(Arc::new(NiceTransmitter::new(p)?)));
    m.insert("multicast".into(), |p| {
        Ok(Arc::new(MulticastTransmitter::new(p)?))
    });
    m.insert("shm".into(), |p| Ok(Arc::new(ShmTransmitter::new(p)?)));
    RwLock::new(m)
});

/// Register a transmitter kind. Replaces an earlier one with the same name.
pub fn register_transmitter(kind: &str, factory: TransmitterFactory) {
    REGISTRY.write().insert(kind.to_string(), factory);
}

/// Kinds that can be built, sorted.
pub fn list_available() -> Vec<String> {
    let mut v: Vec<_> = REGISTRY.read().keys().cloned().collect();
    v.sort();
    v
}

/// Build a transmitter of a kind.
pub fn new_transmitter(
    kind: &str,
    params: &TransmitterParams,
) -> Result<Arc<dyn Transmitter>, FsError> {
    check_components(params.components)?;

    let factory = REGISTRY.read().get(kind).copied().ok_or_else(|| {
        FsError::Construction(format!("Could not find transmitter kind {}", kind))
    })?;

    let t = factory(params)?;
    debug!(
        "New {} transmitter with {} components",
        kind, params.components
    );
    Ok(t)
}

pub(crate) fn wrong_config(kind: &str, config: &StreamTransmitterConfig) -> FsError {
    FsError::invalid(format!(
        "The {} transmitter can not use {} parameters",
        kind,
        config.kind()
    ))
}

/// Check the component of a candidate.
pub(crate) fn check_component(candidate: &Candidate, components: u16) -> Result<(), FsError> {
    if candidate.component_id == 0 || candidate.component_id > components {
        return Err(FsError::invalid(format!(
            "Candidate MUST have a component id between 1 and {}, {} is invalid",
            components, candidate.component_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn builtin_kinds() {
        let kinds = list_available();
        for k in ["multicast", "nice", "rawudp", "shm"] {
            assert!(kinds.iter().any(|v| v == k), "missing {}", k);
        }
    }

    #[test]
    fn unknown_kind_is_construction() {
        let e = new_transmitter("carrier-pigeon", &TransmitterParams::new(1, 0)).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Construction);
    }

    #[test]
    fn bad_components() {
        let e = new_transmitter("rawudp", &TransmitterParams::new(0, 0)).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArguments);
        let e = new_transmitter("rawudp", &TransmitterParams::new(256, 0)).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArguments);
    }

    #[test]
    fn endpoints_per_component() {
        let t = new_transmitter("rawudp", &TransmitterParams::new(2, 0)).unwrap();
        assert_eq!(t.kind(), "rawudp");
        assert_eq!(t.source().pad_names(), vec!["src_1", "src_2"]);
        assert_eq!(t.sink().pad_names(), vec!["sink_1", "sink_2"]);
    }

    #[test]
    fn state_from_ice() {
        assert_eq!(StreamState::from(ComponentState::Ready), StreamState::Ready);
        assert!(StreamState::Connected.is_connected());
        assert!(!StreamState::Failed.is_connected());
    }
}
