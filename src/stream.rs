//! The link between a session and one participant.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::candidate::Candidate;
use crate::codec::{codec_list_are_equal, Codec, CodecId};
use crate::conference::ConferenceKind;
use crate::config::StreamTransmitterConfig;
use crate::error::FsError;
use crate::event::{Bus, Event, EventSource};
use crate::id::StreamId;
use crate::participant::Participant;
use crate::session::{Session, SessionInner};
use crate::transmitter::{StreamState, StreamTransmitter};
use crate::transmitter::{StreamTransmitterEvent, StreamTransmitterHandler};

/// Media direction of a stream.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    None,
    Send,
    Recv,
    Both,
}

impl Direction {
    /// Whether the send bit is set.
    pub fn sends(&self) -> bool {
        matches!(self, Direction::Send | Direction::Both)
    }

    /// Whether the receive bit is set.
    pub fn receives(&self) -> bool {
        matches!(self, Direction::Recv | Direction::Both)
    }
}

/// A stream of a session to a [`Participant`].
///
/// Clones refer to the same stream. A stream must be ended with
/// [`Stream::destroy()`] from an application thread.
#[derive(Clone)]
pub struct Stream {
    pub(crate) inner: Arc<StreamInner>,
}

pub(crate) struct StreamInner {
    id: StreamId,
    session: Session,
    participant: Participant,
    events: Arc<StreamEvents>,
    state: Mutex<StreamInnerState>,
}

struct StreamInnerState {
    direction: Direction,
    remote_codecs: Vec<Codec>,
    transmitter: Option<Arc<StreamTransmitter>>,
    destroyed: bool,
    /// Removed from the session after the transmitter failed.
    detached: bool,
}

/// Turns stream transmitter events into bus messages.
struct StreamEvents {
    stream: StreamId,
    session: Weak<SessionInner>,
    bus: Bus,
}

impl Stream {
    pub(crate) fn new(session: Session, participant: Participant, direction: Direction) -> Stream {
        let id = StreamId::next();
        let events = Arc::new(StreamEvents {
            stream: id,
            session: session.downgrade(),
            bus: session.inner.bus.clone(),
        });
        Stream {
            inner: Arc::new(StreamInner {
                id,
                session,
                participant,
                events,
                state: Mutex::new(StreamInnerState {
                    direction,
                    remote_codecs: vec![],
                    transmitter: None,
                    destroyed: false,
                    detached: false,
                }),
            }),
        }
    }

    /// Unique id, also used in events.
    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    /// The session of this stream.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// The peer of this stream.
    pub fn participant(&self) -> &Participant {
        &self.inner.participant
    }

    fn lock_live(&self) -> Result<MutexGuard<'_, StreamInnerState>, FsError> {
        let state = self.inner.state.lock();
        if state.destroyed || state.detached {
            return Err(FsError::disposed("stream"));
        }
        Ok(state)
    }

    fn stream_transmitter(&self) -> Result<Arc<StreamTransmitter>, FsError> {
        let state = self.lock_live()?;
        state.transmitter.clone().ok_or_else(|| {
            FsError::Disposed("Stream transmitter not set (or stream has been disposed)".into())
        })
    }

    /// Bind the stream to a transmitter kind and start gathering.
    ///
    /// Can only be done once. If gathering cannot start the stream is detached
    /// from its session and later calls return [`FsError::Disposed`].
    pub fn set_transmitter(&self, kind: &str, config: StreamTransmitterConfig) -> Result<(), FsError> {
        {
            let state = self.lock_live()?;
            if state.transmitter.is_some() {
                return Err(FsError::AlreadyExists(
                    "Stream transmitter already set".into(),
                ));
            }
        }

        let transmitter = self.inner.session.transmitter(kind)?;
        let handler: Arc<dyn StreamTransmitterHandler> = self.inner.events.clone();
        let st = Arc::new(transmitter.new_stream_transmitter(
            &self.inner.participant,
            self.inner.id,
            config,
            Arc::downgrade(&handler),
        )?);

        let sending = {
            let mut state = self.lock_live()?;
            if state.transmitter.is_some() {
                return Err(FsError::AlreadyExists(
                    "Stream transmitter already set".into(),
                ));
            }
            state.transmitter = Some(st.clone());
            state.direction.sends()
        };
        st.set_sending(sending);

        debug!("Stream {} uses the {} transmitter", self.inner.id, kind);

        if let Err(e) = st.gather_local_candidates() {
            warn!("Stream {} could not gather: {}", self.inner.id, e);
            st.stop();
            {
                let mut state = self.inner.state.lock();
                state.transmitter = None;
                state.detached = true;
            }
            self.inner.session.remove_stream(self.inner.id);
            return Err(e);
        }

        Ok(())
    }

    /// Hand candidates from the peer to the stream transmitter.
    ///
    /// For ICE an empty list restarts the connectivity checks.
    pub fn add_remote_candidates(&self, candidates: Vec<Candidate>) -> Result<(), FsError> {
        self.stream_transmitter()?.add_remote_candidates(candidates)
    }

    /// Use these candidates, one per component, without connectivity checks.
    pub fn force_remote_candidates(&self, candidates: Vec<Candidate>) -> Result<(), FsError> {
        self.stream_transmitter()?.force_remote_candidates(candidates)
    }

    /// The codecs of the peer.
    pub fn remote_codecs(&self) -> Vec<Codec> {
        self.inner.state.lock().remote_codecs.clone()
    }

    /// Set the codecs of the peer and renegotiate the session.
    ///
    /// In raw sessions the list holds one or two codecs. The first is what the
    /// peer sends, the second, if given, what we send. Setting the same list
    /// again does nothing.
    pub fn set_remote_codecs(&self, codecs: Vec<Codec>) -> Result<(), FsError> {
        let _ = self.lock_live()?;
        if self.inner.session.is_destroyed() {
            return Err(FsError::disposed("session"));
        }

        self.validate_codecs(&codecs)?;

        let old = {
            let mut state = self.lock_live()?;
            if codec_list_are_equal(&state.remote_codecs, &codecs) {
                trace!("Stream {}: remote codecs unchanged", self.inner.id);
                return Ok(());
            }
            std::mem::replace(&mut state.remote_codecs, codecs.clone())
        };

        if let Err(e) = self.inner.session.renegotiate() {
            debug!("Stream {}: remote codecs rejected: {}", self.inner.id, e);
            self.restore_remote_codecs(&codecs, old);
            return Err(e);
        }
        Ok(())
    }

    /// Put back `old` unless another call replaced `installed` in the meantime.
    fn restore_remote_codecs(&self, installed: &[Codec], old: Vec<Codec>) {
        let mut state = self.inner.state.lock();
        if codec_list_are_equal(&state.remote_codecs, installed) {
            state.remote_codecs = old;
        } else {
            trace!(
                "Stream {}: remote codecs changed since, not rolling back",
                self.inner.id
            );
        }
    }

    fn validate_codecs(&self, codecs: &[Codec]) -> Result<(), FsError> {
        if codecs.is_empty() {
            return Err(FsError::invalid("You can not set NULL remote codecs"));
        }

        let raw = self.inner.session.kind() == ConferenceKind::Raw;
        if raw && codecs.len() > 2 {
            return Err(FsError::invalid("Too many codecs passed"));
        }

        let media_type = self.inner.session.media_type();
        for codec in codecs {
            let Some(name) = codec.encoding_name.as_deref() else {
                return Err(FsError::invalid("The codec must have an encoding name"));
            };

            if raw {
                codec.to_caps()?;
                continue;
            }

            if !matches!(codec.id, CodecId::Id(v) if v <= 128) {
                return Err(FsError::invalid(format!(
                    "The codec id must be between 0 and 128 for {}",
                    name
                )));
            }
            if codec.media_type != media_type {
                return Err(FsError::invalid(format!(
                    "The media type for codec {} is not {}",
                    name, media_type
                )));
            }
        }
        Ok(())
    }

    /// Current direction.
    pub fn direction(&self) -> Direction {
        self.inner.state.lock().direction
    }

    /// Change the direction. The send bit starts or stops sending, and the session
    /// only sends while one of its streams has it.
    pub fn set_direction(&self, direction: Direction) -> Result<(), FsError> {
        let st = {
            let mut state = self.lock_live()?;
            if state.direction == direction {
                return Ok(());
            }
            state.direction = direction;
            state.transmitter.clone()
        };

        debug!("Stream {} direction {:?}", self.inner.id, direction);
        if let Some(st) = st {
            st.set_sending(direction.sends());
        }
        self.inner.session.direction_changed(self.inner.id, direction);
        Ok(())
    }

    /// Stop the stream transmitter and leave the session.
    ///
    /// Calling this on an internal thread is refused with an error log, the stream
    /// is then leaked.
    pub fn destroy(&self) {
        if self.inner.session.inner.threads.is_internal() {
            error!(
                "Stream::destroy() must be called from an application thread, \
                 stream {} may now be leaked",
                self.inner.id
            );
            return;
        }

        let st = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.transmitter.take()
        };

        if let Some(st) = st {
            st.stop();
        }
        self.inner.session.remove_stream(self.inner.id);
        debug!("Destroyed stream {}", self.inner.id);
    }

    /// Whether [`Stream::destroy()`] was called or the stream was detached.
    pub fn is_destroyed(&self) -> bool {
        let state = self.inner.state.lock();
        state.destroyed || state.detached
    }

    /// Kind of the bound transmitter.
    pub fn transmitter_kind(&self) -> Option<&'static str> {
        self.inner.state.lock().transmitter.as_ref().map(|t| t.kind())
    }
}

impl StreamEvents {
    fn post(&self, event: Event) {
        self.bus.post(event);
    }

    fn session(&self) -> Option<Session> {
        self.session.upgrade().map(|inner| Session { inner })
    }
}

impl StreamTransmitterHandler for StreamEvents {
    fn handle_event(&self, event: StreamTransmitterEvent) {
        let stream = self.stream;
        match event {
            StreamTransmitterEvent::NewLocalCandidate(candidate) => {
                self.post(Event::NewLocalCandidate { stream, candidate });
            }
            StreamTransmitterEvent::LocalCandidatesPrepared => {
                self.post(Event::LocalCandidatesPrepared { stream });
            }
            StreamTransmitterEvent::NewActiveCandidatePair { local, remote } => {
                self.post(Event::NewActiveCandidatePair {
                    stream,
                    local,
                    remote,
                });
            }
            StreamTransmitterEvent::StateChanged { component, state } => {
                self.post(Event::ComponentStateChanged {
                    stream,
                    component,
                    state,
                });
                if component == 1 && state == StreamState::Failed {
                    let err = FsError::ConnectionFailed("Could not establish connection".into());
                    self.post(Event::error(EventSource::Stream(stream), &err));
                }
            }
            StreamTransmitterEvent::KeyUnitRequested { component } => {
                if let Some(session) = self.session() {
                    session.request_keyunit(component);
                }
            }
            StreamTransmitterEvent::Error(err) => {
                self.post(Event::error(EventSource::Stream(stream), &err));
            }
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("session", &self.inner.session.id())
            .field("participant", &self.inner.participant.id())
            .finish()
    }
}
