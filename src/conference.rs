use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::error::FsError;
use crate::event::Bus;
use crate::id::SessionId;
use crate::participant::{Participant, WeakParticipant};
use crate::session::{Session, SessionInner};
use crate::thread::InternalThreads;

/// What the sessions of a conference carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConferenceKind {
    /// Bare payloads described by caps, one stream per session.
    Raw,
    /// RTP with codec negotiation over many streams.
    Rtp,
}

/// The top object. Makes sessions and participants and posts their events on
/// one [`Bus`].
///
/// Clones refer to the same conference.
#[derive(Clone)]
pub struct Conference {
    inner: Arc<ConferenceInner>,
}

struct ConferenceInner {
    kind: ConferenceKind,
    bus: Bus,
    threads: InternalThreads,
    state: RwLock<ConferenceState>,
}

struct ConferenceState {
    sessions: Vec<(SessionId, Weak<SessionInner>)>,
    participants: Vec<WeakParticipant>,
    next_session_id: u32,
}

impl Conference {
    /// Make a conference.
    pub fn new(kind: ConferenceKind) -> Self {
        info!("New {:?} conference", kind);
        Conference {
            inner: Arc::new(ConferenceInner {
                kind,
                bus: Bus::new(),
                threads: InternalThreads::new(),
                state: RwLock::new(ConferenceState {
                    sessions: vec![],
                    participants: vec![],
                    next_session_id: 1,
                }),
            }),
        }
    }

    /// Raw or RTP.
    pub fn kind(&self) -> ConferenceKind {
        self.inner.kind
    }

    /// Where all events go.
    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    /// Make a session.
    ///
    /// Ids increase and skip ids of live sessions.
    pub fn new_session(&self, config: SessionConfig) -> Result<Session, FsError> {
        config.validate()?;

        let mut state = self.inner.state.write();
        state.sessions.retain(|(_, s)| s.strong_count() > 0);

        let id = loop {
            let candidate = state.next_session_id;
            state.next_session_id = state.next_session_id.wrapping_add(1);
            if candidate == 0 {
                continue;
            }
            if state.sessions.iter().all(|(s, _)| **s != candidate) {
                break SessionId::from(candidate);
            }
        };

        let session = Session::new(
            id,
            self.inner.kind,
            config,
            self.inner.bus.clone(),
            self.inner.threads.clone(),
        )?;
        state.sessions.push((id, session.downgrade()));
        Ok(session)
    }

    /// Live sessions, in order of creation.
    pub fn sessions(&self) -> Vec<Session> {
        self.inner
            .state
            .read()
            .sessions
            .iter()
            .filter_map(|(_, s)| s.upgrade())
            .map(|inner| Session { inner })
            .collect()
    }

    /// Make a participant.
    pub fn new_participant(&self) -> Participant {
        let participant = Participant::new();
        let mut state = self.inner.state.write();
        state.participants.retain(|p| p.upgrade().is_some());
        state.participants.push(participant.downgrade());
        participant
    }

    /// Live participants made by this conference.
    pub fn participants(&self) -> Vec<Participant> {
        self.inner
            .state
            .read()
            .participants
            .iter()
            .filter_map(|p| p.upgrade())
            .collect()
    }

    /// Whether the current thread runs inside the conference.
    pub fn is_internal_thread(&self) -> bool {
        self.inner.threads.is_internal()
    }

    /// Announce that the current thread is a streaming thread of the application.
    pub fn thread_enter(&self) {
        self.inner.threads.enter();
    }

    /// Undo [`Conference::thread_enter()`].
    pub fn thread_leave(&self) {
        self.inner.threads.leave();
    }
}

impl fmt::Debug for Conference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Conference")
            .field("kind", &self.inner.kind)
            .field("sessions", &state.sessions.len())
            .field("participants", &state.participants.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::MediaType;
    use crate::ErrorKind;

    #[test]
    fn session_ids_skip_live_ones() {
        let conf = Conference::new(ConferenceKind::Rtp);
        let a = conf.new_session(SessionConfig::new(MediaType::Audio)).unwrap();
        let b = conf.new_session(SessionConfig::new(MediaType::Video)).unwrap();
        assert_eq!(*a.id(), 1);
        assert_eq!(*b.id(), 2);

        conf.inner.state.write().next_session_id = 1;
        let c = conf.new_session(SessionConfig::new(MediaType::Audio)).unwrap();
        assert_eq!(*c.id(), 3);
        assert_eq!(conf.sessions().len(), 3);

        drop(a);
        conf.inner.state.write().next_session_id = 1;
        let d = conf.new_session(SessionConfig::new(MediaType::Audio)).unwrap();
        assert_eq!(*d.id(), 1);
    }

    #[test]
    fn bad_session_config() {
        let conf = Conference::new(ConferenceKind::Raw);
        let e = conf
            .new_session(SessionConfig::new(MediaType::Audio).set_components(0))
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArguments);
    }

    #[test]
    fn internal_threads() {
        let conf = Conference::new(ConferenceKind::Raw);
        assert!(!conf.is_internal_thread());
        conf.thread_enter();
        assert!(conf.is_internal_thread());
        conf.thread_leave();
        assert!(!conf.is_internal_thread());
    }

    #[test]
    fn participants_are_listed() {
        let conf = Conference::new(ConferenceKind::Rtp);
        let p = conf.new_participant();
        assert_eq!(conf.participants(), vec![p.clone()]);
        drop(p);
        assert!(conf.participants().is_empty());
    }
}
