//! One media session of a conference and its codec negotiation.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam::channel::Select;
use parking_lot::Mutex;

use crate::codec::{codec_list_are_equal, Codec, CodecId, MediaType};
use crate::conference::ConferenceKind;
use crate::config::SessionConfig;
use crate::error::FsError;
use crate::event::{Bus, Event};
use crate::id::{SessionId, StreamId};
use crate::participant::Participant;
use crate::stream::{Direction, Stream, StreamInner};
use crate::thread::InternalThreads;
use crate::transmitter::{self, ReceivedPacket, Transmitter, TransmitterParams};

/// A media session.
///
/// A session sends one kind of media to all its streams. Clones refer to the same
/// session.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    id: SessionId,
    kind: ConferenceKind,
    config: SessionConfig,
    pub(crate) bus: Bus,
    pub(crate) threads: InternalThreads,
    state: Mutex<SessionState>,
    keyunits: AtomicUsize,
}

struct SessionState {
    destroyed: bool,
    tos: u8,
    transmitters: Vec<Arc<dyn Transmitter>>,
    streams: Vec<(StreamId, Weak<StreamInner>)>,
    /// Whether any stream has the send bit.
    sending: bool,
    codec_preferences: Vec<Codec>,
    /// Codec asked for with `set_send_codec`.
    requested_send_codec: Option<Codec>,
    codecs: Vec<Codec>,
    recv_codecs: Vec<Codec>,
    send_codec: Option<Codec>,
    secondary_codecs: Vec<Codec>,
}

impl SessionState {
    fn update_sending(&mut self) {
        self.sending = self
            .streams
            .iter()
            .filter_map(|(_, s)| s.upgrade())
            .any(|inner| Stream { inner }.direction().sends());
    }
}

/// Result of a negotiation.
#[derive(Debug)]
struct Negotiated {
    codecs: Vec<Codec>,
    recv_codecs: Vec<Codec>,
    send_codec: Option<Codec>,
    secondary_codecs: Vec<Codec>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        kind: ConferenceKind,
        config: SessionConfig,
        bus: Bus,
        threads: InternalThreads,
    ) -> Result<Session, FsError> {
        config.validate()?;

        info!(
            "New {} session {} with {} components",
            config.media_type(),
            id,
            config.components()
        );

        Ok(Session {
            inner: Arc::new(SessionInner {
                id,
                kind,
                bus,
                threads,
                state: Mutex::new(SessionState {
                    destroyed: false,
                    tos: config.tos(),
                    transmitters: vec![],
                    streams: vec![],
                    sending: false,
                    codec_preferences: vec![],
                    requested_send_codec: None,
                    codecs: vec![],
                    recv_codecs: vec![],
                    send_codec: None,
                    secondary_codecs: vec![],
                }),
                config,
                keyunits: AtomicUsize::new(0),
            }),
        })
    }

    /// Id, unique within the conference.
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Audio, video or application.
    pub fn media_type(&self) -> MediaType {
        self.inner.config.media_type()
    }

    /// Number of components.
    pub fn components(&self) -> u16 {
        self.inner.config.components()
    }

    fn lock_live(&self) -> Result<parking_lot::MutexGuard<'_, SessionState>, FsError> {
        let state = self.inner.state.lock();
        if state.destroyed {
            return Err(FsError::disposed("session"));
        }
        Ok(state)
    }

    /// Add a stream to a participant.
    ///
    /// Raw sessions have at most one stream.
    pub fn new_stream(
        &self,
        participant: &Participant,
        direction: Direction,
    ) -> Result<Stream, FsError> {
        let mut state = self.lock_live()?;
        state.streams.retain(|(_, s)| s.strong_count() > 0);

        if self.inner.kind == ConferenceKind::Raw && !state.streams.is_empty() {
            return Err(FsError::AlreadyExists(
                "There already is a stream in this session".into(),
            ));
        }

        let stream = Stream::new(self.clone(), participant.clone(), direction);
        state.streams.push((stream.id(), Arc::downgrade(&stream.inner)));
        state.update_sending();
        drop(state);

        info!(
            "New stream {} in session {} for participant {}",
            stream.id(),
            self.inner.id,
            participant.id()
        );
        Ok(stream)
    }

    /// Live streams of this session.
    pub fn streams(&self) -> Vec<Stream> {
        let state = self.inner.state.lock();
        state
            .streams
            .iter()
            .filter_map(|(_, s)| s.upgrade())
            .map(|inner| Stream { inner })
            .collect()
    }

    pub(crate) fn remove_stream(&self, id: StreamId) {
        {
            let mut state = self.inner.state.lock();
            state.streams.retain(|(s, _)| *s != id);
            state.update_sending();
            if state.destroyed {
                return;
            }
        }
        debug!("Removed stream {} from session {}", id, self.inner.id);
        if let Err(e) = self.renegotiate() {
            debug!("Renegotiation after removing stream {}: {}", id, e);
        }
    }

    /// A stream changed direction.
    pub(crate) fn direction_changed(&self, id: StreamId, direction: Direction) {
        let mut state = self.inner.state.lock();
        let was = state.sending;
        state.update_sending();
        if was != state.sending {
            debug!(
                "Session {}: stream {} went {:?}, sending {}",
                self.inner.id, id, direction, state.sending
            );
        }
    }

    /// Whether any stream of the session has the send bit.
    pub fn is_sending(&self) -> bool {
        self.inner.state.lock().sending
    }

    /// The transmitter of a kind, made on first use.
    pub(crate) fn transmitter(&self, kind: &str) -> Result<Arc<dyn Transmitter>, FsError> {
        let mut state = self.lock_live()?;
        if let Some(t) = state.transmitters.iter().find(|t| t.kind() == kind) {
            return Ok(t.clone());
        }

        let params = TransmitterParams {
            components: self.inner.config.components(),
            tos: state.tos,
            do_timestamp: self.inner.config.do_timestamp(),
            threads: self.inner.threads.clone(),
        };
        let t = transmitter::new_transmitter(kind, &params)?;
        state.transmitters.push(t.clone());
        Ok(t)
    }

    /// Transmitter kinds that can be used in [`Stream::set_transmitter()`].
    pub fn list_transmitters(&self) -> Vec<String> {
        transmitter::list_available()
    }

    /// Type of service for every socket of the session.
    pub fn tos(&self) -> u8 {
        self.inner.state.lock().tos
    }

    /// Change the type of service on every transmitter.
    pub fn set_tos(&self, tos: u8) -> Result<(), FsError> {
        let transmitters = {
            let mut state = self.lock_live()?;
            state.tos = tos;
            state.transmitters.clone()
        };
        for t in transmitters {
            t.set_tos(tos);
        }
        Ok(())
    }

    /// Negotiated codecs.
    pub fn codecs(&self) -> Vec<Codec> {
        self.inner.state.lock().codecs.clone()
    }

    /// Codecs the session can receive.
    pub fn recv_codecs(&self) -> Vec<Codec> {
        self.inner.state.lock().recv_codecs.clone()
    }

    /// The codec currently sent.
    pub fn current_send_codec(&self) -> Option<Codec> {
        self.inner.state.lock().send_codec.clone()
    }

    /// The wish list used for negotiation.
    pub fn codec_preferences(&self) -> Vec<Codec> {
        self.inner.state.lock().codec_preferences.clone()
    }

    /// Set the codec wish list, in order of preference.
    ///
    /// A codec with id [`CodecId::Disable`] removes the matching codec from negotiation.
    /// Not available in raw sessions.
    pub fn set_codec_preferences(&self, preferences: Vec<Codec>) -> Result<(), FsError> {
        if self.inner.kind == ConferenceKind::Raw {
            return Err(FsError::NotImplemented(
                "Codec preferences can not be set on raw sessions".into(),
            ));
        }
        for p in &preferences {
            if p.encoding_name.is_none() {
                return Err(FsError::invalid("The codec must have an encoding name"));
            }
        }
        {
            let mut state = self.lock_live()?;
            if codec_list_are_equal(&state.codec_preferences, &preferences) {
                return Ok(());
            }
            state.codec_preferences = preferences;
        }
        self.renegotiate()
    }

    /// Send with this codec. It must be one of the negotiated codecs.
    pub fn set_send_codec(&self, codec: &Codec) -> Result<(), FsError> {
        if self.inner.kind == ConferenceKind::Raw {
            return Err(FsError::NotImplemented(
                "The send codec of a raw session follows the remote codecs".into(),
            ));
        }
        {
            let mut state = self.lock_live()?;
            let known = state
                .codecs
                .iter()
                .any(|c| c.id == codec.id && c.is_equivalent(codec));
            if !known {
                return Err(FsError::invalid(
                    "The passed codec is not part of the list of codecs",
                ));
            }
            state.requested_send_codec = Some(codec.clone());
        }
        self.renegotiate()
    }

    /// Not supported.
    pub fn set_encryption_parameters(&self, _parameters: &[(String, String)]) -> Result<(), FsError> {
        let _state = self.lock_live()?;
        Err(FsError::NotImplemented(
            "Encryption is not supported by this session".into(),
        ))
    }

    /// Not supported.
    pub fn start_telephony_event(&self, _event: u8, _volume: u8) -> Result<(), FsError> {
        let _state = self.lock_live()?;
        Err(FsError::NotImplemented(
            "Telephony events are not supported by this session".into(),
        ))
    }

    /// Not supported.
    pub fn stop_telephony_event(&self) -> Result<(), FsError> {
        let _state = self.lock_live()?;
        Err(FsError::NotImplemented(
            "Telephony events are not supported by this session".into(),
        ))
    }

    /// Send a packet on a component through every transmitter of the session.
    ///
    /// Nothing is sent until there is a send codec and a stream with the send bit.
    /// Returns how many outputs took it.
    pub fn send_packet(&self, component: u16, data: &[u8]) -> Result<usize, FsError> {
        let transmitters = {
            let state = self.lock_live()?;
            if state.send_codec.is_none() {
                trace!("Session {}: no send codec, dropping packet", self.inner.id);
                return Ok(0);
            }
            if !state.sending {
                trace!("Session {}: no sending stream, dropping packet", self.inner.id);
                return Ok(0);
            }
            state.transmitters.clone()
        };

        let mut n = 0;
        for t in transmitters {
            n += t.sink().push(component, data)?;
        }
        Ok(n)
    }

    /// Wait for a packet from any of the transmitters.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ReceivedPacket> {
        let receivers: Vec<_> = {
            let state = self.inner.state.lock();
            state
                .transmitters
                .iter()
                .map(|t| t.source().receiver().clone())
                .collect()
        };
        if receivers.is_empty() {
            std::thread::sleep(timeout);
            return None;
        }

        let mut sel = Select::new();
        for r in &receivers {
            sel.recv(r);
        }
        let op = sel.select_timeout(timeout).ok()?;
        let idx = op.index();
        op.recv(&receivers[idx]).ok()
    }

    /// How many key units the transmitters asked for.
    pub fn keyunit_requests(&self) -> usize {
        self.inner.keyunits.load(Ordering::Relaxed)
    }

    /// Destroy the session and all its streams.
    ///
    /// Later calls return [`FsError::Disposed`]. Like [`Stream::destroy()`] this
    /// is refused on an internal thread.
    pub fn destroy(&self) {
        if self.inner.threads.is_internal() {
            error!(
                "Session::destroy() must be called from an application thread, \
                 session {} may now be leaked",
                self.inner.id
            );
            return;
        }

        let streams = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            std::mem::take(&mut state.streams)
        };

        for inner in streams.into_iter().filter_map(|(_, s)| s.upgrade()) {
            Stream { inner }.destroy();
        }

        let transmitters = std::mem::take(&mut self.inner.state.lock().transmitters);
        drop(transmitters);
        debug!("Destroyed session {}", self.inner.id);
    }

    /// Whether [`Session::destroy()`] was called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    pub(crate) fn post(&self, event: Event) {
        self.inner.bus.post(event);
    }

    /// Renegotiate from the remote codecs of all streams.
    ///
    /// On failure nothing changes.
    pub(crate) fn renegotiate(&self) -> Result<(), FsError> {
        let mut state = self.lock_live()?;

        let remotes: Vec<Vec<Codec>> = state
            .streams
            .iter()
            .filter_map(|(_, s)| s.upgrade())
            .map(|s| Stream { inner: s }.remote_codecs())
            .filter(|c| !c.is_empty())
            .collect();

        let negotiated = match self.inner.kind {
            ConferenceKind::Raw => negotiate_raw(&remotes),
            ConferenceKind::Rtp => negotiate_rtp(
                &remotes,
                &state.codec_preferences,
                state.requested_send_codec.as_ref(),
            )?,
        };

        let codecs_changed = !codec_list_are_equal(&state.codecs, &negotiated.codecs);
        let recv_changed = !codec_list_are_equal(&state.recv_codecs, &negotiated.recv_codecs);
        let send_changed = state.send_codec != negotiated.send_codec
            || !codec_list_are_equal(&state.secondary_codecs, &negotiated.secondary_codecs);

        state.codecs = negotiated.codecs.clone();
        state.recv_codecs = negotiated.recv_codecs.clone();
        state.send_codec = negotiated.send_codec.clone();
        state.secondary_codecs = negotiated.secondary_codecs.clone();
        drop(state);

        let session = self.inner.id;
        if codecs_changed {
            debug!("Session {} codecs: {:?}", session, negotiated.codecs);
            self.post(Event::CodecsChanged { session });
        }
        if recv_changed {
            self.post(Event::RecvCodecsChanged {
                session,
                codecs: negotiated.recv_codecs,
            });
        }
        if send_changed {
            if let Some(codec) = negotiated.send_codec {
                info!("Session {} sends {}", session, codec);
                self.post(Event::SendCodecChanged {
                    session,
                    codec,
                    secondary_codecs: negotiated.secondary_codecs,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn request_keyunit(&self, component: u16) {
        if self.inner.kind == ConferenceKind::Raw {
            return;
        }
        debug!(
            "Session {}: key unit requested on component {}",
            self.inner.id, component
        );
        self.inner.keyunits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn kind(&self) -> ConferenceKind {
        self.inner.kind
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }
}

/// Raw: the first remote codec is what the peer sends, the last what we send.
fn negotiate_raw(remotes: &[Vec<Codec>]) -> Negotiated {
    let Some(remote) = remotes.first() else {
        return Negotiated {
            codecs: vec![],
            recv_codecs: vec![],
            send_codec: None,
            secondary_codecs: vec![],
        };
    };
    Negotiated {
        codecs: remote.clone(),
        recv_codecs: remote.first().cloned().into_iter().collect(),
        send_codec: remote.last().cloned(),
        secondary_codecs: vec![],
    }
}

fn names_match(a: &Codec, b: &Codec) -> bool {
    match (&a.encoding_name, &b.encoding_name) {
        (Some(x), Some(y)) => x.eq_ignore_ascii_case(y),
        _ => false,
    }
}

/// A preference matches a codec by name, and by clock rate and channels if it has them.
fn preference_matches(pref: &Codec, codec: &Codec) -> bool {
    names_match(pref, codec)
        && (pref.clock_rate == 0 || pref.clock_rate == codec.clock_rate)
        && (pref.channels <= 1 || pref.channels == codec.channels.max(1))
}

/// RTP: codecs every stream has, ordered by the preferences.
fn negotiate_rtp(
    remotes: &[Vec<Codec>],
    preferences: &[Codec],
    requested: Option<&Codec>,
) -> Result<Negotiated, FsError> {
    let Some((first, rest)) = remotes.split_first() else {
        return Ok(Negotiated {
            codecs: vec![],
            recv_codecs: vec![],
            send_codec: None,
            secondary_codecs: vec![],
        });
    };

    let common: Vec<Codec> = first
        .iter()
        .filter(|c| rest.iter().all(|r| r.iter().any(|o| o.is_equivalent(c))))
        .filter(|c| {
            !preferences
                .iter()
                .any(|p| p.id == CodecId::Disable && preference_matches(p, c))
        })
        .cloned()
        .collect();

    let (secondary, primary): (Vec<_>, Vec<_>) =
        common.into_iter().partition(|c| c.is_secondary());

    if primary.is_empty() {
        return Err(FsError::NegotiationFailed(
            "There was no intersection between the remote codecs of the streams".into(),
        ));
    }

    // Preferred codecs first, in preference order, then the rest in remote order.
    let mut ordered: Vec<Codec> = vec![];
    for p in preferences.iter().filter(|p| p.id != CodecId::Disable) {
        for c in &primary {
            if preference_matches(p, c) && !ordered.contains(c) {
                ordered.push(c.clone());
            }
        }
    }
    for c in &primary {
        if !ordered.contains(c) {
            ordered.push(c.clone());
        }
    }

    let send_codec = requested
        .and_then(|r| ordered.iter().find(|c| c.id == r.id && c.is_equivalent(r)))
        .or_else(|| ordered.first())
        .cloned();

    let secondary_codecs: Vec<Codec> = match &send_codec {
        Some(s) => secondary
            .iter()
            .filter(|c| c.clock_rate == s.clock_rate)
            .cloned()
            .collect(),
        None => vec![],
    };

    let mut codecs = ordered;
    codecs.extend(secondary);

    Ok(Negotiated {
        recv_codecs: codecs.clone(),
        codecs,
        send_codec,
        secondary_codecs,
    })
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("media_type", &self.inner.config.media_type())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pcmu() -> Codec {
        Codec::new(0, "PCMU", MediaType::Audio, 8000)
    }

    fn pcma() -> Codec {
        Codec::new(8, "PCMA", MediaType::Audio, 8000)
    }

    fn opus() -> Codec {
        Codec::new(111, "opus", MediaType::Audio, 48000).set_channels(2)
    }

    fn dtmf() -> Codec {
        Codec::new(101, "telephone-event", MediaType::Audio, 8000)
    }

    #[test]
    fn raw_send_is_last() {
        let a = Codec::raw("audio/x-raw,rate=8000", MediaType::Audio);
        let b = Codec::raw("audio/x-raw,rate=16000", MediaType::Audio);
        let n = negotiate_raw(&[vec![a.clone(), b.clone()]]);
        assert_eq!(n.send_codec, Some(b));
        assert_eq!(n.recv_codecs, vec![a.clone()]);

        let n = negotiate_raw(&[vec![a.clone()]]);
        assert_eq!(n.send_codec, Some(a));
    }

    #[test]
    fn rtp_intersection() {
        let n = negotiate_rtp(
            &[vec![pcmu(), pcma(), opus()], vec![opus(), pcma()]],
            &[],
            None,
        )
        .unwrap();
        assert_eq!(n.codecs, vec![pcma(), opus()]);
        assert_eq!(n.send_codec, Some(pcma()));
    }

    #[test]
    fn rtp_preferences_order_and_disable() {
        let prefs = vec![Codec::new(CodecId::Any, "opus", MediaType::Audio, 0)];
        let n = negotiate_rtp(&[vec![pcmu(), pcma(), opus()]], &prefs, None).unwrap();
        assert_eq!(n.send_codec, Some(opus()));
        assert_eq!(n.codecs[0], opus());

        let prefs = vec![Codec::new(CodecId::Disable, "PCMU", MediaType::Audio, 0)];
        let n = negotiate_rtp(&[vec![pcmu(), pcma()]], &prefs, None).unwrap();
        assert_eq!(n.codecs, vec![pcma()]);
    }

    #[test]
    fn rtp_secondary_follows_clock_rate() {
        let n = negotiate_rtp(&[vec![pcmu(), dtmf()]], &[], None).unwrap();
        assert_eq!(n.send_codec, Some(pcmu()));
        assert_eq!(n.secondary_codecs, vec![dtmf()]);
        assert_eq!(n.codecs, vec![pcmu(), dtmf()]);
    }

    #[test]
    fn rtp_requested_send_codec() {
        let n = negotiate_rtp(&[vec![pcmu(), pcma()]], &[], Some(&pcma())).unwrap();
        assert_eq!(n.send_codec, Some(pcma()));
    }

    #[test]
    fn destroy_on_internal_thread_is_refused() {
        let s = Session::new(
            SessionId::from(1),
            ConferenceKind::Rtp,
            SessionConfig::new(MediaType::Audio),
            Bus::new(),
            InternalThreads::new(),
        )
        .unwrap();
        let stream = s.new_stream(&Participant::new(), Direction::Both).unwrap();

        let threads = s.inner.threads.clone();
        threads.enter();
        s.destroy();
        threads.leave();
        assert!(!s.is_destroyed());
        assert!(!stream.is_destroyed());
        assert_eq!(s.streams().len(), 1);

        s.destroy();
        assert!(s.is_destroyed());
        assert!(stream.is_destroyed());
    }

    #[test]
    fn sending_follows_stream_directions() {
        let s = Session::new(
            SessionId::from(1),
            ConferenceKind::Rtp,
            SessionConfig::new(MediaType::Audio),
            Bus::new(),
            InternalThreads::new(),
        )
        .unwrap();
        assert!(!s.is_sending());

        let a = s.new_stream(&Participant::new(), Direction::Recv).unwrap();
        assert!(!s.is_sending());
        let b = s.new_stream(&Participant::new(), Direction::Both).unwrap();
        assert!(s.is_sending());

        a.set_remote_codecs(vec![pcmu()]).unwrap();
        b.set_remote_codecs(vec![pcmu()]).unwrap();
        b.set_direction(Direction::Recv).unwrap();
        assert!(!s.is_sending());
        assert_eq!(s.send_packet(1, b"nothing").unwrap(), 0);

        a.set_direction(Direction::Send).unwrap();
        assert!(s.is_sending());

        a.destroy();
        assert!(!s.is_sending());
    }

    #[test]
    fn rtp_nothing_in_common() {
        let e = negotiate_rtp(&[vec![pcmu()], vec![pcma()]], &[], None).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::NegotiationFailed);
    }
}
