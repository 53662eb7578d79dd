//! Conferencing with negotiated codecs over pluggable network transmitters.
//!
//! A [`Conference`] makes [`Session`]s, one per media type, and [`Participant`]s,
//! one per remote peer. A [`Stream`] ties a session to a participant. Every stream
//! is bound to one transmitter kind which finds local candidates, takes the
//! candidates of the peer and carries the packets:
//!
//! * `rawudp` plain UDP to a known address and port.
//! * `nice` ICE connectivity checks with host and server reflexive candidates.
//! * `multicast` UDP to a multicast group.
//! * `shm` local datagram sockets between processes on one host.
//!
//! The conference has no main loop of its own. Everything that happens
//! asynchronously, candidates found, connection states, codec changes and errors,
//! is posted as an [`Event`] on the conference [`Bus`].
//!
//! # Sessions and codecs
//!
//! An RTP conference negotiates codecs. Each stream is given the codecs of its
//! peer with [`Stream::set_remote_codecs()`]. The session intersects the lists of
//! all its streams, orders them by the codec preferences and picks the send codec.
//! Changes are reported with [`Event::CodecsChanged`], [`Event::RecvCodecsChanged`]
//! and [`Event::SendCodecChanged`], in that order.
//!
//! A raw conference carries bare payloads described by a caps string like
//! `audio/x-raw,format=S16LE,rate=8000,channels=1`. A raw session has a single
//! stream, and the remote codec list has one or two entries: the first is what
//! the peer sends, the second what we send.
//!
//! # Raw one-way
//!
//! ```no_run
//! # use std::net::UdpSocket;
//! # use farstream::*;
//! let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
//! let port = receiver.local_addr().unwrap().port();
//!
//! let conference = Conference::new(ConferenceKind::Raw);
//! let session = conference
//!     .new_session(SessionConfig::new(MediaType::Audio))
//!     .unwrap();
//! let participant = conference.new_participant();
//! let stream = session.new_stream(&participant, Direction::Send).unwrap();
//!
//! stream
//!     .set_transmitter("rawudp", StreamTransmitterConfig::RawUdp(RawUdpConfig::new()))
//!     .unwrap();
//!
//! let remote = Candidate::new("1", 1, CandidateType::Host, NetworkProtocol::Udp, "127.0.0.1", port);
//! stream.force_remote_candidates(vec![remote]).unwrap();
//!
//! let caps = "audio/x-raw,format=S16LE,rate=8000,channels=1";
//! stream
//!     .set_remote_codecs(vec![Codec::raw(caps, MediaType::Audio)])
//!     .unwrap();
//!
//! session.send_packet(1, &[1, 2, 3, 4]).unwrap();
//!
//! let mut buf = [0; 1500];
//! let (n, _) = receiver.recv_from(&mut buf).unwrap();
//! assert_eq!(&buf[..n], &[1, 2, 3, 4]);
//! ```
//!
//! # ICE
//!
//! With the `nice` transmitter each side posts [`Event::NewLocalCandidate`] for
//! every candidate found and then [`Event::LocalCandidatesPrepared`] once. The
//! candidates carry the ICE credentials and are handed to the peer with
//! [`Stream::add_remote_candidates()`]. When the checks succeed the components go
//! to [`StreamState::Ready`] and [`Event::NewActiveCandidatePair`] names the pair
//! in use. Adding an empty list restarts ICE with new credentials.
//!
//! Streams to the same participant with the same STUN server, compatibility mode
//! and preferred addresses share one ICE agent.
//!
//! # Threads
//!
//! Transmitters run their own threads, socket readers and the ICE agent. These
//! are "internal" threads, see [`Conference::is_internal_thread()`]. A stream must
//! never be destroyed from one of them. [`Stream::destroy()`] refuses and logs an
//! error instead.
//!
//! Internally the locks are taken in the order conference, session, stream,
//! stream transmitter. Events are posted with no lock held.
//!
//! # Errors
//!
//! Operations return [`FsError`]. Every error has a stable number,
//! [`FsError::code()`], which is also what asynchronous [`Event::Error`] carries.
//! After `destroy()` all operations return [`FsError::Disposed`].

#![forbid(unsafe_code)]
#![allow(clippy::new_without_default)]
#![allow(clippy::manual_range_contains)]
#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

mod ice;
pub use ice::Compatibility;

mod net;

mod thread;
pub use thread::InternalThreads;

mod error;
pub use error::{ErrorKind, FsError};

mod id;
pub use id::{ParticipantId, SessionId, StreamId};

mod candidate;
pub use candidate::{Candidate, CandidateType, NetworkProtocol};

mod codec;
pub use codec::{codec_list_are_equal, codec_list_from_file, codec_list_from_str};
pub use codec::{codecs_need_resend, Caps};
pub use codec::{Codec, CodecId, CodecParameter, FeedbackParameter, MediaType};

mod config;
pub use config::{MulticastConfig, NiceConfig, RawUdpConfig, ShmConfig};
pub use config::{RelayInfo, RelayType, SessionConfig, StreamTransmitterConfig};

mod event;
pub use event::{Bus, Event, EventSource};

pub mod transmitter;
pub use transmitter::{ReceivedPacket, StreamState};

mod participant;
pub use participant::Participant;

mod session;
pub use session::Session;

mod stream;
pub use stream::{Direction, Stream};

mod conference;
pub use conference::{Conference, ConferenceKind};

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn handles_are_send_sync() {
        fn is_send_sync<T: Send + Sync>() {}
        is_send_sync::<Conference>();
        is_send_sync::<Session>();
        is_send_sync::<Stream>();
        is_send_sync::<Participant>();
        is_send_sync::<Bus>();
    }

    #[test]
    fn event_is_reasonably_sized() {
        let n = std::mem::size_of::<Event>();
        assert!(n < 450);
    }
}
