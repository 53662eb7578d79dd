use std::time::Instant;

use farstream::{Candidate, CandidateType, Codec, Compatibility, Conference, ConferenceKind};
use farstream::{Direction, ErrorKind, Event, FsError, MediaType, NetworkProtocol, NiceConfig};
use farstream::{Session, SessionConfig, Stream, StreamState, StreamTransmitterConfig};

mod common;
use common::{init_log, local_candidates, wait_state, TIMEOUT};

struct Side {
    conference: Conference,
    session: Session,
    stream: Stream,
}

impl Side {
    fn new(controlling: bool) -> Result<Side, FsError> {
        let conference = Conference::new(ConferenceKind::Rtp);
        let session = conference.new_session(SessionConfig::new(MediaType::Audio))?;
        let participant = conference.new_participant();
        let stream = session.new_stream(&participant, Direction::Both)?;

        let config = NiceConfig::new()
            .set_compatibility_mode(Compatibility::Rfc5245)
            .set_controlling_mode(controlling)
            .set_preferred_local_candidates(vec![Candidate::with_ip("127.0.0.1")]);
        stream.set_transmitter("nice", StreamTransmitterConfig::Nice(config))?;

        Ok(Side {
            conference,
            session,
            stream,
        })
    }

    fn candidates(&self) -> Vec<Candidate> {
        local_candidates(self.conference.bus(), self.stream.id())
    }

    fn wait_ready(&self) {
        wait_state(
            self.conference.bus(),
            self.stream.id(),
            1,
            StreamState::Ready,
        );
    }

    /// Candidates announced after a restart, recognized by their new username.
    fn fresh_candidates(&self, old_username: &str, count: usize) -> Vec<Candidate> {
        let mut out = vec![];
        let deadline = Instant::now() + TIMEOUT;
        while out.len() < count {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.conference.bus().recv_timeout(left) {
                Some(Event::NewLocalCandidate { candidate, .. })
                    if candidate.username.as_deref() != Some(old_username) =>
                {
                    out.push(candidate)
                }
                Some(_) => {}
                None => panic!("No candidates after restart"),
            }
        }
        out
    }
}

fn connect() -> Result<(Side, Side, Vec<Candidate>, Vec<Candidate>), FsError> {
    let l = Side::new(true)?;
    let r = Side::new(false)?;

    let lc = l.candidates();
    let rc = r.candidates();
    assert!(!lc.is_empty() && !rc.is_empty());
    for c in lc.iter().chain(rc.iter()) {
        assert!(c.username.is_some() && c.password.is_some());
        assert_eq!(c.component_id, 1);
    }

    l.stream.add_remote_candidates(rc.clone())?;
    r.stream.add_remote_candidates(lc.clone())?;

    l.wait_ready();
    r.wait_ready();
    Ok((l, r, lc, rc))
}

#[test]
pub fn ice_candidate_exchange() -> Result<(), FsError> {
    init_log();

    let (l, r, _, _) = connect()?;

    let pcmu = Codec::new(0, "PCMU", MediaType::Audio, 8000);
    l.stream.set_remote_codecs(vec![pcmu.clone()])?;
    r.stream.set_remote_codecs(vec![pcmu])?;

    l.session.send_packet(1, b"hello over ice")?;
    let p = r.session.recv_timeout(TIMEOUT).expect("a packet");
    assert_eq!(p.data, b"hello over ice");
    assert_eq!(p.component, 1);
    assert_eq!(p.stream, Some(r.stream.id()));

    // A connected component asks for a key unit.
    assert!(l.session.keyunit_requests() > 0);

    l.stream.destroy();
    r.stream.destroy();
    Ok(())
}

#[test]
pub fn ice_restart() -> Result<(), FsError> {
    init_log();

    let (l, r, lc, rc) = connect()?;
    let l_user = lc[0].username.clone().unwrap_or_default();
    let r_user = rc[0].username.clone().unwrap_or_default();

    l.stream.add_remote_candidates(vec![])?;
    r.stream.add_remote_candidates(vec![])?;

    let lc2 = l.fresh_candidates(&l_user, lc.len());
    let rc2 = r.fresh_candidates(&r_user, rc.len());
    assert_eq!(lc2[0].ip, lc[0].ip);
    assert_ne!(lc2[0].username, lc[0].username);

    l.stream.add_remote_candidates(rc2)?;
    r.stream.add_remote_candidates(lc2)?;

    l.wait_ready();
    r.wait_ready();

    l.stream.destroy();
    r.stream.destroy();
    Ok(())
}

#[test]
pub fn ice_credential_mismatch() -> Result<(), FsError> {
    init_log();

    let l = Side::new(true)?;
    l.candidates();

    let c1 = Candidate::new("1", 1, CandidateType::Host, NetworkProtocol::Udp, "127.0.0.1", 9)
        .set_username("one")
        .set_password("secret");
    let c2 = Candidate::new("2", 1, CandidateType::Host, NetworkProtocol::Udp, "127.0.0.1", 11)
        .set_username("two")
        .set_password("secret");

    let e = l
        .stream
        .add_remote_candidates(vec![c1.clone(), c2.clone()])
        .unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidArguments);

    // Nothing was stored, so the second username is still free to use.
    l.stream.add_remote_candidates(vec![c2])?;
    let e = l.stream.add_remote_candidates(vec![c1]).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidArguments);

    l.stream.destroy();
    Ok(())
}

#[test]
pub fn ice_forced_pair() -> Result<(), FsError> {
    init_log();

    let l = Side::new(true)?;
    let r = Side::new(false)?;
    let lc = l.candidates();
    let rc = r.candidates();

    l.stream.force_remote_candidates(vec![rc[0].clone()])?;
    r.stream.force_remote_candidates(vec![lc[0].clone()])?;
    l.wait_ready();
    r.wait_ready();

    // Forced candidates can't be mixed with checked ones.
    let e = l.stream.add_remote_candidates(rc).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidArguments);

    // Two candidates for one component.
    let e = l
        .stream
        .force_remote_candidates(vec![lc[0].clone(), lc[0].clone()])
        .unwrap_err();
    assert_eq!(e.message(), "You can set only one candidate per component");

    let pcmu = Codec::new(0, "PCMU", MediaType::Audio, 8000);
    l.stream.set_remote_codecs(vec![pcmu.clone()])?;
    r.stream.set_remote_codecs(vec![pcmu])?;
    r.session.send_packet(1, b"forced")?;
    let p = l.session.recv_timeout(TIMEOUT).expect("a packet");
    assert_eq!(p.data, b"forced");

    l.stream.destroy();
    r.stream.destroy();
    Ok(())
}

#[test]
pub fn ice_two_sessions_one_participant() -> Result<(), FsError> {
    init_log();

    let conference = Conference::new(ConferenceKind::Rtp);
    let audio = conference.new_session(SessionConfig::new(MediaType::Audio))?;
    let video = conference.new_session(SessionConfig::new(MediaType::Video))?;
    let participant = conference.new_participant();

    let config = StreamTransmitterConfig::Nice(
        NiceConfig::new().set_preferred_local_candidates(vec![Candidate::with_ip("127.0.0.1")]),
    );
    let a = audio.new_stream(&participant, Direction::Both)?;
    let v = video.new_stream(&participant, Direction::Both)?;
    a.set_transmitter("nice", config.clone())?;
    v.set_transmitter("nice", config)?;

    // Each stream gets its own prepared event.
    let mut waiting = vec![a.id(), v.id()];
    let deadline = Instant::now() + TIMEOUT;
    while !waiting.is_empty() {
        let left = deadline.saturating_duration_since(Instant::now());
        match conference.bus().recv_timeout(left) {
            Some(Event::LocalCandidatesPrepared { stream }) => {
                assert!(waiting.contains(&stream), "prepared twice");
                waiting.retain(|s| *s != stream);
            }
            Some(_) => {}
            None => panic!("Missing local-candidates-prepared"),
        }
    }

    a.destroy();
    v.destroy();
    Ok(())
}
