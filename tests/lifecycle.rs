use farstream::{Candidate, Codec, Conference, ConferenceKind, Direction, ErrorKind, Event};
use farstream::{EventSource, FsError, MediaType, RawUdpConfig, SessionConfig};
use farstream::StreamTransmitterConfig;

mod common;
use common::{drain, init_log};

fn rawudp() -> StreamTransmitterConfig {
    StreamTransmitterConfig::RawUdp(RawUdpConfig::new().set_min_port(0))
}

#[test]
pub fn disposed_after_destroy() -> Result<(), FsError> {
    init_log();

    let conference = Conference::new(ConferenceKind::Rtp);
    let session = conference.new_session(SessionConfig::new(MediaType::Audio))?;
    let participant = conference.new_participant();
    let stream = session.new_stream(&participant, Direction::Both)?;
    stream.set_transmitter("rawudp", rawudp())?;

    stream.destroy();
    assert!(stream.is_destroyed());

    let codec = Codec::new(0, "PCMU", MediaType::Audio, 8000);
    let e = stream.set_remote_codecs(vec![codec.clone()]).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Disposed);
    let e = stream.add_remote_candidates(vec![]).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Disposed);
    let e = stream.set_direction(Direction::Recv).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Disposed);
    let e = stream.set_transmitter("rawudp", rawudp()).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Disposed);

    // Destroying twice is fine.
    stream.destroy();

    let other = session.new_stream(&participant, Direction::Both)?;
    session.destroy();
    assert!(other.is_destroyed());

    let e = session.new_stream(&participant, Direction::Both).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Disposed);
    assert_eq!(e.message(), "Called function after session has been disposed");
    let e = session.set_codec_preferences(vec![codec]).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Disposed);
    let e = session.send_packet(1, b"late").unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Disposed);
    Ok(())
}

#[test]
pub fn failed_gather_detaches_stream() -> Result<(), FsError> {
    init_log();

    let conference = Conference::new(ConferenceKind::Raw);
    let session = conference.new_session(SessionConfig::new(MediaType::Audio))?;
    let participant = conference.new_participant();
    let stream = session.new_stream(&participant, Direction::Both)?;

    // TEST-NET-1 is not a local address, nothing can be bound.
    let config = RawUdpConfig::new()
        .set_min_port(40000)
        .set_max_port(40010)
        .set_preferred_local_candidates(vec![Candidate::with_ip("192.0.2.1")]);
    let e = stream
        .set_transmitter("rawudp", StreamTransmitterConfig::RawUdp(config))
        .unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Network);
    assert_eq!(e.message(), "Could not bind the socket to a port");

    assert!(stream.is_destroyed());
    assert!(session.streams().is_empty());
    let e = stream.add_remote_candidates(vec![]).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Disposed);

    // The raw session has room for a new stream.
    let stream = session.new_stream(&participant, Direction::Both)?;
    stream.set_transmitter("rawudp", rawudp())?;
    Ok(())
}

#[test]
pub fn bad_transmitter_config_leaves_stream() -> Result<(), FsError> {
    init_log();

    let conference = Conference::new(ConferenceKind::Rtp);
    let session = conference.new_session(SessionConfig::new(MediaType::Audio))?;
    let stream = session.new_stream(&conference.new_participant(), Direction::Both)?;

    let e = stream.set_transmitter("nosuch", rawudp()).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Construction);

    let e = stream.set_transmitter("nice", rawudp()).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidArguments);

    let config = RawUdpConfig::new().set_min_port(2000).set_max_port(1000);
    let e = stream
        .set_transmitter("rawudp", StreamTransmitterConfig::RawUdp(config))
        .unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidArguments);

    // Still usable.
    assert!(!stream.is_destroyed());
    stream.set_transmitter("rawudp", rawudp())?;
    assert!(drain(conference.bus())
        .iter()
        .any(|e| matches!(e, Event::LocalCandidatesPrepared { stream: s } if *s == stream.id())));
    Ok(())
}

#[test]
pub fn destroy_from_internal_thread_is_refused() -> Result<(), FsError> {
    init_log();

    let conference = Conference::new(ConferenceKind::Rtp);
    let session = conference.new_session(SessionConfig::new(MediaType::Audio))?;
    let stream = session.new_stream(&conference.new_participant(), Direction::Both)?;

    let c = conference.clone();
    let s = stream.clone();
    std::thread::spawn(move || {
        c.thread_enter();
        assert!(c.is_internal_thread());
        s.destroy();
        c.thread_leave();
    })
    .join()
    .unwrap();

    assert!(!stream.is_destroyed());
    stream.destroy();
    assert!(stream.is_destroyed());
    Ok(())
}

#[test]
pub fn bad_remote_candidate_is_refused() -> Result<(), FsError> {
    init_log();

    let conference = Conference::new(ConferenceKind::Raw);
    let session = conference.new_session(SessionConfig::new(MediaType::Audio))?;
    let stream = session.new_stream(&conference.new_participant(), Direction::Both)?;
    stream.set_transmitter("rawudp", rawudp())?;
    drain(conference.bus());

    // Bad candidates are refused synchronously, never posted.
    let mut bad = Candidate::with_ip("not an ip");
    bad.component_id = 1;
    let e = stream.add_remote_candidates(vec![bad]).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidArguments);
    assert!(drain(conference.bus())
        .iter()
        .all(|e| !matches!(e, Event::Error { src: EventSource::Stream(_), .. })));
    Ok(())
}
