use farstream::{Codec, CodecId, Conference, ConferenceKind, Direction, ErrorKind, Event};
use farstream::{FsError, MediaType, SessionConfig};

mod common;
use common::{drain, init_log};

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
    Codec::new(101, "telephone-event", MediaType::Audio, 8000).with_parameter("events", "0-15")
}

fn names(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}

#[test]
pub fn renegotiation() -> Result<(), FsError> {
    init_log();

    let conference = Conference::new(ConferenceKind::Rtp);
    let session = conference.new_session(SessionConfig::new(MediaType::Audio))?;
    session.set_codec_preferences(vec![
        Codec::new(CodecId::Any, "opus", MediaType::Audio, 0),
        Codec::new(CodecId::Any, "PCMA", MediaType::Audio, 0),
    ])?;

    let s1 = session.new_stream(&conference.new_participant(), Direction::Both)?;
    let s2 = session.new_stream(&conference.new_participant(), Direction::Both)?;

    s1.set_remote_codecs(vec![pcmu(), pcma(), opus()])?;
    assert_eq!(session.current_send_codec(), Some(opus()));
    drain(conference.bus());

    // The intersection loses opus, the next preference wins.
    s2.set_remote_codecs(vec![pcma(), pcmu()])?;
    let events = drain(conference.bus());
    assert_eq!(
        names(&events),
        vec![
            "farstream-codecs-changed",
            "farstream-recv-codecs-changed",
            "farstream-send-codec-changed"
        ]
    );
    match &events[2] {
        Event::SendCodecChanged { codec, .. } => assert_eq!(codec, &pcma()),
        e => panic!("unexpected {:?}", e),
    }
    assert_eq!(session.codecs(), vec![pcma(), pcmu()]);

    // Only PCMU is left in common.
    s2.set_remote_codecs(vec![pcmu()])?;
    assert_eq!(session.current_send_codec(), Some(pcmu()));
    let events = drain(conference.bus());
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::SendCodecChanged { codec, .. } if codec == &pcmu())));

    // Nothing in common is refused and leaves the old list.
    let e = s2.set_remote_codecs(vec![opus()]).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::NegotiationFailed);
    assert_eq!(s2.remote_codecs(), vec![pcmu()]);
    assert_eq!(session.current_send_codec(), Some(pcmu()));

    // Leaving restores the wider set.
    s2.destroy();
    assert_eq!(session.current_send_codec(), Some(opus()));
    Ok(())
}

#[test]
pub fn set_remote_codecs_is_idempotent() -> Result<(), FsError> {
    init_log();

    let conference = Conference::new(ConferenceKind::Rtp);
    let session = conference.new_session(SessionConfig::new(MediaType::Audio))?;
    let stream = session.new_stream(&conference.new_participant(), Direction::Both)?;

    stream.set_remote_codecs(vec![pcmu(), pcma()])?;
    stream.set_remote_codecs(vec![pcmu(), pcma()])?;

    let events = drain(conference.bus());
    let changed = events
        .iter()
        .filter(|e| matches!(e, Event::CodecsChanged { .. }))
        .count();
    assert_eq!(changed, 1);
    Ok(())
}

#[test]
pub fn secondary_codecs_follow_clock_rate() -> Result<(), FsError> {
    init_log();

    let conference = Conference::new(ConferenceKind::Rtp);
    let session = conference.new_session(SessionConfig::new(MediaType::Audio))?;
    let stream = session.new_stream(&conference.new_participant(), Direction::Both)?;

    stream.set_remote_codecs(vec![pcmu(), dtmf()])?;

    let sent = drain(conference.bus()).into_iter().find_map(|e| match e {
        Event::SendCodecChanged {
            codec,
            secondary_codecs,
            ..
        } => Some((codec, secondary_codecs)),
        _ => None,
    });
    assert_eq!(sent, Some((pcmu(), vec![dtmf()])));

    // Only a telephone-event is not enough to send.
    let other = session.new_stream(&conference.new_participant(), Direction::Both)?;
    let e = other.set_remote_codecs(vec![dtmf()]).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::NegotiationFailed);
    Ok(())
}

#[test]
pub fn send_codec_and_preferences() -> Result<(), FsError> {
    init_log();

    let conference = Conference::new(ConferenceKind::Rtp);
    let session = conference.new_session(SessionConfig::new(MediaType::Audio))?;
    let stream = session.new_stream(&conference.new_participant(), Direction::Both)?;
    stream.set_remote_codecs(vec![pcmu(), pcma()])?;
    assert_eq!(session.current_send_codec(), Some(pcmu()));

    session.set_send_codec(&pcma())?;
    assert_eq!(session.current_send_codec(), Some(pcma()));

    let e = session.set_send_codec(&opus()).unwrap_err();
    assert_eq!(e.message(), "The passed codec is not part of the list of codecs");

    // Disabled in preferences, PCMA goes away and with it the requested send codec.
    session.set_codec_preferences(vec![Codec::new(CodecId::Disable, "PCMA", MediaType::Audio, 0)])?;
    assert_eq!(session.codecs(), vec![pcmu()]);
    assert_eq!(session.current_send_codec(), Some(pcmu()));

    let e = session.set_encryption_parameters(&[]).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::NotImplemented);
    let e = session.start_telephony_event(1, 10).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::NotImplemented);
    Ok(())
}
