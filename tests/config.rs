use std::sync::Arc;

use farstream::transmitter::{self, RawUdpTransmitter, Transmitter, TransmitterParams};
use farstream::{Candidate, Compatibility, Conference, ConferenceKind, Direction, ErrorKind};
use farstream::{FsError, MediaType, NiceConfig, RawUdpConfig, RelayInfo, RelayType};
use farstream::{SessionConfig, StreamTransmitterConfig};

mod common;
use common::{init_log, local_candidates};

#[test]
pub fn nice_config_serializes() {
    init_log();

    let config = StreamTransmitterConfig::Nice(
        NiceConfig::new()
            .set_stun_ip("192.0.2.10")
            .set_stun_port(19302)
            .set_controlling_mode(false)
            .set_compatibility_mode(Compatibility::Google)
            .set_relay_info(vec![RelayInfo::new("192.0.2.20", 3478, "user", "pass")
                .set_relay_type(RelayType::Tls)
                .set_component(1)])
            .set_preferred_local_candidates(vec![Candidate::with_ip("127.0.0.1")]),
    );

    let json = serde_json::to_string(&config).unwrap();
    let back: StreamTransmitterConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);

    let StreamTransmitterConfig::Nice(nice) = back else {
        panic!("not nice");
    };
    assert_eq!(nice.stun_ip(), Some("192.0.2.10"));
    assert_eq!(nice.relay_info()[0].relay_type, RelayType::Tls);
}

#[test]
pub fn defaults() {
    let raw = RawUdpConfig::new();
    assert_eq!(raw.min_port(), 7078);
    assert_eq!(raw.max_port(), 65535);
    assert!(raw.associate_on_source());

    let nice = NiceConfig::new();
    assert_eq!(nice.stun_port(), 3478);
    assert!(nice.controlling_mode());
    assert!(nice.ice_udp());
    assert_eq!(nice.compatibility_mode(), Compatibility::Rfc5245);

    for kind in ["rawudp", "nice", "multicast", "shm"] {
        let c = StreamTransmitterConfig::default_for(kind).unwrap();
        assert_eq!(c.kind(), kind);
    }
    assert!(StreamTransmitterConfig::default_for("nosuch").is_none());
}

#[test]
pub fn registered_transmitter_is_usable() -> Result<(), FsError> {
    init_log();

    fn factory(params: &TransmitterParams) -> Result<Arc<dyn Transmitter>, FsError> {
        Ok(Arc::new(RawUdpTransmitter::new(params)?))
    }
    transmitter::register_transmitter("loopback-udp", factory);

    let conference = Conference::new(ConferenceKind::Raw);
    let session = conference.new_session(SessionConfig::new(MediaType::Audio))?;
    let available = session.list_transmitters();
    for kind in ["loopback-udp", "multicast", "nice", "rawudp", "shm"] {
        assert!(available.iter().any(|k| k == kind), "{} missing", kind);
    }

    let stream = session.new_stream(&conference.new_participant(), Direction::Both)?;
    let config = RawUdpConfig::new()
        .set_min_port(0)
        .set_preferred_local_candidates(vec![Candidate::with_ip("127.0.0.1")]);
    stream.set_transmitter("loopback-udp", StreamTransmitterConfig::RawUdp(config))?;
    let candidates = local_candidates(conference.bus(), stream.id());
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].ip.as_deref(), Some("127.0.0.1"));
    Ok(())
}

#[test]
pub fn session_config_is_validated() {
    let conference = Conference::new(ConferenceKind::Rtp);
    let e = conference
        .new_session(SessionConfig::new(MediaType::Video).set_components(256))
        .unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidArguments);

    let session = conference
        .new_session(SessionConfig::new(MediaType::Video).set_components(2).set_tos(0x88))
        .unwrap();
    assert_eq!(session.components(), 2);
    assert_eq!(session.tos(), 0x88);
    session.set_tos(0x10).unwrap();
    assert_eq!(session.tos(), 0x10);
}
