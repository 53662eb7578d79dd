//! Configuration of sessions and stream transmitters.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::candidate::{Candidate, CandidateType};
use crate::codec::MediaType;
use crate::error::FsError;
use crate::ice::Compatibility;

/// Configuration for creating a [`crate::Session`].
///
/// ```
/// use farstream::{MediaType, SessionConfig};
///
/// let config = SessionConfig::new(MediaType::Video)
///     .set_components(2)
///     .set_tos(0xb8);
///
/// assert_eq!(config.components(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    media_type: MediaType,
    components: u16,
    tos: u8,
    do_timestamp: bool,
}

impl SessionConfig {
    /// Creates a config with one component.
    pub fn new(media_type: MediaType) -> Self {
        SessionConfig {
            media_type,
            components: 1,
            tos: 0,
            do_timestamp: true,
        }
    }

    /// Audio, video or application.
    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// Number of components, 1..=255. RTP with RTCP uses 2.
    pub fn components(&self) -> u16 {
        self.components
    }

    /// Set the number of components. Defaults to 1.
    pub fn set_components(mut self, components: u16) -> Self {
        self.components = components;
        self
    }

    /// IP type of service applied to all sockets.
    pub fn tos(&self) -> u8 {
        self.tos
    }

    /// Set the type of service.
    pub fn set_tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    /// Whether received packets are timestamped.
    pub fn do_timestamp(&self) -> bool {
        self.do_timestamp
    }

    /// Whether received packets get a timestamp. Defaults to `true`.
    pub fn set_do_timestamp(mut self, v: bool) -> Self {
        self.do_timestamp = v;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), FsError> {
        check_components(self.components)
    }
}

pub(crate) fn check_components(components: u16) -> Result<(), FsError> {
    if components == 0 || components > 255 {
        return Err(FsError::invalid(format!(
            "Invalid number of components {}, must be between 1 and 255",
            components
        )));
    }
    Ok(())
}

/// Parameters for the stream transmitter of a [`crate::Stream`].
///
/// The variant selects the transmitter kind.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StreamTransmitterConfig {
    RawUdp(RawUdpConfig),
    Nice(NiceConfig),
    Multicast(MulticastConfig),
    Shm(ShmConfig),
}

impl StreamTransmitterConfig {
    /// The transmitter kind name, as in [`crate::transmitter::list_available()`].
    pub fn kind(&self) -> &'static str {
        match self {
            StreamTransmitterConfig::RawUdp(_) => "rawudp",
            StreamTransmitterConfig::Nice(_) => "nice",
            StreamTransmitterConfig::Multicast(_) => "multicast",
            StreamTransmitterConfig::Shm(_) => "shm",
        }
    }

    /// Default configuration for a kind.
    pub fn default_for(kind: &str) -> Option<Self> {
        let c = match kind {
            "rawudp" => StreamTransmitterConfig::RawUdp(RawUdpConfig::new()),
            "nice" => StreamTransmitterConfig::Nice(NiceConfig::new()),
            "multicast" => StreamTransmitterConfig::Multicast(MulticastConfig::new()),
            "shm" => StreamTransmitterConfig::Shm(ShmConfig::new()),
            _ => return None,
        };
        Some(c)
    }
}

/// Plain UDP transmitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawUdpConfig {
    preferred_local_candidates: Vec<Candidate>,
    associate_on_source: bool,
    min_port: u16,
    max_port: u16,
}

impl RawUdpConfig {
    /// Defaults, port range 7078 to 65535.
    pub fn new() -> Self {
        RawUdpConfig {
            preferred_local_candidates: vec![],
            associate_on_source: true,
            min_port: 7078,
            max_port: 65535,
        }
    }

    /// Host candidates to bind to. Port 0 means starting at `min_port`.
    pub fn preferred_local_candidates(&self) -> &[Candidate] {
        &self.preferred_local_candidates
    }

    /// Set the preferred local candidates.
    pub fn set_preferred_local_candidates(mut self, v: Vec<Candidate>) -> Self {
        self.preferred_local_candidates = v;
        self
    }

    /// Tag received packets with the stream of their sender.
    pub fn associate_on_source(&self) -> bool {
        self.associate_on_source
    }

    /// Set associate on source.
    pub fn set_associate_on_source(mut self, v: bool) -> Self {
        self.associate_on_source = v;
        self
    }

    /// First port tried for component 1. Component `c` starts at `min_port + c - 1`.
    pub fn min_port(&self) -> u16 {
        self.min_port
    }

    /// Set the first port to try. 0 lets the system pick.
    pub fn set_min_port(mut self, v: u16) -> Self {
        self.min_port = v;
        self
    }

    /// Highest port to bind.
    pub fn max_port(&self) -> u16 {
        self.max_port
    }

    /// Set max port.
    pub fn set_max_port(mut self, v: u16) -> Self {
        self.max_port = v;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), FsError> {
        if self.min_port > self.max_port {
            return Err(FsError::invalid("The min-port must be lower than max-port"));
        }
        for c in &self.preferred_local_candidates {
            if c.kind != CandidateType::Host {
                return Err(FsError::invalid(
                    "You can only set preferred candidates of type host",
                ));
            }
            if c.ip_addr().is_none() {
                return Err(FsError::invalid(format!(
                    "Invalid IP address {} passed",
                    c.ip.as_deref().unwrap_or("")
                )));
            }
        }
        Ok(())
    }
}

/// Kind of TURN relay.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayType {
    #[default]
    Udp,
    Tcp,
    Tls,
}

/// A TURN relay.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    pub ip: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub relay_type: RelayType,
    /// Only for this component. `None` applies to every component without its own.
    pub component: Option<u16>,
}

impl RelayInfo {
    /// A relay with credentials, used for all components.
    pub fn new(
        ip: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        RelayInfo {
            ip: ip.into(),
            port,
            username: Some(username.into()),
            password: Some(password.into()),
            relay_type: RelayType::Udp,
            component: None,
        }
    }

    /// Set relay type.
    pub fn set_relay_type(mut self, v: RelayType) -> Self {
        self.relay_type = v;
        self
    }

    /// Only use the relay for this component.
    pub fn set_component(mut self, v: u16) -> Self {
        self.component = Some(v);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), FsError> {
        if self.ip.is_empty()
            || self.port == 0
            || self.username.is_none()
            || self.password.is_none()
        {
            return Err(FsError::invalid(
                "Need to pass an ip, port, username and password for a relay",
            ));
        }
        Ok(())
    }
}

/// ICE transmitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NiceConfig {
    preferred_local_candidates: Vec<Candidate>,
    stun_ip: Option<String>,
    stun_port: u16,
    controlling_mode: bool,
    ice_udp: bool,
    ice_tcp: bool,
    reliable: bool,
    compatibility_mode: Compatibility,
    relay_info: Vec<RelayInfo>,
    min_port: u16,
    max_port: u16,
    send_component_mux: bool,
    debug: bool,
    associate_on_source: bool,
}

impl NiceConfig {
    /// Defaults, controlling with UDP and TCP enabled.
    pub fn new() -> Self {
        NiceConfig {
            preferred_local_candidates: vec![],
            stun_ip: None,
            stun_port: 3478,
            controlling_mode: true,
            ice_udp: true,
            ice_tcp: true,
            reliable: false,
            compatibility_mode: Compatibility::Rfc5245,
            relay_info: vec![],
            min_port: 0,
            max_port: 0,
            send_component_mux: true,
            debug: false,
            associate_on_source: true,
        }
    }

    /// Addresses to gather on. Each must be a host candidate with only an ip.
    pub fn preferred_local_candidates(&self) -> &[Candidate] {
        &self.preferred_local_candidates
    }

    /// Set the preferred local candidates.
    pub fn set_preferred_local_candidates(mut self, v: Vec<Candidate>) -> Self {
        self.preferred_local_candidates = v;
        self
    }

    /// STUN server for server reflexive candidates.
    pub fn stun_ip(&self) -> Option<&str> {
        self.stun_ip.as_deref()
    }

    /// Set the STUN server address.
    pub fn set_stun_ip(mut self, v: impl Into<String>) -> Self {
        self.stun_ip = Some(v.into());
        self
    }

    /// STUN server port.
    pub fn stun_port(&self) -> u16 {
        self.stun_port
    }

    /// Set stun port.
    pub fn set_stun_port(mut self, v: u16) -> Self {
        self.stun_port = v;
        self
    }

    /// Initial ICE role.
    pub fn controlling_mode(&self) -> bool {
        self.controlling_mode
    }

    /// Set controlling mode.
    pub fn set_controlling_mode(mut self, v: bool) -> Self {
        self.controlling_mode = v;
        self
    }

    /// Whether UDP candidates are gathered.
    pub fn ice_udp(&self) -> bool {
        self.ice_udp
    }

    /// Set ice udp.
    pub fn set_ice_udp(mut self, v: bool) -> Self {
        self.ice_udp = v;
        self
    }

    /// Whether TCP candidates are wanted.
    pub fn ice_tcp(&self) -> bool {
        self.ice_tcp
    }

    /// Set ice tcp.
    pub fn set_ice_tcp(mut self, v: bool) -> Self {
        self.ice_tcp = v;
        self
    }

    /// Reliable (pseudo-TCP) mode. Only recorded.
    pub fn reliable(&self) -> bool {
        self.reliable
    }

    /// Set reliable.
    pub fn set_reliable(mut self, v: bool) -> Self {
        self.reliable = v;
        self
    }

    /// Dialect of ICE.
    pub fn compatibility_mode(&self) -> Compatibility {
        self.compatibility_mode
    }

    /// Set compatibility mode.
    pub fn set_compatibility_mode(mut self, v: Compatibility) -> Self {
        self.compatibility_mode = v;
        self
    }

    /// Relay servers.
    pub fn relay_info(&self) -> &[RelayInfo] {
        &self.relay_info
    }

    /// Set the relay servers.
    pub fn set_relay_info(mut self, v: Vec<RelayInfo>) -> Self {
        self.relay_info = v;
        self
    }

    /// Port range. Only applied if `min_port < max_port`.
    pub fn min_port(&self) -> u16 {
        self.min_port
    }

    /// Set min port.
    pub fn set_min_port(mut self, v: u16) -> Self {
        self.min_port = v;
        self
    }

    /// Highest port to bind.
    pub fn max_port(&self) -> u16 {
        self.max_port
    }

    /// Set max port.
    pub fn set_max_port(mut self, v: u16) -> Self {
        self.max_port = v;
        self
    }

    /// Send RTCP over the RTP component when the peer supports it. Only recorded.
    pub fn send_component_mux(&self) -> bool {
        self.send_component_mux
    }

    /// Set send component mux.
    pub fn set_send_component_mux(mut self, v: bool) -> Self {
        self.send_component_mux = v;
        self
    }

    /// Log the agent at debug level.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Log agent internals.
    pub fn set_debug(mut self, v: bool) -> Self {
        self.debug = v;
        self
    }

    /// Whether received packets are tagged with the stream of the sender.
    pub fn associate_on_source(&self) -> bool {
        self.associate_on_source
    }

    /// Set associate on source.
    pub fn set_associate_on_source(mut self, v: bool) -> Self {
        self.associate_on_source = v;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), FsError> {
        for c in &self.preferred_local_candidates {
            if c.ip.is_none() {
                return Err(FsError::invalid(
                    "You have to set an ip on your preferred candidate",
                ));
            }
            if c.port != 0 || c.component_id != 0 {
                return Err(FsError::invalid(
                    "You can not set a port or component id for the preferred nice candidate",
                ));
            }
            if c.kind != CandidateType::Host {
                return Err(FsError::invalid(
                    "You can only set preferred candidates of type host",
                ));
            }
            if c.ip_addr().is_none() {
                return Err(FsError::invalid(format!(
                    "Invalid IP address {} passed",
                    c.ip.as_deref().unwrap_or("")
                )));
            }
        }
        for (i, r) in self.relay_info.iter().enumerate() {
            r.validate()?;
            if r.ip.parse::<std::net::IpAddr>().is_err() {
                return Err(FsError::invalid(format!(
                    "Element {} of the relay-info does not have an ip as a string",
                    i
                )));
            }
        }
        if let Some(ip) = &self.stun_ip {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(FsError::invalid(format!("Invalid stun-ip {}", ip)));
            }
        }
        Ok(())
    }

    /// The relays that apply to a component.
    pub(crate) fn relays_for(&self, component: u16) -> Vec<RelayInfo> {
        let specific: Vec<_> = self
            .relay_info
            .iter()
            .filter(|r| r.component == Some(component))
            .cloned()
            .collect();
        if !specific.is_empty() {
            return specific;
        }
        self.relay_info
            .iter()
            .filter(|r| r.component.is_none())
            .cloned()
            .collect()
    }
}

/// Multicast transmitter.
///
/// The group, port and TTL come from remote candidates of type
/// [`CandidateType::Multicast`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastConfig {
    preferred_local_candidates: Vec<Candidate>,
}

impl MulticastConfig {
    /// No preferred candidates.
    pub fn new() -> Self {
        MulticastConfig {
            preferred_local_candidates: vec![],
        }
    }

    /// Local interface per component to join the groups on.
    pub fn preferred_local_candidates(&self) -> &[Candidate] {
        &self.preferred_local_candidates
    }

    /// Set the multicast groups to join, as candidates of type multicast.
    pub fn set_preferred_local_candidates(mut self, v: Vec<Candidate>) -> Self {
        self.preferred_local_candidates = v;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), FsError> {
        for c in &self.preferred_local_candidates {
            if c.ip_addr().is_none() {
                return Err(FsError::invalid(
                    "The preferred candidate must have a valid IP address",
                ));
            }
        }
        Ok(())
    }
}

/// Local socket transmitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmConfig {
    socket_dir: PathBuf,
}

impl ShmConfig {
    /// Sockets in the temporary directory.
    pub fn new() -> Self {
        ShmConfig {
            socket_dir: std::env::temp_dir(),
        }
    }

    /// Directory where the local sockets are created.
    pub fn socket_dir(&self) -> &PathBuf {
        &self.socket_dir
    }

    /// Set the directory for the sockets.
    pub fn set_socket_dir(mut self, v: impl Into<PathBuf>) -> Self {
        self.socket_dir = v.into();
        self
    }

    pub(crate) fn validate(&self) -> Result<(), FsError> {
        if !self.socket_dir.is_dir() {
            return Err(FsError::invalid(format!(
                "The socket directory {} does not exist",
                self.socket_dir.display()
            )));
        }
        Ok(())
    }
}

impl Default for RawUdpConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for NiceConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::candidate::NetworkProtocol;

    #[test]
    fn components_range() {
        assert!(SessionConfig::new(MediaType::Audio).validate().is_ok());
        let e = SessionConfig::new(MediaType::Audio)
            .set_components(0)
            .validate()
            .unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidArguments);
        assert!(SessionConfig::new(MediaType::Audio)
            .set_components(256)
            .validate()
            .is_err());
    }

    #[test]
    fn nice_preferred_must_be_bare_host() {
        let ok = NiceConfig::new().set_preferred_local_candidates(vec![Candidate::with_ip(
            "127.0.0.1",
        )]);
        assert!(ok.validate().is_ok());

        let with_port = NiceConfig::new().set_preferred_local_candidates(vec![Candidate::new(
            "",
            0,
            CandidateType::Host,
            NetworkProtocol::Udp,
            "127.0.0.1",
            5000,
        )]);
        assert_eq!(
            with_port.validate().unwrap_err().message(),
            "You can not set a port or component id for the preferred nice candidate"
        );

        let mut srflx = Candidate::with_ip("127.0.0.1");
        srflx.kind = CandidateType::Srflx;
        let e = NiceConfig::new()
            .set_preferred_local_candidates(vec![srflx])
            .validate()
            .unwrap_err();
        assert_eq!(e.message(), "You can only set preferred candidates of type host");

        let e = NiceConfig::new()
            .set_preferred_local_candidates(vec![Candidate::default()])
            .validate()
            .unwrap_err();
        assert_eq!(e.message(), "You have to set an ip on your preferred candidate");
    }

    #[test]
    fn relay_needs_credentials() {
        let mut r = RelayInfo::new("1.2.3.4", 3478, "u", "p");
        assert!(r.validate().is_ok());
        r.password = None;
        assert_eq!(
            r.validate().unwrap_err().message(),
            "Need to pass an ip, port, username and password for a relay"
        );
    }

    #[test]
    fn relays_per_component() {
        let all = RelayInfo::new("1.2.3.4", 3478, "u", "p");
        let two = RelayInfo::new("5.6.7.8", 3478, "u", "p").set_component(2);
        let c = NiceConfig::new().set_relay_info(vec![all.clone(), two.clone()]);
        assert_eq!(c.relays_for(1), vec![all]);
        assert_eq!(c.relays_for(2), vec![two]);
    }
}
