use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Kind of candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    /// A local address.
    #[default]
    Host,
    /// Server reflexive, the address a STUN server saw.
    Srflx,
    /// Peer reflexive, the address the peer saw.
    Prflx,
    /// An address allocated on a relay.
    Relay,
    /// A multicast group.
    Multicast,
}

/// Transport of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkProtocol {
    /// Plain UDP.
    #[default]
    Udp,
    /// TCP without a stated direction.
    Tcp,
    /// TCP that waits for a connection.
    TcpPassive,
    /// TCP that opens the connection.
    TcpActive,
    /// TCP simultaneous open.
    TcpSo,
}

/// Description of a transport address for one component.
///
/// This is the value that travels over the signaling. It is not validated on
/// construction, every transmitter checks what it needs when it gets one.
///
/// ```
/// use farstream::{Candidate, CandidateType, NetworkProtocol};
///
/// let c = Candidate::new("1", 1, CandidateType::Host, NetworkProtocol::Udp, "127.0.0.1", 5000)
///     .set_username("ufrag")
///     .set_password("pass");
///
/// assert_eq!(c.socket_addr(), Some("127.0.0.1:5000".parse().unwrap()));
/// ```
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Candidate {
    pub foundation: String,
    pub component_id: u16,
    /// IP address, or for shm a socket path.
    pub ip: Option<String>,
    pub port: u16,
    pub base_ip: Option<String>,
    pub base_port: u16,
    pub proto: NetworkProtocol,
    pub priority: u32,
    #[serde(rename = "type")]
    pub kind: CandidateType,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Multicast time to live.
    pub ttl: u8,
}

impl Candidate {
    /// Creates a candidate with the mandatory fields.
    pub fn new(
        foundation: impl Into<String>,
        component_id: u16,
        kind: CandidateType,
        proto: NetworkProtocol,
        ip: impl Into<String>,
        port: u16,
    ) -> Self {
        Candidate {
            foundation: foundation.into(),
            component_id,
            ip: Some(ip.into()),
            port,
            proto,
            kind,
            ..Default::default()
        }
    }

    /// A candidate that only names an address, as used for preferred local candidates.
    pub fn with_ip(ip: impl Into<String>) -> Self {
        Candidate {
            ip: Some(ip.into()),
            ..Default::default()
        }
    }

    /// Set the ICE username fragment.
    pub fn set_username(mut self, v: impl Into<String>) -> Self {
        self.username = Some(v.into());
        self
    }

    /// Set the ICE password.
    pub fn set_password(mut self, v: impl Into<String>) -> Self {
        self.password = Some(v.into());
        self
    }

    /// Set the priority.
    pub fn set_priority(mut self, v: u32) -> Self {
        self.priority = v;
        self
    }

    /// Set the base address of a reflexive candidate.
    pub fn set_base(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.base_ip = Some(ip.into());
        self.base_port = port;
        self
    }

    /// Set the multicast TTL.
    pub fn set_ttl(mut self, v: u8) -> Self {
        self.ttl = v;
        self
    }

    /// The IP address, if the `ip` field parses as one.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.ip.as_deref()?.parse().ok()
    }

    /// The IP and port as a socket address.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip_addr().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// The base address, if there is one.
    pub fn base_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.base_ip.as_deref()?.parse().ok()?;
        Some(SocketAddr::new(ip, self.base_port))
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:?} {:?} {}:{}",
            self.foundation,
            self.component_id,
            self.proto,
            self.kind,
            self.ip.as_deref().unwrap_or("-"),
            self.port
        )?;
        if let Some(base) = &self.base_ip {
            write!(f, " base {}:{}", base, self.base_port)?;
        }
        Ok(())
    }
}

/// Whether two candidates name the same transport address.
pub(crate) fn same_address(a: &Candidate, b: &Candidate) -> bool {
    a.component_id == b.component_id && a.ip == b.ip && a.port == b.port && a.proto == b.proto
}
