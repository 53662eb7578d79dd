use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use super::IceError;

/// ICE candidates are network addresses used to connect to a peer.
///
/// There are different kinds of ICE candidates. The simplest kind is a
/// host candidate which is a socket address on a local (host) network interface.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    /// An arbitrary string used in the freezing algorithm to
    /// group similar candidates.
    ///
    /// For remote, this is communicated, and locally it's calculated.
    foundation: Option<String>,

    /// A component is a piece of a data stream. 1 for RTP, 2 for RTCP.
    component_id: u16,

    /// Priority.
    ///
    /// For remote, this is communicated, and locally it's (mostly) calculated.
    /// For local peer reflexive it is set.
    prio: Option<u32>,

    /// The actual address to use. This might be a host address, server reflex, relay etc.
    addr: SocketAddr,

    /// The address an agent sends from for a particular candidate.
    ///
    /// * host - same as `addr`, i.e the local interface address
    /// * peer/server reflexive - the local interface address
    base: Option<SocketAddr>,

    /// Type of candidate.
    kind: CandidateKind,

    /// Short term credentials this candidate belongs to.
    ///
    /// Remote candidates carry them from the signaling. In some compatibility
    /// modes every candidate has its own credentials.
    ufrag: Option<String>,
    pass: Option<String>,

    /// The ice agent might assign a local preference if we have multiple candidates
    /// that are the same type.
    local_preference: Option<u32>,

    /// If we discarded this candidate (for example due to being redundant
    /// against another candidate).
    discarded: bool,
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Candidate({}={} comp={}",
            self.kind, self.addr, self.component_id
        )?;
        if let Some(base) = self.base {
            if base != self.addr {
                write!(f, " base={base}")?;
            }
        }
        write!(f, " prio={}", self.prio())?;
        if self.discarded {
            write!(f, " discarded")?;
        }
        write!(f, ")")
    }
}

impl Candidate {
    fn new(
        component_id: u16,
        addr: SocketAddr,
        base: Option<SocketAddr>,
        kind: CandidateKind,
    ) -> Self {
        Candidate {
            foundation: None,
            component_id,
            prio: None,
            addr,
            base,
            kind,
            ufrag: None,
            pass: None,
            local_preference: None,
            discarded: false,
        }
    }

    /// Creates a host ICE candidate.
    ///
    /// Host candidates are local sockets directly on the host.
    pub fn host(addr: SocketAddr, component_id: u16) -> Result<Self, IceError> {
        check_component(component_id)?;
        if !is_valid_ip(addr.ip()) {
            return Err(IceError::BadCandidate(format!("invalid ip {}", addr.ip())));
        }

        Ok(Candidate::new(
            component_id,
            addr,
            Some(addr),
            CandidateKind::Host,
        ))
    }

    /// Creates a server reflexive ICE candidate.
    ///
    /// Server reflexive candidates are local sockets mapped to external ip discovered
    /// via a STUN binding request.
    /// The `base` is the local interface that this address corresponds to.
    pub fn server_reflexive(
        addr: SocketAddr,
        base: SocketAddr,
        component_id: u16,
    ) -> Result<Self, IceError> {
        check_component(component_id)?;
        if !is_valid_ip(addr.ip()) {
            return Err(IceError::BadCandidate(format!("invalid ip {}", addr.ip())));
        }

        if addr.is_ipv4() != base.is_ipv4() {
            return Err(IceError::BadCandidate(
                "addr and base are different IP versions".to_owned(),
            ));
        }

        Ok(Candidate::new(
            component_id,
            addr,
            Some(base),
            CandidateKind::ServerReflexive,
        ))
    }

    /// Creates a candidate learned from the remote peer.
    pub fn remote(
        foundation: String,
        component_id: u16,
        prio: u32,
        addr: SocketAddr,
        kind: CandidateKind,
        ufrag: Option<String>,
        pass: Option<String>,
    ) -> Result<Self, IceError> {
        check_component(component_id)?;
        if addr.ip().is_unspecified() || addr.ip().is_multicast() {
            return Err(IceError::BadCandidate(format!("invalid ip {}", addr.ip())));
        }

        let mut c = Candidate::new(component_id, addr, None, kind);
        c.foundation = Some(foundation);
        // The prio must never be 0, since that would sort it after everything.
        c.prio = Some(prio.max(1));
        c.ufrag = ufrag;
        c.pass = pass;
        Ok(c)
    }

    /// Creates a peer reflexive ICE candidate.
    ///
    /// Peer reflexive candidates are NAT:ed addresses discovered via STUN
    /// binding responses. `addr` is the discovered address. `base` is the local
    /// (host) address inside the NAT we used to get this response.
    pub(crate) fn peer_reflexive(
        component_id: u16,
        addr: SocketAddr,
        base: SocketAddr,
        prio: u32,
        found: Option<String>,
    ) -> Self {
        let mut c = Candidate::new(component_id, addr, Some(base), CandidateKind::PeerReflexive);
        c.prio = Some(prio);
        c.foundation = found;
        c
    }

    /// Candidate foundation.
    ///
    /// For local candidates this is calculated.
    pub fn foundation(&self) -> String {
        if let Some(v) = &self.foundation {
            return v.clone();
        }

        // Two candidates have the same foundation when they have the same
        // type, their bases have the same IP address and they were obtained
        // using the same transport protocol (always UDP here).
        let mut hasher = DefaultHasher::new();
        self.kind.hash(&mut hasher);
        self.base().ip().hash(&mut hasher);

        // Keep it short and within ice-chars.
        format!("{:x}", hasher.finish() as u32)
    }

    /// Returns the priority value for the specified ICE candidate.
    ///
    /// The priority is a positive integer between 1 and 2^31 - 1 (inclusive), calculated
    /// according to the ICE specification defined in RFC 8445, Section 5.1.2.
    pub fn prio(&self) -> u32 {
        self.do_prio(false)
    }

    pub(crate) fn prio_prflx(&self) -> u32 {
        self.do_prio(true)
    }

    fn do_prio(&self, as_prflx: bool) -> u32 {
        // Remote candidates have their prio calculated on their side.
        if let Some(prio) = &self.prio {
            return *prio;
        }

        let kind = if as_prflx {
            CandidateKind::PeerReflexive
        } else {
            self.kind
        };

        // RECOMMENDED values for type preferences.
        let type_preference: u32 = match kind {
            CandidateKind::Host => 126,
            CandidateKind::PeerReflexive => 110,
            CandidateKind::ServerReflexive => 100,
            CandidateKind::Relayed => 0,
        };

        // priority = (2^24)*(type preference) +
        //     (2^8)*(local preference) +
        //     (2^0)*(256 - component ID)
        type_preference << 24
            | self.local_preference() << 8
            | (256 - self.component_id as u32)
    }

    pub(crate) fn local_preference(&self) -> u32 {
        self.local_preference
            .unwrap_or_else(|| if self.addr.is_ipv6() { 65_535 } else { 65_534 })
    }

    pub fn component_id(&self) -> u16 {
        self.component_id
    }

    /// Returns the address for the specified ICE candidate.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn base(&self) -> SocketAddr {
        self.base.unwrap_or(self.addr)
    }

    /// Returns the kind of this candidate.
    pub fn kind(&self) -> CandidateKind {
        self.kind
    }

    pub(crate) fn set_local_preference(&mut self, v: u32) {
        self.local_preference = Some(v);
    }

    pub(crate) fn set_discarded(&mut self) {
        self.discarded = true;
    }

    pub(crate) fn discarded(&self) -> bool {
        self.discarded
    }

    pub fn ufrag(&self) -> Option<&str> {
        self.ufrag.as_deref()
    }

    pub fn pass(&self) -> Option<&str> {
        self.pass.as_deref()
    }

    pub(crate) fn with_ufrag(mut self, ufrag: String) -> Self {
        self.ufrag = Some(ufrag);
        self
    }
}

fn check_component(component_id: u16) -> Result<(), IceError> {
    if component_id == 0 || component_id > 255 {
        return Err(IceError::BadCandidate(format!(
            "invalid component id {component_id}"
        )));
    }
    Ok(())
}

/// Type of candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    /// Host (local network interface)
    Host,
    /// Prflx (Peer reflexive)
    PeerReflexive,
    /// Srflx (STUN)
    ServerReflexive,
    /// Relay (TURN)
    Relayed,
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = match self {
            CandidateKind::Host => "host",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::Relayed => "relay",
        };
        write!(f, "{x}")
    }
}

fn is_valid_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v) => !v.is_broadcast() && !v.is_multicast() && !v.is_unspecified(),
        IpAddr::V6(v) => !v.is_multicast() && !v.is_unspecified(),
    }
}
