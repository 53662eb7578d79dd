//! Plain UDP with candidates given by the application.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::candidate::{Candidate, CandidateType, NetworkProtocol};
use crate::config::{RawUdpConfig, StreamTransmitterConfig};
use crate::error::FsError;
use crate::id::StreamId;
use crate::net;
use crate::participant::Participant;
use crate::thread::InternalThreads;

use super::{check_component, emit, wrong_config};
use super::{NetworkSink, NetworkSource, OutputId, PacketOutput};
use super::{StreamState, StreamTransmitter, StreamTransmitterEvent};
use super::{StreamTransmitterHandler, Transmitter, TransmitterParams};

/// Transmitter sending plain UDP.
///
/// Sockets are shared between the streams of a session. A stream asking for the
/// same address and port on a component gets the socket already bound for it.
#[derive(Clone)]
pub struct RawUdpTransmitter {
    inner: Arc<RawUdpInner>,
}

struct RawUdpInner {
    components: u16,
    tos: AtomicU8,
    source: NetworkSource,
    sink: NetworkSink,
    threads: InternalThreads,
    ports: Mutex<Vec<PortEntry>>,
}

struct PortEntry {
    component: u16,
    requested_ip: Option<IpAddr>,
    requested_port: u16,
    refcount: usize,
    port: Arc<UdpPort>,
}

/// A bound socket for one component.
struct UdpPort {
    component: u16,
    socket: UdpSocket,
    local: SocketAddr,
    /// Destinations with a count of the streams sending there.
    dests: Mutex<Vec<(SocketAddr, usize)>>,
    /// Remote addresses of streams that associate on source.
    known: RwLock<Vec<(SocketAddr, StreamId)>>,
    closed: AtomicBool,
    output: Mutex<Option<OutputId>>,
}

impl UdpPort {
    fn add_dest(&self, addr: SocketAddr) {
        debug!("Adding dest {} on {}", addr, self.local);
        let mut dests = self.dests.lock();
        match dests.iter_mut().find(|(a, _)| *a == addr) {
            Some((_, n)) => *n += 1,
            None => dests.push((addr, 1)),
        }
    }

    fn remove_dest(&self, addr: SocketAddr) {
        debug!("Removing dest {} on {}", addr, self.local);
        let mut dests = self.dests.lock();
        if let Some(idx) = dests.iter().position(|(a, _)| *a == addr) {
            dests[idx].1 -= 1;
            if dests[idx].1 == 0 {
                dests.remove(idx);
            }
        }
    }

    fn add_known(&self, addr: SocketAddr, stream: StreamId) {
        self.known.write().push((addr, stream));
    }

    fn remove_known(&self, addr: SocketAddr, stream: StreamId) {
        let mut known = self.known.write();
        if let Some(idx) = known.iter().position(|v| *v == (addr, stream)) {
            known.remove(idx);
        }
    }

    fn stream_of(&self, origin: SocketAddr) -> Option<StreamId> {
        self.known
            .read()
            .iter()
            .find(|(a, _)| *a == origin)
            .map(|(_, s)| *s)
    }
}

impl PacketOutput for UdpPort {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        let dests: Vec<_> = self.dests.lock().iter().map(|(a, _)| *a).collect();
        for dest in dests {
            self.socket.send_to(data, dest)?;
        }
        Ok(())
    }
}

impl RawUdpTransmitter {
    /// Creates the transmitter. No sockets are bound until a stream gathers.
    pub fn new(params: &TransmitterParams) -> Result<Self, FsError> {
        Ok(RawUdpTransmitter {
            inner: Arc::new(RawUdpInner {
                components: params.components,
                tos: AtomicU8::new(params.tos),
                source: NetworkSource::new(params.components, params.do_timestamp),
                sink: NetworkSink::new(params.components),
                threads: params.threads.clone(),
                ports: Mutex::new(vec![]),
            }),
        })
    }
}

impl RawUdpInner {
    /// Get a socket for a component, sharing an already bound one.
    fn get_port(
        self: &Arc<Self>,
        component: u16,
        requested_ip: Option<IpAddr>,
        requested_port: u16,
        max_port: u16,
    ) -> Result<Arc<UdpPort>, FsError> {
        if let Some(port) = self.get_port_locked(component, requested_ip, requested_port) {
            return Ok(port);
        }

        debug!(
            "Make new UdpPort for component {} requesting {}:{}",
            component,
            requested_ip.map(|v| v.to_string()).unwrap_or("ANY".into()),
            requested_port
        );

        let socket = bind_port(requested_ip, requested_port, max_port)?;
        net::set_tos(&socket, self.tos.load(Ordering::Relaxed));
        let local = socket.local_addr()?;

        let port = Arc::new(UdpPort {
            component,
            socket,
            local,
            dests: Mutex::new(vec![]),
            known: RwLock::new(vec![]),
            closed: AtomicBool::new(false),
            output: Mutex::new(None),
        });

        {
            let mut ports = self.ports.lock();
            // Someone else bound the same while we were binding.
            if let Some(e) = ports.iter_mut().find(|e| {
                e.component == component
                    && e.requested_ip == requested_ip
                    && e.requested_port == requested_port
            }) {
                e.refcount += 1;
                return Ok(e.port.clone());
            }
            ports.push(PortEntry {
                component,
                requested_ip,
                requested_port,
                refcount: 1,
                port: port.clone(),
            });
        }

        let id = self.sink.attach(component, port.clone());
        *port.output.lock() = Some(id);

        if let Err(e) = self.spawn_reader(port.clone()) {
            self.put_port(&port);
            return Err(e.into());
        }

        Ok(port)
    }

    fn get_port_locked(
        &self,
        component: u16,
        requested_ip: Option<IpAddr>,
        requested_port: u16,
    ) -> Option<Arc<UdpPort>> {
        let mut ports = self.ports.lock();
        let e = ports.iter_mut().find(|e| {
            e.component == component
                && e.requested_ip == requested_ip
                && e.requested_port == requested_port
        })?;
        trace!("Got port refcount {}->{}", e.refcount, e.refcount + 1);
        e.refcount += 1;
        Some(e.port.clone())
    }

    fn put_port(&self, port: &Arc<UdpPort>) {
        let mut ports = self.ports.lock();
        let Some(idx) = ports.iter().position(|e| Arc::ptr_eq(&e.port, port)) else {
            return;
        };
        let e = &mut ports[idx];
        trace!("Put port refcount {}->{}", e.refcount, e.refcount - 1);
        e.refcount -= 1;
        if e.refcount > 0 {
            return;
        }
        ports.remove(idx);
        drop(ports);

        port.closed.store(true, Ordering::Release);
        if let Some(id) = port.output.lock().take() {
            self.sink.detach(id);
        }
        debug!("Closed UdpPort {}", port.local);
    }

    fn spawn_reader(&self, port: Arc<UdpPort>) -> io::Result<()> {
        let source = self.source.clone();
        let name = format!("rawudp-recv-{}", port.local.port());
        self.threads.spawn(name, move || {
            let mut buf = vec![0_u8; net::DATAGRAM_MAX];
            while !port.closed.load(Ordering::Acquire) {
                match port.socket.recv_from(&mut buf) {
                    Ok((n, origin)) => {
                        let stream = port.stream_of(origin);
                        source.push(port.component, Some(origin), stream, &buf[..n]);
                    }
                    Err(e) if net::is_timeout(&e) => {}
                    Err(e) => trace!("Receive error on {}: {}", port.local, e),
                }
            }
        })?;
        Ok(())
    }
}

fn bind_port(ip: Option<IpAddr>, port: u16, max_port: u16) -> Result<UdpSocket, FsError> {
    let ip = ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let mut port = port as u32;
    loop {
        match net::bind_udp(SocketAddr::new(ip, port as u16), false) {
            Ok(v) => return Ok(v),
            Err(e) => {
                info!("could not bind port {}: {}", port, e);
                port += 2;
                if port == 0 || port > max_port as u32 {
                    return Err(FsError::Network(
                        "Could not bind the socket to a port".into(),
                    ));
                }
            }
        }
    }
}

impl fmt::Debug for RawUdpTransmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawUdpTransmitter")
            .field("components", &self.inner.components)
            .field("ports", &self.inner.ports.lock().len())
            .finish()
    }
}

impl Transmitter for RawUdpTransmitter {
    fn kind(&self) -> &'static str {
        "rawudp"
    }

    fn components(&self) -> u16 {
        self.inner.components
    }

    fn source(&self) -> &NetworkSource {
        &self.inner.source
    }

    fn sink(&self) -> &NetworkSink {
        &self.inner.sink
    }

    fn tos(&self) -> u8 {
        self.inner.tos.load(Ordering::Relaxed)
    }

    fn set_tos(&self, tos: u8) {
        self.inner.tos.store(tos, Ordering::Relaxed);
        for e in self.inner.ports.lock().iter() {
            net::set_tos(&e.port.socket, tos);
        }
    }

    fn new_stream_transmitter(
        &self,
        _participant: &Participant,
        stream: StreamId,
        config: StreamTransmitterConfig,
        handler: Weak<dyn StreamTransmitterHandler>,
    ) -> Result<StreamTransmitter, FsError> {
        let StreamTransmitterConfig::RawUdp(config) = config else {
            return Err(wrong_config(self.kind(), &config));
        };
        config.validate()?;

        let components = self.inner.components as usize;
        let st = RawUdpStreamTransmitter {
            inner: Arc::new(RawUdpStreamInner {
                transmitter: self.inner.clone(),
                stream,
                config,
                handler,
                state: Mutex::new(RawUdpState {
                    ports: vec![None; components],
                    locals: vec![None; components],
                    remotes: vec![None; components],
                    sending: true,
                    gathered: false,
                    stopped: false,
                }),
            }),
        };
        Ok(StreamTransmitter::RawUdp(st))
    }
}

/// Stream transmitter of [`RawUdpTransmitter`].
pub struct RawUdpStreamTransmitter {
    inner: Arc<RawUdpStreamInner>,
}

struct RawUdpStreamInner {
    transmitter: Arc<RawUdpInner>,
    stream: StreamId,
    config: RawUdpConfig,
    handler: Weak<dyn StreamTransmitterHandler>,
    state: Mutex<RawUdpState>,
}

struct RawUdpState {
    ports: Vec<Option<Arc<UdpPort>>>,
    /// First local candidate per component.
    locals: Vec<Option<Candidate>>,
    remotes: Vec<Option<(Candidate, SocketAddr)>>,
    sending: bool,
    gathered: bool,
    stopped: bool,
}

impl RawUdpStreamInner {
    fn preferred_for(&self, component: u16) -> Option<&Candidate> {
        let preferred = self.config.preferred_local_candidates();
        preferred
            .iter()
            .find(|c| c.component_id == component)
            .or_else(|| preferred.iter().find(|c| c.component_id == 0))
    }

    /// Events for a component that got its remote address.
    fn connected_events(
        &self,
        state: &RawUdpState,
        component: u16,
        out: &mut Vec<StreamTransmitterEvent>,
    ) {
        let idx = component as usize - 1;
        let (Some(local), Some((remote, _))) = (&state.locals[idx], &state.remotes[idx]) else {
            return;
        };
        out.push(StreamTransmitterEvent::NewActiveCandidatePair {
            local: local.clone(),
            remote: remote.clone(),
        });
        // A new destination needs a key unit to start decoding.
        out.push(StreamTransmitterEvent::KeyUnitRequested { component });
        out.push(StreamTransmitterEvent::StateChanged {
            component,
            state: StreamState::Connected,
        });
        out.push(StreamTransmitterEvent::StateChanged {
            component,
            state: StreamState::Ready,
        });
    }
}

impl RawUdpStreamTransmitter {
    pub(crate) fn gather_local_candidates(&self) -> Result<(), FsError> {
        let inner = &self.inner;
        let t = &inner.transmitter;

        let mut state = inner.state.lock();
        if state.stopped {
            return Err(FsError::disposed("stream transmitter"));
        }
        if state.gathered {
            return Err(FsError::invalid(
                "Local candidates have already been gathered",
            ));
        }

        let mut candidates = vec![];
        let mut bound = vec![];

        for component in 1..=t.components {
            let preferred = inner.preferred_for(component);
            let ip = preferred.and_then(|c| c.ip_addr());
            let port = match preferred {
                Some(c) if c.port != 0 => c.port,
                _ if inner.config.min_port() == 0 => 0,
                _ => inner
                    .config
                    .min_port()
                    .saturating_add(component - 1)
                    .min(inner.config.max_port()),
            };

            let udpport = match t.get_port(component, ip, port, inner.config.max_port()) {
                Ok(v) => v,
                Err(e) => {
                    for p in &bound {
                        t.put_port(p);
                    }
                    return Err(e);
                }
            };
            bound.push(udpport.clone());

            let ips = match ip {
                Some(ip) => vec![ip],
                None => local_ips(),
            };
            for (i, ip) in ips.into_iter().enumerate() {
                let c = Candidate::new(
                    (i + 1).to_string(),
                    component,
                    CandidateType::Host,
                    NetworkProtocol::Udp,
                    ip.to_string(),
                    udpport.local.port(),
                );
                if i == 0 {
                    state.locals[component as usize - 1] = Some(c.clone());
                }
                candidates.push(c);
            }

            state.ports[component as usize - 1] = Some(udpport);
        }

        state.gathered = true;

        let mut events: Vec<_> = candidates
            .into_iter()
            .map(StreamTransmitterEvent::NewLocalCandidate)
            .collect();
        events.push(StreamTransmitterEvent::LocalCandidatesPrepared);

        // Remote candidates given before gathering.
        for component in 1..=t.components {
            let idx = component as usize - 1;
            let (Some(port), Some((_, addr))) = (&state.ports[idx], &state.remotes[idx]) else {
                continue;
            };
            if state.sending {
                port.add_dest(*addr);
            }
            if inner.config.associate_on_source() {
                port.add_known(*addr, inner.stream);
            }
            inner.connected_events(&state, component, &mut events);
        }
        drop(state);

        for e in events {
            emit(&inner.handler, e);
        }
        Ok(())
    }

    pub(crate) fn add_remote_candidates(&self, candidates: Vec<Candidate>) -> Result<(), FsError> {
        let inner = &self.inner;
        let components = inner.transmitter.components;

        let mut parsed = vec![];
        for c in candidates {
            let Some(ip) = c.ip.as_deref() else {
                return Err(FsError::invalid("Candidate MUST have an IP address"));
            };
            check_component(&c, components)?;
            let addr = c
                .socket_addr()
                .ok_or_else(|| FsError::invalid(format!("Invalid IP address {} passed", ip)))?;
            parsed.push((c, addr));
        }

        let mut state = inner.state.lock();
        if state.stopped {
            return Err(FsError::disposed("stream transmitter"));
        }

        let mut events = vec![];
        for (c, addr) in parsed {
            let component = c.component_id;
            let idx = component as usize - 1;

            let old = state.remotes[idx].replace((c, addr)).map(|(_, a)| a);
            if old == Some(addr) {
                continue;
            }

            if let Some(port) = &state.ports[idx] {
                if let Some(old) = old {
                    if state.sending {
                        port.remove_dest(old);
                    }
                    port.remove_known(old, inner.stream);
                }
                if state.sending {
                    port.add_dest(addr);
                }
                if inner.config.associate_on_source() {
                    port.add_known(addr, inner.stream);
                }
                inner.connected_events(&state, component, &mut events);
            }
        }
        drop(state);

        for e in events {
            emit(&inner.handler, e);
        }
        Ok(())
    }

    pub(crate) fn force_remote_candidates(&self, candidates: Vec<Candidate>) -> Result<(), FsError> {
        self.add_remote_candidates(candidates)
    }

    pub(crate) fn sending(&self) -> bool {
        self.inner.state.lock().sending
    }

    pub(crate) fn set_sending(&self, sending: bool) {
        let mut state = self.inner.state.lock();
        if state.sending == sending || state.stopped {
            state.sending = sending;
            return;
        }
        state.sending = sending;
        for (port, remote) in state.ports.iter().zip(state.remotes.iter()) {
            let (Some(port), Some((_, addr))) = (port, remote) else {
                continue;
            };
            if sending {
                port.add_dest(*addr);
            } else {
                port.remove_dest(*addr);
            }
        }
    }

    pub(crate) fn stop(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;

        let mut release = vec![];
        for idx in 0..state.ports.len() {
            let Some(port) = state.ports[idx].take() else {
                continue;
            };
            if let Some((_, addr)) = &state.remotes[idx] {
                if state.sending {
                    port.remove_dest(*addr);
                }
                port.remove_known(*addr, inner.stream);
            }
            release.push(port);
        }
        drop(state);

        for port in release {
            inner.transmitter.put_port(&port);
        }
    }

    /// Local port of a component, once gathered.
    pub fn local_port(&self, component: u16) -> Option<u16> {
        let state = self.inner.state.lock();
        state
            .ports
            .get(component.checked_sub(1)? as usize)?
            .as_ref()
            .map(|p| p.local.port())
    }
}

/// Addresses to announce for a socket bound to all IPv4 interfaces.
fn local_ips() -> Vec<IpAddr> {
    let ips: Vec<_> = net::host_addresses()
        .unwrap_or_default()
        .into_iter()
        .filter(|ip| ip.is_ipv4())
        .collect();
    if ips.is_empty() {
        return vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
    }
    ips
}

impl fmt::Debug for RawUdpStreamTransmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawUdpStreamTransmitter")
            .field("stream", &self.inner.stream)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam::channel::{self, Receiver, Sender};
    use std::time::Duration;

    struct Events(Sender<StreamTransmitterEvent>);

    impl StreamTransmitterHandler for Events {
        fn handle_event(&self, event: StreamTransmitterEvent) {
            let _ = self.0.send(event);
        }
    }

    fn setup(
        components: u16,
        config: RawUdpConfig,
    ) -> (
        RawUdpTransmitter,
        StreamTransmitter,
        Arc<dyn StreamTransmitterHandler>,
        Receiver<StreamTransmitterEvent>,
    ) {
        let t = RawUdpTransmitter::new(&TransmitterParams::new(components, 0)).unwrap();
        let (tx, rx) = channel::unbounded();
        let handler: Arc<dyn StreamTransmitterHandler> = Arc::new(Events(tx));
        let st = t
            .new_stream_transmitter(
                &Participant::new(),
                StreamId::from(1),
                StreamTransmitterConfig::RawUdp(config),
                Arc::downgrade(&handler),
            )
            .unwrap();
        (t, st, handler, rx)
    }

    fn loopback_config() -> RawUdpConfig {
        RawUdpConfig::new()
            .set_min_port(0)
            .set_preferred_local_candidates(vec![Candidate::with_ip("127.0.0.1")])
    }

    #[test]
    fn gather_emits_then_prepared() {
        let (_t, st, _h, rx) = setup(2, loopback_config());
        st.gather_local_candidates().unwrap();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            StreamTransmitterEvent::NewLocalCandidate(c) if c.component_id == 1
        ));
        assert!(matches!(
            &events[1],
            StreamTransmitterEvent::NewLocalCandidate(c) if c.component_id == 2
        ));
        assert_eq!(events[2], StreamTransmitterEvent::LocalCandidatesPrepared);

        let e = st.gather_local_candidates().unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidArguments);
    }

    #[test]
    fn remote_gives_ready_and_sends() {
        let (t, st, _h, rx) = setup(1, loopback_config());
        st.gather_local_candidates().unwrap();
        let _: Vec<_> = rx.try_iter().collect();

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let port = peer.local_addr().unwrap().port();

        let remote = Candidate::new(
            "1",
            1,
            CandidateType::Host,
            NetworkProtocol::Udp,
            "127.0.0.1",
            port,
        );
        st.force_remote_candidates(vec![remote]).unwrap();

        let events: Vec<_> = rx.try_iter().collect();
        assert!(events.contains(&StreamTransmitterEvent::KeyUnitRequested { component: 1 }));
        let states: Vec<_> = events
            .into_iter()
            .filter_map(|e| match e {
                StreamTransmitterEvent::StateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![StreamState::Connected, StreamState::Ready]);

        assert_eq!(t.sink().push(1, b"hello").unwrap(), 1);
        let mut buf = [0; 16];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn received_packets_are_associated() {
        let (t, st, _h, _rx) = setup(1, loopback_config());
        st.gather_local_candidates().unwrap();
        let StreamTransmitter::RawUdp(raw) = &st else {
            unreachable!()
        };
        let local_port = raw.local_port(1).unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let remote = Candidate::new(
            "1",
            1,
            CandidateType::Host,
            NetworkProtocol::Udp,
            "127.0.0.1",
            peer.local_addr().unwrap().port(),
        );
        st.add_remote_candidates(vec![remote]).unwrap();

        peer.send_to(b"ping", ("127.0.0.1", local_port)).unwrap();
        let p = t.source().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(p.data, b"ping");
        assert_eq!(p.component, 1);
        assert_eq!(p.stream, Some(StreamId::from(1)));
    }

    #[test]
    fn ports_are_shared_and_released() {
        let t = RawUdpTransmitter::new(&TransmitterParams::new(1, 0)).unwrap();
        let ip = Some("127.0.0.1".parse().unwrap());
        let a = t.inner.get_port(1, ip, 0, 65535).unwrap();
        let b = t.inner.get_port(1, ip, 0, 65535).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(t.sink().output_count(1), 1);

        t.inner.put_port(&a);
        assert_eq!(t.sink().output_count(1), 1);
        t.inner.put_port(&b);
        assert_eq!(t.sink().output_count(1), 0);
        assert!(a.closed.load(Ordering::Acquire));
    }

    #[test]
    fn bad_remote_is_rejected() {
        let (_t, st, _h, _rx) = setup(1, loopback_config());
        let mut c = Candidate::with_ip("not an ip");
        c.component_id = 1;
        let e = st.add_remote_candidates(vec![c]).unwrap_err();
        assert_eq!(e.message(), "Invalid IP address not an ip passed");

        let mut c = Candidate::with_ip("127.0.0.1");
        c.component_id = 2;
        assert!(st.add_remote_candidates(vec![c]).is_err());
    }

    #[test]
    fn wrong_config_kind() {
        let t = RawUdpTransmitter::new(&TransmitterParams::new(1, 0)).unwrap();
        let (tx, _rx) = channel::unbounded();
        let handler: Arc<dyn StreamTransmitterHandler> = Arc::new(Events(tx));
        let e = t
            .new_stream_transmitter(
                &Participant::new(),
                StreamId::from(1),
                StreamTransmitterConfig::Shm(crate::config::ShmConfig::new()),
                Arc::downgrade(&handler),
            )
            .unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidArguments);
    }
}
