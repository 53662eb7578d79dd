//! UDP multicast. Remote candidates name the group, local candidates the interface.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::candidate::{Candidate, CandidateType, NetworkProtocol};
use crate::config::{MulticastConfig, StreamTransmitterConfig};
use crate::error::FsError;
use crate::id::StreamId;
use crate::net;
use crate::participant::Participant;
use crate::thread::InternalThreads;

use super::{check_component, emit, wrong_config};
use super::{NetworkSink, NetworkSource, OutputId, PacketOutput};
use super::{StreamState, StreamTransmitter, StreamTransmitterEvent};
use super::{StreamTransmitterHandler, Transmitter, TransmitterParams};

/// Transmitter sending to multicast groups.
#[derive(Clone)]
pub struct MulticastTransmitter {
    inner: Arc<MulticastInner>,
}

struct MulticastInner {
    components: u16,
    tos: AtomicU8,
    source: NetworkSource,
    sink: NetworkSink,
    threads: InternalThreads,
    sockets: Mutex<Vec<GroupEntry>>,
}

struct GroupEntry {
    refcount: usize,
    socket: Arc<GroupSocket>,
}

/// A socket joined to a group for one component.
struct GroupSocket {
    component: u16,
    local_ip: Option<IpAddr>,
    group: SocketAddr,
    socket: UdpSocket,
    /// TTL asked for by each user, the biggest applies.
    ttls: Mutex<Vec<u8>>,
    /// Users that currently send.
    senders: AtomicUsize,
    closed: AtomicBool,
    output: Mutex<Option<OutputId>>,
}

impl GroupSocket {
    fn is(&self, component: u16, local_ip: Option<IpAddr>, group: SocketAddr) -> bool {
        self.component == component && self.local_ip == local_ip && self.group == group
    }

    fn add_ttl(&self, ttl: u8) {
        let mut ttls = self.ttls.lock();
        ttls.push(ttl);
        self.apply_ttl(&ttls);
    }

    fn remove_ttl(&self, ttl: u8) {
        let mut ttls = self.ttls.lock();
        if let Some(idx) = ttls.iter().position(|t| *t == ttl) {
            ttls.remove(idx);
        }
        self.apply_ttl(&ttls);
    }

    fn apply_ttl(&self, ttls: &[u8]) {
        let Some(ttl) = ttls.iter().max() else {
            return;
        };
        if let Err(e) = net::set_multicast_ttl(&self.socket, self.group.ip(), *ttl) {
            warn!("Could not set multicast TTL {} on {}: {}", ttl, self.group, e);
        }
    }
}

impl PacketOutput for GroupSocket {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        if self.senders.load(Ordering::Relaxed) == 0 {
            return Ok(());
        }
        self.socket.send_to(data, self.group)?;
        Ok(())
    }
}

impl MulticastTransmitter {
    /// Creates the transmitter. Groups are joined when remote candidates are set.
    pub fn new(params: &TransmitterParams) -> Result<Self, FsError> {
        Ok(MulticastTransmitter {
            inner: Arc::new(MulticastInner {
                components: params.components,
                tos: AtomicU8::new(params.tos),
                source: NetworkSource::new(params.components, params.do_timestamp),
                sink: NetworkSink::new(params.components),
                threads: params.threads.clone(),
                sockets: Mutex::new(vec![]),
            }),
        })
    }
}

impl MulticastInner {
    fn get_socket(
        &self,
        component: u16,
        local_ip: Option<IpAddr>,
        group: SocketAddr,
    ) -> Result<Arc<GroupSocket>, FsError> {
        let mut sockets = self.sockets.lock();
        if let Some(e) = sockets
            .iter_mut()
            .find(|e| e.socket.is(component, local_ip, group))
        {
            e.refcount += 1;
            return Ok(e.socket.clone());
        }

        let any = match group.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = net::bind_udp(SocketAddr::new(any, group.port()), true).map_err(|e| {
            FsError::Network(format!(
                "Could not bind to port {} for multicast: {}",
                group.port(),
                e
            ))
        })?;
        net::join_multicast(&socket, group.ip(), local_ip.unwrap_or(any)).map_err(|e| {
            FsError::Network(format!(
                "Could not join the multicast group {}: {}",
                group.ip(),
                e
            ))
        })?;
        net::set_tos(&socket, self.tos.load(Ordering::Relaxed));

        debug!(
            "Joined multicast group {} on component {} from {:?}",
            group, component, local_ip
        );

        let socket = Arc::new(GroupSocket {
            component,
            local_ip,
            group,
            socket,
            ttls: Mutex::new(vec![]),
            senders: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            output: Mutex::new(None),
        });

        let id = self.sink.attach(component, socket.clone());
        *socket.output.lock() = Some(id);

        let reader = socket.clone();
        let source = self.source.clone();
        let spawned = self
            .threads
            .spawn(format!("multicast-recv-{}", group), move || {
                let mut buf = vec![0_u8; net::DATAGRAM_MAX];
                while !reader.closed.load(Ordering::Acquire) {
                    match reader.socket.recv_from(&mut buf) {
                        Ok((n, origin)) => {
                            source.push(reader.component, Some(origin), None, &buf[..n])
                        }
                        Err(e) if net::is_timeout(&e) => {}
                        Err(e) => trace!("Multicast receive error on {}: {}", reader.group, e),
                    }
                }
            });
        if let Err(e) = spawned {
            self.sink.detach(id);
            socket.closed.store(true, Ordering::Release);
            return Err(e.into());
        }

        sockets.push(GroupEntry {
            refcount: 1,
            socket: socket.clone(),
        });
        Ok(socket)
    }

    fn put_socket(&self, socket: &Arc<GroupSocket>) {
        let mut sockets = self.sockets.lock();
        let Some(idx) = sockets.iter().position(|e| Arc::ptr_eq(&e.socket, socket)) else {
            return;
        };
        sockets[idx].refcount -= 1;
        if sockets[idx].refcount > 0 {
            return;
        }
        sockets.remove(idx);
        drop(sockets);

        let local = socket.local_ip.unwrap_or(match socket.group.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
        if let Err(e) = net::leave_multicast(&socket.socket, socket.group.ip(), local) {
            debug!("Could not leave group {}: {}", socket.group, e);
        }
        socket.closed.store(true, Ordering::Release);
        if let Some(id) = socket.output.lock().take() {
            self.sink.detach(id);
        }
        debug!("Left multicast group {}", socket.group);
    }
}

impl fmt::Debug for MulticastTransmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MulticastTransmitter")
            .field("components", &self.inner.components)
            .field("groups", &self.inner.sockets.lock().len())
            .finish()
    }
}

impl Transmitter for MulticastTransmitter {
    fn kind(&self) -> &'static str {
        "multicast"
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
        for e in self.inner.sockets.lock().iter() {
            net::set_tos(&e.socket.socket, tos);
        }
    }

    fn new_stream_transmitter(
        &self,
        _participant: &Participant,
        stream: StreamId,
        config: StreamTransmitterConfig,
        handler: Weak<dyn StreamTransmitterHandler>,
    ) -> Result<StreamTransmitter, FsError> {
        let StreamTransmitterConfig::Multicast(config) = config else {
            return Err(wrong_config(self.kind(), &config));
        };
        config.validate()?;

        let components = self.inner.components as usize;
        Ok(StreamTransmitter::Multicast(MulticastStreamTransmitter {
            transmitter: self.inner.clone(),
            stream,
            config,
            handler,
            state: Mutex::new(MulticastState {
                joined: vec![None; components],
                sending: true,
                gathered: false,
                stopped: false,
            }),
        }))
    }
}

/// Stream transmitter of [`MulticastTransmitter`].
pub struct MulticastStreamTransmitter {
    transmitter: Arc<MulticastInner>,
    stream: StreamId,
    config: MulticastConfig,
    handler: Weak<dyn StreamTransmitterHandler>,
    state: Mutex<MulticastState>,
}

struct MulticastState {
    /// Per component the group joined with the remote candidate it came from.
    joined: Vec<Option<(Arc<GroupSocket>, Candidate)>>,
    sending: bool,
    gathered: bool,
    stopped: bool,
}

impl MulticastStreamTransmitter {
    fn local_ip(&self, component: u16) -> Option<IpAddr> {
        let preferred = self.config.preferred_local_candidates();
        preferred
            .iter()
            .find(|c| c.component_id == component)
            .or_else(|| preferred.iter().find(|c| c.component_id == 0))
            .and_then(|c| c.ip_addr())
    }

    fn leave(&self, sending: bool, socket: Arc<GroupSocket>, remote: &Candidate) {
        if sending {
            socket.senders.fetch_sub(1, Ordering::Relaxed);
        }
        socket.remove_ttl(remote.ttl);
        self.transmitter.put_socket(&socket);
    }

    pub(crate) fn gather_local_candidates(&self) -> Result<(), FsError> {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return Err(FsError::disposed("stream transmitter"));
            }
            if state.gathered {
                return Err(FsError::invalid(
                    "Local candidates have already been gathered",
                ));
            }
            state.gathered = true;
        }
        emit(&self.handler, StreamTransmitterEvent::LocalCandidatesPrepared);
        Ok(())
    }

    pub(crate) fn add_remote_candidates(&self, candidates: Vec<Candidate>) -> Result<(), FsError> {
        let components = self.transmitter.components;

        let mut groups = vec![];
        for c in candidates {
            check_component(&c, components)?;
            if c.kind != CandidateType::Multicast {
                return Err(FsError::invalid(
                    "The remote candidate is not of the right type, it should be multicast",
                ));
            }
            if c.proto != NetworkProtocol::Udp {
                return Err(FsError::invalid(
                    "The remote candidate is not of the right protocol, it should be udp",
                ));
            }
            let Some(addr) = c.socket_addr() else {
                return Err(FsError::invalid(format!(
                    "Invalid IP address {} passed",
                    c.ip.as_deref().unwrap_or("")
                )));
            };
            if !addr.ip().is_multicast() {
                return Err(FsError::invalid(format!(
                    "The IP address {} is not a multicast address",
                    addr.ip()
                )));
            }
            if addr.is_ipv4() && c.ttl == 0 {
                return Err(FsError::invalid(
                    "The TTL for IPv4 multicast candidates must not be 0",
                ));
            }
            groups.push((c, addr));
        }

        let mut events = vec![];
        let mut release = vec![];
        let mut result = Ok(());
        {
            let mut state = self.state.lock();
            if state.stopped {
                return Err(FsError::disposed("stream transmitter"));
            }

            for (c, addr) in groups {
                let component = c.component_id;
                let idx = component as usize - 1;
                let local_ip = self.local_ip(component);

                if let Some((socket, old)) = &state.joined[idx] {
                    if socket.group == addr && old.ttl == c.ttl {
                        continue;
                    }
                }

                let socket = match self.transmitter.get_socket(component, local_ip, addr) {
                    Ok(v) => v,
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                };
                socket.add_ttl(c.ttl);
                if state.sending {
                    socket.senders.fetch_add(1, Ordering::Relaxed);
                }

                if let Some(old) = state.joined[idx].replace((socket, c.clone())) {
                    release.push(old);
                }

                let mut local = Candidate::new(
                    "1",
                    component,
                    CandidateType::Multicast,
                    NetworkProtocol::Udp,
                    local_ip.map(|v| v.to_string()).unwrap_or_default(),
                    addr.port(),
                );
                local.ttl = c.ttl;

                events.push(StreamTransmitterEvent::NewActiveCandidatePair { local, remote: c });
                events.push(StreamTransmitterEvent::StateChanged {
                    component,
                    state: StreamState::Connected,
                });
                events.push(StreamTransmitterEvent::StateChanged {
                    component,
                    state: StreamState::Ready,
                });
            }

            let sending = state.sending;
            for (socket, remote) in release {
                self.leave(sending, socket, &remote);
            }
        }

        for e in events {
            emit(&self.handler, e);
        }
        result
    }

    pub(crate) fn force_remote_candidates(&self, candidates: Vec<Candidate>) -> Result<(), FsError> {
        self.add_remote_candidates(candidates)
    }

    pub(crate) fn sending(&self) -> bool {
        self.state.lock().sending
    }

    pub(crate) fn set_sending(&self, sending: bool) {
        let mut state = self.state.lock();
        if state.sending == sending {
            return;
        }
        state.sending = sending;
        for (socket, _) in state.joined.iter().flatten() {
            if sending {
                socket.senders.fetch_add(1, Ordering::Relaxed);
            } else {
                socket.senders.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        let sending = state.sending;
        let joined: Vec<_> = state.joined.iter_mut().filter_map(|v| v.take()).collect();
        drop(state);

        for (socket, remote) in joined {
            self.leave(sending, socket, &remote);
        }
        debug!("Stopped multicast stream transmitter for stream {}", self.stream);
    }
}

impl fmt::Debug for MulticastStreamTransmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MulticastStreamTransmitter")
            .field("stream", &self.stream)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ErrorKind;
    use crossbeam::channel::{self, Sender};

    struct Events(Sender<StreamTransmitterEvent>);

    impl StreamTransmitterHandler for Events {
        fn handle_event(&self, event: StreamTransmitterEvent) {
            let _ = self.0.send(event);
        }
    }

    fn group(port: u16) -> Candidate {
        Candidate::new(
            "1",
            1,
            CandidateType::Multicast,
            NetworkProtocol::Udp,
            "239.255.42.99",
            port,
        )
        .set_ttl(1)
    }

    fn setup() -> (MulticastTransmitter, StreamTransmitter, Arc<dyn StreamTransmitterHandler>) {
        let t = MulticastTransmitter::new(&TransmitterParams::new(1, 0)).unwrap();
        let (tx, _rx) = channel::unbounded();
        let handler: Arc<dyn StreamTransmitterHandler> = Arc::new(Events(tx));
        let st = t
            .new_stream_transmitter(
                &Participant::new(),
                StreamId::from(1),
                StreamTransmitterConfig::Multicast(MulticastConfig::new()),
                Arc::downgrade(&handler),
            )
            .unwrap();
        (t, st, handler)
    }

    #[test]
    fn rejects_non_multicast() {
        let (_t, st, _h) = setup();

        let mut host = group(40000);
        host.kind = CandidateType::Host;
        let e = st.add_remote_candidates(vec![host]).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArguments);

        let mut unicast = group(40000);
        unicast.ip = Some("10.0.0.1".into());
        let e = st.add_remote_candidates(vec![unicast]).unwrap_err();
        assert_eq!(e.message(), "The IP address 10.0.0.1 is not a multicast address");

        let e = st.add_remote_candidates(vec![group(40000).set_ttl(0)]).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArguments);
    }

    #[test]
    fn gather_only_prepares() {
        let t = MulticastTransmitter::new(&TransmitterParams::new(1, 0)).unwrap();
        let (tx, rx) = channel::unbounded();
        let handler: Arc<dyn StreamTransmitterHandler> = Arc::new(Events(tx));
        let st = t
            .new_stream_transmitter(
                &Participant::new(),
                StreamId::from(2),
                StreamTransmitterConfig::Multicast(MulticastConfig::new()),
                Arc::downgrade(&handler),
            )
            .unwrap();
        st.gather_local_candidates().unwrap();
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events, vec![StreamTransmitterEvent::LocalCandidatesPrepared]);
    }

    #[test]
    fn groups_are_shared() {
        let (t, a, _ha) = setup();
        let (tx, _rx) = channel::unbounded();
        let handler: Arc<dyn StreamTransmitterHandler> = Arc::new(Events(tx));
        let b = t
            .new_stream_transmitter(
                &Participant::new(),
                StreamId::from(3),
                StreamTransmitterConfig::Multicast(MulticastConfig::new()),
                Arc::downgrade(&handler),
            )
            .unwrap();

        // Joining may not be possible without a multicast route.
        if a.add_remote_candidates(vec![group(40002)]).is_err() {
            return;
        }
        b.add_remote_candidates(vec![group(40002)]).unwrap();
        assert_eq!(t.inner.sockets.lock().len(), 1);
        assert_eq!(t.sink().output_count(1), 1);

        a.stop();
        assert_eq!(t.sink().output_count(1), 1);
        b.stop();
        assert_eq!(t.sink().output_count(1), 0);
    }
}
