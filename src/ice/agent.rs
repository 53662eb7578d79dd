use std::collections::HashMap;
use std::fmt;
use std::io;
use std::mem;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};

use crate::config::RelayInfo;
use crate::net;
use crate::thread::InternalThreads;

use super::candidate::{Candidate, CandidateKind};
use super::checklist::{CheckList, CheckListEvent};
use super::gather::ServerReflexive;
use super::stun::{is_stun, StunMessage};
use super::{Compatibility, ComponentState, IceCreds, IceError};

/// How long `remove_stream` waits for callbacks already queued on the agent thread.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Wake up at least this often, even if nothing is scheduled.
const IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration of an [`Agent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// ICE dialect.
    pub compatibility: Compatibility,
    /// STUN server used to discover server reflexive candidates.
    pub stun_server: Option<SocketAddr>,
    /// Initial role. Role conflicts are resolved with the peer.
    pub controlling: bool,
    /// Only gather on these addresses. Empty means all interfaces.
    pub preferred_addresses: Vec<IpAddr>,
    /// Gather UDP candidates.
    pub ice_udp: bool,
    /// Gather TCP candidates. Recorded, but only UDP is gathered.
    pub ice_tcp: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            compatibility: Compatibility::Rfc5245,
            stun_server: None,
            controlling: true,
            preferred_addresses: vec![],
            ice_udp: true,
            ice_tcp: true,
        }
    }
}

/// A local candidate with the credentials it was announced with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCandidate {
    pub candidate: Candidate,
    pub ufrag: String,
    pub pass: String,
}

/// Events from the [`Agent`] for one of its streams.
///
/// These are always delivered on the agent thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// A component changed state.
    ComponentStateChanged {
        stream: u32,
        component: u16,
        state: ComponentState,
    },
    /// A local candidate was found. Also sent again for every candidate after a restart.
    NewCandidate { stream: u32, candidate: LocalCandidate },
    /// All local candidates are found.
    GatheringDone { stream: u32 },
    /// The pair used to send data on a component changed.
    NewSelectedPair {
        stream: u32,
        component: u16,
        local: LocalCandidate,
        remote: Candidate,
    },
}

impl AgentEvent {
    fn stream(&self) -> u32 {
        match self {
            AgentEvent::ComponentStateChanged { stream, .. }
            | AgentEvent::NewCandidate { stream, .. }
            | AgentEvent::GatheringDone { stream }
            | AgentEvent::NewSelectedPair { stream, .. } => *stream,
        }
    }
}

/// Receiver of [`AgentEvent`].
pub trait AgentHandler: Send + Sync {
    /// Handle an event. Called on the agent thread with no agent lock held.
    fn handle_event(&self, event: AgentEvent);
}

/// Callback for non-STUN datagrams: component, origin and data.
///
/// Called on the socket reader threads.
pub type DataCallback = Arc<dyn Fn(u16, SocketAddr, &[u8]) + Send + Sync>;

/// Threaded ICE agent.
///
/// Cloning gives another handle to the same agent. The agent thread stops when the
/// last handle is dropped.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

/// Weak handle to an [`Agent`].
#[derive(Clone)]
pub struct WeakAgent(Weak<AgentInner>);

impl WeakAgent {
    /// The agent, if it still runs.
    pub fn upgrade(&self) -> Option<Agent> {
        self.0.upgrade().map(|inner| Agent { inner })
    }
}

struct AgentInner {
    shared: Arc<Shared>,
    tx: Sender<Command>,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    config: AgentConfig,
    threads: InternalThreads,
    state: Mutex<AgentState>,
}

struct AgentState {
    streams: HashMap<u32, AgentStream>,
    next_stream_id: u32,
    controlling: bool,
    tie_breaker: u64,
    /// Events to deliver on the agent thread.
    pending: Vec<Pending>,
}

struct Pending {
    handler: Weak<dyn AgentHandler>,
    event: AgentEvent,
}

struct AgentStream {
    id: u32,
    local_creds: IceCreds,
    components: Vec<AgentComponent>,
    handler: Option<Weak<dyn AgentHandler>>,
    data: Arc<RwLock<Option<DataCallback>>>,
    srflx: Option<ServerReflexive>,
    gathering: bool,
    gathered: bool,
    tos: u8,
}

struct AgentComponent {
    id: u16,
    checklist: CheckList,
    sockets: Vec<Arc<AgentSocket>>,
    port_range: Option<(u16, u16)>,
    relays: Vec<RelayInfo>,
}

struct AgentSocket {
    socket: UdpSocket,
    local: SocketAddr,
    closed: AtomicBool,
}

enum Command {
    /// Run on the agent thread.
    Task(Box<dyn FnOnce() + Send>),
    /// STUN from one of the sockets.
    Datagram {
        stream: u32,
        component: u16,
        source: SocketAddr,
        destination: SocketAddr,
        data: Vec<u8>,
    },
    /// Something changed, drive the check lists.
    Wake,
    Shutdown,
}

impl Agent {
    /// Start a new agent thread.
    pub fn new(config: AgentConfig, threads: InternalThreads) -> Result<Agent, IceError> {
        let (tx, rx) = channel::unbounded();

        let shared = Arc::new(Shared {
            config,
            threads: threads.clone(),
            state: Mutex::new(AgentState {
                streams: HashMap::new(),
                next_stream_id: 1,
                controlling: false,
                tie_breaker: fastrand::u64(..),
                pending: vec![],
            }),
        });
        shared.state.lock().controlling = shared.config.controlling;

        let run_shared = shared.clone();
        let join = threads.spawn("ice-agent".into(), move || run(run_shared, rx))?;
        let thread_id = join.thread().id();

        debug!("Started ICE agent: {:?}", shared.config);

        Ok(Agent {
            inner: Arc::new(AgentInner {
                shared,
                tx,
                thread_id,
                join: Mutex::new(Some(join)),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakAgent {
        WeakAgent(Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.shared.config
    }

    /// Whether the current thread is the agent thread.
    pub fn is_agent_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Run `task` on the agent thread, after everything queued before it.
    pub fn add_idle<F>(&self, task: F) -> Result<(), IceError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .tx
            .send(Command::Task(Box::new(task)))
            .map_err(|_| IceError::Shutdown)
    }

    fn wake(&self) {
        let _ = self.inner.tx.send(Command::Wake);
    }

    /// Add a stream with `components` components. Returns the stream id.
    pub fn add_stream(&self, components: u16) -> Result<u32, IceError> {
        if components == 0 {
            return Err(IceError::UnknownComponent(0, 0));
        }
        let mut state = self.inner.shared.state.lock();
        let id = state.next_stream_id;
        state.next_stream_id += 1;

        let local_creds = IceCreds::new();
        let controlling = state.controlling;
        let tie_breaker = state.tie_breaker;
        let compatibility = self.inner.shared.config.compatibility;

        let components = (1..=components)
            .map(|c| AgentComponent {
                id: c,
                checklist: CheckList::new(
                    id,
                    c,
                    compatibility,
                    local_creds.clone(),
                    controlling,
                    tie_breaker,
                ),
                sockets: vec![],
                port_range: None,
                relays: vec![],
            })
            .collect();

        state.streams.insert(
            id,
            AgentStream {
                id,
                local_creds,
                components,
                handler: None,
                data: Arc::new(RwLock::new(None)),
                srflx: None,
                gathering: false,
                gathered: false,
                tos: 0,
            },
        );

        debug!("ICE agent add stream {}", id);
        Ok(id)
    }

    /// Remove a stream, closing its sockets.
    ///
    /// Unless called on the agent thread, this waits for the callbacks already queued
    /// on the agent thread to run.
    pub fn remove_stream(&self, stream_id: u32) {
        let removed = {
            let mut state = self.inner.shared.state.lock();
            state.pending.retain(|p| p.event.stream() != stream_id);
            state.streams.remove(&stream_id)
        };

        let Some(stream) = removed else {
            return;
        };

        debug!("ICE agent remove stream {}", stream_id);
        stream.close();

        if !self.is_agent_thread() {
            let (tx, rx) = channel::bounded(1);
            let queued = self.add_idle(move || {
                let _ = tx.send(());
            });
            if queued.is_ok() && rx.recv_timeout(DRAIN_TIMEOUT).is_err() {
                warn!("Timeout waiting for ICE agent thread");
            }
        }
    }

    fn with_stream<T>(
        &self,
        stream_id: u32,
        f: impl FnOnce(&mut AgentStream) -> Result<T, IceError>,
    ) -> Result<T, IceError> {
        let mut state = self.inner.shared.state.lock();
        let stream = state
            .streams
            .get_mut(&stream_id)
            .ok_or(IceError::UnknownStream(stream_id))?;
        f(stream)
    }

    /// Set the handler receiving events for the stream.
    pub fn set_stream_handler(
        &self,
        stream_id: u32,
        handler: Weak<dyn AgentHandler>,
    ) -> Result<(), IceError> {
        self.with_stream(stream_id, |s| {
            s.handler = Some(handler);
            Ok(())
        })
    }

    /// Set the callback receiving the data of the stream.
    pub fn set_data_callback(&self, stream_id: u32, cb: DataCallback) -> Result<(), IceError> {
        self.with_stream(stream_id, |s| {
            *s.data.write() = Some(cb);
            Ok(())
        })
    }

    /// Restrict the local ports of a component.
    pub fn set_port_range(
        &self,
        stream_id: u32,
        component_id: u16,
        min: u16,
        max: u16,
    ) -> Result<(), IceError> {
        self.with_stream(stream_id, |s| {
            let c = s.component_mut(component_id)?;
            c.port_range = Some((min, max));
            Ok(())
        })
    }

    /// Record a TURN relay for a component.
    ///
    /// Relays are kept with the component, but no allocation is made.
    pub fn set_relay_info(
        &self,
        stream_id: u32,
        component_id: u16,
        relay: RelayInfo,
    ) -> Result<(), IceError> {
        self.with_stream(stream_id, |s| {
            let c = s.component_mut(component_id)?;
            debug!(
                "Stream {} component {} relay {}:{}",
                stream_id, component_id, relay.ip, relay.port
            );
            c.relays.push(relay);
            Ok(())
        })
    }

    /// Set the type of service on all sockets of the stream, current and future.
    pub fn set_stream_tos(&self, stream_id: u32, tos: u8) -> Result<(), IceError> {
        self.with_stream(stream_id, |s| {
            s.tos = tos;
            for c in &s.components {
                for sock in &c.sockets {
                    net::set_tos(&sock.socket, tos);
                }
            }
            Ok(())
        })
    }

    /// Local credentials of a stream.
    pub fn local_credentials(&self, stream_id: u32) -> Result<IceCreds, IceError> {
        self.with_stream(stream_id, |s| Ok(s.local_creds.clone()))
    }

    /// Set the remote credentials of a stream.
    pub fn set_remote_credentials(&self, stream_id: u32, creds: IceCreds) -> Result<(), IceError> {
        self.with_stream(stream_id, |s| {
            for c in &mut s.components {
                c.checklist.set_remote_credentials(creds.clone());
            }
            Ok(())
        })?;
        self.wake();
        Ok(())
    }

    /// Start gathering local candidates for a stream.
    ///
    /// The candidates are reported as [`AgentEvent::NewCandidate`], followed by
    /// [`AgentEvent::GatheringDone`].
    pub fn gather_candidates(&self, stream_id: u32) -> Result<(), IceError> {
        let shared = &self.inner.shared;
        let config = &shared.config;

        let addrs = if config.preferred_addresses.is_empty() {
            net::host_addresses()?
        } else {
            config.preferred_addresses.clone()
        };

        let mut readers = vec![];

        {
            let mut state = shared.state.lock();
            let state = &mut *state;
            let stream = state
                .streams
                .get_mut(&stream_id)
                .ok_or(IceError::UnknownStream(stream_id))?;

            if stream.gathering {
                return Ok(());
            }
            stream.gathering = true;

            let mut srflx = config
                .stun_server
                .map(|server| ServerReflexive::new(server, Instant::now()));
            let mut found = vec![];

            for comp in &mut stream.components {
                comp.checklist.start_gathering();

                if !config.ice_udp {
                    continue;
                }

                for ip in &addrs {
                    let bound = match comp.port_range {
                        Some((min, max)) => net::bind_udp_in_range(*ip, min, max),
                        None => net::bind_udp(SocketAddr::new(*ip, 0), false),
                    };
                    let socket = match bound {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("Failed to bind on {}: {}", ip, e);
                            continue;
                        }
                    };
                    if stream.tos != 0 {
                        net::set_tos(&socket, stream.tos);
                    }
                    let local = socket.local_addr()?;

                    let sock = Arc::new(AgentSocket {
                        socket,
                        local,
                        closed: AtomicBool::new(false),
                    });
                    comp.sockets.push(sock.clone());
                    readers.push((comp.id, sock));

                    if let Some(srflx) = &mut srflx {
                        srflx.add_socket(comp.id, local);
                    }

                    match Candidate::host(local, comp.id) {
                        Ok(c) => {
                            if comp.checklist.add_local_candidate(c.clone()) {
                                found.push(c);
                            }
                        }
                        Err(e) => debug!("Skip host candidate {}: {}", local, e),
                    }
                }

                if comp.sockets.is_empty() {
                    return Err(IceError::Io(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        format!("no socket could be bound for component {}", comp.id),
                    )));
                }
            }

            // The gathering state goes out ahead of the candidates.
            let mut events = vec![];
            stream.poll_events(&mut events, &mut None);
            for event in events {
                stream.queue(&mut state.pending, event);
            }

            for candidate in found {
                let event = AgentEvent::NewCandidate {
                    stream: stream_id,
                    candidate: stream.local_candidate(candidate),
                };
                stream.queue(&mut state.pending, event);
            }

            match srflx {
                Some(srflx) if !srflx.is_done(Instant::now()) => stream.srflx = Some(srflx),
                _ => {
                    stream.gathered = true;
                    let event = AgentEvent::GatheringDone { stream: stream_id };
                    stream.queue(&mut state.pending, event);
                }
            }
        }

        let data = self.with_stream(stream_id, |s| Ok(s.data.clone()))?;
        for (component, sock) in readers {
            spawn_reader(
                &shared.threads,
                self.inner.tx.clone(),
                stream_id,
                component,
                sock,
                data.clone(),
            )?;
        }

        self.wake();
        Ok(())
    }

    /// Add remote candidates to a component. Returns how many were accepted.
    pub fn set_remote_candidates(
        &self,
        stream_id: u32,
        component_id: u16,
        candidates: Vec<Candidate>,
    ) -> Result<usize, IceError> {
        let n = self.with_stream(stream_id, |s| {
            let c = s.component_mut(component_id)?;
            let mut n = 0;
            for candidate in candidates {
                if candidate.component_id() == component_id {
                    c.checklist.add_remote_candidate(candidate);
                    n += 1;
                }
            }
            Ok(n)
        })?;
        self.wake();
        Ok(n)
    }

    /// Select the remote candidate of a component without connectivity checks.
    pub fn set_selected_remote_candidate(
        &self,
        stream_id: u32,
        component_id: u16,
        candidate: Candidate,
    ) -> Result<(), IceError> {
        self.with_stream(stream_id, |s| {
            let c = s.component_mut(component_id)?;
            if c.checklist.force_remote_candidate(candidate) {
                Ok(())
            } else {
                Err(IceError::NotConnected(stream_id, component_id))
            }
        })?;
        self.wake();
        Ok(())
    }

    /// ICE restart of a single stream.
    ///
    /// New local credentials are made, remote state is forgotten and the local
    /// candidates are announced again with the new credentials.
    pub fn restart_stream(&self, stream_id: u32) -> Result<(), IceError> {
        {
            let mut state = self.inner.shared.state.lock();
            let state = &mut *state;
            let stream = state
                .streams
                .get_mut(&stream_id)
                .ok_or(IceError::UnknownStream(stream_id))?;

            stream.local_creds = IceCreds::new();
            let mut announce = vec![];
            for c in &mut stream.components {
                c.checklist.restart(stream.local_creds.clone());
                if stream.gathered {
                    announce.extend(
                        c.checklist
                            .local_candidates()
                            .iter()
                            .filter(|v| {
                                matches!(
                                    v.kind(),
                                    CandidateKind::Host | CandidateKind::ServerReflexive
                                )
                            })
                            .cloned(),
                    );
                }
            }

            for candidate in announce {
                let event = AgentEvent::NewCandidate {
                    stream: stream_id,
                    candidate: stream.local_candidate(candidate),
                };
                stream.queue(&mut state.pending, event);
            }
        }
        self.wake();
        Ok(())
    }

    /// Send data on a component using the selected pair.
    pub fn send(&self, stream_id: u32, component_id: u16, data: &[u8]) -> Result<usize, IceError> {
        let (sock, destination) = self.with_stream(stream_id, |s| {
            let c = s.component_mut(component_id)?;
            let (source, destination) = c
                .checklist
                .send_addrs()
                .ok_or(IceError::NotConnected(stream_id, component_id))?;
            let sock = c
                .sockets
                .iter()
                .find(|v| v.local == source)
                .cloned()
                .ok_or(IceError::NotConnected(stream_id, component_id))?;
            Ok((sock, destination))
        })?;

        Ok(sock.socket.send_to(data, destination)?)
    }

    /// Current state of a component.
    pub fn component_state(
        &self,
        stream_id: u32,
        component_id: u16,
    ) -> Result<ComponentState, IceError> {
        self.with_stream(stream_id, |s| {
            Ok(s.component_mut(component_id)?.checklist.state())
        })
    }
}

impl AgentStream {
    fn component_mut(&mut self, component_id: u16) -> Result<&mut AgentComponent, IceError> {
        let stream_id = self.id;
        self.components
            .iter_mut()
            .find(|c| c.id == component_id)
            .ok_or(IceError::UnknownComponent(stream_id, component_id))
    }

    fn local_candidate(&self, candidate: Candidate) -> LocalCandidate {
        LocalCandidate {
            candidate,
            ufrag: self.local_creds.ufrag.clone(),
            pass: self.local_creds.pass.clone(),
        }
    }

    fn queue(&self, pending: &mut Vec<Pending>, event: AgentEvent) {
        match &self.handler {
            Some(handler) => pending.push(Pending {
                handler: handler.clone(),
                event,
            }),
            None => trace!("No handler for event: {:?}", event),
        }
    }

    fn close(&self) {
        *self.data.write() = None;
        for c in &self.components {
            for s in &c.sockets {
                s.closed.store(true, Ordering::Release);
            }
        }
    }

    /// Drive gathering and the check lists.
    fn drive(
        &mut self,
        now: Instant,
        out: &mut Vec<(Arc<AgentSocket>, SocketAddr, Vec<u8>)>,
        events: &mut Vec<AgentEvent>,
        role: &mut Option<bool>,
    ) {
        if let Some(srflx) = &mut self.srflx {
            for t in srflx.poll_transmit(now) {
                if let Some(sock) = find_socket(&self.components, t.source) {
                    out.push((sock, t.destination, t.contents));
                }
            }
            if srflx.is_done(now) {
                self.srflx = None;
                self.gathered = true;
                events.push(AgentEvent::GatheringDone { stream: self.id });
            }
        }

        for comp in &mut self.components {
            comp.checklist.handle_timeout(now);

            while let Some(t) = comp.checklist.poll_transmit() {
                match comp.sockets.iter().find(|s| s.local == t.source) {
                    Some(sock) => out.push((sock.clone(), t.destination, t.contents)),
                    None => trace!("No socket for {}", t.source),
                }
            }
        }

        self.poll_events(events, role);
    }

    /// Move the check list events over as agent events.
    fn poll_events(&mut self, events: &mut Vec<AgentEvent>, role: &mut Option<bool>) {
        for comp in &mut self.components {
            while let Some(ev) = comp.checklist.poll_event() {
                let ev = match ev {
                    CheckListEvent::StateChange(state) => AgentEvent::ComponentStateChanged {
                        stream: self.id,
                        component: comp.id,
                        state,
                    },
                    CheckListEvent::NewSelectedPair { local, remote } => {
                        AgentEvent::NewSelectedPair {
                            stream: self.id,
                            component: comp.id,
                            local: LocalCandidate {
                                candidate: local,
                                ufrag: self.local_creds.ufrag.clone(),
                                pass: self.local_creds.pass.clone(),
                            },
                            remote,
                        }
                    }
                    CheckListEvent::RoleChanged(controlling) => {
                        *role = Some(controlling);
                        continue;
                    }
                };
                events.push(ev);
            }
        }
    }

    fn next_timeout(&mut self) -> Option<Instant> {
        let srflx = self.srflx.as_ref().map(|s| s.poll_timeout());
        self.components
            .iter_mut()
            .filter_map(|c| c.checklist.poll_timeout())
            .chain(srflx)
            .min()
    }
}

fn find_socket(components: &[AgentComponent], local: SocketAddr) -> Option<Arc<AgentSocket>> {
    components
        .iter()
        .flat_map(|c| c.sockets.iter())
        .find(|s| s.local == local)
        .cloned()
}

impl Shared {
    fn handle_datagram(
        &self,
        stream_id: u32,
        component_id: u16,
        source: SocketAddr,
        destination: SocketAddr,
        data: &[u8],
    ) {
        let message = match StunMessage::parse(data) {
            Ok(v) => v,
            Err(e) => {
                trace!("Drop unparseable STUN from {}: {}", source, e);
                return;
            }
        };

        let mut state = self.state.lock();
        let state = &mut *state;
        let Some(stream) = state.streams.get_mut(&stream_id) else {
            return;
        };

        if let Some(srflx) = &mut stream.srflx {
            if srflx.accepts(&message) {
                let Some(r) = srflx.handle_response(&message) else {
                    return;
                };
                let Ok(candidate) = Candidate::server_reflexive(r.mapped, r.base, r.component_id)
                else {
                    return;
                };
                let added = match stream.component_mut(r.component_id) {
                    Ok(c) => c.checklist.add_local_candidate(candidate.clone()),
                    Err(_) => false,
                };
                if added {
                    let event = AgentEvent::NewCandidate {
                        stream: stream_id,
                        candidate: stream.local_candidate(candidate),
                    };
                    stream.queue(&mut state.pending, event);
                }
                return;
            }
        }

        if let Ok(c) = stream.component_mut(component_id) {
            c.checklist
                .handle_receive(Instant::now(), source, destination, &message);
        }
    }

    /// Drive all streams and deliver the resulting events.
    fn drive(&self, now: Instant) {
        let mut out = vec![];

        let pending = {
            let mut state = self.state.lock();
            let state = &mut *state;

            let mut role = None;
            for stream in state.streams.values_mut() {
                let mut events = vec![];
                stream.drive(now, &mut out, &mut events, &mut role);
                for event in events {
                    stream.queue(&mut state.pending, event);
                }
            }

            if let Some(controlling) = role {
                // The role is for the whole agent.
                state.controlling = controlling;
                for stream in state.streams.values_mut() {
                    for c in &mut stream.components {
                        c.checklist.set_controlling(controlling);
                    }
                }
            }

            mem::take(&mut state.pending)
        };

        for (sock, destination, contents) in out {
            if let Err(e) = sock.socket.send_to(&contents, destination) {
                debug!("Failed to send to {}: {}", destination, e);
            }
        }

        for p in pending {
            if let Some(handler) = p.handler.upgrade() {
                handler.handle_event(p.event);
            }
        }
    }

    fn next_timeout(&self, now: Instant) -> Duration {
        let mut state = self.state.lock();
        let state = &mut *state;
        if !state.pending.is_empty() {
            return Duration::ZERO;
        }
        state
            .streams
            .values_mut()
            .filter_map(|s| s.next_timeout())
            .min()
            .map(|t| t.saturating_duration_since(now))
            .unwrap_or(IDLE_TIMEOUT)
            .min(IDLE_TIMEOUT)
    }

    fn close_all(&self) {
        let mut state = self.state.lock();
        for (_, stream) in state.streams.drain() {
            stream.close();
        }
        state.pending.clear();
    }
}

fn run(shared: Arc<Shared>, rx: Receiver<Command>) {
    loop {
        let timeout = shared.next_timeout(Instant::now());

        match rx.recv_timeout(timeout) {
            Ok(Command::Task(task)) => task(),
            Ok(Command::Datagram {
                stream,
                component,
                source,
                destination,
                data,
            }) => shared.handle_datagram(stream, component, source, destination, &data),
            Ok(Command::Wake) | Err(RecvTimeoutError::Timeout) => {}
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }

        shared.drive(Instant::now());
    }

    shared.close_all();
    debug!("ICE agent stopped");
}

fn spawn_reader(
    threads: &InternalThreads,
    tx: Sender<Command>,
    stream: u32,
    component: u16,
    sock: Arc<AgentSocket>,
    data: Arc<RwLock<Option<DataCallback>>>,
) -> io::Result<()> {
    let name = format!("ice-recv-{}-{}", stream, component);
    threads.spawn(name, move || {
        let mut buf = vec![0_u8; net::DATAGRAM_MAX];
        while !sock.closed.load(Ordering::Acquire) {
            let (n, source) = match sock.socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if net::is_timeout(&e) => continue,
                Err(e) => {
                    // ICMP errors from earlier sends surface here.
                    trace!("Receive error on {}: {}", sock.local, e);
                    continue;
                }
            };
            let packet = &buf[..n];

            if is_stun(packet) {
                let cmd = Command::Datagram {
                    stream,
                    component,
                    source,
                    destination: sock.local,
                    data: packet.to_vec(),
                };
                if tx.send(cmd).is_err() {
                    break;
                }
            } else {
                let cb = data.read().clone();
                if let Some(cb) = cb {
                    cb(component, source, packet);
                }
            }
        }
        trace!("Reader for {} stopped", sock.local);
    })?;
    Ok(())
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if thread::current().id() != self.thread_id {
            if let Some(join) = self.join.lock().take() {
                let _ = join.join();
            }
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.inner.shared.config)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Collect(Mutex<Vec<AgentEvent>>);

    impl AgentHandler for Collect {
        fn handle_event(&self, event: AgentEvent) {
            self.0.lock().push(event);
        }
    }

    fn loopback_agent(controlling: bool) -> Agent {
        let config = AgentConfig {
            controlling,
            preferred_addresses: vec!["127.0.0.1".parse().unwrap()],
            ..Default::default()
        };
        Agent::new(config, InternalThreads::new()).unwrap()
    }

    fn wait_for(events: &Collect, mut f: impl FnMut(&AgentEvent) -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(10) {
            if events.0.lock().iter().any(&mut f) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    fn remote_of(c: &LocalCandidate) -> Candidate {
        Candidate::remote(
            c.candidate.foundation(),
            c.candidate.component_id(),
            c.candidate.prio(),
            c.candidate.addr(),
            c.candidate.kind(),
            Some(c.ufrag.clone()),
            Some(c.pass.clone()),
        )
        .unwrap()
    }

    fn candidates(events: &Collect) -> Vec<LocalCandidate> {
        events
            .0
            .lock()
            .iter()
            .filter_map(|e| match e {
                AgentEvent::NewCandidate { candidate, .. } => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn gather_then_done() {
        let agent = loopback_agent(true);
        let events = Arc::new(Collect(Mutex::new(vec![])));
        let handler: Arc<dyn AgentHandler> = events.clone();

        let id = agent.add_stream(2).unwrap();
        agent.set_stream_handler(id, Arc::downgrade(&handler)).unwrap();
        agent.gather_candidates(id).unwrap();

        assert!(wait_for(&events, |e| matches!(e, AgentEvent::GatheringDone { .. })));

        let cands = candidates(&events);
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].candidate.component_id(), 1);
        assert_eq!(cands[1].candidate.component_id(), 2);

        // Gathering is done last.
        let last = events.0.lock().last().cloned();
        assert_eq!(last, Some(AgentEvent::GatheringDone { stream: id }));

        agent.remove_stream(id);
        assert!(agent.local_credentials(id).is_err());
    }

    #[test]
    fn two_agents_connect_and_send() {
        let a = loopback_agent(true);
        let b = loopback_agent(false);

        let ea = Arc::new(Collect(Mutex::new(vec![])));
        let eb = Arc::new(Collect(Mutex::new(vec![])));
        let ha: Arc<dyn AgentHandler> = ea.clone();
        let hb: Arc<dyn AgentHandler> = eb.clone();

        let sa = a.add_stream(1).unwrap();
        let sb = b.add_stream(1).unwrap();
        a.set_stream_handler(sa, Arc::downgrade(&ha)).unwrap();
        b.set_stream_handler(sb, Arc::downgrade(&hb)).unwrap();

        let (data_tx, data_rx) = channel::unbounded();
        let cb: DataCallback = Arc::new(move |component, _source, data: &[u8]| {
            let _ = data_tx.send((component, data.to_vec()));
        });
        b.set_data_callback(sb, cb).unwrap();

        a.gather_candidates(sa).unwrap();
        b.gather_candidates(sb).unwrap();
        assert!(wait_for(&ea, |e| matches!(e, AgentEvent::GatheringDone { .. })));
        assert!(wait_for(&eb, |e| matches!(e, AgentEvent::GatheringDone { .. })));

        a.set_remote_credentials(sa, b.local_credentials(sb).unwrap()).unwrap();
        b.set_remote_credentials(sb, a.local_credentials(sa).unwrap()).unwrap();

        let ca: Vec<_> = candidates(&ea).iter().map(remote_of).collect();
        let cb: Vec<_> = candidates(&eb).iter().map(remote_of).collect();
        assert_eq!(b.set_remote_candidates(sb, 1, ca).unwrap(), 1);
        assert_eq!(a.set_remote_candidates(sa, 1, cb).unwrap(), 1);

        let ready = |e: &AgentEvent| {
            matches!(
                e,
                AgentEvent::ComponentStateChanged {
                    state: ComponentState::Ready,
                    ..
                }
            )
        };
        assert!(wait_for(&ea, ready));
        assert!(wait_for(&eb, ready));
        assert!(wait_for(&ea, |e| matches!(e, AgentEvent::NewSelectedPair { .. })));

        a.send(sa, 1, b"hello").unwrap();
        let (component, data) = data_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(component, 1);
        assert_eq!(data, b"hello");
    }

    #[test]
    fn idle_runs_on_agent_thread() {
        let agent = loopback_agent(true);
        let (tx, rx) = channel::bounded(1);
        let a2 = agent.downgrade();
        agent
            .add_idle(move || {
                let on_agent = a2.upgrade().map(|a| a.is_agent_thread()).unwrap_or(false);
                let _ = tx.send(on_agent);
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(!agent.is_agent_thread());
    }
}
