//! ICE transmitter on top of the bundled agent.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::candidate::{Candidate, CandidateType, NetworkProtocol};
use crate::config::{NiceConfig, StreamTransmitterConfig};
use crate::error::FsError;
use crate::ice::{self, Agent, AgentConfig, AgentEvent, AgentHandler, CandidateKind};
use crate::ice::{Compatibility, IceCreds, LocalCandidate, WeakAgent};
use crate::id::StreamId;
use crate::participant::{AgentKey, Participant};
use crate::thread::InternalThreads;

use super::{check_component, emit, wrong_config};
use super::{NetworkSink, NetworkSource, OutputId, PacketOutput};
use super::{StreamState, StreamTransmitter, StreamTransmitterEvent};
use super::{StreamTransmitterHandler, Transmitter, TransmitterParams};

/// Transmitter doing ICE.
///
/// Agents are shared between the streams to the same participant, each stream
/// transmitter owns one agent stream.
#[derive(Clone)]
pub struct NiceTransmitter {
    inner: Arc<NiceInner>,
}

struct NiceInner {
    components: u16,
    tos: AtomicU8,
    source: NetworkSource,
    sink: NetworkSink,
    threads: InternalThreads,
    /// Agent streams, for changes of type of service.
    streams: Mutex<Vec<(WeakAgent, u32)>>,
}

impl NiceTransmitter {
    /// Creates the transmitter. Agents are made per participant when streams are added.
    pub fn new(params: &TransmitterParams) -> Result<Self, FsError> {
        Ok(NiceTransmitter {
            inner: Arc::new(NiceInner {
                components: params.components,
                tos: AtomicU8::new(params.tos),
                source: NetworkSource::new(params.components, params.do_timestamp),
                sink: NetworkSink::new(params.components),
                threads: params.threads.clone(),
                streams: Mutex::new(vec![]),
            }),
        })
    }
}

fn agent_config(config: &NiceConfig) -> AgentConfig {
    let stun_server = config
        .stun_ip()
        .and_then(|ip| ip.parse::<IpAddr>().ok())
        .map(|ip| SocketAddr::new(ip, config.stun_port()));

    AgentConfig {
        compatibility: config.compatibility_mode(),
        stun_server,
        controlling: config.controlling_mode(),
        preferred_addresses: config
            .preferred_local_candidates()
            .iter()
            .filter_map(|c| c.ip_addr())
            .collect(),
        ice_udp: config.ice_udp(),
        ice_tcp: config.ice_tcp(),
    }
}

impl fmt::Debug for NiceTransmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NiceTransmitter")
            .field("components", &self.inner.components)
            .field("streams", &self.inner.streams.lock().len())
            .finish()
    }
}

impl Transmitter for NiceTransmitter {
    fn kind(&self) -> &'static str {
        "nice"
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
        let mut streams = self.inner.streams.lock();
        streams.retain(|(agent, id)| match agent.upgrade() {
            Some(agent) => agent.set_stream_tos(*id, tos).is_ok(),
            None => false,
        });
    }

    fn new_stream_transmitter(
        &self,
        participant: &Participant,
        stream: StreamId,
        config: StreamTransmitterConfig,
        handler: Weak<dyn StreamTransmitterHandler>,
    ) -> Result<StreamTransmitter, FsError> {
        let StreamTransmitterConfig::Nice(config) = config else {
            return Err(wrong_config(self.kind(), &config));
        };
        config.validate()?;

        if config.debug() {
            debug!("ICE debugging requested for stream {}", stream);
        }

        let key = AgentKey {
            compatibility: config.compatibility_mode(),
            stun_ip: config.stun_ip().map(|v| v.to_string()),
            stun_port: config.stun_port(),
            preferred: config
                .preferred_local_candidates()
                .iter()
                .filter_map(|c| c.ip.clone())
                .collect(),
        };

        let threads = self.inner.threads.clone();
        let agent = participant.agent_for(key, || {
            Ok(Agent::new(agent_config(&config), threads)?)
        })?;

        let components = self.inner.components;
        let agent_stream = agent.add_stream(components)?;

        match self.setup_stream(&agent, agent_stream, stream, config, handler) {
            Ok(st) => {
                self.inner
                    .streams
                    .lock()
                    .push((agent.downgrade(), agent_stream));
                Ok(StreamTransmitter::Nice(st))
            }
            Err(e) => {
                agent.remove_stream(agent_stream);
                Err(e)
            }
        }
    }
}

impl NiceTransmitter {
    fn setup_stream(
        &self,
        agent: &Agent,
        agent_stream: u32,
        stream: StreamId,
        config: NiceConfig,
        handler: Weak<dyn StreamTransmitterHandler>,
    ) -> Result<NiceStreamTransmitter, FsError> {
        let t = &self.inner;
        let components = t.components;

        for component in 1..=components {
            for relay in config.relays_for(component) {
                agent.set_relay_info(agent_stream, component, relay)?;
            }
            if config.min_port() < config.max_port() {
                agent.set_port_range(
                    agent_stream,
                    component,
                    config.min_port(),
                    config.max_port(),
                )?;
            }
        }

        let tos = t.tos.load(Ordering::Relaxed);
        if tos != 0 {
            agent.set_stream_tos(agent_stream, tos)?;
        }

        let source = t.source.clone();
        let associate = config.associate_on_source();
        let on_data: ice::DataCallback = Arc::new(move |component, origin, data: &[u8]| {
            let stream = associate.then_some(stream);
            source.push(component, Some(origin), stream, data);
        });
        agent.set_data_callback(agent_stream, on_data)?;

        let sending = Arc::new(AtomicBool::new(true));
        let outputs = (1..=components)
            .map(|component| {
                let output = Arc::new(NiceOutput {
                    agent: agent.downgrade(),
                    agent_stream,
                    component,
                    sending: sending.clone(),
                });
                t.sink.attach(component, output)
            })
            .collect();

        let inner = Arc::new(NiceStreamInner {
            agent: agent.clone(),
            agent_stream,
            stream,
            components,
            compatibility: config.compatibility_mode(),
            sink: t.sink.clone(),
            handler,
            sending,
            state: Mutex::new(NiceState {
                gather_started: false,
                gathered: false,
                forced: false,
                local_pending: vec![],
                remote_pending: vec![],
                username: None,
                password: None,
                has_been_ready: vec![false; components as usize],
                outputs,
                stopped: false,
            }),
        });

        let weak: Weak<NiceStreamInner> = Arc::downgrade(&inner);
        let weak: Weak<dyn AgentHandler> = weak;
        agent.set_stream_handler(agent_stream, weak)?;

        debug!(
            "New nice stream transmitter for stream {} on agent stream {}",
            stream, agent_stream
        );

        Ok(NiceStreamTransmitter { inner })
    }
}

/// Sends what is pushed in the sink through the agent.
struct NiceOutput {
    agent: WeakAgent,
    agent_stream: u32,
    component: u16,
    sending: Arc<AtomicBool>,
}

impl PacketOutput for NiceOutput {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        if !self.sending.load(Ordering::Relaxed) {
            return Ok(());
        }
        let Some(agent) = self.agent.upgrade() else {
            return Ok(());
        };
        match agent.send(self.agent_stream, self.component, data) {
            Ok(_) => Ok(()),
            Err(ice::IceError::Io(e)) => Err(e),
            Err(e) => {
                trace!("Not sending on component {}: {}", self.component, e);
                Ok(())
            }
        }
    }
}

/// Stream transmitter of [`NiceTransmitter`].
pub struct NiceStreamTransmitter {
    inner: Arc<NiceStreamInner>,
}

struct NiceStreamInner {
    agent: Agent,
    agent_stream: u32,
    stream: StreamId,
    components: u16,
    compatibility: Compatibility,
    sink: NetworkSink,
    handler: Weak<dyn StreamTransmitterHandler>,
    sending: Arc<AtomicBool>,
    state: Mutex<NiceState>,
}

struct NiceState {
    gather_started: bool,
    gathered: bool,
    forced: bool,
    /// Local candidates found before gathering is done.
    local_pending: Vec<Candidate>,
    /// Remote candidates given before gathering is done.
    remote_pending: Vec<Candidate>,
    username: Option<String>,
    password: Option<String>,
    has_been_ready: Vec<bool>,
    outputs: Vec<OutputId>,
    stopped: bool,
}

impl NiceStreamInner {
    fn emit(&self, event: StreamTransmitterEvent) {
        emit(&self.handler, event);
    }

    fn error(&self, err: FsError) {
        warn!("Stream {}: {}", self.stream, err);
        self.emit(StreamTransmitterEvent::Error(err));
    }

    /// Validate remote candidates and check that they agree on credentials.
    fn check_remote_candidates(
        &self,
        candidates: &[Candidate],
    ) -> Result<Option<(String, String)>, FsError> {
        let mut creds: Option<(&str, &str)> = None;

        for c in candidates {
            if c.ip.is_none() {
                return Err(FsError::invalid("Candidate MUST have an IP address"));
            }
            check_component(c, self.components)?;
            if c.kind == CandidateType::Multicast {
                return Err(FsError::invalid(
                    "libnice transmitter does not accept multicast candidates",
                ));
            }
            let Some(username) = c.username.as_deref() else {
                return Err(FsError::invalid(
                    "Invalid remote candidates passed, does not have a username",
                ));
            };
            let password = match (c.password.as_deref(), self.compatibility) {
                (Some(v), _) => v,
                (None, Compatibility::Google) => "",
                (None, _) => {
                    return Err(FsError::invalid(
                        "Invalid remote candidates passed, does not have a password",
                    ))
                }
            };

            if !self.compatibility.is_rfc() {
                continue;
            }
            match creds {
                None => creds = Some((username, password)),
                Some((u, p)) if u == username && p == password => {}
                Some(_) => {
                    return Err(FsError::invalid(
                        "Invalid remote candidates passed, does not have the right username/password",
                    ))
                }
            }
        }

        Ok(creds.map(|(u, p)| (u.to_string(), p.to_string())))
    }

    fn set_credentials(&self, username: &str, password: &str) -> Result<(), FsError> {
        if !self.compatibility.is_rfc() {
            return Ok(());
        }
        let creds = IceCreds {
            ufrag: username.to_string(),
            pass: password.to_string(),
        };
        self.agent
            .set_remote_credentials(self.agent_stream, creds)
            .map_err(|e| FsError::Internal(format!("Could not set the security credentials: {}", e)))
    }

    /// Give candidates to the agent, per component.
    fn apply_remote(&self, candidates: &[Candidate]) -> Result<(), FsError> {
        for component in 1..=self.components {
            let list: Vec<_> = candidates
                .iter()
                .filter(|c| c.component_id == component)
                .filter_map(to_agent_candidate)
                .collect();
            if list.is_empty() {
                continue;
            }
            let n = self
                .agent
                .set_remote_candidates(self.agent_stream, component, list)?;
            debug!(
                "Stream {} component {}: {} remote candidates added",
                self.stream, component, n
            );
        }
        Ok(())
    }

    /// Select forced candidates on the agent.
    fn apply_forced(&self, candidates: &[Candidate]) -> Result<(), FsError> {
        for c in candidates {
            let Some(remote) = to_agent_candidate(c) else {
                return Err(FsError::Internal(
                    "Unknown error while selecting remote candidates".into(),
                ));
            };
            if let (Some(u), Some(p)) = (&c.username, &c.password) {
                self.set_credentials(u, p)?;
            }
            self.agent
                .set_selected_remote_candidate(self.agent_stream, c.component_id, remote)
                .map_err(|e| {
                    FsError::Internal(format!(
                        "Unknown error while selecting remote candidates: {}",
                        e
                    ))
                })?;
        }
        Ok(())
    }

    fn on_new_candidate(&self, local: LocalCandidate) {
        let candidate = from_local_candidate(&local);
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        if !state.gathered {
            // IPv4 is tried first, so it goes before any IPv6.
            let is_v6 = matches!(candidate.ip_addr(), Some(IpAddr::V6(_)));
            let pos = if is_v6 {
                state.local_pending.len()
            } else {
                state
                    .local_pending
                    .iter()
                    .position(|c| matches!(c.ip_addr(), Some(IpAddr::V6(_))))
                    .unwrap_or(state.local_pending.len())
            };
            state.local_pending.insert(pos, candidate);
            return;
        }
        drop(state);

        debug!("Stream {}: new local candidate {}", self.stream, candidate);
        self.emit(StreamTransmitterEvent::NewLocalCandidate(candidate));
    }

    fn on_gathering_done(&self) {
        let mut state = self.state.lock();
        if state.stopped || state.gathered {
            return;
        }
        state.gathered = true;
        let locals = std::mem::take(&mut state.local_pending);
        let remotes = std::mem::take(&mut state.remote_pending);
        let forced = state.forced;
        let creds = state.username.clone().zip(state.password.clone());
        drop(state);

        debug!(
            "Stream {}: gathering done with {} candidates",
            self.stream,
            locals.len()
        );
        for c in locals {
            self.emit(StreamTransmitterEvent::NewLocalCandidate(c));
        }
        self.emit(StreamTransmitterEvent::LocalCandidatesPrepared);

        if remotes.is_empty() {
            return;
        }

        if forced {
            if let Err(e) = self.apply_forced(&remotes) {
                self.error(FsError::Internal(format!(
                    "Error setting delayed forced remote candidates: {}",
                    e.message()
                )));
            }
            return;
        }

        if let Some((u, p)) = creds {
            if let Err(e) = self.set_credentials(&u, &p) {
                self.error(e);
                return;
            }
        }
        if let Err(e) = self.apply_remote(&remotes) {
            self.error(FsError::Internal(format!(
                "Error setting delayed remote candidates: {}",
                e.message()
            )));
        }
    }

    fn on_state_changed(&self, component: u16, state: StreamState) {
        {
            let mut s = self.state.lock();
            if s.stopped {
                return;
            }
            let idx = component as usize - 1;
            let Some(ready) = s.has_been_ready.get_mut(idx) else {
                return;
            };
            if state == StreamState::Failed && !*ready {
                debug!(
                    "Stream {} component {}: ignoring failed before first ready",
                    self.stream, component
                );
                return;
            }
            if state == StreamState::Ready {
                *ready = true;
            }
        }

        debug!(
            "Stream {} component {}: state {}",
            self.stream, component, state
        );
        self.emit(StreamTransmitterEvent::StateChanged { component, state });

        if state.is_connected() {
            self.emit(StreamTransmitterEvent::KeyUnitRequested { component });
        }
    }
}

impl AgentHandler for NiceStreamInner {
    fn handle_event(&self, event: AgentEvent) {
        match event {
            AgentEvent::NewCandidate { candidate, .. } => self.on_new_candidate(candidate),
            AgentEvent::GatheringDone { .. } => self.on_gathering_done(),
            AgentEvent::ComponentStateChanged {
                component, state, ..
            } => self.on_state_changed(component, state.into()),
            AgentEvent::NewSelectedPair {
                component,
                local,
                remote,
                ..
            } => {
                if self.state.lock().stopped {
                    return;
                }
                let local = from_local_candidate(&local);
                let remote = from_agent_candidate(&remote);
                info!(
                    "Stream {} component {}: selected pair {} -> {}",
                    self.stream, component, local, remote
                );
                self.emit(StreamTransmitterEvent::NewActiveCandidatePair { local, remote });
            }
        }
    }
}

impl NiceStreamTransmitter {
    pub(crate) fn gather_local_candidates(&self) -> Result<(), FsError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if state.stopped {
                return Err(FsError::disposed("stream transmitter"));
            }
            if state.gather_started {
                return Err(FsError::invalid(
                    "Local candidates have already been gathered",
                ));
            }
            state.gather_started = true;
        }

        inner.agent.gather_candidates(inner.agent_stream)?;
        Ok(())
    }

    pub(crate) fn add_remote_candidates(&self, candidates: Vec<Candidate>) -> Result<(), FsError> {
        let inner = &self.inner;

        if candidates.is_empty() {
            {
                let mut state = inner.state.lock();
                if state.stopped {
                    return Err(FsError::disposed("stream transmitter"));
                }
                state.remote_pending.clear();
                state.username = None;
                state.password = None;
                state.forced = false;
            }
            info!("Stream {}: ICE restart", inner.stream);
            inner.agent.restart_stream(inner.agent_stream)?;
            return Ok(());
        }

        let creds = inner.check_remote_candidates(&candidates)?;

        let mut state = inner.state.lock();
        if state.stopped {
            return Err(FsError::disposed("stream transmitter"));
        }
        if state.forced {
            return Err(FsError::invalid(
                "Candidates have been forced, can't set remote candidates",
            ));
        }

        if let Some((u, p)) = &creds {
            if let (Some(su), Some(sp)) = (&state.username, &state.password) {
                if su != u || sp != p {
                    return Err(FsError::invalid(
                        "Invalid remote candidates passed, does not have the right username/password",
                    ));
                }
            }
            state.username = Some(u.clone());
            state.password = Some(p.clone());
        }

        if !state.gathered {
            state.remote_pending.extend(candidates);
            return Ok(());
        }
        drop(state);

        if let Some((u, p)) = creds {
            inner.set_credentials(&u, &p)?;
        }
        inner.apply_remote(&candidates)
    }

    pub(crate) fn force_remote_candidates(&self, candidates: Vec<Candidate>) -> Result<(), FsError> {
        let inner = &self.inner;

        let mut seen = vec![false; inner.components as usize];
        for c in &candidates {
            if c.component_id == 0 || c.component_id > inner.components {
                return Err(FsError::invalid("The component on this candidate is wrong"));
            }
            let idx = c.component_id as usize - 1;
            if seen[idx] {
                return Err(FsError::invalid(
                    "You can set only one candidate per component",
                ));
            }
            seen[idx] = true;
            if c.socket_addr().is_none() {
                return Err(FsError::invalid("Candidate MUST have an IP address"));
            }
        }

        let mut state = inner.state.lock();
        if state.stopped {
            return Err(FsError::disposed("stream transmitter"));
        }
        state.forced = true;
        if !state.gathered {
            state.remote_pending = candidates;
            return Ok(());
        }
        drop(state);

        inner.apply_forced(&candidates)
    }

    pub(crate) fn sending(&self) -> bool {
        self.inner.sending.load(Ordering::Relaxed)
    }

    pub(crate) fn set_sending(&self, sending: bool) {
        self.inner.sending.store(sending, Ordering::Relaxed);
    }

    pub(crate) fn stop(&self) {
        let inner = &self.inner;
        let outputs = {
            let mut state = inner.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            std::mem::take(&mut state.outputs)
        };

        for id in outputs {
            inner.sink.detach(id);
        }
        inner.agent.remove_stream(inner.agent_stream);
        debug!("Stopped nice stream transmitter for stream {}", inner.stream);
    }

    /// Local credentials of the agent stream.
    pub fn local_credentials(&self) -> Result<(String, String), FsError> {
        let creds = self.inner.agent.local_credentials(self.inner.agent_stream)?;
        Ok((creds.ufrag, creds.pass))
    }
}

impl fmt::Debug for NiceStreamTransmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NiceStreamTransmitter")
            .field("stream", &self.inner.stream)
            .field("agent_stream", &self.inner.agent_stream)
            .finish()
    }
}

fn kind_to_type(kind: CandidateKind) -> CandidateType {
    match kind {
        CandidateKind::Host => CandidateType::Host,
        CandidateKind::ServerReflexive => CandidateType::Srflx,
        CandidateKind::PeerReflexive => CandidateType::Prflx,
        CandidateKind::Relayed => CandidateType::Relay,
    }
}

fn type_to_kind(kind: CandidateType) -> CandidateKind {
    match kind {
        CandidateType::Srflx => CandidateKind::ServerReflexive,
        CandidateType::Prflx => CandidateKind::PeerReflexive,
        CandidateType::Relay => CandidateKind::Relayed,
        CandidateType::Host | CandidateType::Multicast => CandidateKind::Host,
    }
}

fn from_local_candidate(local: &LocalCandidate) -> Candidate {
    let c = &local.candidate;
    let addr = c.addr();
    let base = c.base();
    let mut out = Candidate::new(
        c.foundation(),
        c.component_id(),
        kind_to_type(c.kind()),
        NetworkProtocol::Udp,
        addr.ip().to_string(),
        addr.port(),
    )
    .set_priority(c.prio())
    .set_username(local.ufrag.clone())
    .set_password(local.pass.clone());
    if base != addr {
        out = out.set_base(base.ip().to_string(), base.port());
    }
    out
}

fn from_agent_candidate(c: &ice::Candidate) -> Candidate {
    let addr = c.addr();
    let mut out = Candidate::new(
        c.foundation(),
        c.component_id(),
        kind_to_type(c.kind()),
        NetworkProtocol::Udp,
        addr.ip().to_string(),
        addr.port(),
    )
    .set_priority(c.prio());
    out.username = c.ufrag().map(|v| v.to_string());
    out.password = c.pass().map(|v| v.to_string());
    out
}

/// Convert a remote candidate. TCP candidates are skipped since only UDP is gathered.
fn to_agent_candidate(c: &Candidate) -> Option<ice::Candidate> {
    if c.proto != NetworkProtocol::Udp {
        debug!("Skipping non-UDP remote candidate {}", c);
        return None;
    }
    let addr = c.socket_addr()?;
    let kind = type_to_kind(c.kind);
    let prio = match c.priority {
        0 => default_priority(kind, c.component_id),
        v => v,
    };
    match ice::Candidate::remote(
        c.foundation.clone(),
        c.component_id,
        prio,
        addr,
        kind,
        c.username.clone(),
        c.password.clone(),
    ) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!("Skipping remote candidate {}: {}", c, e);
            None
        }
    }
}

/// Priority for a remote candidate that came without one.
fn default_priority(kind: CandidateKind, component: u16) -> u32 {
    let type_pref: u32 = match kind {
        CandidateKind::Host => 126,
        CandidateKind::PeerReflexive => 110,
        CandidateKind::ServerReflexive => 100,
        CandidateKind::Relayed => 0,
    };
    (type_pref << 24) | (65535 << 8) | (256 - component.min(256) as u32)
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam::channel::{self, Receiver, Sender};
    use std::time::{Duration, Instant};

    struct Events(Sender<StreamTransmitterEvent>);

    impl StreamTransmitterHandler for Events {
        fn handle_event(&self, event: StreamTransmitterEvent) {
            let _ = self.0.send(event);
        }
    }

    struct Side {
        t: NiceTransmitter,
        st: StreamTransmitter,
        rx: Receiver<StreamTransmitterEvent>,
        _handler: Arc<dyn StreamTransmitterHandler>,
    }

    fn side(controlling: bool) -> Side {
        let t = NiceTransmitter::new(&TransmitterParams::new(1, 0)).unwrap();
        let (tx, rx) = channel::unbounded();
        let handler: Arc<dyn StreamTransmitterHandler> = Arc::new(Events(tx));
        let config = NiceConfig::new()
            .set_controlling_mode(controlling)
            .set_preferred_local_candidates(vec![Candidate::with_ip("127.0.0.1")]);
        let st = t
            .new_stream_transmitter(
                &Participant::new(),
                StreamId::from(1),
                StreamTransmitterConfig::Nice(config),
                Arc::downgrade(&handler),
            )
            .unwrap();
        Side {
            t,
            st,
            rx,
            _handler: handler,
        }
    }

    fn gather(side: &Side) -> Vec<Candidate> {
        side.st.gather_local_candidates().unwrap();
        let mut out = vec![];
        loop {
            match side.rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                StreamTransmitterEvent::NewLocalCandidate(c) => out.push(c),
                StreamTransmitterEvent::LocalCandidatesPrepared => return out,
                StreamTransmitterEvent::StateChanged {
                    state: StreamState::Gathering,
                    ..
                } => {}
                e => panic!("unexpected {:?}", e),
            }
        }
    }

    fn wait_ready(side: &Side) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match side.rx.recv_timeout(left) {
                Ok(StreamTransmitterEvent::StateChanged {
                    state: StreamState::Ready,
                    ..
                }) => return,
                Ok(_) => {}
                Err(_) => panic!("not ready in time"),
            }
        }
    }

    #[test]
    fn gather_publishes_with_credentials() {
        let a = side(true);
        let candidates = gather(&a);
        assert!(!candidates.is_empty());
        let (ufrag, pass) = match &a.st {
            StreamTransmitter::Nice(v) => v.local_credentials().unwrap(),
            _ => unreachable!(),
        };
        for c in &candidates {
            assert_eq!(c.username.as_deref(), Some(ufrag.as_str()));
            assert_eq!(c.password.as_deref(), Some(pass.as_str()));
            assert_eq!(c.ip.as_deref(), Some("127.0.0.1"));
        }
        let e = a.st.gather_local_candidates().unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidArguments);
    }

    #[test]
    fn connect_and_send() {
        let a = side(true);
        let b = side(false);
        let ca = gather(&a);
        let cb = gather(&b);
        a.st.add_remote_candidates(cb).unwrap();
        b.st.add_remote_candidates(ca).unwrap();
        wait_ready(&a);
        wait_ready(&b);

        a.t.sink().push(1, b"over ice").unwrap();
        let p = b.t.source().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(p.data, b"over ice");
        assert_eq!(p.stream, Some(StreamId::from(1)));
    }

    #[test]
    fn credentials_must_agree() {
        let a = side(true);
        let c1 = Candidate::new("1", 1, CandidateType::Host, NetworkProtocol::Udp, "127.0.0.1", 4000)
            .set_username("u1")
            .set_password("p");
        let c2 = Candidate::new("2", 1, CandidateType::Host, NetworkProtocol::Udp, "127.0.0.1", 4002)
            .set_username("u2")
            .set_password("p");
        let e = a.st.add_remote_candidates(vec![c1.clone(), c2]).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidArguments);

        // Nothing was stored, other credentials are still accepted.
        let c3 = c1.clone().set_username("u3");
        a.st.add_remote_candidates(vec![c3]).unwrap();
        let e = a.st.add_remote_candidates(vec![c1]).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidArguments);
    }

    #[test]
    fn remote_validation() {
        let a = side(true);
        let no_user =
            Candidate::new("1", 1, CandidateType::Host, NetworkProtocol::Udp, "127.0.0.1", 4000);
        let e = a.st.add_remote_candidates(vec![no_user.clone()]).unwrap_err();
        assert_eq!(
            e.message(),
            "Invalid remote candidates passed, does not have a username"
        );

        let mut multicast = no_user.clone().set_username("u").set_password("p");
        multicast.kind = CandidateType::Multicast;
        let e = a.st.add_remote_candidates(vec![multicast]).unwrap_err();
        assert_eq!(
            e.message(),
            "libnice transmitter does not accept multicast candidates"
        );

        let mut comp = no_user.set_username("u").set_password("p");
        comp.component_id = 2;
        assert!(a.st.add_remote_candidates(vec![comp]).is_err());
    }

    #[test]
    fn force_before_gather() {
        let a = side(true);
        let b = side(false);
        let cb = gather(&b);

        let forced = cb[0].clone();
        a.st.force_remote_candidates(vec![forced.clone()]).unwrap();
        let e = a.st.add_remote_candidates(cb.clone()).unwrap_err();
        assert_eq!(
            e.message(),
            "Candidates have been forced, can't set remote candidates"
        );

        let _ = gather(&a);

        let mut pairs = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while let Ok(ev) = a
            .rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
        {
            match ev {
                StreamTransmitterEvent::NewActiveCandidatePair { remote, .. } => {
                    assert_eq!(remote.socket_addr(), forced.socket_addr());
                    pairs += 1;
                }
                StreamTransmitterEvent::StateChanged {
                    state: StreamState::Ready,
                    ..
                } => break,
                StreamTransmitterEvent::Error(e) => panic!("{}", e),
                _ => {}
            }
        }
        assert_eq!(pairs, 1);
    }

    #[test]
    fn restart_clears_forced() {
        let a = side(true);
        let b = side(false);
        let cb = gather(&b);
        let _ = gather(&a);

        a.st.force_remote_candidates(vec![cb[0].clone()]).unwrap();
        assert!(a.st.add_remote_candidates(cb.clone()).is_err());

        a.st.add_remote_candidates(vec![]).unwrap();
        a.st.add_remote_candidates(cb).unwrap();
    }

    fn inner(side: &Side) -> Arc<NiceStreamInner> {
        match &side.st {
            StreamTransmitter::Nice(v) => v.inner.clone(),
            _ => unreachable!(),
        }
    }

    fn state_changed(inner: &NiceStreamInner, component: u16, state: ice::ComponentState) {
        inner.handle_event(AgentEvent::ComponentStateChanged {
            stream: inner.agent_stream,
            component,
            state,
        });
    }

    fn pending(side: &Side) -> Vec<StreamTransmitterEvent> {
        side.rx.try_iter().collect()
    }

    #[test]
    fn failed_only_after_ready() {
        use crate::ice::ComponentState;

        let a = side(true);
        let inner = inner(&a);

        state_changed(&inner, 1, ComponentState::Connecting);
        state_changed(&inner, 1, ComponentState::Failed);
        assert_eq!(
            pending(&a),
            vec![StreamTransmitterEvent::StateChanged {
                component: 1,
                state: StreamState::Connecting
            }]
        );

        state_changed(&inner, 1, ComponentState::Ready);
        assert_eq!(
            pending(&a),
            vec![
                StreamTransmitterEvent::StateChanged {
                    component: 1,
                    state: StreamState::Ready
                },
                StreamTransmitterEvent::KeyUnitRequested { component: 1 },
            ]
        );

        state_changed(&inner, 1, ComponentState::Failed);
        assert_eq!(
            pending(&a),
            vec![StreamTransmitterEvent::StateChanged {
                component: 1,
                state: StreamState::Failed
            }]
        );

        // Out of range components are dropped.
        state_changed(&inner, 3, ComponentState::Ready);
        assert!(pending(&a).is_empty());
    }

    #[test]
    fn force_validation() {
        let a = side(true);
        let c = Candidate::new("1", 1, CandidateType::Host, NetworkProtocol::Udp, "127.0.0.1", 4000);
        let e = a
            .st
            .force_remote_candidates(vec![c.clone(), c.clone()])
            .unwrap_err();
        assert_eq!(e.message(), "You can set only one candidate per component");

        let mut bad = c;
        bad.component_id = 3;
        let e = a.st.force_remote_candidates(vec![bad]).unwrap_err();
        assert_eq!(e.message(), "The component on this candidate is wrong");
    }

    #[test]
    fn stop_detaches_outputs() {
        let a = side(true);
        assert_eq!(a.t.sink().output_count(1), 1);
        a.st.stop();
        a.st.stop();
        assert_eq!(a.t.sink().output_count(1), 0);
        let e = a.st.gather_local_candidates().unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::Disposed);
    }

    #[test]
    fn priority_for_missing() {
        let p = default_priority(CandidateKind::Host, 1);
        assert_eq!(p >> 24, 126);
        assert_eq!(p & 0xff, 255);
    }
}
