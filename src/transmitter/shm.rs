//! Local transport over unix datagram sockets.
//!
//! The local candidate carries the socket path in its `ip` field. The remote
//! candidate names the peer socket the same way.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::candidate::{Candidate, CandidateType, NetworkProtocol};
use crate::config::{ShmConfig, StreamTransmitterConfig};
use crate::error::FsError;
use crate::id::StreamId;
use crate::net;
use crate::participant::Participant;
use crate::thread::InternalThreads;

use super::{check_component, emit, wrong_config};
use super::{NetworkSink, NetworkSource, OutputId, PacketOutput};
use super::{StreamState, StreamTransmitter, StreamTransmitterEvent};
use super::{StreamTransmitterHandler, Transmitter, TransmitterParams};

#[cfg(unix)]
use std::os::unix::net::UnixDatagram as Datagram;

#[cfg(not(unix))]
struct Datagram;

#[cfg(not(unix))]
impl Datagram {
    fn bind(_path: &Path) -> io::Result<Datagram> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no unix sockets"))
    }

    fn set_read_timeout(&self, _t: Option<std::time::Duration>) -> io::Result<()> {
        Ok(())
    }

    fn send_to(&self, _data: &[u8], _path: &Path) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no unix sockets"))
    }

    fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no unix sockets"))
    }
}

/// Transmitter for peers on the same host.
#[derive(Clone)]
pub struct ShmTransmitter {
    inner: Arc<ShmInner>,
}

struct ShmInner {
    components: u16,
    tos: AtomicU8,
    source: NetworkSource,
    sink: NetworkSink,
    threads: InternalThreads,
}

impl ShmTransmitter {
    /// Creates the transmitter. Only available on unix.
    pub fn new(params: &TransmitterParams) -> Result<Self, FsError> {
        if !cfg!(unix) {
            return Err(FsError::NotImplemented(
                "The shm transmitter is only available on unix".into(),
            ));
        }
        Ok(ShmTransmitter {
            inner: Arc::new(ShmInner {
                components: params.components,
                tos: AtomicU8::new(params.tos),
                source: NetworkSource::new(params.components, params.do_timestamp),
                sink: NetworkSink::new(params.components),
                threads: params.threads.clone(),
            }),
        })
    }
}

impl fmt::Debug for ShmTransmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmTransmitter")
            .field("components", &self.inner.components)
            .finish()
    }
}

impl Transmitter for ShmTransmitter {
    fn kind(&self) -> &'static str {
        "shm"
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

    // Local sockets have no type of service.
    fn set_tos(&self, tos: u8) {
        self.inner.tos.store(tos, Ordering::Relaxed);
    }

    fn new_stream_transmitter(
        &self,
        _participant: &Participant,
        stream: StreamId,
        config: StreamTransmitterConfig,
        handler: Weak<dyn StreamTransmitterHandler>,
    ) -> Result<StreamTransmitter, FsError> {
        let StreamTransmitterConfig::Shm(config) = config else {
            return Err(wrong_config(self.kind(), &config));
        };
        config.validate()?;

        let components = self.inner.components as usize;
        Ok(StreamTransmitter::Shm(ShmStreamTransmitter {
            transmitter: self.inner.clone(),
            stream,
            config,
            handler,
            sending: Arc::new(AtomicBool::new(true)),
            state: Mutex::new(ShmState {
                sockets: vec![None; components],
                remotes: vec![None; components],
                gathered: false,
                stopped: false,
            }),
        }))
    }
}

/// One bound socket of a stream.
struct ShmSocket {
    component: u16,
    path: PathBuf,
    socket: Datagram,
    peer: Mutex<Option<PathBuf>>,
    sending: Arc<AtomicBool>,
    closed: AtomicBool,
    output: Mutex<Option<OutputId>>,
}

impl PacketOutput for ShmSocket {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        if !self.sending.load(Ordering::Relaxed) {
            return Ok(());
        }
        let peer = self.peer.lock().clone();
        if let Some(peer) = peer {
            self.socket.send_to(data, &peer)?;
        }
        Ok(())
    }
}

/// Stream transmitter of [`ShmTransmitter`].
pub struct ShmStreamTransmitter {
    transmitter: Arc<ShmInner>,
    stream: StreamId,
    config: ShmConfig,
    handler: Weak<dyn StreamTransmitterHandler>,
    sending: Arc<AtomicBool>,
    state: Mutex<ShmState>,
}

struct ShmState {
    sockets: Vec<Option<Arc<ShmSocket>>>,
    remotes: Vec<Option<Candidate>>,
    gathered: bool,
    stopped: bool,
}

fn local_candidate(socket: &ShmSocket) -> Candidate {
    Candidate::new(
        "1",
        socket.component,
        CandidateType::Host,
        NetworkProtocol::Udp,
        socket.path.to_string_lossy(),
        0,
    )
}

fn connected_events(
    local: &ShmSocket,
    remote: &Candidate,
    out: &mut Vec<StreamTransmitterEvent>,
) {
    let component = local.component;
    out.push(StreamTransmitterEvent::NewActiveCandidatePair {
        local: local_candidate(local),
        remote: remote.clone(),
    });
    out.push(StreamTransmitterEvent::StateChanged {
        component,
        state: StreamState::Connected,
    });
    out.push(StreamTransmitterEvent::StateChanged {
        component,
        state: StreamState::Ready,
    });
}

impl ShmStreamTransmitter {
    fn socket_path(&self, component: u16) -> PathBuf {
        let name = format!(
            "farstream-shm-{}-{}-{}-{:08x}",
            std::process::id(),
            self.stream,
            component,
            fastrand::u32(..)
        );
        self.config.socket_dir().join(name)
    }

    fn bind(&self, component: u16) -> Result<Arc<ShmSocket>, FsError> {
        let path = self.socket_path(component);
        let socket = Datagram::bind(&path).map_err(|e| {
            FsError::Network(format!(
                "Could not create socket {}: {}",
                path.display(),
                e
            ))
        })?;
        socket.set_read_timeout(Some(net::READ_TIMEOUT))?;

        let socket = Arc::new(ShmSocket {
            component,
            path,
            socket,
            peer: Mutex::new(None),
            sending: self.sending.clone(),
            closed: AtomicBool::new(false),
            output: Mutex::new(None),
        });

        let t = &self.transmitter;
        let reader = socket.clone();
        let source = t.source.clone();
        let stream = self.stream;
        t.threads.spawn(format!("shm-recv-{}", component), move || {
            let mut buf = vec![0_u8; net::DATAGRAM_MAX];
            while !reader.closed.load(Ordering::Acquire) {
                match reader.socket.recv(&mut buf) {
                    Ok(n) => source.push(reader.component, None, Some(stream), &buf[..n]),
                    Err(e) if net::is_timeout(&e) => {}
                    Err(e) => {
                        trace!("Receive error on {}: {}", reader.path.display(), e);
                        break;
                    }
                }
            }
        })?;

        let id = t.sink.attach(component, socket.clone());
        *socket.output.lock() = Some(id);

        debug!("Bound shm socket {}", socket.path.display());
        Ok(socket)
    }

    fn release(&self, socket: &ShmSocket) {
        socket.closed.store(true, Ordering::Release);
        if let Some(id) = socket.output.lock().take() {
            self.transmitter.sink.detach(id);
        }
        remove_file(&socket.path);
    }

    pub(crate) fn gather_local_candidates(&self) -> Result<(), FsError> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(FsError::disposed("stream transmitter"));
        }
        if state.gathered {
            return Err(FsError::invalid(
                "Local candidates have already been gathered",
            ));
        }

        let mut bound = vec![];
        for component in 1..=self.transmitter.components {
            match self.bind(component) {
                Ok(v) => bound.push(v),
                Err(e) => {
                    for s in &bound {
                        self.release(s);
                    }
                    return Err(e);
                }
            }
        }

        let mut events: Vec<_> = bound
            .iter()
            .map(|s| StreamTransmitterEvent::NewLocalCandidate(local_candidate(s)))
            .collect();
        events.push(StreamTransmitterEvent::LocalCandidatesPrepared);

        for socket in bound {
            let idx = socket.component as usize - 1;
            if let Some(remote) = &state.remotes[idx] {
                *socket.peer.lock() = remote.ip.as_ref().map(PathBuf::from);
                connected_events(&socket, remote, &mut events);
            }
            state.sockets[idx] = Some(socket);
        }
        state.gathered = true;
        drop(state);

        for e in events {
            emit(&self.handler, e);
        }
        Ok(())
    }

    pub(crate) fn add_remote_candidates(&self, candidates: Vec<Candidate>) -> Result<(), FsError> {
        for c in &candidates {
            check_component(c, self.transmitter.components)?;
            if c.ip.as_deref().map_or(true, str::is_empty) {
                return Err(FsError::invalid(
                    "The candidate must have the path of the peer socket in its ip",
                ));
            }
        }

        let mut events = vec![];
        {
            let mut state = self.state.lock();
            if state.stopped {
                return Err(FsError::disposed("stream transmitter"));
            }
            for c in candidates {
                let idx = c.component_id as usize - 1;
                if let Some(socket) = &state.sockets[idx] {
                    *socket.peer.lock() = c.ip.as_ref().map(PathBuf::from);
                    connected_events(socket, &c, &mut events);
                }
                state.remotes[idx] = Some(c);
            }
        }

        for e in events {
            emit(&self.handler, e);
        }
        Ok(())
    }

    pub(crate) fn force_remote_candidates(&self, candidates: Vec<Candidate>) -> Result<(), FsError> {
        self.add_remote_candidates(candidates)
    }

    pub(crate) fn sending(&self) -> bool {
        self.sending.load(Ordering::Relaxed)
    }

    pub(crate) fn set_sending(&self, sending: bool) {
        self.sending.store(sending, Ordering::Relaxed);
    }

    pub(crate) fn stop(&self) {
        let sockets: Vec<_> = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.sockets.iter_mut().filter_map(|s| s.take()).collect()
        };
        for s in sockets {
            self.release(&s);
        }
        debug!("Stopped shm stream transmitter for stream {}", self.stream);
    }
}

fn remove_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            debug!("Could not remove {}: {}", path.display(), e);
        }
    }
}

impl fmt::Debug for ShmStreamTransmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmStreamTransmitter")
            .field("stream", &self.stream)
            .finish()
    }
}
