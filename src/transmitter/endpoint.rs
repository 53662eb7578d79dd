use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::RwLock;

use crate::error::FsError;
use crate::id::StreamId;

/// A datagram from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    /// Component it arrived on.
    pub component: u16,
    /// Sender address. `None` for transports without addresses.
    pub origin: Option<SocketAddr>,
    /// The stream of the sender, if it is known.
    pub stream: Option<StreamId>,
    /// When it was read, if the transmitter timestamps.
    pub timestamp: Option<Instant>,
    /// The payload.
    pub data: Vec<u8>,
}

/// Where a transmitter delivers received packets. One pad `src_<N>` per component.
///
/// Packets from all components are funneled into one queue.
#[derive(Clone)]
pub struct NetworkSource {
    components: u16,
    do_timestamp: bool,
    tx: Sender<ReceivedPacket>,
    rx: Receiver<ReceivedPacket>,
}

impl NetworkSource {
    pub(crate) fn new(components: u16, do_timestamp: bool) -> Self {
        let (tx, rx) = channel::unbounded();
        NetworkSource {
            components,
            do_timestamp,
            tx,
            rx,
        }
    }

    /// Pad names, `src_1` to `src_<components>`.
    pub fn pad_names(&self) -> Vec<String> {
        (1..=self.components).map(|c| format!("src_{}", c)).collect()
    }

    pub(crate) fn push(
        &self,
        component: u16,
        origin: Option<SocketAddr>,
        stream: Option<StreamId>,
        data: &[u8],
    ) {
        let packet = ReceivedPacket {
            component,
            origin,
            stream,
            timestamp: self.do_timestamp.then(Instant::now),
            data: data.to_vec(),
        };
        let _ = self.tx.send(packet);
    }

    /// Take a received packet, if any.
    pub fn try_recv(&self) -> Option<ReceivedPacket> {
        self.rx.try_recv().ok()
    }

    /// Wait for a received packet.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ReceivedPacket> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub(crate) fn receiver(&self) -> &Receiver<ReceivedPacket> {
        &self.rx
    }
}

impl fmt::Debug for NetworkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkSource")
            .field("components", &self.components)
            .field("queued", &self.rx.len())
            .finish()
    }
}

/// Something packets pushed in the sink are written to.
pub(crate) trait PacketOutput: Send + Sync {
    fn send(&self, data: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct OutputId(u64);

static NEXT_OUTPUT: AtomicU64 = AtomicU64::new(1);

struct Attached {
    id: OutputId,
    component: u16,
    output: Arc<dyn PacketOutput>,
}

/// Where packets to send are pushed. One pad `sink_<N>` per component.
///
/// Every packet on a component is copied to each output attached to it.
#[derive(Clone)]
pub struct NetworkSink {
    components: u16,
    outputs: Arc<RwLock<Vec<Attached>>>,
}

impl NetworkSink {
    pub(crate) fn new(components: u16) -> Self {
        NetworkSink {
            components,
            outputs: Arc::new(RwLock::new(vec![])),
        }
    }

    /// Pad names, `sink_1` to `sink_<components>`.
    pub fn pad_names(&self) -> Vec<String> {
        (1..=self.components).map(|c| format!("sink_{}", c)).collect()
    }

    /// Send a packet on a component. Returns how many outputs took it.
    pub fn push(&self, component: u16, data: &[u8]) -> Result<usize, FsError> {
        if component == 0 || component > self.components {
            return Err(FsError::invalid(format!(
                "Invalid component {} > {}",
                component, self.components
            )));
        }

        let outputs: Vec<_> = self
            .outputs
            .read()
            .iter()
            .filter(|a| a.component == component)
            .map(|a| a.output.clone())
            .collect();

        let mut n = 0;
        for output in outputs {
            match output.send(data) {
                Ok(()) => n += 1,
                Err(e) => trace!("Output on component {} failed: {}", component, e),
            }
        }
        Ok(n)
    }

    pub(crate) fn attach(&self, component: u16, output: Arc<dyn PacketOutput>) -> OutputId {
        let id = OutputId(NEXT_OUTPUT.fetch_add(1, Ordering::Relaxed));
        self.outputs.write().push(Attached {
            id,
            component,
            output,
        });
        id
    }

    pub(crate) fn detach(&self, id: OutputId) {
        self.outputs.write().retain(|a| a.id != id);
    }

    /// Number of outputs on a component.
    pub fn output_count(&self, component: u16) -> usize {
        self.outputs
            .read()
            .iter()
            .filter(|a| a.component == component)
            .count()
    }
}

impl fmt::Debug for NetworkSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkSink")
            .field("components", &self.components)
            .field("outputs", &self.outputs.read().len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use parking_lot::Mutex;

    struct Collect(Mutex<Vec<Vec<u8>>>);

    impl PacketOutput for Collect {
        fn send(&self, data: &[u8]) -> io::Result<()> {
            self.0.lock().push(data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn sink_copies_to_each_output() {
        let sink = NetworkSink::new(2);
        assert_eq!(sink.pad_names(), vec!["sink_1", "sink_2"]);

        let a = Arc::new(Collect(Mutex::new(vec![])));
        let b = Arc::new(Collect(Mutex::new(vec![])));
        let ida = sink.attach(1, a.clone());
        sink.attach(1, b.clone());

        assert_eq!(sink.push(1, b"x").unwrap(), 2);
        assert_eq!(sink.push(2, b"y").unwrap(), 0);
        assert!(sink.push(3, b"z").is_err());

        sink.detach(ida);
        assert_eq!(sink.push(1, b"w").unwrap(), 1);
        assert_eq!(a.0.lock().len(), 1);
        assert_eq!(b.0.lock().len(), 2);
    }

    #[test]
    fn source_funnels() {
        let src = NetworkSource::new(2, false);
        assert_eq!(src.pad_names(), vec!["src_1", "src_2"]);
        src.push(2, None, None, b"a");
        let p = src.try_recv().unwrap();
        assert_eq!(p.component, 2);
        assert_eq!(p.timestamp, None);
        assert!(src.try_recv().is_none());
    }
}
