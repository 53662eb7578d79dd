#![allow(unused)]
use std::sync::Once;
use std::time::{Duration, Instant};

use farstream::{Bus, Candidate, Event, StreamId, StreamState};

pub const TIMEOUT: Duration = Duration::from_secs(15);

pub fn init_log() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    static START: Once = Once::new();

    START.call_once(|| {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(env_filter)
            .init();
    });
}

/// Collect local candidates of a stream until it reports them prepared.
pub fn local_candidates(bus: &Bus, stream: StreamId) -> Vec<Candidate> {
    let mut out = vec![];
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match bus.recv_timeout(left) {
            Some(Event::NewLocalCandidate { stream: s, candidate }) if s == stream => {
                out.push(candidate)
            }
            Some(Event::LocalCandidatesPrepared { stream: s }) if s == stream => return out,
            Some(_) => {}
            None => panic!("No local-candidates-prepared for stream {}", stream),
        }
    }
}

/// Wait until a component of a stream reaches a state. Candidates seen on the way
/// are returned.
pub fn wait_state(
    bus: &Bus,
    stream: StreamId,
    component: u16,
    state: StreamState,
) -> Vec<Candidate> {
    let mut candidates = vec![];
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match bus.recv_timeout(left) {
            Some(Event::ComponentStateChanged {
                stream: s,
                component: c,
                state: st,
            }) if s == stream && c == component && st == state => return candidates,
            Some(Event::NewLocalCandidate { stream: s, candidate }) if s == stream => {
                candidates.push(candidate)
            }
            Some(_) => {}
            None => panic!("Stream {} component {} never got {}", stream, component, state),
        }
    }
}

/// All events currently queued.
pub fn drain(bus: &Bus) -> Vec<Event> {
    let mut out = vec![];
    while let Some(e) = bus.pop() {
        out.push(e);
    }
    out
}
