use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::stun::{stun_resend_delay, StunMessage, TransId};
use super::Transmit;

/// Number of binding requests sent to the STUN server per socket.
const SERVER_ATTEMPTS: usize = 3;

/// Give up on the STUN server after this long.
const SERVER_TIMEOUT: Duration = Duration::from_secs(3);

/// Discovery of server reflexive candidates for one agent stream.
///
/// Every local socket sends a binding request to the STUN server. The mapped address
/// in the response is the server reflexive candidate.
#[derive(Debug)]
pub struct ServerReflexive {
    server: SocketAddr,
    started: Instant,
    pending: Vec<Pending>,
}

#[derive(Debug)]
struct Pending {
    component_id: u16,
    local: SocketAddr,
    trans_id: TransId,
    attempts: usize,
    last_sent: Option<Instant>,
    done: bool,
}

/// A discovered server reflexive address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reflexive {
    pub component_id: u16,
    pub base: SocketAddr,
    pub mapped: SocketAddr,
}

impl ServerReflexive {
    pub fn new(server: SocketAddr, now: Instant) -> Self {
        ServerReflexive {
            server,
            started: now,
            pending: vec![],
        }
    }

    /// Query the server from the local socket `local`.
    pub fn add_socket(&mut self, component_id: u16, local: SocketAddr) {
        // The server can only be reached over the same IP family.
        if local.is_ipv4() != self.server.is_ipv4() {
            return;
        }
        self.pending.push(Pending {
            component_id,
            local,
            trans_id: TransId::new(),
            attempts: 0,
            last_sent: None,
            done: false,
        });
    }

    pub fn is_done(&self, now: Instant) -> bool {
        now >= self.started + SERVER_TIMEOUT || self.pending.iter().all(|p| p.done)
    }

    /// Requests due to be (re)sent.
    pub fn poll_transmit(&mut self, now: Instant) -> Vec<Transmit> {
        let mut out = vec![];
        for p in &mut self.pending {
            if p.done || p.attempts >= SERVER_ATTEMPTS {
                continue;
            }
            let due = match p.last_sent {
                None => true,
                Some(t) => now >= t + stun_resend_delay(p.attempts + 1),
            };
            if !due {
                continue;
            }

            p.attempts += 1;
            p.last_sent = Some(now);

            match StunMessage::server_binding_request(p.trans_id).to_vec(None) {
                Ok(contents) => out.push(Transmit {
                    source: p.local,
                    destination: self.server,
                    contents,
                }),
                Err(e) => warn!("Failed to serialize STUN server request: {}", e),
            }
        }
        out
    }

    pub fn poll_timeout(&self) -> Instant {
        let deadline = self.started + SERVER_TIMEOUT;
        self.pending
            .iter()
            .filter(|p| !p.done && p.attempts < SERVER_ATTEMPTS)
            .filter_map(|p| p.last_sent.map(|t| t + stun_resend_delay(p.attempts + 1)))
            .min()
            .unwrap_or(deadline)
            .min(deadline)
    }

    /// Whether the message is an answer from the STUN server.
    pub fn accepts(&self, message: &StunMessage<'_>) -> bool {
        message.is_successful_binding_response()
            && self
                .pending
                .iter()
                .any(|p| !p.done && p.trans_id == message.trans_id())
    }

    /// Handle the answer from the STUN server.
    pub fn handle_response(&mut self, message: &StunMessage<'_>) -> Option<Reflexive> {
        let p = self
            .pending
            .iter_mut()
            .find(|p| !p.done && p.trans_id == message.trans_id())?;
        p.done = true;

        let mapped = message.mapped_address()?;
        debug!("Server reflexive address {} for {}", mapped, p.local);

        Some(Reflexive {
            component_id: p.component_id,
            base: p.local,
            mapped,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resend_then_give_up() {
        let now = Instant::now();
        let server = "1.1.1.1:3478".parse().unwrap();
        let mut srflx = ServerReflexive::new(server, now);
        srflx.add_socket(1, "10.0.0.1:5000".parse().unwrap());
        // Different family, ignored.
        srflx.add_socket(1, "[2001:db8::1]:5000".parse().unwrap());

        assert_eq!(srflx.poll_transmit(now).len(), 1);
        assert!(srflx.poll_transmit(now).is_empty());
        assert!(!srflx.is_done(now));

        let next = srflx.poll_timeout();
        assert_eq!(srflx.poll_transmit(next).len(), 1);
        assert!(srflx.is_done(now + SERVER_TIMEOUT));
    }

    #[test]
    fn response_gives_reflexive() {
        let now = Instant::now();
        let server = "1.1.1.1:3478".parse().unwrap();
        let local: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let mut srflx = ServerReflexive::new(server, now);
        srflx.add_socket(2, local);

        let t = srflx.poll_transmit(now).pop().unwrap();
        let req = StunMessage::parse(&t.contents).unwrap();

        let mapped = "5.6.7.8:1234".parse().unwrap();
        let buf = StunMessage::reply(req.trans_id(), mapped).to_vec(None).unwrap();
        let reply = StunMessage::parse(&buf).unwrap();

        assert!(srflx.accepts(&reply));
        let r = srflx.handle_response(&reply).unwrap();
        assert_eq!(
            r,
            Reflexive {
                component_id: 2,
                base: local,
                mapped
            }
        );
        assert!(srflx.is_done(now));
    }
}
