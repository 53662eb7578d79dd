use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::candidate::{Candidate, CandidateKind};
use super::pair::{CandidatePair, CheckState, PairId};
use super::stun::{StunMessage, TransId, STUN_TIMEOUT};
use super::{Compatibility, ComponentState, IceCreds, Transmit};

/// Timing advance (Ta) value.
///
/// ICE agents SHOULD use a default Ta value, 50 ms, but MAY use another
/// value based on the characteristics of the associated data.
const TIMING_ADVANCE: Duration = Duration::from_millis(50);

/// Limit of candidate pairs per check list.
const MAX_CANDIDATE_PAIRS: usize = 100;

const REMOTE_PEER_REFLEXIVE_TEMP_FOUNDATION: &str = "tmp_prflx";

/// Connectivity checks for one component of one agent stream.
///
/// This is sans-IO. Incoming STUN is fed through [`CheckList::handle_receive`], time
/// through [`CheckList::handle_timeout`], and the outcome is polled as
/// [`Transmit`] and [`CheckListEvent`].
#[derive(Debug)]
pub struct CheckList {
    stream_id: u32,
    component_id: u16,

    compatibility: Compatibility,

    /// Last time handle_timeout run (paced by timing_advance).
    last_now: Option<Instant>,

    /// Credentials for this side. Set on init and ice-restart.
    local_credentials: IceCreds,

    /// Credentials for the remote side. Set when we learn about it.
    remote_credentials: Option<IceCreds>,

    /// If this side is controlling or controlled.
    controlling: bool,

    /// Number used in STUN attribute ICE-CONTROLLING and ICE-CONTROLLED.
    /// Same for all check lists of an agent.
    control_tie_breaker: u64,

    /// Current state of the component.
    state: ComponentState,

    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    candidate_pairs: Vec<CandidatePair>,

    transmit: VecDeque<Transmit>,
    events: VecDeque<CheckListEvent>,

    /// Incoming STUN requests queued up before we know the remote credentials.
    stun_server_queue: VecDeque<StunRequest>,

    /// Currently selected pair.
    nominated_send: Option<PairId>,

    /// The remote candidate was selected by the application, no checks are done.
    forced: bool,
}

#[derive(Debug)]
struct StunRequest {
    now: Instant,
    source: SocketAddr,
    destination: SocketAddr,
    trans_id: TransId,
    prio: u32,
    use_candidate: bool,
    remote_ufrag: String,
}

/// Events from a [`CheckList`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckListEvent {
    /// The component state changed.
    StateChange(ComponentState),

    /// A new pair is used for sending.
    NewSelectedPair { local: Candidate, remote: Candidate },

    /// A role conflict made this side switch role. The new value is `controlling`.
    RoleChanged(bool),
}

impl CheckList {
    pub fn new(
        stream_id: u32,
        component_id: u16,
        compatibility: Compatibility,
        local_credentials: IceCreds,
        controlling: bool,
        control_tie_breaker: u64,
    ) -> Self {
        CheckList {
            stream_id,
            component_id,
            compatibility,
            last_now: None,
            local_credentials,
            remote_credentials: None,
            controlling,
            control_tie_breaker,
            state: ComponentState::Disconnected,
            local_candidates: vec![],
            remote_candidates: vec![],
            candidate_pairs: vec![],
            transmit: VecDeque::new(),
            events: VecDeque::new(),
            stun_server_queue: VecDeque::new(),
            nominated_send: None,
            forced: false,
        }
    }

    pub fn component_id(&self) -> u16 {
        self.component_id
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    pub fn local_candidates(&self) -> &[Candidate] {
        &self.local_candidates
    }

    pub fn controlling(&self) -> bool {
        self.controlling
    }

    /// Change the role. Pair priorities depend on the role and are recalculated.
    pub fn set_controlling(&mut self, controlling: bool) {
        if self.controlling == controlling {
            return;
        }
        debug!(
            "Stream {} component {} controlling: {}",
            self.stream_id, self.component_id, controlling
        );
        self.controlling = controlling;

        for p in &mut self.candidate_pairs {
            let local = p.local_candidate(&self.local_candidates).prio();
            let remote = p.remote_candidate(&self.remote_candidates).prio();
            p.set_prio(CandidatePair::calculate_prio(controlling, remote, local));
        }
        self.candidate_pairs.sort();
    }

    pub fn set_remote_credentials(&mut self, r: IceCreds) {
        if self.remote_credentials.as_ref() != Some(&r) {
            debug!(
                "Stream {} component {} remote credentials: {}",
                self.stream_id, self.component_id, r.ufrag
            );
            self.remote_credentials = Some(r);
        }
    }

    /// Mark the component as gathering.
    pub fn start_gathering(&mut self) {
        if self.state == ComponentState::Disconnected {
            self.set_state(ComponentState::Gathering, "gathering started");
        }
    }

    /// Adds a local candidate.
    ///
    /// Returns `false` if the candidate was not added because it is redundant.
    pub fn add_local_candidate(&mut self, mut c: Candidate) -> bool {
        if c.component_id() != self.component_id {
            debug!("Reject local candidate for wrong component: {:?}", c);
            return false;
        }

        let ip = c.addr().ip();

        // We deliberately do not follow the recommendation of unique local
        // preferences per interface known up front, since candidates trickle in.
        // Intervals per kind, odd numbers for IPv6 and even for IPv4:
        //
        // 0     - 16384 => relay
        // 16384 - 32768 => srflx
        // 32768 - 49152 => prflx
        // 49152 - 65536 => host
        let counter_start: u32 = {
            use CandidateKind::*;
            let x = match c.kind() {
                Host => 65_535,
                PeerReflexive => 49_151,
                ServerReflexive => 32_767,
                Relayed => 16_383,
            };
            x - if ip.is_ipv6() { 0 } else { 1 }
        };

        let same_kind = self
            .local_candidates
            .iter()
            .filter(|v| v.kind() == c.kind())
            .filter(|v| v.addr().is_ipv6() == ip.is_ipv6())
            .count() as u32;

        let pref = counter_start.saturating_sub(same_kind * 2);
        c.set_local_preference(pref);

        // A candidate is redundant if and only if its transport address and base equal those
        // of another candidate.
        if let Some((idx, other)) = self
            .local_candidates
            .iter_mut()
            .enumerate()
            .find(|(_, v)| v.addr() == c.addr() && v.base() == c.base())
        {
            if c.prio() < other.prio() {
                debug!(
                    "Reject redundant candidate, current: {:?} rejected: {:?}",
                    other, c
                );
                return false;
            } else {
                debug!(
                    "Replace redundant candidate, current: {:?} replaced with: {:?}",
                    other, c
                );
                other.set_discarded();
                self.discard_candidate_pairs(idx);
            }
        }

        let remote_idxs: Vec<_> = self
            .remote_candidates
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.discarded() && v.addr().is_ipv4() == ip.is_ipv4())
            .map(|(i, _)| i)
            .collect();

        self.local_candidates.push(c);

        let local_idxs = [self.local_candidates.len() - 1];
        self.form_pairs(&local_idxs, &remote_idxs);

        true
    }

    /// Adds a remote candidate.
    pub fn add_remote_candidate(&mut self, c: Candidate) {
        if c.component_id() != self.component_id {
            debug!("Reject remote candidate for wrong component: {:?}", c);
            return;
        }

        if self.compatibility.is_rfc() {
            if let (Some(creds), Some(ufrag)) = (&self.remote_credentials, c.ufrag()) {
                if ufrag != creds.ufrag {
                    debug!(
                        "Reject candidate with ufrag mismatch: {} != {}",
                        ufrag, creds.ufrag
                    );
                    return;
                }
            }
        }

        if self
            .remote_candidates
            .iter()
            .any(|v| !v.discarded() && v.addr() == c.addr() && v.kind() == c.kind())
        {
            trace!("Remote candidate already known: {:?}", c);
            return;
        }

        debug!(
            "Stream {} component {} add remote candidate: {:?}",
            self.stream_id, self.component_id, c
        );

        let existing_prflx = self.remote_candidates.iter_mut().enumerate().find(|(_, v)| {
            v.foundation() == REMOTE_PEER_REFLEXIVE_TEMP_FOUNDATION
                && v.kind() == CandidateKind::PeerReflexive
                && v.addr() == c.addr()
        });

        let ipv4 = c.addr().is_ipv4();

        let remote_idx = if let Some((idx, existing)) = existing_prflx {
            // A candidate exchange signals the actual foundation of the peer reflexive.
            debug!(
                "Replace peer reflexive candidate, current: {:?} replaced with: {:?}",
                existing, c
            );
            *existing = c;
            idx
        } else {
            self.remote_candidates.push(c);
            self.remote_candidates.len() - 1
        };

        let local_idxs: Vec<_> = self
            .local_candidates
            .iter()
            .enumerate()
            .filter(|(_, v)| {
                !v.discarded()
                    && v.kind() != CandidateKind::PeerReflexive
                    && v.addr().is_ipv4() == ipv4
            })
            .map(|(i, _)| i)
            .collect();

        self.form_pairs(&local_idxs, &[remote_idx]);

        // New remotes give a failed component another go.
        if self.state == ComponentState::Failed {
            self.set_state(ComponentState::Connecting, "new remote candidate");
        }
    }

    /// Select a remote candidate directly, without connectivity checks.
    ///
    /// Returns `false` if there is no local candidate to pair it with.
    pub fn force_remote_candidate(&mut self, c: Candidate) -> bool {
        if c.component_id() != self.component_id {
            return false;
        }

        let ipv4 = c.addr().is_ipv4();
        let Some(local_idx) = self
            .local_candidates
            .iter()
            .enumerate()
            .filter(|(_, v)| {
                !v.discarded() && v.kind() == CandidateKind::Host && v.addr().is_ipv4() == ipv4
            })
            .max_by_key(|(_, v)| v.prio())
            .map(|(i, _)| i)
        else {
            debug!("No local candidate to pair forced remote with: {:?}", c);
            return false;
        };

        self.remote_candidates.push(c);
        let remote_idx = self.remote_candidates.len() - 1;

        let local_prio = self.local_candidates[local_idx].prio();
        let remote_prio = self.remote_candidates[remote_idx].prio();
        let prio = CandidatePair::calculate_prio(self.controlling, remote_prio, local_prio);

        let mut pair = CandidatePair::new(local_idx, remote_idx, prio);
        pair.nominate(true);
        let id = pair.id();

        self.candidate_pairs.retain(|p| p.remote_idx() != remote_idx);
        self.candidate_pairs.push(pair);
        self.candidate_pairs.sort();
        self.forced = true;

        info!(
            "Stream {} component {} forced remote candidate: {:?}",
            self.stream_id, self.component_id, self.remote_candidates[remote_idx]
        );

        self.select_pair(id);
        self.set_state(ComponentState::Ready, "forced remote candidate");
        true
    }

    /// Form pairs given two slices of indexes into the local_candidates and remote_candidates.
    fn form_pairs(&mut self, local_idxs: &[usize], remote_idxs: &[usize]) {
        for local_idx in local_idxs {
            'outer: for remote_idx in remote_idxs {
                let local = &self.local_candidates[*local_idx];
                let remote = &self.remote_candidates[*remote_idx];

                let prio =
                    CandidatePair::calculate_prio(self.controlling, remote.prio(), local.prio());
                let mut pair = CandidatePair::new(*local_idx, *remote_idx, prio);

                trace!("Form pair local: {:?} remote: {:?}", local, remote);

                // Two candidate pairs are redundant if their local candidates have the
                // same base and their remote candidates are identical.
                for (check_idx, check) in self.candidate_pairs.iter().enumerate() {
                    let check_local = check.local_candidate(&self.local_candidates);
                    let check_remote = check.remote_candidate(&self.remote_candidates);

                    let redundant =
                        local.base() == check_local.base() && remote.addr() == check_remote.addr();

                    if redundant {
                        if check.prio() >= pair.prio() {
                            debug!(
                                "Reject redundant pair, current: {:?} rejected: {:?}",
                                check, pair
                            );
                        } else {
                            debug!(
                                "Replace redundant pair, current: {:?} replaced with: {:?}",
                                check, pair
                            );

                            if self.candidate_pairs[check_idx].is_nominated() {
                                pair.nominate(true);
                            }

                            self.candidate_pairs[check_idx] = pair;
                        }

                        continue 'outer;
                    }
                }

                debug!("Add new pair {:?}", pair);
                self.candidate_pairs.push(pair);
            }
        }

        self.candidate_pairs.sort();

        while self.candidate_pairs.len() > MAX_CANDIDATE_PAIRS {
            let pair = self.candidate_pairs.pop();
            debug!("Remove overflow pair {:?}", pair);
        }
    }

    /// Discard candidate pairs that contain the candidate identified by a local index.
    fn discard_candidate_pairs(&mut self, local_idx: usize) {
        trace!("Discard pairs for local candidate index: {:?}", local_idx);
        self.candidate_pairs.retain(|c| c.local_idx() != local_idx);
    }

    /// Restart ICE on this component.
    ///
    /// Remote state is flushed. The local candidates are kept, and so is the
    /// selected pair until a new one is found, so data can continue to flow.
    pub fn restart(&mut self, local_credentials: IceCreds) {
        info!(
            "Stream {} component {} ICE restart",
            self.stream_id, self.component_id
        );

        self.remote_credentials = None;
        self.stun_server_queue.clear();
        self.transmit.clear();
        self.forced = false;
        self.local_credentials = local_credentials;

        // Rebuild the list without any remote state. Local prflx are forgotten.
        let locals: Vec<_> = self
            .local_candidates
            .drain(..)
            .filter(|c| !c.discarded() && c.kind() != CandidateKind::PeerReflexive)
            .collect();
        self.local_candidates = locals;
        self.remote_candidates.clear();
        self.candidate_pairs.clear();

        if self.state != ComponentState::Disconnected && self.state != ComponentState::Gathering {
            self.set_state(ComponentState::Connecting, "ice restart");
        }
    }

    /// The addresses to send data on, if we have found a working pair.
    pub fn send_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        let pair = self
            .nominated_send
            .and_then(|id| self.candidate_pairs.iter().find(|p| p.id() == id))
            .or_else(|| {
                // Before nomination, the best working pair is used.
                self.candidate_pairs
                    .iter()
                    .find(|p| p.state() == CheckState::Succeeded)
            })?;

        let local = &self.local_candidates[pair.valid_local_idx()];
        let remote = pair.remote_candidate(&self.remote_candidates);
        Some((local.base(), remote.addr()))
    }

    /// Username and password to use towards the remote candidate at `remote_idx`.
    fn remote_creds_for(&self, remote_idx: usize) -> Option<(String, String)> {
        if self.compatibility.is_rfc() {
            let c = self.remote_credentials.as_ref()?;
            return Some((c.ufrag.clone(), c.pass.clone()));
        }

        // Each candidate can carry its own credentials.
        let remote = &self.remote_candidates[remote_idx];
        let ufrag = remote
            .ufrag()
            .map(|v| v.to_string())
            .or_else(|| self.remote_credentials.as_ref().map(|c| c.ufrag.clone()))?;

        let pass = remote
            .pass()
            .map(|v| v.to_string())
            .or_else(|| {
                self.remote_candidates
                    .iter()
                    .find(|c| c.ufrag() == Some(ufrag.as_str()) && c.pass().is_some())
                    .and_then(|c| c.pass().map(|v| v.to_string()))
            })
            .or_else(|| self.remote_credentials.as_ref().map(|c| c.pass.clone()))
            .unwrap_or_default();

        Some((ufrag, pass))
    }

    /// Whether the remote ufrag in a STUN request is one we know.
    ///
    /// `None` means we can't tell yet, since we have not received the remote credentials.
    fn knows_remote_ufrag(&self, remote_ufrag: &str) -> Option<bool> {
        if self.compatibility.is_rfc() {
            let creds = self.remote_credentials.as_ref()?;
            return Some(creds.ufrag == remote_ufrag);
        }

        let by_candidate = self
            .remote_candidates
            .iter()
            .any(|c| c.ufrag() == Some(remote_ufrag));
        let by_stream = self
            .remote_credentials
            .as_ref()
            .map(|c| c.ufrag == remote_ufrag);

        match (by_candidate, by_stream) {
            (true, _) | (_, Some(true)) => Some(true),
            (false, Some(false)) => Some(false),
            (false, None) if self.remote_candidates.is_empty() => None,
            _ => Some(false),
        }
    }

    /// Handles an incoming STUN message received on the socket `destination`.
    pub fn handle_receive(
        &mut self,
        now: Instant,
        source: SocketAddr,
        destination: SocketAddr,
        message: &StunMessage<'_>,
    ) {
        if message.is_binding_request() {
            let Some((local, remote)) = message.split_username() else {
                return;
            };

            if local != self.local_credentials.ufrag {
                trace!(
                    "Message rejected, local user mismatch: {} != {}",
                    local,
                    self.local_credentials.ufrag
                );
                return;
            }

            // Requests are checked against our own password.
            if !message.check_integrity(&self.local_credentials.pass) {
                debug!("STUN request rejected, integrity check failed");
                return;
            }

            let Some(prio) = message.prio() else {
                return;
            };

            // Role conflict, resolved by comparing tie breakers.
            if self.controlling {
                if let Some(tb) = message.ice_controlling() {
                    if self.control_tie_breaker >= tb {
                        debug!("Role conflict, both controlling, we keep the role");
                        return;
                    }
                    self.switch_role(false);
                }
            } else if let Some(tb) = message.ice_controlled() {
                if self.control_tie_breaker >= tb {
                    self.switch_role(true);
                } else {
                    debug!("Role conflict, both controlled, we keep the role");
                    return;
                }
            }

            let req = StunRequest {
                now,
                source,
                destination,
                trans_id: message.trans_id(),
                prio,
                use_candidate: message.use_candidate(),
                remote_ufrag: remote.into(),
            };

            match self.knows_remote_ufrag(remote) {
                Some(true) => self.stun_server_handle_request(req),
                Some(false) => {
                    debug!(
                        "STUN request rejected, remote user mismatch: {}",
                        req.remote_ufrag
                    );
                }
                None => {
                    debug!(
                        "Enqueue STUN request due to missing remote credentials: {:?}",
                        req
                    );
                    self.stun_server_queue.push_back(req);
                    while self.stun_server_queue.len() > 100 {
                        let r = self.stun_server_queue.pop_front();
                        debug!("Remove overflow STUN request {:?}", r);
                    }
                }
            }
        } else if message.is_successful_binding_response() {
            self.stun_client_handle_response(now, message);
        } else {
            trace!("Ignore STUN message: {:?}", message);
        }
    }

    fn switch_role(&mut self, controlling: bool) {
        info!(
            "Stream {} component {} role conflict, switching to controlling: {}",
            self.stream_id, self.component_id, controlling
        );
        self.set_controlling(controlling);
        self.events.push_back(CheckListEvent::RoleChanged(controlling));
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        // The generation of ordinary and triggered connectivity checks is
        // governed by timer Ta.
        if let Some(last_now) = self.last_now {
            if now < last_now + TIMING_ADVANCE {
                return;
            }
        }

        self.last_now = Some(now);

        // First we try to empty the queue of saved STUN requests.
        while let Some(peek) = self.stun_server_queue.front() {
            if now - peek.now >= STUN_TIMEOUT {
                let r = self.stun_server_queue.pop_front();
                trace!("Drop too old enqueued STUN request: {:?}", r);
                continue;
            }
            match self.knows_remote_ufrag(&peek.remote_ufrag) {
                None => break,
                Some(_) => {
                    if let Some(req) = self.stun_server_queue.pop_front() {
                        if self.knows_remote_ufrag(&req.remote_ufrag) == Some(true) {
                            debug!("Handle enqueued STUN request: {:?}", req);
                            self.stun_server_handle_request(req);
                        }
                    }
                }
            }
        }

        self.evaluate_nomination();

        // prune failed pairs.
        let mut any_pruned = false;
        let nominated_send = self.nominated_send;
        self.candidate_pairs.retain_mut(|p| {
            p.update_failed(now);
            let keep = p.state() != CheckState::Failed;
            if !keep {
                debug!("Remove failed pair: {:?}", p);
                any_pruned = true;
            }
            keep
        });
        if any_pruned {
            if let Some(id) = nominated_send {
                if !self.candidate_pairs.iter().any(|p| p.id() == id) {
                    self.nominated_send = None;
                }
            }
            self.evaluate_nomination();
        }
        self.evaluate_state(now);

        if self.forced {
            return;
        }

        // when do we need to handle the next candidate pair?
        let next = self
            .candidate_pairs
            .iter_mut()
            .enumerate()
            .filter(|(_, p)| p.state() != CheckState::Failed)
            .map(|(i, c)| (i, c.next_binding_attempt(now)))
            .min_by_key(|(_, t)| *t);

        if let Some((idx, deadline)) = next {
            if now >= deadline {
                self.stun_client_binding_request(now, idx);
            }
        }
    }

    /// Poll for the next datagram to send.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmit.pop_front()
    }

    /// Poll for the next time to call [`CheckList::handle_timeout`].
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        let last_now = self.last_now?;

        if !self.transmit.is_empty() || !self.stun_server_queue.is_empty() {
            return Some(last_now + TIMING_ADVANCE);
        }

        let maybe_next = if self.forced {
            None
        } else {
            self.candidate_pairs
                .iter_mut()
                .map(|c| c.next_binding_attempt(last_now))
                .min()
        };

        let next = match maybe_next {
            Some(next) => next.max(last_now + TIMING_ADVANCE),
            // Idle for a while, but check for pruning.
            None => last_now + Duration::from_secs(1),
        };

        Some(next)
    }

    pub fn poll_event(&mut self) -> Option<CheckListEvent> {
        self.events.pop_front()
    }

    fn stun_server_handle_request(&mut self, req: StunRequest) {
        if req.use_candidate && self.controlling {
            debug!("STUN request rejected, USE-CANDIDATE when local is controlling");
            return;
        }

        // If the source transport address of the request does not match any
        // existing remote candidates, it represents a new peer-reflexive remote
        // candidate.
        let found_in_remote = self
            .remote_candidates
            .iter()
            .enumerate()
            .find(|(_, c)| !c.discarded() && c.addr() == req.source);

        let remote_idx = if let Some((idx, _)) = found_in_remote {
            idx
        } else {
            let mut c = Candidate::peer_reflexive(
                self.component_id,
                req.source,
                req.source,
                req.prio,
                Some(REMOTE_PEER_REFLEXIVE_TEMP_FOUNDATION.into()),
            );
            if !self.compatibility.is_rfc() {
                c = c.with_ufrag(req.remote_ufrag.clone());
            }

            debug!(
                "Created peer reflexive remote candidate from STUN request: {:?}",
                c
            );

            self.remote_candidates.push(c);
            self.remote_candidates.len() - 1
        };

        // The local candidate is the host candidate the request arrived on.
        let Some(local_idx) = self
            .local_candidates
            .iter()
            .enumerate()
            .find(|(_, v)| {
                !v.discarded() && v.kind() == CandidateKind::Host && v.addr() == req.destination
            })
            .map(|(i, _)| i)
        else {
            debug!(
                "STUN request for socket that is not a local candidate: {}",
                req.destination
            );
            return;
        };

        let exists = self
            .candidate_pairs
            .iter()
            .any(|p| p.local_idx() == local_idx && p.remote_idx() == remote_idx);

        if !exists {
            let local = &self.local_candidates[local_idx];
            let remote = &self.remote_candidates[remote_idx];
            let prio = CandidatePair::calculate_prio(self.controlling, remote.prio(), local.prio());
            let pair = CandidatePair::new(local_idx, remote_idx, prio);

            debug!("Created new pair for STUN request: {:?}", pair);

            self.candidate_pairs.push(pair);
            self.candidate_pairs.sort();
        }

        let controlling = self.controlling;
        let Some(pair) = self
            .candidate_pairs
            .iter_mut()
            .find(|p| p.local_idx() == local_idx && p.remote_idx() == remote_idx)
        else {
            return;
        };

        pair.increase_remote_binding_requests(req.now);

        if !controlling && !pair.is_nominated() && req.use_candidate {
            // We answer a nomination request with a binding request
            // in the other direction.
            pair.nominate(false);
        } else if pair.state() == CheckState::Waiting {
            pair.trigger();
        }

        let local_addr = self.local_candidates[local_idx].base();

        if controlling && pair.state() == CheckState::Succeeded {
            self.evaluate_nomination();
        }

        let reply = StunMessage::reply(req.trans_id, req.source);

        trace!("Send STUN reply: {} -> {} {:?}", local_addr, req.source, reply);

        match reply.to_vec(Some(&self.local_credentials.pass)) {
            Ok(contents) => self.transmit.push_back(Transmit {
                source: local_addr,
                destination: req.source,
                contents,
            }),
            Err(e) => warn!("Failed to serialize STUN reply: {}", e),
        }
    }

    fn stun_client_binding_request(&mut self, now: Instant, pair_idx: usize) {
        let remote_idx = self.candidate_pairs[pair_idx].remote_idx();
        let Some((remote_ufrag, password)) = self.remote_creds_for(remote_idx) else {
            trace!("No remote credentials for binding request");
            return;
        };
        let username = format!("{}:{}", remote_ufrag, self.local_credentials.ufrag);

        let pair = &mut self.candidate_pairs[pair_idx];
        let local = pair.local_candidate(&self.local_candidates);
        let remote = pair.remote_candidate(&self.remote_candidates);
        let prio = local.prio_prflx();
        let source = local.base();
        let destination = remote.addr();

        // Only the controlling side sends USE-CANDIDATE.
        let use_candidate = self.controlling && (pair.is_nominating() || pair.is_nominated());

        let trans_id = pair.new_attempt(now);

        let binding = StunMessage::binding_request(
            &username,
            trans_id,
            self.controlling,
            self.control_tie_breaker,
            prio,
            use_candidate,
        );

        trace!("Send STUN request: {} -> {} {:?}", source, destination, binding);

        match binding.to_vec(Some(&password)) {
            Ok(contents) => self.transmit.push_back(Transmit {
                source,
                destination,
                contents,
            }),
            Err(e) => warn!("Failed to serialize STUN request: {}", e),
        }
    }

    fn stun_client_handle_response(&mut self, now: Instant, message: &StunMessage<'_>) {
        let trans_id = message.trans_id();
        let Some(pair_idx) = self
            .candidate_pairs
            .iter()
            .position(|p| p.has_binding_attempt(trans_id))
        else {
            // The response came in "too late", after we discarded the pair.
            trace!("No pair found for STUN response: {:?}", message);
            return;
        };

        let remote_idx = self.candidate_pairs[pair_idx].remote_idx();
        let Some((_, password)) = self.remote_creds_for(remote_idx) else {
            return;
        };
        if !message.check_integrity(&password) {
            debug!("STUN response rejected, integrity check failed");
            return;
        }

        let Some(mapped_address) = message.mapped_address() else {
            return;
        };

        let found_in_local = self
            .local_candidates
            .iter()
            .position(|c| !c.discarded() && c.addr() == mapped_address);

        let valid_idx = if let Some(valid_idx) = found_in_local {
            valid_idx
        } else {
            let local_sent_from = self.candidate_pairs[pair_idx].local_candidate(&self.local_candidates);

            // A new local peer reflexive. We do not tell the other side about it,
            // it's only used for the valid pair.
            let candidate = Candidate::peer_reflexive(
                self.component_id,
                mapped_address,
                local_sent_from.base(),
                local_sent_from.prio_prflx(),
                None,
            );

            debug!(
                "Created local peer reflexive candidate for mapped address: {}",
                mapped_address
            );

            self.local_candidates.push(candidate);
            self.local_candidates.len() - 1
        };

        self.candidate_pairs[pair_idx].record_binding_response(now, trans_id, valid_idx);

        self.evaluate_nomination();
        self.evaluate_state(now);
    }

    fn evaluate_nomination(&mut self) {
        if self.forced {
            return;
        }

        if self.controlling {
            // Regular nomination of the best working pair.
            let best = self
                .candidate_pairs
                .iter_mut()
                .filter(|p| p.state() == CheckState::Succeeded)
                .max_by_key(|p| p.prio());

            if let Some(pair) = best {
                if !pair.is_nominated() && !pair.is_nominating() {
                    debug!("Nominating best candidate pair: {:?}", pair);
                    pair.nominate(false);
                }
            }
        }

        let best = self
            .candidate_pairs
            .iter()
            .filter(|p| p.is_nominated())
            .max_by_key(|p| p.prio())
            .map(|p| p.id());

        if let Some(best) = best {
            if self.nominated_send != Some(best) {
                self.select_pair(best);
            }
        }
    }

    fn select_pair(&mut self, id: PairId) {
        let Some(pair) = self.candidate_pairs.iter().find(|p| p.id() == id) else {
            return;
        };

        let local = self.local_candidates[pair.valid_local_idx()].clone();
        let remote = pair.remote_candidate(&self.remote_candidates).clone();

        info!(
            "Stream {} component {} selected pair: {} -> {}",
            self.stream_id,
            self.component_id,
            local.base(),
            remote.addr()
        );

        self.nominated_send = Some(id);
        self.events
            .push_back(CheckListEvent::NewSelectedPair { local, remote });
    }

    fn set_state(&mut self, state: ComponentState, reason: &'static str) {
        if self.state != state {
            debug!(
                "Stream {} component {} state change ({}): {:?} -> {:?}",
                self.stream_id, self.component_id, reason, self.state, state
            );
            self.state = state;
            self.events.push_back(CheckListEvent::StateChange(state));
        }
    }

    fn evaluate_state(&mut self, now: Instant) {
        use ComponentState::*;

        if self.forced {
            self.set_state(Ready, "forced");
            return;
        }

        if self.remote_candidates.is_empty() {
            // Nothing to check yet.
            return;
        }

        let mut any_nomination = false;
        let mut any_succeeded = false;
        let mut any_still_possible = false;

        for p in &self.candidate_pairs {
            if p.is_nominated() {
                any_nomination = true;
            }
            if p.state() == CheckState::Succeeded {
                any_succeeded = true;
            }
            if p.is_still_possible(now) {
                any_still_possible = true;
            }
        }

        if any_nomination {
            self.set_state(Ready, "got nomination");
        } else if any_succeeded {
            self.set_state(Connected, "got working pair");
        } else if any_still_possible || self.local_candidates.is_empty() {
            self.set_state(Connecting, "checking pairs");
        } else {
            self.set_state(Failed, "no possible pairs");
        }
    }
}
