use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::candidate::Candidate;
use super::stun::{stun_resend_delay, TransId, STUN_MAX_RETRANS, STUN_TIMEOUT};

/// Interval between keepalive checks on a pair that already succeeded.
const RECHECK_INTERVAL: Duration = Duration::from_secs(3);

/// Number of binding attempts we remember per pair.
const MAX_ATTEMPTS_KEPT: usize = STUN_MAX_RETRANS + 1;

static PAIR_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairId(usize);

impl PairId {
    fn new() -> Self {
        PairId(PAIR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A pair of candidates, local and remote, in a check list.
pub struct CandidatePair {
    id: PairId,

    /// Index into the local candidates of the check list.
    local_idx: usize,

    /// Index into the remote candidates of the check list.
    remote_idx: usize,

    /// Index into local candidates for the valid pair.
    ///
    /// This is the candidate the STUN response mapped address points to.
    valid_idx: Option<usize>,

    /// Calculated prio for this pair. This is the basis
    /// for sorting the pairs.
    prio: u64,

    /// Record of the latest binding requests sent for this pair.
    binding_attempts: VecDeque<BindingAttempt>,

    /// The next time we are to do a binding attempt, cached, since we
    /// potentially recalculate this many times per second otherwise.
    cached_next_attempt_time: Option<Instant>,

    /// Number of remote binding requests we seen for this pair.
    remote_binding_requests: u64,

    /// Last remote binding request.
    remote_binding_request_time: Option<Instant>,

    /// State of nomination for this candidate pair.
    nomination_state: NominationState,

    /// A check is to be sent straight away, ahead of the regular schedule.
    triggered: bool,

    /// Current state of this pair. Start in Waiting (there is
    /// no frozen state since we check each component independently).
    state: CheckState,
}

#[derive(Debug)]
struct BindingAttempt {
    /// The transaction id used in the STUN binding request.
    ///
    /// This is how we recognize the binding response.
    trans_id: TransId,

    /// The time we sent the binding request.
    request_sent: Instant,

    /// The time we got a binding response.
    respone_recv: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    /// A check has not been sent for this pair.
    #[default]
    Waiting,

    /// A check has been sent for this pair, but the
    /// transaction is in progress.
    InProgress,

    /// A check has been sent for this pair, and it produced a
    /// successful result.
    Succeeded,

    /// A check has been sent for this pair, and it failed (a
    /// response to the check was never received).
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum NominationState {
    /// Not nominated.
    #[default]
    None,

    /// Nominated, but no binding with USE-CANDIDATE succeeded yet.
    Nominated,

    /// A binding with USE-CANDIDATE succeeded.
    Success,
}

impl CandidatePair {
    pub fn new(local_idx: usize, remote_idx: usize, prio: u64) -> Self {
        CandidatePair {
            id: PairId::new(),
            local_idx,
            remote_idx,
            valid_idx: None,
            prio,
            binding_attempts: VecDeque::with_capacity(MAX_ATTEMPTS_KEPT),
            cached_next_attempt_time: None,
            remote_binding_requests: 0,
            remote_binding_request_time: None,
            nomination_state: NominationState::None,
            triggered: false,
            state: CheckState::Waiting,
        }
    }

    pub fn id(&self) -> PairId {
        self.id
    }

    pub fn prio(&self) -> u64 {
        self.prio
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    pub fn local_idx(&self) -> usize {
        self.local_idx
    }

    pub fn remote_idx(&self) -> usize {
        self.remote_idx
    }

    pub fn local_candidate<'a>(&self, cs: &'a [Candidate]) -> &'a Candidate {
        &cs[self.local_idx]
    }

    pub fn remote_candidate<'a>(&self, cs: &'a [Candidate]) -> &'a Candidate {
        &cs[self.remote_idx]
    }

    /// The local candidate to use when sending on this pair.
    ///
    /// This is the base of the valid candidate, which might differ from the local candidate
    /// we sent the check from for hosts with asymmetric routing.
    pub fn valid_local_idx(&self) -> usize {
        self.valid_idx.unwrap_or(self.local_idx)
    }

    /// Recompute the prio after a role change.
    pub fn set_prio(&mut self, prio: u64) {
        self.prio = prio;
    }

    /// Whether a USE-CANDIDATE binding has succeeded on this pair.
    pub fn is_nominated(&self) -> bool {
        self.nomination_state == NominationState::Success
    }

    /// Whether this pair is nominated, but still waiting for the nomination to succeed.
    pub fn is_nominating(&self) -> bool {
        self.nomination_state == NominationState::Nominated
    }

    /// Mark this pair as nominated.
    ///
    /// With `force_success`, the pair goes straight to a succeeded nomination
    /// without a USE-CANDIDATE roundtrip.
    pub fn nominate(&mut self, force_success: bool) {
        if force_success {
            self.nomination_state = NominationState::Success;
            self.state = CheckState::Succeeded;
        } else if self.nomination_state == NominationState::None {
            self.nomination_state = NominationState::Nominated;
        }
        self.trigger();
    }

    /// Enqueue a triggered check for this pair.
    pub fn trigger(&mut self) {
        self.triggered = true;
        self.cached_next_attempt_time = None;
    }

    /// Pick the pair prio given the candidate prios.
    ///
    /// pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
    /// where G is the prio of the controlling agent's candidate and D the controlled.
    pub fn calculate_prio(controlling: bool, remote_prio: u32, local_prio: u32) -> u64 {
        let (g, d) = if controlling {
            (local_prio as u64, remote_prio as u64)
        } else {
            (remote_prio as u64, local_prio as u64)
        };

        2_u64.pow(32) * g.min(d) + 2 * g.max(d) + if g > d { 1 } else { 0 }
    }

    pub fn new_attempt(&mut self, now: Instant) -> TransId {
        // calculate a new time
        self.cached_next_attempt_time = None;
        self.triggered = false;

        let attempt = BindingAttempt {
            trans_id: TransId::new(),
            request_sent: now,
            respone_recv: None,
        };

        let trans_id = attempt.trans_id;

        self.binding_attempts.push_back(attempt);

        // Never keep more than the maximum allowed retransmits.
        while self.binding_attempts.len() > MAX_ATTEMPTS_KEPT {
            self.binding_attempts.pop_front();
        }

        if self.state == CheckState::Waiting {
            self.state = CheckState::InProgress;
        }

        trans_id
    }

    pub fn has_binding_attempt(&self, trans_id: TransId) -> bool {
        self.binding_attempts.iter().any(|b| b.trans_id == trans_id)
    }

    /// Marks a binding request as having a response.
    pub fn record_binding_response(&mut self, now: Instant, trans_id: TransId, valid_idx: usize) {
        self.cached_next_attempt_time = None;

        if let Some(b) = self
            .binding_attempts
            .iter_mut()
            .find(|b| b.trans_id == trans_id)
        {
            b.respone_recv = Some(now);
        }

        self.valid_idx = Some(valid_idx);
        self.state = CheckState::Succeeded;

        if self.nomination_state == NominationState::Nominated {
            self.nomination_state = NominationState::Success;
        }

        trace!("Binding response for pair: {:?}", self);
    }

    pub fn increase_remote_binding_requests(&mut self, now: Instant) {
        self.remote_binding_requests += 1;
        self.remote_binding_request_time = Some(now);
    }

    /// Number of unanswered binding requests since the last response.
    fn unanswered(&self) -> usize {
        self.binding_attempts
            .iter()
            .rev()
            .take_while(|b| b.respone_recv.is_none())
            .count()
    }

    fn last_response_time(&self) -> Option<Instant> {
        self.binding_attempts
            .iter()
            .rev()
            .find_map(|b| b.respone_recv)
    }

    /// When we should do the next binding request.
    pub fn next_binding_attempt(&mut self, now: Instant) -> Instant {
        if let Some(cached) = self.cached_next_attempt_time {
            return cached;
        }

        let next = if self.triggered {
            // Triggered checks (and nominations) jump the queue.
            now
        } else if let Some(last) = self.binding_attempts.back() {
            if self.state == CheckState::Succeeded && self.unanswered() == 0 {
                // Keepalive for working pairs.
                last.request_sent + RECHECK_INTERVAL
            } else {
                let unanswered = self.unanswered();
                let base = if self.state == CheckState::Succeeded {
                    // Resending the keepalive with the same backoff.
                    unanswered.min(STUN_MAX_RETRANS)
                } else {
                    self.binding_attempts.len()
                };
                last.request_sent + stun_resend_delay(base.max(1))
            }
        } else {
            // No attempts yet, do it now.
            now
        };

        self.cached_next_attempt_time = Some(next);

        next
    }

    /// Tells if this candidate pair is still possible to use for connectivity.
    ///
    /// Returns `false` if the candidate has failed.
    pub fn is_still_possible(&self, now: Instant) -> bool {
        let attempts = self.binding_attempts.len();
        let unanswered = self.unanswered();

        if attempts < MAX_ATTEMPTS_KEPT || unanswered < MAX_ATTEMPTS_KEPT {
            true
        } else if self
            .binding_attempts
            .back()
            .map(|b| now < b.request_sent + stun_resend_delay(MAX_ATTEMPTS_KEPT))
            .unwrap_or(false)
        {
            // Give the last attempt a chance to be answered.
            true
        } else {
            // check to see if we heard from the other side lately
            let last = self
                .last_response_time()
                .or(self.remote_binding_request_time);

            match last {
                Some(t) => now - t < STUN_TIMEOUT,
                None => false,
            }
        }
    }

    /// Marks the pair as failed once it is no longer possible.
    pub fn update_failed(&mut self, now: Instant) {
        if !self.is_still_possible(now) {
            self.state = CheckState::Failed;
        }
    }

    #[cfg(test)]
    pub fn remote_binding_requests(&self) -> u64 {
        self.remote_binding_requests
    }
}

impl fmt::Debug for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CandidatePair({}-{} prio={} state={:?} attempts={} unanswered={} remote={} nomination={:?})",
            self.local_idx,
            self.remote_idx,
            self.prio,
            self.state,
            self.binding_attempts.len(),
            self.unanswered(),
            self.remote_binding_requests,
            self.nomination_state,
        )
    }
}

impl PartialEq for CandidatePair {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CandidatePair {}

impl PartialOrd for CandidatePair {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CandidatePair {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // reverse since we want highest prio first.
        other.prio.cmp(&self.prio)
    }
}
