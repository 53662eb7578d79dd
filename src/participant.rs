use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::FsError;
use crate::ice::{Agent, Compatibility, WeakAgent};
use crate::id::ParticipantId;

/// What an ICE agent is shared by.
///
/// Stream transmitters to the same participant that agree on these share one agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct AgentKey {
    pub compatibility: Compatibility,
    pub stun_ip: Option<String>,
    pub stun_port: u16,
    pub preferred: Vec<String>,
}

/// A remote peer.
///
/// Clones refer to the same participant.
#[derive(Clone)]
pub struct Participant {
    inner: Arc<ParticipantInner>,
}

struct ParticipantInner {
    id: ParticipantId,
    agents: Mutex<Vec<(AgentKey, WeakAgent)>>,
}

impl Participant {
    /// Make a new participant.
    pub fn new() -> Self {
        let id = ParticipantId::next();
        debug!("New participant {}", id);
        Participant {
            inner: Arc::new(ParticipantInner {
                id,
                agents: Mutex::new(vec![]),
            }),
        }
    }

    /// Unique id.
    pub fn id(&self) -> ParticipantId {
        self.inner.id
    }

    /// The running agent for `key`, or a new one made by `create`.
    ///
    /// Only weak handles are kept. The agent stops when the last stream
    /// transmitter using it goes away.
    pub(crate) fn agent_for(
        &self,
        key: AgentKey,
        create: impl FnOnce() -> Result<Agent, FsError>,
    ) -> Result<Agent, FsError> {
        let mut agents = self.inner.agents.lock();
        agents.retain(|(_, a)| a.upgrade().is_some());

        if let Some(agent) = agents
            .iter()
            .find(|(k, _)| *k == key)
            .and_then(|(_, a)| a.upgrade())
        {
            trace!("Reuse ICE agent for {:?}", key);
            return Ok(agent);
        }

        let agent = create()?;
        agents.push((key, agent.downgrade()));
        Ok(agent)
    }

    pub(crate) fn downgrade(&self) -> WeakParticipant {
        WeakParticipant(Arc::downgrade(&self.inner))
    }

    /// Number of live ICE agents held for this participant.
    pub(crate) fn agent_count(&self) -> usize {
        self.inner
            .agents
            .lock()
            .iter()
            .filter(|(_, a)| a.upgrade().is_some())
            .count()
    }
}

/// Handle that does not keep a [`Participant`] alive.
#[derive(Clone)]
pub(crate) struct WeakParticipant(Weak<ParticipantInner>);

impl WeakParticipant {
    pub fn upgrade(&self) -> Option<Participant> {
        self.0.upgrade().map(|inner| Participant { inner })
    }
}

impl PartialEq for Participant {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Participant {}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.inner.id)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ice::AgentConfig;
    use crate::thread::InternalThreads;

    fn key(stun: Option<&str>) -> AgentKey {
        AgentKey {
            compatibility: Compatibility::Rfc5245,
            stun_ip: stun.map(|v| v.to_string()),
            stun_port: 3478,
            preferred: vec!["127.0.0.1".into()],
        }
    }

    fn make() -> Result<Agent, FsError> {
        let config = AgentConfig {
            preferred_addresses: vec!["127.0.0.1".parse().unwrap()],
            ..Default::default()
        };
        Ok(Agent::new(config, InternalThreads::new())?)
    }

    #[test]
    fn agents_are_shared_per_key() {
        let p = Participant::new();
        let a = p.agent_for(key(None), make).unwrap();
        let b = p
            .agent_for(key(None), || panic!("should reuse the agent"))
            .unwrap();
        assert_eq!(p.agent_count(), 1);

        let c = p.agent_for(key(Some("127.0.0.1")), make).unwrap();
        assert_eq!(p.agent_count(), 2);

        drop((a, b, c));
        assert_eq!(p.agent_count(), 0);
    }

    #[test]
    fn clones_are_equal() {
        let p = Participant::new();
        let q = p.clone();
        assert_eq!(p, q);
        assert_ne!(p, Participant::new());
        assert_eq!(p.id(), q.id());

        let weak = p.downgrade();
        assert_eq!(weak.upgrade(), Some(q.clone()));
        drop((p, q));
        assert!(weak.upgrade().is_none());
    }
}
