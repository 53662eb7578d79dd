#![allow(missing_docs)]

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! num_id {
    ($id:ident, $t:ty) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $id($t);

        impl Deref for $id {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$t> for $id {
            fn from(v: $t) -> Self {
                $id(v)
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// Session ids are allocated by the conference, see `Conference::new_session`.
num_id!(SessionId, u32);
num_id!(StreamId, u64);
num_id!(ParticipantId, u64);

static NEXT_STREAM: AtomicU64 = AtomicU64::new(1);
static NEXT_PARTICIPANT: AtomicU64 = AtomicU64::new(1);

impl StreamId {
    pub(crate) fn next() -> Self {
        StreamId(NEXT_STREAM.fetch_add(1, Ordering::Relaxed))
    }
}

impl ParticipantId {
    pub(crate) fn next() -> Self {
        ParticipantId(NEXT_PARTICIPANT.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stream_ids_are_unique() {
        let a = StreamId::next();
        let b = StreamId::next();
        assert!(b > a);
        assert_eq!(*SessionId::from(3), 3);
    }
}
