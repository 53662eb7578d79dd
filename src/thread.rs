use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::RwLock;

/// Registry of the threads that run inside the conference.
///
/// These are the ICE agent threads, socket readers and any thread the application
/// announces with [`crate::Conference::thread_enter`]. Teardown must never happen on
/// one of them.
#[derive(Clone, Default)]
pub struct InternalThreads(Arc<RwLock<HashSet<ThreadId>>>);

impl InternalThreads {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the current thread as internal.
    pub fn enter(&self) {
        self.0.write().insert(thread::current().id());
    }

    /// Unmark the current thread.
    pub fn leave(&self) {
        self.0.write().remove(&thread::current().id());
    }

    /// Whether the current thread is internal.
    pub fn is_internal(&self) -> bool {
        self.0.read().contains(&thread::current().id())
    }

    /// Spawn a named thread that is registered as internal while it runs.
    pub fn spawn<F>(&self, name: String, f: F) -> io::Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let threads = self.clone();
        thread::Builder::new().name(name).spawn(move || {
            threads.enter();
            f();
            threads.leave();
        })
    }
}

impl fmt::Debug for InternalThreads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InternalThreads")
            .field(&self.0.read().len())
            .finish()
    }
}
