//! Running Job Registry
//!
//! Process-local map from an in-flight job id to the token that aborts it.
//! Owned by a single worker; never shared across processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

struct Entry {
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct State {
    next_generation: u64,
    entries: HashMap<String, Entry>,
}

#[derive(Clone, Default)]
pub struct RunningJobRegistry {
    state: Arc<Mutex<State>>,
}

impl RunningJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a fresh abort token under `id`. The entry is removed when the
    /// returned [`Registration`] is dropped.
    pub fn register(&self, id: &str) -> Registration {
        let token = CancellationToken::new();
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        state.entries.insert(
            id.to_string(),
            Entry {
                generation,
                token: token.clone(),
            },
        );

        Registration {
            registry: self.clone(),
            id: id.to_string(),
            generation,
            token,
        }
    }

    /// Fire and remove the abort token for `id`. Returns false when the job
    /// is not running in this process.
    pub fn abort(&self, id: &str) -> bool {
        let entry = self.lock().entries.remove(id);
        match entry {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

/// Guard for one registry entry
pub struct Registration {
    registry: RunningJobRegistry,
    id: String,
    generation: u64,
    token: CancellationToken,
}

impl Registration {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut state = self.registry.lock();
        // Only remove our own entry, a later registration may have replaced it
        if state
            .entries
            .get(&self.id)
            .is_some_and(|e| e.generation == self.generation)
        {
            state.entries.remove(&self.id);
        }
    }
}
