//! Observable viewer state
//!
//! One [`ViewerState`] value behind a single-writer lock. Every dispatched
//! action is applied under the lock and the resulting snapshot is broadcast
//! before the lock is released, so subscribers see changes in the order
//! they were applied. Lock order is `state` then `subscribers`.

use std::sync::{Mutex, PoisonError};

use flume::{Receiver, Sender};
use log::debug;

use super::state::{Action, Effect, ViewerState};

pub struct StateStore {
    state: Mutex<ViewerState>,
    subscribers: Mutex<Vec<Sender<ViewerState>>>,
}

impl StateStore {
    #[must_use]
    pub fn new(initial: ViewerState) -> Self {
        Self {
            state: Mutex::new(initial),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Apply `action`, notify subscribers when the state changed, return effects
    pub fn dispatch(&self, action: Action) -> Vec<Effect> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = state.clone();
        debug!("dispatch {action:?}");
        let effects = state.apply(action);
        if *state != before {
            self.broadcast(&state);
        }
        effects
    }

    /// Called with the state lock held
    fn broadcast(&self, snapshot: &ViewerState) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }

    /// Receive every state change, starting with the current state
    pub fn subscribe(&self) -> Receiver<ViewerState> {
        let (tx, rx) = flume::unbounded();
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = tx.send(state.clone());
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    #[must_use]
    pub fn snapshot(&self) -> ViewerState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(ViewerState::default())
    }
}
