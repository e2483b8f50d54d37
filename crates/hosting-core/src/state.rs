//! Guarded state value shared by the lifecycle state machines.

use crate::{Error, Result};
use std::fmt::Debug;
use std::sync::RwLock;

/// A state value guarded by a reader/writer lock.
///
/// Handlers read the state, release the lock before external I/O, and
/// reacquire it only at transition points; `try_transition` is the single
/// write path and rejects moves the transition graph does not permit.
pub(crate) struct StateMachine<S: Copy + Eq + Debug> {
    state: RwLock<S>,
}

impl<S: Copy + Eq + Debug> StateMachine<S> {
    pub(crate) fn new(initial: S) -> Self {
        Self {
            state: RwLock::new(initial),
        }
    }

    pub(crate) fn current(&self) -> S {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `to` if the current state is one of `allowed_from`; returns
    /// the previous state.
    pub(crate) fn try_transition(&self, allowed_from: &[S], to: S) -> Result<S> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let current = *state;
        if !allowed_from.contains(&current) {
            return Err(Error::InvalidState {
                current: format!("{current:?}"),
                operation: format!("transition to {to:?}"),
            });
        }
        *state = to;
        Ok(current)
    }

    /// Move to `to` unconditionally; returns the previous state. Used by
    /// abort paths that must always reach a terminal state.
    pub(crate) fn force(&self, to: S) -> S {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *state, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Demo {
        A,
        B,
        C,
    }

    #[test]
    fn test_transition_follows_graph() {
        let sm = StateMachine::new(Demo::A);
        assert_eq!(sm.try_transition(&[Demo::A], Demo::B).unwrap(), Demo::A);
        assert_eq!(sm.current(), Demo::B);

        let denied = sm.try_transition(&[Demo::A], Demo::C);
        assert!(matches!(denied, Err(Error::InvalidState { .. })));
        assert_eq!(sm.current(), Demo::B);
    }

    #[test]
    fn test_force_overrides() {
        let sm = StateMachine::new(Demo::A);
        assert_eq!(sm.force(Demo::C), Demo::A);
        assert_eq!(sm.current(), Demo::C);
    }
}
