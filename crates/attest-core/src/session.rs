use std::sync::Mutex;

use crate::error::EngineError;

pub const PROTOCOL_VERSION_CURRENT: u32 = 1;
pub const PROTOCOL_VERSION_MIN: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCounters {
    pub sessions_completed: u64,
    pub assertions_evaluated: u64,
}

struct Inner {
    state: SessionState,
    counters: SessionCounters,
}

/// Single-process session: a three-state machine plus counters, everything
/// behind one mutex.
pub struct Session {
    inner: Mutex<Inner>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SessionState::Uninitialized,
                counters: SessionCounters::default(),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn initialize(&self, protocol_version: u32) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SessionState::Uninitialized {
            return Err(EngineError::session(
                "initialize called twice; the session is already initialized",
            ));
        }
        if !(PROTOCOL_VERSION_MIN..=PROTOCOL_VERSION_CURRENT).contains(&protocol_version) {
            return Err(EngineError::session(format!(
                "protocol_version {} is outside the supported range {}..={}",
                protocol_version, PROTOCOL_VERSION_MIN, PROTOCOL_VERSION_CURRENT
            )));
        }
        inner.state = SessionState::Initialized;
        Ok(())
    }

    /// Precondition check for every non-initialize handler.
    pub fn require_initialized(&self, method: &str) -> Result<(), EngineError> {
        match self.inner.lock().unwrap().state {
            SessionState::Initialized => Ok(()),
            SessionState::Uninitialized => Err(EngineError::session(format!(
                "{} called before initialize",
                method
            ))),
            SessionState::ShuttingDown => Err(EngineError::session(format!(
                "{} called while shutting down",
                method
            ))),
        }
    }

    /// Transitions to the terminal state and returns the final counters.
    pub fn shutdown(&self) -> Result<SessionCounters, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            SessionState::Initialized => {
                inner.state = SessionState::ShuttingDown;
                Ok(inner.counters)
            }
            SessionState::Uninitialized => {
                Err(EngineError::session("shutdown called before initialize"))
            }
            SessionState::ShuttingDown => Err(EngineError::session("shutdown called twice")),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() == SessionState::ShuttingDown
    }

    pub fn record_batch(&self, assertions: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.counters.sessions_completed += 1;
        inner.counters.assertions_evaluated += assertions;
    }

    pub fn record_assertions(&self, assertions: u64) {
        self.inner.lock().unwrap().counters.assertions_evaluated += assertions;
    }

    pub fn counters(&self) -> SessionCounters {
        self.inner.lock().unwrap().counters
    }
}
