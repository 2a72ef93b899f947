//! Session state machine.

use std::fmt;

use thiserror::Error;

/// Phase of one device-update session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No link. Initial state, and the state after an abort.
    #[default]
    Disconnected,
    Connecting,
    VersionQuery,
    /// Exchanging session keys with a secure device.
    SecureHandshake,
    /// Device accepts plain transfers; no key exchange needed.
    PlainReady,
    /// Device version known; eligible for a transfer.
    Ready,
    Transferring,
    Completed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "DISCONNECTED"),
            SessionState::Connecting => write!(f, "CONNECTING"),
            SessionState::VersionQuery => write!(f, "VERSION_QUERY"),
            SessionState::SecureHandshake => write!(f, "SECURE_HANDSHAKE"),
            SessionState::PlainReady => write!(f, "PLAIN_READY"),
            SessionState::Ready => write!(f, "READY"),
            SessionState::Transferring => write!(f, "TRANSFERRING"),
            SessionState::Completed => write!(f, "COMPLETED"),
            SessionState::Failed => write!(f, "FAILED"),
        }
    }
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    /// Whether `self -> to` is a legal step.
    ///
    /// Any non-terminal state may fail or be aborted back to `Disconnected`.
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (_, Disconnected) => true,
            (Disconnected, Failed) => false,
            (_, Failed) => true,
            (Disconnected, Connecting)
            | (Connecting, VersionQuery)
            | (VersionQuery, SecureHandshake)
            | (VersionQuery, PlainReady)
            | (SecureHandshake, Ready)
            | (PlainReady, Ready)
            | (Ready, Transferring)
            | (Transferring, Completed) => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Illegal state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Current state plus transition bookkeeping.
#[derive(Debug, Default)]
pub struct SessionMachine {
    state: SessionState,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `to`, returning the previous state.
    pub fn goto_state(&mut self, to: SessionState) -> Result<SessionState, InvalidTransition> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(InvalidTransition { from, to });
        }
        tracing::info!(from = %from, to = %to, "State transition");
        self.state = to;
        Ok(from)
    }
}
