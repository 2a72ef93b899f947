//! Event system for UI decoupling.
//!
//! The orchestrator reports through [`FotaEvent`] values handed to a
//! [`FotaObserver`]. Every delivery is scheduled through a [`Dispatcher`],
//! so callers choose the execution context callbacks run on.

use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc;

use parking_lot::Mutex;

use crate::state::SessionState;
use crate::version::ProductVersion;

/// Typed reason attached to a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    ConnectFailed,
    ServiceUnavailable,
    VersionQueryFailed,
    HandshakeFailed,
    EnableFailed,
    BurnFailed,
    MetadataFailed,
    Internal,
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCode::ConnectFailed => write!(f, "connect"),
            FailureCode::ServiceUnavailable => write!(f, "service"),
            FailureCode::VersionQueryFailed => write!(f, "version"),
            FailureCode::HandshakeFailed => write!(f, "handshake"),
            FailureCode::EnableFailed => write!(f, "enable"),
            FailureCode::BurnFailed => write!(f, "burn"),
            FailureCode::MetadataFailed => write!(f, "metadata"),
            FailureCode::Internal => write!(f, "internal"),
        }
    }
}

/// Events emitted by an update session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FotaEvent {
    /// `percent: None` means no change to report; `message: None` means no text update.
    Progress {
        percent: Option<u8>,
        message: Option<String>,
    },
    /// Whether the device requires the secure path. Fired once.
    SecureStatus { secure: bool },
    /// Device version read; transfers may begin. Fired once.
    Ready { version: ProductVersion },
    StateChanged { from: SessionState, to: SessionState },
    /// Session failed. The same text is also sent as a progress message.
    Failed { code: FailureCode, message: String },
    Completed,
}

impl FotaEvent {
    pub fn message(text: impl Into<String>) -> Self {
        FotaEvent::Progress {
            percent: None,
            message: Some(text.into()),
        }
    }

    pub fn percent(percent: u8) -> Self {
        FotaEvent::Progress {
            percent: Some(percent),
            message: None,
        }
    }
}

/// Observer trait for receiving session events.
pub trait FotaObserver: Send + Sync {
    fn on_event(&self, event: &FotaEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FotaObserver for NullObserver {
    fn on_event(&self, _event: &FotaEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FotaObserver for TracingObserver {
    fn on_event(&self, event: &FotaEvent) {
        match event {
            FotaEvent::Progress { percent, message } => {
                if let Some(message) = message {
                    tracing::info!("{}", message);
                }
                if let Some(percent) = percent {
                    tracing::debug!(progress = %format!("{}%", percent), "Progress");
                }
            }
            FotaEvent::SecureStatus { secure } => {
                tracing::info!(secure, "Secure status");
            }
            FotaEvent::Ready { version } => {
                tracing::info!(version = %version, "Device ready");
            }
            FotaEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State changed");
            }
            FotaEvent::Failed { code, message } => {
                tracing::error!(code = %code, "{}", message);
            }
            FotaEvent::Completed => {
                tracing::info!("Update complete");
            }
        }
    }
}

/// Forwards events into a channel, for callers that prefer polling.
pub struct ChannelObserver {
    tx: mpsc::Sender<FotaEvent>,
}

impl ChannelObserver {
    pub fn channel() -> (Self, mpsc::Receiver<FotaEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl FotaObserver for ChannelObserver {
    fn on_event(&self, event: &FotaEvent) {
        // Receiver gone: nobody is listening any more.
        let _ = self.tx.send(event.clone());
    }
}

/// Unit of callback work handed to a [`Dispatcher`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Schedules callback delivery onto the caller's execution context.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, job: Job);
}

impl<F> Dispatcher for F
where
    F: Fn(Job) + Send + Sync,
{
    fn dispatch(&self, job: Job) {
        self(job)
    }
}

/// Runs callbacks immediately on the session's worker thread.
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, job: Job) {
        job()
    }
}

/// Queues callbacks until the owner calls [`pump`](QueueDispatcher::pump).
#[derive(Default)]
pub struct QueueDispatcher {
    queue: Mutex<VecDeque<Job>>,
}

impl QueueDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every queued job on the calling thread. Returns how many ran.
    pub fn pump(&self) -> usize {
        let mut ran = 0;
        // Pop one at a time so jobs may dispatch more work without deadlocking.
        loop {
            let job = self.queue.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl Dispatcher for QueueDispatcher {
    fn dispatch(&self, job: Job) {
        self.queue.lock().push_back(job);
    }
}
