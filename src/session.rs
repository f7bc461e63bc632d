use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Coarse lifecycle of one generation session. One active session per client
/// at a time; this is a UI convention, not a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Initializing,
    Connecting,
    Analyzing,
    Generating,
    Parsing,
    Saving,
    Complete,
    Error,
    Aborted,
}

/// The one cancellation context for a session, shared by the outbound stream
/// request and the image loop so "the network call stopped" and "the loop
/// stopped" can never diverge. Tripping it twice is a no-op.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self { token: CancellationToken::new() }
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Subscribe interface: resolves once the session is aborted.
    pub fn aborted(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

pub struct GenerationSession {
    pub abort: AbortHandle,
    pub status: GenerationStatus,
}

impl GenerationSession {
    pub fn new() -> Self {
        Self { abort: AbortHandle::new(), status: GenerationStatus::Initializing }
    }
}

impl Default for GenerationSession {
    fn default() -> Self {
        Self::new()
    }
}

/// How a progress message should be presented. Cancellation is surfaced as
/// informational, never as a failure banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    Info,
    Success,
    Warning,
    Failure,
}

pub trait ProgressSink: Send + Sync {
    fn progress(&self, message: &str, kind: ProgressKind);
}

/// Default sink that forwards to the log.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn progress(&self, message: &str, kind: ProgressKind) {
        match kind {
            ProgressKind::Failure => log::error!("{}", message),
            ProgressKind::Warning => log::warn!("{}", message),
            _ => log::info!("{}", message),
        }
    }
}
