//! RPC plumbing shared by the library facade, the CLI, and the daemon:
//! request deadlines and the `{status, message, retryable}` envelope every
//! response carries.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, ErrorKind, OneirosError};

/// A request deadline checked at phase boundaries.
///
/// Server-side work never interrupts mid-phase; it checks the deadline
/// between phases and unwinds cleanly when it has elapsed.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// No deadline: work runs to completion.
    pub const NONE: Deadline = Deadline { at: None };

    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Some(Instant::now() + timeout),
        }
    }

    /// Whether the deadline has elapsed.
    pub fn expired(&self) -> bool {
        self.at.map(|at| Instant::now() >= at).unwrap_or(false)
    }

    /// Remaining time, if a deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Phase-boundary check.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.expired() {
            Err(EngineError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Deadline::NONE
    }
}

/// Cooperative cancellation token, checked at the same phase boundaries as
/// deadlines. Clones observe the same flag, so a token handed to a worker
/// can be tripped from the RPC surface.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, std::sync::atomic::Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(std::sync::atomic::Ordering::Acquire)
    }
}

/// Wire envelope for every RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope<T> {
    /// `ok` on success, else the taxonomy kind of the failure.
    pub status: RpcStatus,
    /// Human-readable outcome or failure description.
    pub message: String,
    /// Whether the caller may retry the call as-is.
    pub retryable: bool,
    /// The payload, present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
}

/// Envelope status: success or an [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcStatus {
    Ok,
    Error(ErrorKind),
}

impl RpcStatus {
    /// Exit code for CLI surfacing.
    pub fn exit_code(self) -> i32 {
        match self {
            RpcStatus::Ok => 0,
            RpcStatus::Error(kind) => kind.exit_code(),
        }
    }
}

impl std::fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcStatus::Ok => write!(f, "ok"),
            RpcStatus::Error(kind) => write!(f, "{kind}"),
        }
    }
}

impl<T> RpcEnvelope<T> {
    /// Success envelope with a payload and message.
    pub fn ok(result: T, message: impl Into<String>) -> Self {
        Self {
            status: RpcStatus::Ok,
            message: message.into(),
            retryable: false,
            result: Some(result),
        }
    }

    /// Failure envelope derived from the error's taxonomy kind.
    pub fn err(error: &OneirosError) -> Self {
        let kind = error.kind();
        Self {
            status: RpcStatus::Error(kind),
            message: error.to_string(),
            retryable: kind.retryable(),
            result: None,
        }
    }

    /// Wrap a library result into an envelope.
    pub fn from_result(result: Result<T, OneirosError>, message: impl Into<String>) -> Self {
        match result {
            Ok(value) => RpcEnvelope::ok(value, message),
            Err(e) => RpcEnvelope::err(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;

    #[test]
    fn deadline_none_never_expires() {
        assert!(!Deadline::NONE.expired());
        assert!(Deadline::NONE.check().is_ok());
        assert!(Deadline::NONE.remaining().is_none());
    }

    #[test]
    fn deadline_after_elapses() {
        let d = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(1));
        assert!(d.expired());
        assert!(d.check().is_err());
    }

    #[test]
    fn envelope_carries_taxonomy() {
        let err: OneirosError = VaultError::Degraded.into();
        let env: RpcEnvelope<()> = RpcEnvelope::err(&err);
        assert_eq!(env.status, RpcStatus::Error(ErrorKind::FailedPrecondition));
        assert!(!env.retryable);
        assert_eq!(env.status.exit_code(), 1);

        let ok = RpcEnvelope::ok(7u32, "done");
        assert_eq!(ok.status.exit_code(), 0);
        assert_eq!(ok.result, Some(7));
    }
}
