use capgate_core::FrameError;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    Transport,
    Backpressure,
    WriteFailed,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::Transport => "transport_error",
            CloseReason::Backpressure => "backpressure",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// Reason sent in the final `error` frame, if the client should get one.
    pub fn client_reason(self) -> Option<&'static str> {
        match self {
            CloseReason::Backpressure => Some("backpressure timeout"),
            CloseReason::Shutdown => Some("server shutting down"),
            CloseReason::ClientClosed | CloseReason::Transport | CloseReason::WriteFailed => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error("backpressure timeout")]
    Backpressure,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Session-wide cancellation. The first recorded reason wins; later calls
/// only observe that the session is already closing.
#[derive(Clone)]
pub struct Closer {
    cancel: CancellationToken,
    reason: Arc<Mutex<Option<CloseReason>>>,
}

impl Closer {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns true when this call initiated the close.
    pub fn close(&self, reason: CloseReason) -> bool {
        let first = {
            let mut recorded = self.reason.lock();
            if recorded.is_none() {
                *recorded = Some(reason);
                true
            } else {
                false
            }
        };
        self.cancel.cancel();
        first
    }

    /// A cancelled scope with no recorded reason was torn down from above.
    pub fn reason(&self) -> Option<CloseReason> {
        match *self.reason.lock() {
            Some(reason) => Some(reason),
            None if self.cancel.is_cancelled() => Some(CloseReason::Shutdown),
            None => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
