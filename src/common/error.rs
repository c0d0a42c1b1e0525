//! Common error types for the camera controller client
//!
//! # Design Principles (KISS)
//! - One error enum shared by the command channel, controller facade and sequencer
//! - Connection refusal is its own variant so callers can fail fast on it
//! - Protocol failures (replies starting with `ERROR`) are only raised where a
//!   multi-step operation has to stop; elsewhere they are classified, not thrown

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Errors raised while talking to the controller server or sequencing an exposure
#[derive(Error, Debug)]
pub enum CameraError {
    /// The controller server actively refused the connection
    #[error("Could not connect to camserver at {address}")]
    ConnectionRefused { address: String },

    /// Any other socket-level failure
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The controller server answered with an `ERROR` reply
    #[error("Controller error: {message}")]
    Protocol { message: String },

    /// Timeout waiting for the controller server
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Sequencer not in the expected phase
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Image file could not be written or forwarded
    #[error("Image error: {0}")]
    Image(String),

    /// Image display failed (never fatal to an exposure)
    #[error("Display error: {0}")]
    Display(String),
}

impl CameraError {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol {
            message: msg.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// True for controller-reported failures
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }
}

/// Result type alias using CameraError
pub type CameraResult<T> = Result<T, CameraError>;

/// Outcome of the most recent protocol exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Error kind (the reply sentinel, e.g. `ERROR`)
    pub kind: String,
    /// Human-readable message
    pub message: String,
}

/// Last-error status shared between the components of one camera
///
/// Cloning is cheap; all clones observe the same record. Reply
/// classification writes it: success clears it, an error reply records
/// kind and message.
#[derive(Debug, Clone, Default)]
pub struct ErrorStatus {
    inner: Arc<Mutex<Option<ErrorRecord>>>,
}

impl ErrorStatus {
    /// Create an empty (no error) status
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error
    pub fn set(&self, kind: impl Into<String>, message: impl Into<String>) {
        *self.inner.lock() = Some(ErrorRecord {
            kind: kind.into(),
            message: message.into(),
        });
    }

    /// Clear the error (last exchange succeeded)
    pub fn clear(&self) {
        *self.inner.lock() = None;
    }

    /// Current error, if any
    pub fn get(&self) -> Option<ErrorRecord> {
        self.inner.lock().clone()
    }

    /// True if the last exchange failed
    pub fn is_error(&self) -> bool {
        self.inner.lock().is_some()
    }
}
