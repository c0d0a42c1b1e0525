//! Exposure phase and the shared monitor handle
//!
//! ## State Machine
//! ```text
//!   ┌──────┐ integrate ┌──────────┐  countdown done  ┌──────┐
//!   │ NONE │ ────────► │ EXPOSING │ ───────────────► │ READ │
//!   └──────┘           └──────────┘                  └──────┘
//!      ▲                    │ abort                     │ data received
//!      │                    ▼                           ▼
//!      │               ┌─────────┐                 ┌─────────┐
//!      │               │  ABORT  │                 │ WRITING │ (end)
//!      │               └─────────┘                 └─────────┘
//!      │                                                │
//!      └────────────────────────────────────────────────┘
//! ```
//!
//! The phase lives in a `watch` channel. The sequencer is the only writer
//! except for abort requests, which any holder of an [`ExposureMonitor`] may
//! send while the phase is EXPOSING; the sequencer polls for them once per
//! countdown tick.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Exposure phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExposurePhase {
    /// Idle, no exposure in progress
    #[default]
    None,
    /// Integrating
    Exposing,
    /// Reading out the detector
    Read,
    /// Writing the image file
    Writing,
    /// Abort requested or exposure aborted
    Abort,
}

impl ExposurePhase {
    /// Check if transition to target phase is valid
    pub fn can_transition_to(&self, target: ExposurePhase) -> bool {
        use ExposurePhase::*;
        matches!(
            (self, target),
            // Normal flow
            (None, Exposing)
            | (Exposing, Read)
            | (Read, None)
            | (Read, Writing)
            | (Writing, None)
            // Readout may follow an aborted integration
            | (Abort, Read)
            | (Abort, Writing)
            | (Abort, None)
            // Sequence cancellation resumes the running exposure
            | (Abort, Exposing)
            // Abort while integrating or reading out
            | (Exposing, Abort)
            | (Read, Abort)
            // Finalize without readout
            | (None, Writing)
        )
    }
}

impl std::fmt::Display for ExposurePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExposurePhase::None => write!(f, "NONE"),
            ExposurePhase::Exposing => write!(f, "EXPOSING"),
            ExposurePhase::Read => write!(f, "READ"),
            ExposurePhase::Writing => write!(f, "WRITING"),
            ExposurePhase::Abort => write!(f, "ABORT"),
        }
    }
}

/// Handle for observing a running exposure and requesting abort
///
/// Cloned out of the sequencer and handed to whoever processes operator
/// commands. Remaining time is kept in whole milliseconds.
#[derive(Debug, Clone)]
pub struct ExposureMonitor {
    phase: Arc<watch::Sender<ExposurePhase>>,
    remaining_ms: Arc<AtomicI64>,
}

impl Default for ExposureMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ExposureMonitor {
    /// Create a monitor in phase NONE with no remaining time
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ExposurePhase::None);
        Self {
            phase: Arc::new(tx),
            remaining_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Current phase
    pub fn phase(&self) -> ExposurePhase {
        *self.phase.borrow()
    }

    /// Subscribe to phase changes
    pub fn subscribe(&self) -> watch::Receiver<ExposurePhase> {
        self.phase.subscribe()
    }

    /// Ask the sequencer to abort
    ///
    /// Only honoured while integrating, since readout cannot be cancelled.
    /// Returns whether the request was recorded.
    pub fn request_abort(&self) -> bool {
        let mut current = ExposurePhase::None;
        let recorded = self.phase.send_if_modified(|phase| {
            current = *phase;
            if *phase == ExposurePhase::Exposing {
                *phase = ExposurePhase::Abort;
                true
            } else {
                false
            }
        });

        if recorded {
            info!("Abort requested");
        } else {
            info!(phase = %current, "Abort ignored, not integrating");
        }
        recorded
    }

    /// Remaining integration time in seconds
    pub fn exposure_time_remaining(&self) -> f64 {
        self.remaining_ms.load(Ordering::Acquire) as f64 / 1000.0
    }

    pub(crate) fn set_phase(&self, phase: ExposurePhase) {
        self.phase.send_replace(phase);
    }

    pub(crate) fn remaining_ms(&self) -> i64 {
        self.remaining_ms.load(Ordering::Acquire)
    }

    pub(crate) fn set_remaining_ms(&self, ms: i64) {
        self.remaining_ms.store(ms, Ordering::Release);
    }
}
