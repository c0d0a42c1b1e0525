//! Common types shared across components
//!
//! Error types, the last-error status, the exposure phase and the CLI
//! argument definitions.

pub mod cli;
pub mod error;
pub use error::{CameraError, CameraResult, ErrorRecord, ErrorStatus};

// Exposure phase and abort/monitor handle
pub mod state;
pub use state::{ExposureMonitor, ExposurePhase};
