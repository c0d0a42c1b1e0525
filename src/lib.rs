//! MAGCCD-RS: client for the Magellan CCD controller server
//!
//! Talks to the controller server over its line-oriented TCP command
//! protocol and sequences exposures (integrate, readout, finalize) with
//! cooperative abort.

pub mod camserver;
pub mod common;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod exposure;
