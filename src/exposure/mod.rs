//! Exposure sequencer
//!
//! Runs one exposure through integrate, readout and finalize while keeping
//! the [`ExposurePhase`] current in a shared [`ExposureMonitor`].
//!
//! ```text
//! integrate()  NONE ─► EXPOSING ─(countdown)─► READ   (or stays ABORT)
//! readout()    READ ─► StartReadout ─► wait ─► receive ─► NONE  (or ABORT)
//! end()        WRITING ─► header ─► write/send ─► display ─► NONE
//! ```
//!
//! Abort is cooperative: [`ExposureMonitor::request_abort`] sets the phase to
//! ABORT and the integration countdown checks it once per 100 ms tick. Short
//! exposures (< 1 s) and readout are not cancellable. A request the countdown
//! never acted on does not stop the exposure: the frame is still read out.
//!
//! Each phase runs for its full wall-clock duration. Drive the sequencer from
//! its own task so status queries are answered meanwhile.

pub mod services;


use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::camserver::{classify_reply, Reply};
use crate::common::{CameraError, CameraResult, ErrorStatus, ExposureMonitor, ExposurePhase};
use crate::config::{ExposureConfig, ShutterState};
use crate::controller::Controller;

pub use services::{
    DataReceiver, ExposureServices, FilenameManager, HeaderStore, ImageDisplay, ImageFlags,
    ImageWriter, KeywordValue, MemoryHeader, SequentialFilename,
};

/// Countdown tick
pub const TICK: Duration = Duration::from_millis(100);

/// Countdown stops once the remaining time is at or below this (ms)
const COUNTDOWN_FLOOR_MS: i64 = 150;

/// Exposures shorter than this (s) sleep without abort checks
const COUNTDOWN_THRESHOLD: f64 = 1.0;

/// Finalize polls for image data this often ...
const FINALIZE_POLL: Duration = Duration::from_millis(50);

/// ... at most this many times
const FINALIZE_MAX_POLLS: u32 = 100;

const ZERO: &str = "zero";
const RAMP: &str = "ramp";

/// Result of [`ExposureSequencer::integrate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationOutcome {
    /// Integration ran its course; the frame is ready for readout
    Complete,
    /// The countdown stopped the exposure with a hardware abort
    Aborted,
}

/// Result of [`ExposureSequencer::readout`]
#[derive(Debug, Clone, PartialEq)]
pub enum ReadoutOutcome {
    /// Image data transferred
    Complete,
    /// Readout ended in phase ABORT
    Aborted { reason: String },
    /// The controller refused to start the readout; phase left unchanged
    Rejected(Reply),
}

/// Result of [`ExposureSequencer::expose`]
#[derive(Debug, Clone, PartialEq)]
pub enum ExposureOutcome {
    Completed(FinalizeReport),
    Aborted { reason: String },
}

/// What [`ExposureSequencer::end`] did
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeReport {
    /// Local image file path
    pub path: PathBuf,
    /// Image data arrived before the polling ceiling
    pub data_received: bool,
    pub written: bool,
    pub displayed: bool,
    /// Exposure time written to the header (s, ms precision)
    pub exposure_time: f64,
    /// Dark time written to the header (s, ms precision)
    pub dark_time: f64,
}

/// One exposure: integrate, read out, finalize
#[async_trait]
pub trait ExposureSequencer: Send {
    /// Integrate for the requested exposure time
    async fn integrate(&mut self) -> CameraResult<IntegrationOutcome>;

    /// Read out the detector and receive the image data
    async fn readout(&mut self) -> CameraResult<ReadoutOutcome>;

    /// Write, forward and display the image
    async fn end(&mut self) -> CameraResult<FinalizeReport>;

    /// Handle for status queries and abort requests
    fn monitor(&self) -> ExposureMonitor;

    /// Full exposure
    ///
    /// Stops after a hardware-aborted integration or an aborted readout,
    /// returning [`ExposureOutcome::Aborted`]. The phase is NONE afterwards.
    async fn expose(&mut self) -> CameraResult<ExposureOutcome> {
        let monitor = self.monitor();

        if self.integrate().await? == IntegrationOutcome::Aborted {
            monitor.set_phase(ExposurePhase::None);
            return Ok(ExposureOutcome::Aborted {
                reason: "Integration aborted".to_string(),
            });
        }

        match self.readout().await {
            Ok(ReadoutOutcome::Complete) => {}
            Ok(ReadoutOutcome::Aborted { reason }) => {
                monitor.set_phase(ExposurePhase::None);
                return Ok(ExposureOutcome::Aborted { reason });
            }
            Ok(ReadoutOutcome::Rejected(reply)) => {
                monitor.set_phase(ExposurePhase::None);
                return Err(CameraError::protocol(format!(
                    "StartReadout rejected: {}",
                    reply
                )));
            }
            Err(e) => {
                monitor.set_phase(ExposurePhase::None);
                return Err(e);
            }
        }

        Ok(ExposureOutcome::Completed(self.end().await?))
    }
}

/// Integration timing of the current exposure
#[derive(Debug, Clone, Default)]
pub struct ExposureTiming {
    /// UTC start of integration
    pub start: Option<DateTime<Utc>>,
    /// Measured integration time (s)
    pub actual: f64,
    /// Measured dark time (s)
    pub dark_time: f64,
    exp_start: Option<Instant>,
    dark_start: Option<Instant>,
}

/// Multi-exposure sequence bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceState {
    pub active: bool,
    /// 1-based number of the current exposure in the sequence
    pub number: u32,
}

impl Default for SequenceState {
    fn default() -> Self {
        Self {
            active: false,
            number: 1,
        }
    }
}

/// Exposure sequencer for the Magellan CCD controller
pub struct MagExposure<C: Controller> {
    controller: Arc<C>,
    config: ExposureConfig,
    services: ExposureServices,
    monitor: ExposureMonitor,
    status: ErrorStatus,
    image: Arc<ImageFlags>,
    timing: ExposureTiming,
    sequence: SequenceState,
    /// Requested exposure time while a zero exposure runs
    saved_exposure_time: Option<f64>,
}

impl<C: Controller> MagExposure<C> {
    pub fn new(controller: Arc<C>, config: ExposureConfig, services: ExposureServices) -> Self {
        let status = controller.error_status();
        Self {
            controller,
            config,
            services,
            monitor: ExposureMonitor::new(),
            status,
            image: Arc::new(ImageFlags::new()),
            timing: ExposureTiming::default(),
            sequence: SequenceState::default(),
            saved_exposure_time: None,
        }
    }

    pub fn config(&self) -> &ExposureConfig {
        &self.config
    }

    pub fn set_image_type(&mut self, image_type: impl Into<String>) {
        self.config.image_type = image_type.into();
    }

    /// Requested exposure time in seconds
    pub fn exposure_time(&self) -> f64 {
        self.config.exposure_time
    }

    pub fn set_exposure_time(&mut self, seconds: f64) {
        self.config.exposure_time = seconds;
    }

    pub fn phase(&self) -> ExposurePhase {
        self.monitor.phase()
    }

    /// Remaining integration time in seconds
    pub fn exposure_time_remaining(&self) -> f64 {
        self.monitor.exposure_time_remaining()
    }

    pub fn image(&self) -> &Arc<ImageFlags> {
        &self.image
    }

    pub fn timing(&self) -> &ExposureTiming {
        &self.timing
    }

    pub fn sequence(&self) -> &SequenceState {
        &self.sequence
    }

    /// Mark the next exposures as a sequence of `count`
    pub fn begin_sequence(&mut self, count: u32) {
        self.sequence = SequenceState {
            active: count > 1,
            number: 1,
        };
    }

    /// Run `count` exposures
    ///
    /// Stops early when the sequence is cancelled through an abort request
    /// (the running exposure still completes) or an exposure is aborted.
    pub async fn expose_sequence(&mut self, count: u32) -> CameraResult<Vec<ExposureOutcome>> {
        self.begin_sequence(count);
        info!(count, "Exposure sequence started");

        let mut outcomes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let outcome = match self.expose().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.sequence = SequenceState::default();
                    return Err(e);
                }
            };
            let aborted = matches!(outcome, ExposureOutcome::Aborted { .. });
            outcomes.push(outcome);

            if aborted || !self.sequence.active {
                break;
            }
            self.sequence.number += 1;
        }

        info!(completed = outcomes.len(), requested = count, "Exposure sequence finished");
        self.sequence = SequenceState::default();
        Ok(outcomes)
    }

    fn is_image_type(&self, image_type: &str) -> bool {
        self.config.image_type.eq_ignore_ascii_case(image_type)
    }

    /// Promote an `ERROR` reply to a protocol error
    fn check(&self, verb: &str, reply: &Reply) -> CameraResult<()> {
        let status = classify_reply(Some(reply), &self.status);
        if status.is_error {
            return Err(CameraError::protocol(format!("{}: {}", verb, status.message)));
        }
        Ok(())
    }

    /// Record and log a rejected shutter command
    ///
    /// Accepted replies leave the error status alone so an earlier failure
    /// stays visible.
    fn note_shutter_reply(&self, open: bool, reply: &Reply) {
        if reply.is_error() {
            let status = classify_reply(Some(reply), &self.status);
            warn!(open, message = %status.message, "Controller rejected shutter command");
        }
    }

    async fn run_integration(
        &mut self,
        open_shutter: bool,
        seconds: f64,
    ) -> CameraResult<IntegrationOutcome> {
        if open_shutter {
            let reply = self.controller.set_shutter(true).await?;
            self.check("Shutter open", &reply)?;
        }

        let reply = self.controller.set_exposure_time(seconds).await?;
        self.check("ExposureTime", &reply)?;

        if !self.is_image_type(ZERO) {
            info!(image_type = %self.config.image_type, seconds, "Integration started");
        }

        self.timing.start = Some(Utc::now());
        self.timing.exp_start = Some(Instant::now());
        let reply = self.controller.start_exposure().await?;
        self.check("StartExposure", &reply)?;
        self.timing.dark_start = Some(Instant::now());

        let outcome = if seconds >= COUNTDOWN_THRESHOLD {
            self.countdown().await?
        } else {
            // No abort checks at this granularity
            sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
            IntegrationOutcome::Complete
        };

        // The controller times the exposure; only a hardware abort cuts it short
        self.timing.actual = match outcome {
            IntegrationOutcome::Aborted => self
                .timing
                .exp_start
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            IntegrationOutcome::Complete => seconds,
        };
        Ok(outcome)
    }

    async fn countdown(&mut self) -> CameraResult<IntegrationOutcome> {
        while self.monitor.remaining_ms() > COUNTDOWN_FLOOR_MS {
            if self.monitor.phase() == ExposurePhase::Abort {
                if self.sequence.active {
                    info!(number = self.sequence.number, "Stopping exposure sequence");
                    self.sequence = SequenceState::default();
                    self.monitor.set_phase(ExposurePhase::Exposing);
                } else {
                    let reply = self.controller.abort_exposure().await?;
                    classify_reply(Some(&reply), &self.status);
                    return Ok(IntegrationOutcome::Aborted);
                }
                break;
            }
            sleep(TICK).await;
            self.monitor
                .set_remaining_ms(self.monitor.remaining_ms() - TICK.as_millis() as i64);
        }
        Ok(IntegrationOutcome::Complete)
    }

    async fn run_readout(&mut self) -> CameraResult<ReadoutOutcome> {
        info!("Readout started");
        self.timing.dark_time = self
            .timing
            .dark_start
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let reply = self.controller.start_readout().await?;
        if classify_reply(Some(&reply), &self.status).is_error {
            warn!(reply = %reply, "Controller rejected readout");
            return Ok(ReadoutOutcome::Rejected(reply));
        }

        let bytes = self.config.numpix_image * 2;
        let estimate = bytes as f64 / 1_000_000.0 + 0.1;
        let wait = self.config.readout_delay();
        debug!(estimate_s = estimate, wait_ms = wait.as_millis() as u64, "Waiting for readout");
        sleep(wait).await;

        if self.monitor.phase() != ExposurePhase::Abort {
            self.monitor.set_phase(ExposurePhase::None);
        }

        match self.services.receiver.receive_image_data(bytes).await {
            Ok(()) => {}
            Err(e) if e.is_protocol() => {
                warn!(error = %e, "Image data transfer failed");
                self.monitor.set_phase(ExposurePhase::Abort);
            }
            Err(e) => return Err(e),
        }
        // Set after a failed transfer too; end() only waits for the attempt
        self.image.set_valid(true);

        if self.monitor.phase() == ExposurePhase::Abort {
            info!("Readout aborted");
            return Ok(ReadoutOutcome::Aborted {
                reason: "Readout aborted".to_string(),
            });
        }

        debug!("Readout finished");
        self.monitor.set_phase(ExposurePhase::None);
        Ok(ReadoutOutcome::Complete)
    }

    async fn finalize(&mut self, path: &Path) -> CameraResult<FinalizeReport> {
        let mut polls = 0;
        while !self.image.is_valid() && polls < FINALIZE_MAX_POLLS {
            polls += 1;
            sleep(FINALIZE_POLL).await;
        }
        let data_received = self.image.is_valid();
        if !data_received {
            error!(path = %path.display(), "Image data not received in time");
        }

        let exposure_time = truncate_ms(self.timing.actual);
        let dark_time = truncate_ms(self.timing.dark_time);
        self.publish_header(exposure_time, dark_time);

        let mut written = false;
        if self.config.save_file {
            info!(path = %path.display(), "Writing image");
            self.services.writer.write_file(path, self.config.filetype)?;
            self.image.set_written(true);
            written = true;
            debug!("Writing finished");

            if self.config.remote_imageserver {
                self.services.writer.send_image(path)?;
            }
        }

        self.image.set_ready(true);

        let mut displayed = false;
        if self.config.display_image {
            info!("Displaying image");
            match self.services.display.display() {
                Ok(()) => displayed = true,
                Err(e) => warn!(error = %e, "Image display failed"),
            }
        }

        if self.config.save_file {
            self.services.filename.increment();
        }

        Ok(FinalizeReport {
            path: path.to_path_buf(),
            data_received,
            written,
            displayed,
            exposure_time,
            dark_time,
        })
    }

    fn publish_header(&self, exposure_time: f64, dark_time: f64) {
        let header = &self.services.header;
        header.set_keyword(
            "EXPTIME",
            KeywordValue::Float(exposure_time),
            "Exposure time (seconds)",
        );
        header.set_keyword(
            "DARKTIME",
            KeywordValue::Float(dark_time),
            "Dark time (seconds)",
        );
        header.set_keyword(
            "IMAGETYP",
            KeywordValue::Text(self.config.image_type.to_lowercase()),
            "Image type",
        );
        if let Some(start) = self.timing.start {
            header.set_keyword(
                "DATE-OBS",
                KeywordValue::Text(start.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()),
                "UTC date and time of exposure start",
            );
        }
    }

    /// Local path of the image file
    ///
    /// In remote image server mode this is the temporary file, and a stale
    /// copy left from an earlier exposure is removed first.
    fn local_file(&self) -> PathBuf {
        if !self.config.remote_imageserver {
            return self.services.filename.name();
        }

        let mut name = OsString::from(self.config.temp_image_file.as_os_str());
        name.push(".");
        name.push(self.services.filename.extension(self.config.filetype));
        let path = PathBuf::from(name);

        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale temporary image"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Could not remove temporary image"),
        }
        path
    }
}

#[async_trait]
impl<C: Controller> ExposureSequencer for MagExposure<C> {
    async fn integrate(&mut self) -> CameraResult<IntegrationOutcome> {
        let phase = self.monitor.phase();
        if phase != ExposurePhase::None {
            return Err(CameraError::invalid_state(
                ExposurePhase::None.to_string(),
                phase.to_string(),
            ));
        }

        self.monitor.set_phase(ExposurePhase::Exposing);
        self.image.reset();
        self.timing = ExposureTiming::default();

        let open_shutter = self.config.shutter_state(&self.config.image_type) == ShutterState::Open;

        let seconds = if self.is_image_type(ZERO) {
            self.saved_exposure_time = Some(self.config.exposure_time);
            self.config.exposure_time = 0.0;
            0.0
        } else {
            self.config.exposure_time
        };
        self.monitor.set_remaining_ms((seconds * 1000.0).round() as i64);

        let result = self.run_integration(open_shutter, seconds).await;

        // Shutter closes on every path
        let closed = self.controller.set_shutter(false).await;
        if let Ok(reply) = &closed {
            self.note_shutter_reply(false, reply);
        }

        if let Some(saved) = self.saved_exposure_time.take() {
            self.config.exposure_time = saved;
        }
        self.monitor.set_remaining_ms(0);

        let outcome = match result.and_then(|outcome| closed.map(|_| outcome)) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Integration failed");
                self.monitor.set_phase(ExposurePhase::None);
                return Err(e);
            }
        };

        match (outcome, self.monitor.phase()) {
            (IntegrationOutcome::Aborted, _) => info!("Integration aborted"),
            // Left for readout() to overwrite
            (IntegrationOutcome::Complete, ExposurePhase::Abort) => {
                info!("Abort requested too late to stop integration, frame will be read out")
            }
            (IntegrationOutcome::Complete, _) => {
                self.monitor.set_phase(ExposurePhase::Read);
                if !self.is_image_type(ZERO) {
                    debug!("Integration finished");
                }
            }
        }

        sleep(self.config.settle_delay()).await;
        Ok(outcome)
    }

    async fn readout(&mut self) -> CameraResult<ReadoutOutcome> {
        self.monitor.set_phase(ExposurePhase::Read);

        let ramp = self.is_image_type(RAMP);
        if ramp {
            let reply = self.controller.set_shutter(true).await?;
            self.note_shutter_reply(true, &reply);
        }

        let result = self.run_readout().await;

        if ramp {
            match self.controller.set_shutter(false).await {
                Ok(reply) => self.note_shutter_reply(false, &reply),
                Err(e) => {
                    warn!(error = %e, "Failed to close shutter after ramp readout");
                    if result.is_ok() {
                        return Err(e);
                    }
                }
            }
        }
        result
    }

    async fn end(&mut self) -> CameraResult<FinalizeReport> {
        self.monitor.set_phase(ExposurePhase::Writing);

        let path = self.local_file();
        let result = self.finalize(&path).await;

        self.monitor.set_phase(ExposurePhase::None);
        result
    }

    fn monitor(&self) -> ExposureMonitor {
        self.monitor.clone()
    }
}

/// Truncate seconds to millisecond precision
fn truncate_ms(seconds: f64) -> f64 {
    (seconds * 1000.0).trunc() / 1000.0
}
