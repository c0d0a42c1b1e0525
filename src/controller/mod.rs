//! Controller facade
//!
//! The narrow set of controller operations the exposure sequencer needs.
//! [`Controller`] is the seam: [`MagController`] drives a real (or demo)
//! controller server, tests substitute a recording mock.
//!
//! # Thread Safety
//! - All methods take `&self`; the command channel sits behind a
//!   `tokio::sync::Mutex` so request/reply pairs never interleave
//! - The facade is cheap to clone and can be shared between the sequencer
//!   task and whoever answers status queries

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::camserver::{CameraServerClient, Reply};
use crate::common::{CameraResult, ErrorStatus};

const START_EXPOSURE: &str = "StartExposure";
const ABORT_EXPOSURE: &str = "AbortExposure";
const START_READOUT: &str = "StartReadout";
const SHUTTER: &str = "Shutter";
const EXPOSURE_TIME: &str = "ExposureTime";
const EXPOSURE_TIME_REMAINING: &str = "ExposureTimeRemaining";

/// Controller operations used by the exposure sequencer
///
/// Replies are returned unclassified; the caller decides whether an `ERROR`
/// reply stops what it is doing.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Start integrating
    async fn start_exposure(&self) -> CameraResult<Reply>;

    /// Abort the running exposure in hardware
    async fn abort_exposure(&self) -> CameraResult<Reply>;

    /// Open (`true`) or close (`false`) the shutter
    async fn set_shutter(&self, open: bool) -> CameraResult<Reply>;

    /// Start detector readout
    async fn start_readout(&self) -> CameraResult<Reply>;

    /// Set the exposure time in seconds
    async fn set_exposure_time(&self, seconds: f64) -> CameraResult<Reply>;

    /// Read a named controller parameter
    async fn get_parameter(&self, name: &str) -> CameraResult<Reply>;

    /// Set a named controller parameter
    async fn set_parameter(&self, name: &str, value: &str) -> CameraResult<Reply>;

    /// Shared last-error status updated by reply classification
    fn error_status(&self) -> ErrorStatus;
}

/// Facade over the controller server command channel
#[derive(Clone)]
pub struct MagController {
    server: Arc<Mutex<CameraServerClient>>,
    status: ErrorStatus,
}

impl MagController {
    pub fn new(server: CameraServerClient) -> Self {
        let status = server.error_status().clone();
        Self {
            server: Arc::new(Mutex::new(server)),
            status,
        }
    }

    /// Exclusive access to the command channel
    pub fn server(&self) -> &Arc<Mutex<CameraServerClient>> {
        &self.server
    }

    /// Upload DSP code and load it into `board`
    ///
    /// The uploaded file is removed from the controller server afterwards,
    /// also when loading fails.
    pub async fn load_dsp_code(&self, board: u32, code: &[u8]) -> CameraResult<()> {
        let mut server = self.server.lock().await;
        let file = server.upload_file(code).await?;
        info!(board, bytes = code.len(), "Loading DSP code");
        server.load_file(board, file).await
    }

    /// Remaining integration time reported by the controller, in seconds
    pub async fn exposure_time_remaining(&self) -> CameraResult<f64> {
        let reply = self.get_parameter(EXPOSURE_TIME_REMAINING).await?;
        let ms = reply
            .value()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);
        Ok(ms / 1000.0)
    }

    async fn command(&self, text: &str) -> CameraResult<Reply> {
        self.server.lock().await.command(text).await
    }
}

#[async_trait]
impl Controller for MagController {
    async fn start_exposure(&self) -> CameraResult<Reply> {
        self.command(START_EXPOSURE).await
    }

    async fn abort_exposure(&self) -> CameraResult<Reply> {
        info!("Aborting exposure");
        self.command(ABORT_EXPOSURE).await
    }

    async fn set_shutter(&self, open: bool) -> CameraResult<Reply> {
        debug!(open, "Shutter");
        self.server
            .lock()
            .await
            .set_parameter(SHUTTER, u8::from(open))
            .await
    }

    async fn start_readout(&self) -> CameraResult<Reply> {
        self.command(START_READOUT).await
    }

    async fn set_exposure_time(&self, seconds: f64) -> CameraResult<Reply> {
        let mut server = self.server.lock().await;
        server.set_simulated_exposure_time(seconds);
        let ms = (seconds * 1000.0).round() as i64;
        server.set_parameter(EXPOSURE_TIME, ms).await
    }

    async fn get_parameter(&self, name: &str) -> CameraResult<Reply> {
        self.server.lock().await.get_parameter(name).await
    }

    async fn set_parameter(&self, name: &str, value: &str) -> CameraResult<Reply> {
        self.server.lock().await.set_parameter(name, value).await
    }

    fn error_status(&self) -> ErrorStatus {
        self.status.clone()
    }
}
