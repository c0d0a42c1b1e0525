//! Configuration module for the camera controller client
//!
//! Loaded from a single TOML file with three sections:
//! - `[camserver]`: controller server endpoint and timeouts
//! - `[exposure]`: sequencer settings (readout delay, file saving, shutter policy)
//! - `[discovery]`: UDP broadcast discovery of the controller server
//!
//! Every field has a default, so an empty file is a valid configuration.
//!
//! # Example
//! ```ignore
//! let config = Config::load("magccd.toml")?;
//! let client = CameraServerClient::new(config.camserver.clone(), ErrorStatus::new());
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camserver: CamServerConfig,
    #[serde(default)]
    pub exposure: ExposureConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}

// =============================================================================
// Controller server
// =============================================================================

/// Controller server endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct CamServerConfig {
    /// Host name or IP of the controller server
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port of the controller server
    #[serde(default = "default_port")]
    pub port: u16,

    /// Demo (simulation) mode: canned replies, no network traffic
    #[serde(default)]
    pub demo: bool,

    /// Reply timeout in milliseconds (absent = wait indefinitely)
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for CamServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            demo: false,
            read_timeout_ms: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl CamServerConfig {
    /// `host:port` string used for connecting and in log messages
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    2405
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

// =============================================================================
// Exposure
// =============================================================================

/// Shutter state requested for an image type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutterState {
    Open,
    Closed,
}

/// Image file type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    #[default]
    Fits,
    Bin,
}

impl FileType {
    /// File name extension (without the dot)
    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Fits => "fits",
            FileType::Bin => "bin",
        }
    }
}

/// Exposure sequencer settings
#[derive(Debug, Clone, Deserialize)]
pub struct ExposureConfig {
    /// Image type (object, zero, dark, flat, comp, ramp, ...)
    #[serde(default = "default_image_type")]
    pub image_type: String,

    /// Requested exposure time in seconds
    #[serde(default = "default_exposure_time")]
    pub exposure_time: f64,

    /// Wait between start of readout and data transfer, in milliseconds
    #[serde(default = "default_readout_delay_ms")]
    pub readout_delay_ms: u64,

    /// Number of pixels in the full image (2 bytes per pixel)
    #[serde(default)]
    pub numpix_image: usize,

    /// Write the image file at the end of the exposure
    #[serde(default = "default_true")]
    pub save_file: bool,

    /// Display the image at the end of the exposure
    #[serde(default)]
    pub display_image: bool,

    /// Images are sent to a remote image server instead of kept locally
    #[serde(default)]
    pub remote_imageserver: bool,

    /// Local temporary file (without extension) used in remote image server mode
    #[serde(default = "default_temp_image_file")]
    pub temp_image_file: PathBuf,

    /// Image file type
    #[serde(default)]
    pub filetype: FileType,

    /// Controller settle delay after integration, in milliseconds
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Shutter policy per image type (lowercase keys); unmapped types open
    #[serde(default = "default_shutter_states")]
    pub shutter_states: BTreeMap<String, ShutterState>,

    /// Directory for image files
    #[serde(default = "default_image_folder")]
    pub image_folder: PathBuf,

    /// Image file root name
    #[serde(default = "default_image_root")]
    pub image_root: String,

    /// First image sequence number
    #[serde(default = "default_sequence_number")]
    pub sequence_number: u32,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            image_type: default_image_type(),
            exposure_time: default_exposure_time(),
            readout_delay_ms: default_readout_delay_ms(),
            numpix_image: 0,
            save_file: true,
            display_image: false,
            remote_imageserver: false,
            temp_image_file: default_temp_image_file(),
            filetype: FileType::default(),
            settle_delay_ms: default_settle_delay_ms(),
            shutter_states: default_shutter_states(),
            image_folder: default_image_folder(),
            image_root: default_image_root(),
            sequence_number: default_sequence_number(),
        }
    }
}

impl ExposureConfig {
    /// Shutter policy for an image type (case-insensitive, unmapped = open)
    pub fn shutter_state(&self, image_type: &str) -> ShutterState {
        self.shutter_states
            .get(&image_type.to_lowercase())
            .copied()
            .unwrap_or(ShutterState::Open)
    }

    pub fn readout_delay(&self) -> Duration {
        Duration::from_millis(self.readout_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_image_type() -> String {
    "object".to_string()
}

fn default_exposure_time() -> f64 {
    1.0
}

fn default_readout_delay_ms() -> u64 {
    2000
}

fn default_temp_image_file() -> PathBuf {
    std::env::temp_dir().join("magccd_temp_image")
}

fn default_settle_delay_ms() -> u64 {
    40 // controller needs a moment after the shutter closes
}

fn default_shutter_states() -> BTreeMap<String, ShutterState> {
    [
        ("object", ShutterState::Open),
        ("flat", ShutterState::Open),
        ("comp", ShutterState::Open),
        ("comps", ShutterState::Open),
        ("zero", ShutterState::Closed),
        ("dark", ShutterState::Closed),
        ("ramp", ShutterState::Closed),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_image_folder() -> PathBuf {
    PathBuf::from(".")
}

fn default_image_root() -> String {
    "image".to_string()
}

fn default_sequence_number() -> u32 {
    1
}

// =============================================================================
// Discovery
// =============================================================================

/// UDP discovery settings
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Port the identification request is broadcast to
    #[serde(default = "default_request_port")]
    pub request_port: u16,

    /// Local port replies are received on
    #[serde(default = "default_reply_port")]
    pub reply_port: u16,

    /// Broadcast address for the identification request
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,

    /// Collection window in milliseconds
    #[serde(default = "default_wait_ms")]
    pub wait_ms: u64,

    /// Controller server host name to resolve at startup
    #[serde(default)]
    pub controller_name: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            request_port: default_request_port(),
            reply_port: default_reply_port(),
            broadcast_address: default_broadcast_address(),
            wait_ms: default_wait_ms(),
            controller_name: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

fn default_request_port() -> u16 {
    2400
}

fn default_reply_port() -> u16 {
    2401
}

fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}

fn default_wait_ms() -> u64 {
    1000
}

// =============================================================================
// Tests
// =============================================================================
