//! Collaborators used by the exposure sequencer
//!
//! Header storage, image file writing, file naming, display and the
//! readout data path are owned by the surrounding instrument software. The
//! sequencer only sees these traits; [`MemoryHeader`] and
//! [`SequentialFilename`] are small ready-made implementations.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::common::CameraResult;
use crate::config::FileType;

/// Header keyword value
#[derive(Debug, Clone, PartialEq)]
pub enum KeywordValue {
    Float(f64),
    Int(i64),
    Text(String),
}

impl fmt::Display for KeywordValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeywordValue::Float(v) => write!(f, "{}", v),
            KeywordValue::Int(v) => write!(f, "{}", v),
            KeywordValue::Text(v) => write!(f, "'{}'", v),
        }
    }
}

/// Exposure header keyword store
pub trait HeaderStore: Send + Sync {
    fn set_keyword(&self, name: &str, value: KeywordValue, comment: &str);
}

/// Image file output
pub trait ImageWriter: Send + Sync {
    /// Write the current image to `path`
    fn write_file(&self, path: &Path, filetype: FileType) -> CameraResult<()>;

    /// Forward a written file to the remote image server
    fn send_image(&self, path: &Path) -> CameraResult<()>;
}

/// Image file naming and sequence numbering
pub trait FilenameManager: Send + Sync {
    /// Full path of the next image file
    fn name(&self) -> PathBuf;

    /// File name extension for `filetype`
    fn extension(&self, filetype: FileType) -> String;

    /// Advance to the next sequence number
    fn increment(&self);
}

/// Image display
pub trait ImageDisplay: Send + Sync {
    fn display(&self) -> CameraResult<()>;
}

/// Readout data path
#[async_trait]
pub trait DataReceiver: Send + Sync {
    /// Transfer `byte_count` bytes of image data read out by the controller
    ///
    /// A [`crate::common::CameraError::Protocol`] failure aborts the readout;
    /// any other error is passed to the caller.
    async fn receive_image_data(&self, byte_count: usize) -> CameraResult<()>;
}

/// Image state flags shared with the image consumers
#[derive(Debug, Default)]
pub struct ImageFlags {
    valid: AtomicBool,
    toggle: AtomicBool,
    written: AtomicBool,
}

impl ImageFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Image data has been received
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
    }

    /// Image is ready for display or other consumers
    pub fn is_ready(&self) -> bool {
        self.toggle.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.toggle.store(ready, Ordering::Release);
    }

    /// Image has been written to disk
    pub fn is_written(&self) -> bool {
        self.written.load(Ordering::Acquire)
    }

    pub fn set_written(&self, written: bool) {
        self.written.store(written, Ordering::Release);
    }

    /// Clear all flags before a new exposure
    pub fn reset(&self) {
        self.set_valid(false);
        self.set_ready(false);
        self.set_written(false);
    }
}

/// Bundle of collaborators handed to the sequencer
#[derive(Clone)]
pub struct ExposureServices {
    pub header: Arc<dyn HeaderStore>,
    pub writer: Arc<dyn ImageWriter>,
    pub filename: Arc<dyn FilenameManager>,
    pub display: Arc<dyn ImageDisplay>,
    pub receiver: Arc<dyn DataReceiver>,
}

/// In-memory header store
#[derive(Debug, Default)]
pub struct MemoryHeader {
    keywords: Mutex<BTreeMap<String, (KeywordValue, String)>>,
}

impl MemoryHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<KeywordValue> {
        self.keywords.lock().get(name).map(|(v, _)| v.clone())
    }

    pub fn comment(&self, name: &str) -> Option<String> {
        self.keywords.lock().get(name).map(|(_, c)| c.clone())
    }

    pub fn len(&self) -> usize {
        self.keywords.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.lock().is_empty()
    }
}

impl HeaderStore for MemoryHeader {
    fn set_keyword(&self, name: &str, value: KeywordValue, comment: &str) {
        self.keywords
            .lock()
            .insert(name.to_string(), (value, comment.to_string()));
    }
}

/// `<folder>/<root>.<NNNN>.<ext>` file names with an incrementing number
#[derive(Debug)]
pub struct SequentialFilename {
    folder: PathBuf,
    root: String,
    filetype: FileType,
    number: AtomicU32,
}

impl SequentialFilename {
    pub fn new(folder: impl Into<PathBuf>, root: impl Into<String>, filetype: FileType, first: u32) -> Self {
        Self {
            folder: folder.into(),
            root: root.into(),
            filetype,
            number: AtomicU32::new(first),
        }
    }

    /// Current sequence number
    pub fn number(&self) -> u32 {
        self.number.load(Ordering::Acquire)
    }
}

impl FilenameManager for SequentialFilename {
    fn name(&self) -> PathBuf {
        self.folder.join(format!(
            "{}.{:04}.{}",
            self.root,
            self.number(),
            self.extension(self.filetype)
        ))
    }

    fn extension(&self, filetype: FileType) -> String {
        filetype.extension().to_string()
    }

    fn increment(&self) {
        self.number.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_names() {
        let names = SequentialFilename::new("/data/night1", "mag", FileType::Fits, 7);
        assert_eq!(names.name(), PathBuf::from("/data/night1/mag.0007.fits"));
        names.increment();
        assert_eq!(names.number(), 8);
        assert_eq!(names.name(), PathBuf::from("/data/night1/mag.0008.fits"));
        assert_eq!(names.extension(FileType::Bin), "bin");
    }

    #[test]
    fn memory_header_overwrites() {
        let header = MemoryHeader::new();
        assert!(header.is_empty());
        header.set_keyword("EXPTIME", KeywordValue::Float(1.5), "Exposure time (seconds)");
        header.set_keyword("EXPTIME", KeywordValue::Float(2.0), "Exposure time (seconds)");
        assert_eq!(header.len(), 1);
        assert_eq!(header.get("EXPTIME"), Some(KeywordValue::Float(2.0)));
        assert_eq!(
            header.comment("EXPTIME").as_deref(),
            Some("Exposure time (seconds)")
        );
    }

    #[test]
    fn image_flags_reset() {
        let flags = ImageFlags::new();
        flags.set_valid(true);
        flags.set_ready(true);
        flags.set_written(true);
        flags.reset();
        assert!(!flags.is_valid());
        assert!(!flags.is_ready());
        assert!(!flags.is_written());
    }

    #[test]
    fn keyword_display() {
        assert_eq!(KeywordValue::Text("object".into()).to_string(), "'object'");
        assert_eq!(KeywordValue::Int(3).to_string(), "3");
    }
}
