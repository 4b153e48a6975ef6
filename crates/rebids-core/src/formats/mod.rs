//! Concrete [`Recording`](crate::recording::Recording) readers
//!
//! The engine works against the trait; this module owns the format
//! registry that turns a (module, format) pair and a series directory
//! into a concrete reader.

pub mod attr_dump;

pub use attr_dump::AttrDumpRecording;

use crate::error::BidsError;
use crate::recording::Recording;
use crate::result::Result;
use std::path::Path;

/// Formats known to the registry, per module
pub const KNOWN_FORMATS: &[&str] = &["attr_dump"];

/// Open a series directory with the named format reader
pub fn open_recording(module: &str, format: &str, dir: &Path) -> Result<Box<dyn Recording>> {
    match format {
        "attr_dump" => Ok(Box::new(AttrDumpRecording::scan(module, dir)?)),
        other => Err(BidsError::configuration(format!(
            "unknown recording format '{other}' (known: {})",
            KNOWN_FORMATS.join(", ")
        ))),
    }
}

/// Guess a format able to read the series directory, trying each known
/// reader's acceptance check against the directory's files
pub fn detect_format(dir: &Path) -> Option<&'static str> {
    let readable = std::fs::read_dir(dir).ok()?;
    for entry in readable.flatten() {
        if AttrDumpRecording::accepts(&entry.path()) {
            return Some("attr_dump");
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn registry_dispatches_known_formats() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f1.json"), "{}").unwrap();
        let rec = open_recording("MRI", "attr_dump", dir.path()).unwrap();
        assert_eq!(rec.identity(), "MRI/attr_dump");
        assert!(open_recording("MRI", "dicom", dir.path()).is_err());
    }

    #[test]
    fn detection_falls_back_to_none() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        assert_eq!(detect_format(dir.path()), None);
        std::fs::write(dir.path().join("f1.json"), "{}").unwrap();
        assert_eq!(detect_format(dir.path()), Some("attr_dump"));
    }
}
