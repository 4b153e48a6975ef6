//! Capability interface over format-specific recordings
//!
//! A recording is a logical series of source files sharing acquisition
//! identity. The engine never depends on a concrete format reader, only
//! on this trait; a selector external to the core chooses the concrete
//! implementation for a given source directory.

use crate::attributes::AttrValue;
use crate::result::Result;
use std::path::Path;

/// Format-specific recording access.
///
/// Implementations expose raw source metadata field by field and a
/// current-file cursor. Field values must already be normalized to
/// [`AttrValue`]; any format-specific numeric/string ambiguity is the
/// implementation's to resolve before values reach the matcher.
pub trait Recording {
    /// Module name this format belongs to (e.g. `MRI`, `EEG`)
    fn module(&self) -> &str;

    /// Source format name within the module (e.g. `attr_dump`)
    fn format(&self) -> &str;

    /// Number of valid files in the recording
    fn file_count(&self) -> usize;

    /// Point the cursor at the file with the given index
    fn load(&mut self, index: usize) -> Result<()>;

    /// Path of the file currently under the cursor
    fn current_file(&self) -> Option<&Path>;

    /// Retrieve a raw metadata value from the current file.
    ///
    /// `path` is the attribute key already split on the nesting
    /// separator; list indices arrive as decimal strings.
    fn get_field(&self, path: &[&str]) -> Option<AttrValue>;

    /// Recording-level characteristics (subject, session, acquisition
    /// time and similar), addressed by deferred placeholders with an
    /// empty prefix. Formats without a notion of the key return `None`.
    fn characteristic(&self, _key: &str) -> Option<AttrValue> {
        None
    }

    /// Identification string in `{module}/{format}` form, used in logs
    fn identity(&self) -> String {
        format!("{}/{}", self.module(), self.format())
    }
}
