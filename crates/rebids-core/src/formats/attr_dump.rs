//! Recording reader over JSON attribute dumps
//!
//! An attribute dump is a flat-file export of a scanner header: one
//! JSON object per source file, holding the raw metadata fields. It is
//! the format-neutral interchange the matcher is usually fed with.

use crate::attributes::AttrValue;
use crate::error::BidsError;
use crate::recording::Recording;
use crate::result::Result;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One recording series backed by JSON attribute dumps
#[derive(Debug)]
pub struct AttrDumpRecording {
    module: String,
    files: Vec<PathBuf>,
    cursor: Option<Loaded>,
}

#[derive(Debug)]
struct Loaded {
    index: usize,
    document: serde_json::Value,
}

impl AttrDumpRecording {
    /// Scan a series directory for dump files, sorted by name so file
    /// indices are stable across runs
    pub fn scan(module: &str, dir: &Path) -> Result<AttrDumpRecording> {
        let mut files: Vec<PathBuf> = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.into_path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(BidsError::configuration(format!(
                "no attribute dumps found in '{}'",
                dir.display()
            )));
        }
        Ok(AttrDumpRecording {
            module: module.to_string(),
            files,
            cursor: None,
        })
    }

    /// True if the path looks like an attribute dump
    pub fn accepts(path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "json")
    }

    fn document(&self) -> Option<&serde_json::Value> {
        self.cursor.as_ref().map(|loaded| &loaded.document)
    }
}

impl Recording for AttrDumpRecording {
    fn module(&self) -> &str {
        &self.module
    }

    fn format(&self) -> &str {
        "attr_dump"
    }

    fn file_count(&self) -> usize {
        self.files.len()
    }

    fn load(&mut self, index: usize) -> Result<()> {
        let path = self.files.get(index).ok_or_else(|| {
            BidsError::configuration(format!(
                "file index {index} out of range ({} files)",
                self.files.len()
            ))
        })?;
        let text = fs::read_to_string(path).map_err(|e| BidsError::io(path.as_path(), e))?;
        let document: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            BidsError::configuration(format!("malformed dump '{}': {e}", path.display()))
        })?;
        if !document.is_object() {
            return Err(BidsError::configuration(format!(
                "dump '{}' is not a JSON object",
                path.display()
            )));
        }
        self.cursor = Some(Loaded { index, document });
        Ok(())
    }

    fn current_file(&self) -> Option<&Path> {
        self.cursor
            .as_ref()
            .map(|loaded| self.files[loaded.index].as_path())
    }

    fn get_field(&self, path: &[&str]) -> Option<AttrValue> {
        let mut node = self.document()?;
        for part in path {
            node = match node {
                serde_json::Value::Object(map) => map.get(*part)?,
                serde_json::Value::Array(items) => {
                    let index: usize = part.parse().ok()?;
                    items.get(index)?
                }
                _ => return None,
            };
        }
        AttrValue::from_json(node)
    }

    fn characteristic(&self, key: &str) -> Option<AttrValue> {
        let loaded = self.cursor.as_ref()?;
        match key {
            "fileNumber" => Some(AttrValue::Int(loaded.index as i64)),
            "fileName" => self
                .files
                .get(loaded.index)
                .and_then(|p| p.file_stem())
                .map(|stem| AttrValue::Str(stem.to_string_lossy().into_owned())),
            _ => None,
        }
    }
}
