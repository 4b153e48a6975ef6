//! CLI command implementations
//!
//! One module per workflow stage, sharing the prepared-layout
//! traversal and per-recording naming helpers below.

pub mod bidsify;
pub mod map;
pub mod prepare;
pub mod process;

use indexmap::IndexMap;
use rebids_core::{
    AttributeStore, BidsError, BidsName, BidsSession, Recording, Result, Run, cleanup_value,
    detect_format, resolve_json,
};
use std::path::{Path, PathBuf};

/// One series directory of the prepared layout
#[derive(Debug, Clone)]
pub(crate) struct SeriesEntry {
    pub subject: String,
    pub session: Option<String>,
    pub module: String,
    pub series: String,
    pub path: PathBuf,
}

impl SeriesEntry {
    /// (subject, session) identity, used to detect session boundaries
    pub fn session_id(&self) -> (&str, Option<&str>) {
        (&self.subject, self.session.as_deref())
    }
}

/// Walk a prepared dataset: `sub-*/[ses-*/]<module>/<series>`.
/// Traversal order is lexicographic at every level, so workflows visit
/// series deterministically.
pub(crate) fn walk_prepared(source: &Path) -> Result<Vec<SeriesEntry>> {
    let mut entries = Vec::new();
    for subject_dir in sorted_dirs(source)? {
        let subject = dir_name(&subject_dir);
        if !subject.starts_with("sub-") {
            tracing::debug!("skipping non-subject directory {}", subject_dir.display());
            continue;
        }
        let children = sorted_dirs(&subject_dir)?;
        let has_sessions = children.iter().any(|d| dir_name(d).starts_with("ses-"));
        let sessions: Vec<(Option<String>, PathBuf)> = if has_sessions {
            children
                .into_iter()
                .filter(|d| dir_name(d).starts_with("ses-"))
                .map(|d| (Some(dir_name(&d)), d))
                .collect()
        } else {
            vec![(None, subject_dir.clone())]
        };
        for (session, session_dir) in sessions {
            for module_dir in sorted_dirs(&session_dir)? {
                let module = dir_name(&module_dir);
                for series_dir in sorted_dirs(&module_dir)? {
                    if detect_format(&series_dir).is_none() {
                        tracing::debug!("no readable series in {}", series_dir.display());
                        continue;
                    }
                    entries.push(SeriesEntry {
                        subject: subject.clone(),
                        session: session.clone(),
                        module: module.clone(),
                        series: dir_name(&series_dir),
                        path: series_dir,
                    });
                }
            }
        }
    }
    if entries.is_empty() {
        return Err(BidsError::configuration(format!(
            "no prepared recordings found under '{}'",
            source.display()
        )));
    }
    Ok(entries)
}

/// Locked session for a prepared-layout entry
pub(crate) fn session_for(entry: &SeriesEntry) -> BidsSession {
    let mut session = BidsSession::new();
    // labels come pre-normalized from the prepared layout, so the
    // lock cannot fail and cleanup is a no-op
    let _ = session.set_subject(Some(entry.subject.clone()));
    let _ = session.set_session(entry.session.clone());
    session.lock();
    session.in_path = Some(entry.path.clone());
    session
}

/// Subject filter: an empty list selects everything; entries may be
/// given with or without the `sub-` prefix
pub(crate) fn subject_selected(subject: &str, filter: &[String]) -> bool {
    filter.is_empty()
        || filter
            .iter()
            .any(|wanted| cleanup_value(wanted, "sub-") == subject)
}

/// True if the series name hits one of the map's ignore patterns
pub(crate) fn series_ignored(series: &str, ignore: &[String]) -> bool {
    ignore.iter().any(|pattern| series.contains(pattern.as_str()))
}

/// A fully resolved output file of one recording
pub(crate) struct NamedFile {
    pub source: PathBuf,
    pub name: BidsName,
    pub metadata: IndexMap<String, serde_json::Value>,
}

/// Resolve names and metadata for every file of a recording
pub(crate) fn name_recording(
    rec: &mut dyn Recording,
    run: &Run,
    store: &mut AttributeStore,
    session: &BidsSession,
) -> Result<Vec<NamedFile>> {
    let mut files = Vec::with_capacity(rec.file_count());
    for index in 0..rec.file_count() {
        rec.load(index)?;
        let name = rebids_core::bids_name(run, rec, store, session)?;
        let metadata = resolve_json(run, rec, store, session, &name.labels)?;
        let source = rec
            .current_file()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| BidsError::configuration("recording lost its file cursor"))?;
        files.push(NamedFile {
            source,
            name,
            metadata,
        });
    }
    Ok(files)
}

fn sorted_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| BidsError::io(dir, e))?;
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
