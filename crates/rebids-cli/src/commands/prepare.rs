//! The prepare workflow: normalize an arbitrary source layout into
//! `sub-*/ses-*/<module>/<series>` so the later stages can rely on one
//! directory convention.
//!
//! Source layout is `<subject>/<session>/...` with series directories
//! anywhere below a session; subject and session directory names are
//! cleaned into their BIDS form on the way out.

use crate::commands::{dir_name, sorted_dirs, subject_selected};
use crate::output::WorkflowSummary;
use rebids_core::{BidsError, Result, cleanup_value, detect_format};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub struct PrepareArgs {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub module: String,
    pub subjects: Vec<String>,
    pub skip_existing: bool,
}

pub fn prepare_command(args: &PrepareArgs) -> Result<()> {
    let mut summary = WorkflowSummary::default();
    for subject_dir in sorted_dirs(&args.source)? {
        let raw_subject = dir_name(&subject_dir);
        let subject = cleanup_value(&raw_subject, "sub-");
        if subject == "sub-" {
            warn!("'{}' cleans to an empty subject label, skipped", raw_subject);
            summary.skipped += 1;
            continue;
        }
        if !subject_selected(&subject, &args.subjects) {
            debug!("{}: not selected", subject);
            continue;
        }
        let session_dirs = sorted_dirs(&subject_dir)?;
        if session_dirs.is_empty() {
            warn!("{}: no session directories", subject_dir.display());
            summary.skipped += 1;
            continue;
        }
        for session_dir in session_dirs {
            let session = cleanup_value(&dir_name(&session_dir), "ses-");
            let out_session = args.destination.join(&subject).join(&session);
            prepare_session(args, &session_dir, &out_session, &mut summary)?;
        }
    }
    if summary.processed == 0 && summary.skipped == 0 {
        return Err(BidsError::configuration(format!(
            "no source recordings found under '{}'",
            args.source.display()
        )));
    }
    summary.print("prepare");
    Ok(())
}

fn prepare_session(
    args: &PrepareArgs,
    session_dir: &Path,
    out_session: &Path,
    summary: &mut WorkflowSummary,
) -> Result<()> {
    let module_root = out_session.join(&args.module);
    let mut index = 0usize;
    for series_dir in find_series(session_dir) {
        index += 1;
        let out_series = module_root.join(format!("{:03}-{}", index, dir_name(&series_dir)));
        if out_series.exists() {
            if args.skip_existing {
                debug!("{}: already prepared", out_series.display());
                summary.skipped += 1;
                continue;
            }
            return Err(BidsError::configuration(format!(
                "'{}' already exists (use --skip-existing to resume)",
                out_series.display()
            )));
        }
        fs::create_dir_all(&out_series).map_err(|e| BidsError::io(&out_series, e))?;
        let mut copied = 0usize;
        for file in sorted_files(&series_dir)? {
            let Some(file_name) = file.file_name() else {
                continue;
            };
            let target = out_series.join(file_name);
            fs::copy(&file, &target).map_err(|e| BidsError::io(&target, e))?;
            copied += 1;
        }
        info!(
            "{} -> {} ({} files)",
            series_dir.display(),
            out_series.display(),
            copied
        );
        summary.processed += 1;
    }
    Ok(())
}

/// Series directories below a session, in path order: every directory
/// a format reader accepts
fn find_series(session_dir: &Path) -> Vec<PathBuf> {
    let mut series: Vec<PathBuf> = WalkDir::new(session_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .filter(|path| detect_format(path).is_some())
        .collect();
    series.sort();
    series
}

fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| BidsError::io(dir, e))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed_source(root: &Path) {
        let series = root.join("001/visit_1/scans/localizer");
        fs::create_dir_all(&series).unwrap();
        fs::write(series.join("f1.json"), "{}").unwrap();
        let series = root.join("001/visit_1/scans/t1_mprage");
        fs::create_dir_all(&series).unwrap();
        fs::write(series.join("f1.json"), "{}").unwrap();
    }

    #[test]
    fn prepares_cleaned_layout() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        seed_source(source.path());
        prepare_command(&PrepareArgs {
            source: source.path().to_path_buf(),
            destination: dest.path().to_path_buf(),
            module: "MRI".to_string(),
            subjects: vec![],
            skip_existing: false,
        })
        .unwrap();
        assert!(
            dest.path()
                .join("sub-001/ses-visit1/MRI/001-localizer/f1.json")
                .exists()
        );
        assert!(
            dest.path()
                .join("sub-001/ses-visit1/MRI/002-t1_mprage/f1.json")
                .exists()
        );
    }

    #[test]
    fn existing_series_fails_without_skip_flag() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        seed_source(source.path());
        let args = PrepareArgs {
            source: source.path().to_path_buf(),
            destination: dest.path().to_path_buf(),
            module: "MRI".to_string(),
            subjects: vec![],
            skip_existing: false,
        };
        prepare_command(&args).unwrap();
        assert!(prepare_command(&args).is_err());
        prepare_command(&PrepareArgs {
            skip_existing: true,
            source: source.path().to_path_buf(),
            destination: dest.path().to_path_buf(),
            module: "MRI".to_string(),
            subjects: vec![],
        })
        .unwrap();
    }

    #[test]
    fn subject_filter_limits_output() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        seed_source(source.path());
        let series = source.path().join("002/visit_1/scans/localizer");
        fs::create_dir_all(&series).unwrap();
        fs::write(series.join("f1.json"), "{}").unwrap();
        prepare_command(&PrepareArgs {
            source: source.path().to_path_buf(),
            destination: dest.path().to_path_buf(),
            module: "MRI".to_string(),
            subjects: vec!["002".to_string()],
            skip_existing: false,
        })
        .unwrap();
        assert!(!dest.path().join("sub-001").exists());
        assert!(dest.path().join("sub-002").exists());
    }
}
