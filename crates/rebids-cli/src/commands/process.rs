//! The process workflow: a dry validation pass.
//!
//! Matches and resolves every prepared recording exactly like bidsify
//! would, prints the names that would be produced and touches nothing
//! on disk. Exits non-zero when any series fails, so it can gate a CI
//! pipeline in front of the real run.

use crate::commands::{self, SeriesEntry};
use crate::output::WorkflowSummary;
use rebids_core::{
    AmbiguityPolicy, AttributeStore, BidsError, Bidsmap, BidsSession, IGNORE_MODALITY,
    MatchPolicy, Recording, Result, match_run, open_recording,
};
use std::path::PathBuf;
use tracing::{debug, warn};

pub struct ProcessArgs {
    pub source: PathBuf,
    pub bidsmap: PathBuf,
    pub subjects: Vec<String>,
    pub strict: bool,
}

pub fn process_command(args: &ProcessArgs) -> Result<()> {
    let mut map = Bidsmap::load(&args.bidsmap)?;
    let policy = MatchPolicy::bidsify(if args.strict {
        AmbiguityPolicy::Fail
    } else {
        AmbiguityPolicy::Warn
    });

    let mut summary = WorkflowSummary::default();
    let mut session: Option<BidsSession> = None;
    let mut session_id: Option<(String, Option<String>)> = None;
    for entry in commands::walk_prepared(&args.source)? {
        if !commands::subject_selected(&entry.subject, &args.subjects) {
            continue;
        }
        if commands::series_ignored(&entry.series, &map.options.ignore) {
            summary.skipped += 1;
            continue;
        }
        let id = (entry.subject.clone(), entry.session.clone());
        if session_id.as_ref() != Some(&id) {
            session = Some(commands::session_for(&entry));
            session_id = Some(id);
        }
        let current = session.as_mut().ok_or_else(|| {
            BidsError::configuration("session state lost between series")
        })?;
        match process_series(&mut map, current, &entry, &policy) {
            Ok(true) => summary.processed += 1,
            Ok(false) => summary.skipped += 1,
            Err(err) if !args.strict && err.is_recoverable() => {
                warn!("{}: {}", entry.path.display(), err);
                summary.failed += 1;
            }
            Err(err) => return Err(err),
        }
    }
    summary.print("process");
    if summary.failed > 0 {
        return Err(BidsError::no_match(format!(
            "{} series failed validation",
            summary.failed
        )));
    }
    Ok(())
}

fn process_series(
    map: &mut Bidsmap,
    session: &mut BidsSession,
    entry: &SeriesEntry,
    policy: &MatchPolicy,
) -> Result<bool> {
    let format = rebids_core::detect_format(&entry.path).ok_or_else(|| {
        BidsError::configuration(format!("no reader for '{}'", entry.path.display()))
    })?;
    let mut rec = open_recording(&entry.module, format, &entry.path)?;
    rec.load(0)?;
    let mut store = AttributeStore::new();
    let matched = match_run(map, rec.as_ref(), &mut store, policy)?
        .ok_or_else(|| BidsError::no_match(entry.path.display().to_string()))?;
    if matched.run.modality() == IGNORE_MODALITY {
        debug!("{}: ignored by run rule", entry.series);
        return Ok(false);
    }
    session.increment_counter("run");
    let files = commands::name_recording(rec.as_mut(), &matched.run, &mut store, session)?;
    for file in &files {
        println!(
            "{} -> {}/{}.json",
            file.source.display(),
            file.name.path.display(),
            file.name.name
        );
    }
    Ok(true)
}
