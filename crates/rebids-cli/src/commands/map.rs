//! The map workflow: grow the working bidsmap from the prepared
//! recordings.
//!
//! Each series is matched against the working map first; recordings it
//! misses are tried against the template map and, when a template run
//! matches, a copy frozen to the recording's values is promoted into
//! the working map. Recordings nothing matches are banked under the
//! unknown bucket for the user to classify. The map is saved
//! atomically at the end, together with a sanity report.

use crate::commands::{self, SeriesEntry};
use crate::output;
use rebids_core::{
    AttributeStore, BidsError, Bidsmap, MatchPolicy, Recording, Result, Run, UNKNOWN_MODALITY,
    example_name, match_run, open_recording,
};
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub struct MapArgs {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub bidsmap: Option<PathBuf>,
    pub template: Option<PathBuf>,
    pub subjects: Vec<String>,
}

pub fn map_command(args: &MapArgs) -> Result<()> {
    let map_path = args
        .bidsmap
        .clone()
        .unwrap_or_else(|| args.destination.join("bidsmap.yaml"));
    let mut working = if map_path.exists() {
        Bidsmap::load(&map_path)?
    } else {
        info!("starting a fresh bidsmap at {}", map_path.display());
        Bidsmap::new()
    };
    let mut template = match &args.template {
        Some(path) => Some(Bidsmap::load(path)?),
        None => None,
    };

    let mut summary = output::WorkflowSummary::default();
    for entry in commands::walk_prepared(&args.source)? {
        if !commands::subject_selected(&entry.subject, &args.subjects) {
            continue;
        }
        if commands::series_ignored(&entry.series, &working.options.ignore) {
            debug!("{}: ignored by map options", entry.series);
            summary.skipped += 1;
            continue;
        }
        match map_series(&mut working, template.as_mut(), &entry) {
            Ok(()) => summary.processed += 1,
            Err(err) if err.is_recoverable() => {
                warn!("{}: {}", entry.path.display(), err);
                summary.failed += 1;
            }
            Err(err) => return Err(err),
        }
    }

    if let Some(parent) = map_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| BidsError::io(parent, e))?;
    }
    working.save(&map_path, false)?;
    summary.print("map");
    output::print_map_summary(&working.count_runs(None), &working.check_sanity());
    Ok(())
}

fn map_series(
    working: &mut Bidsmap,
    template: Option<&mut Bidsmap>,
    entry: &SeriesEntry,
) -> Result<()> {
    let format = rebids_core::detect_format(&entry.path).ok_or_else(|| {
        BidsError::configuration(format!("no reader for '{}'", entry.path.display()))
    })?;
    let mut rec = open_recording(&entry.module, format, &entry.path)?;
    rec.load(0)?;
    let mut store = AttributeStore::new();

    // already covered by the working map?
    if let Some(matched) = match_run(
        working,
        rec.as_ref(),
        &mut store,
        &MatchPolicy::bidsify(rebids_core::AmbiguityPolicy::Warn),
    )? {
        debug!(
            "{}: already mapped to {}/{}",
            entry.series, matched.modality, matched.index
        );
        stamp_example(working, entry, rec.as_mut(), &matched.modality, matched.index)?;
        return Ok(());
    }

    // consult the template map
    if let Some(template) = template
        && let Some(matched) = match_run(
            template,
            rec.as_ref(),
            &mut store,
            &MatchPolicy::mapping(),
        )?
    {
        let mut run = matched.run;
        run.template = true;
        run.checked = false;
        let (modality, index) = working.add_run(&entry.module, format, run);
        info!(
            "{}: promoted template run into {}/{}",
            entry.series, modality, index
        );
        stamp_example(working, entry, rec.as_mut(), &modality, index)?;
        return Ok(());
    }

    // nothing matched, bank the recording for classification
    let run = Run::from_recording(rec.as_ref(), &store);
    let (_, index) = working.add_run(&entry.module, format, run);
    warn!(
        "{}: no run matched, banked under {}[{}]",
        entry.series, UNKNOWN_MODALITY, index
    );
    Ok(())
}

/// Generate and store the run's example name from this recording, so
/// the saved map shows what the rule will produce
fn stamp_example(
    map: &mut Bidsmap,
    entry: &SeriesEntry,
    rec: &mut dyn Recording,
    modality: &str,
    index: usize,
) -> Result<()> {
    let mut session = commands::session_for(entry);
    session.increment_counter("run");
    let mut store = AttributeStore::new();
    let format = rec.format().to_string();
    let Some(runs) = map.runs_for_mut(&entry.module, &format) else {
        return Ok(());
    };
    let Some(run) = runs.get_mut(modality).and_then(|runs| runs.get_mut(index)) else {
        return Ok(());
    };
    if run.example.is_none() {
        run.example = example_name(run, rec, &mut store, &session);
    }
    Ok(())
}
