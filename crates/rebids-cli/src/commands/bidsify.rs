//! The bidsify workflow: final reorganization of prepared recordings
//! into the BIDS dataset.
//!
//! Every series must match a run of the bidsmap; the resolved names
//! drive where files land under the destination. Source dumps are
//! copied with the run's resolved metadata merged in, and one
//! participants row is registered per session.

use crate::commands::{self, NamedFile, SeriesEntry};
use crate::output::WorkflowSummary;
use rebids_core::{
    AmbiguityPolicy, AttributeStore, BidsError, Bidsmap, BidsSession, IGNORE_MODALITY,
    MatchPolicy, ParticipantFields, ParticipantRegistry, Recording, Result, match_run,
    open_recording,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct BidsifyArgs {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub bidsmap: Option<PathBuf>,
    pub participants: Option<PathBuf>,
    pub subjects: Vec<String>,
    pub allow_conflicts: bool,
    pub strict: bool,
    pub skip_existing: bool,
}

pub fn bidsify_command(args: &BidsifyArgs) -> Result<()> {
    let map_path = args
        .bidsmap
        .clone()
        .unwrap_or_else(|| args.destination.join("bidsmap.yaml"));
    let mut map = Bidsmap::load(&map_path)?;
    let fields = match &args.participants {
        Some(path) => ParticipantFields::load_definitions(path)?,
        None => ParticipantFields::new(),
    };
    let mut registry = ParticipantRegistry::new(fields);
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
            debug!("{}: ignored by map options", entry.series);
            summary.skipped += 1;
            continue;
        }
        let id = (entry.subject.clone(), entry.session.clone());
        if session_id.as_ref() != Some(&id) {
            if let Some(done) = session.take() {
                registry.register(&done, args.allow_conflicts)?;
            }
            session = Some(commands::session_for(&entry));
            session_id = Some(id);
        }
        let current = session.as_mut().ok_or_else(|| {
            BidsError::configuration("session state lost between series")
        })?;
        match bidsify_series(&mut map, current, &entry, args, &policy) {
            Ok(true) => summary.processed += 1,
            Ok(false) => summary.skipped += 1,
            Err(err) if !args.strict && err.is_recoverable() => {
                warn!("{}: {}", entry.path.display(), err);
                summary.failed += 1;
            }
            Err(err) => return Err(err),
        }
    }
    if let Some(done) = session.take() {
        registry.register(&done, args.allow_conflicts)?;
    }

    fs::create_dir_all(&args.destination).map_err(|e| BidsError::io(&args.destination, e))?;
    registry.export_to(&args.destination)?;
    summary.print("bidsify");
    Ok(())
}

/// Returns `Ok(false)` for series the map explicitly ignores
fn bidsify_series(
    map: &mut Bidsmap,
    session: &mut BidsSession,
    entry: &SeriesEntry,
    args: &BidsifyArgs,
    policy: &MatchPolicy,
) -> Result<bool> {
    let format = rebids_core::detect_format(&entry.path).ok_or_else(|| {
        BidsError::configuration(format!("no reader for '{}'", entry.path.display()))
    })?;
    let mut rec = open_recording(&entry.module, format, &entry.path)?;
    rec.load(0)?;
    let mut store = AttributeStore::new();
    let matched = match_run(map, rec.as_ref(), &mut store, policy)?
        .ok_or_else(|| BidsError::no_match(format!("{}", entry.path.display())))?;
    if matched.run.modality() == IGNORE_MODALITY {
        debug!("{}: ignored by run rule", entry.series);
        return Ok(false);
    }
    if !matched.run.has_suffix() {
        return Err(BidsError::no_match(format!(
            "{} (matched run has no suffix)",
            entry.path.display()
        )));
    }
    session.increment_counter("run");
    let files = commands::name_recording(rec.as_mut(), &matched.run, &mut store, session)?;
    for file in &files {
        write_bidsified(file, &args.destination, args.skip_existing)?;
    }
    info!("{}: {} file(s) bidsified", entry.series, files.len());
    Ok(true)
}

/// Copy the source dump to its bidsified location with the run's
/// resolved metadata merged over the original fields
fn write_bidsified(file: &NamedFile, destination: &Path, skip_existing: bool) -> Result<()> {
    let out_dir = destination.join(&file.name.path);
    fs::create_dir_all(&out_dir).map_err(|e| BidsError::io(&out_dir, e))?;
    let out_path = out_dir.join(format!("{}.json", file.name.name));
    if out_path.exists() {
        if skip_existing {
            debug!("{}: already bidsified", out_path.display());
            return Ok(());
        }
        return Err(BidsError::configuration(format!(
            "'{}' already exists (use --skip-existing to resume)",
            out_path.display()
        )));
    }
    let text = fs::read_to_string(&file.source).map_err(|e| BidsError::io(&file.source, e))?;
    let mut document: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
        BidsError::configuration(format!("malformed dump '{}': {e}", file.source.display()))
    })?;
    if let serde_json::Value::Object(fields) = &mut document {
        for (key, value) in &file.metadata {
            fields.insert(key.clone(), value.clone());
        }
    }
    let rendered = serde_json::to_string_pretty(&document)
        .map_err(|e| BidsError::configuration(format!("sidecar serialization: {e}")))?;
    fs::write(&out_path, rendered).map_err(|e| BidsError::io(&out_path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAP: &str = r#"
Options:
  ignore:
    - localizer
MRI:
  attr_dump:
    func:
      - suffix: bold
        checked: true
        attributes:
          SequenceName: "epfid*"
        bids:
          task: "<ProtocolName>"
          run: "<<run>>"
        json:
          EchoTime: "<EchoTime>"
    __ignore__:
      - attributes:
          SequenceName: "*scout*"
"#;

    fn seed(root: &Path) {
        let series = root.join("sub-001/ses-1/MRI/001-func_rest");
        fs::create_dir_all(&series).unwrap();
        fs::write(
            series.join("f1.json"),
            r#"{"SequenceName": "epfid2d1rs", "ProtocolName": "rest task", "EchoTime": 0.03}"#,
        )
        .unwrap();
    }

    fn dest_with_map() -> TempDir {
        let dest = TempDir::new().unwrap();
        fs::write(dest.path().join("bidsmap.yaml"), MAP).unwrap();
        dest
    }

    fn args(source: &Path, dest: &Path) -> BidsifyArgs {
        BidsifyArgs {
            source: source.to_path_buf(),
            destination: dest.to_path_buf(),
            bidsmap: None,
            participants: None,
            subjects: vec![],
            allow_conflicts: false,
            strict: false,
            skip_existing: false,
        }
    }

    #[test]
    fn builds_the_bids_tree() {
        let source = TempDir::new().unwrap();
        let dest = dest_with_map();
        seed(source.path());

        bidsify_command(&args(source.path(), dest.path())).unwrap();

        let sidecar = dest
            .path()
            .join("sub-001/ses-1/func/sub-001_ses-1_task-resttask_run-1_bold.json");
        let text = fs::read_to_string(&sidecar).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        // original fields survive, resolved metadata merged in
        assert_eq!(doc["SequenceName"], serde_json::json!("epfid2d1rs"));
        assert_eq!(doc["EchoTime"], serde_json::json!(0.03));

        let table = fs::read_to_string(dest.path().join("participants.tsv")).unwrap();
        assert_eq!(table, "participant_id\nsub-001\n");
        assert!(dest.path().join("participants.json").exists());
    }

    #[test]
    fn ignored_series_produce_nothing() {
        let source = TempDir::new().unwrap();
        let dest = dest_with_map();
        // hits the Options ignore list by name
        let series = source.path().join("sub-001/ses-1/MRI/001-localizer");
        fs::create_dir_all(&series).unwrap();
        fs::write(
            series.join("f1.json"),
            r#"{"SequenceName": "epfid2d1rs", "ProtocolName": "x", "EchoTime": 0.03}"#,
        )
        .unwrap();
        // hits the __ignore__ run rule
        let series = source.path().join("sub-001/ses-1/MRI/002-scout_head");
        fs::create_dir_all(&series).unwrap();
        fs::write(
            series.join("f1.json"),
            r#"{"SequenceName": "fast_scout_32ch"}"#,
        )
        .unwrap();

        bidsify_command(&args(source.path(), dest.path())).unwrap();
        assert!(!dest.path().join("sub-001/ses-1/func").exists());
    }

    #[test]
    fn unmatched_series_is_recoverable_unless_strict() {
        let source = TempDir::new().unwrap();
        let dest = dest_with_map();
        let series = source.path().join("sub-001/ses-1/MRI/001-mystery");
        fs::create_dir_all(&series).unwrap();
        fs::write(series.join("f1.json"), r#"{"SequenceName": "tfl3d1"}"#).unwrap();

        bidsify_command(&args(source.path(), dest.path())).unwrap();

        let mut strict = args(source.path(), dest.path());
        strict.strict = true;
        let err = bidsify_command(&strict).unwrap_err();
        assert_eq!(err.kind(), rebids_core::ErrorKind::NoMatch);
    }

    #[test]
    fn existing_output_fails_without_skip_flag() {
        let source = TempDir::new().unwrap();
        let dest = dest_with_map();
        seed(source.path());
        bidsify_command(&args(source.path(), dest.path())).unwrap();
        let err = bidsify_command(&args(source.path(), dest.path())).unwrap_err();
        assert_eq!(err.kind(), rebids_core::ErrorKind::Configuration);

        let mut resume = args(source.path(), dest.path());
        resume.skip_existing = true;
        bidsify_command(&resume).unwrap();
    }
}
