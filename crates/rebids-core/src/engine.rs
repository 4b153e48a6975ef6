//! Run matching: find the unique rule applying to a recording
//!
//! Candidates are scanned in registration order over every
//! (modality, run list) pair of the recording's (module, format)
//! section; within a list, the first satisfying run wins. Ambiguity is
//! reported, not silently resolved: extra matches are either logged or
//! escalated depending on the policy of the workflow stage.

use crate::attributes::AttributeStore;
use crate::bidsmap::Bidsmap;
use crate::error::BidsError;
use crate::recording::Recording;
use crate::result::Result;
use crate::run::Run;

/// What to do when more than one run matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbiguityPolicy {
    /// Log a warning per extra match, keep the first (map stage:
    /// mapping authorship is iterative)
    Warn,
    /// Fail the recording (bidsify/process finalization)
    Fail,
}

/// Matching policy for one workflow stage
#[derive(Debug, Clone, Copy)]
pub struct MatchPolicy {
    /// Keep scanning after the first match to detect ambiguity
    pub check_multiple: bool,
    pub ambiguity: AmbiguityPolicy,
    /// Return a concrete copy with every originally non-empty spec
    /// frozen to the recording's literal value (map generation against
    /// a template map)
    pub fix: bool,
}

impl MatchPolicy {
    /// Policy of the map-generation stage
    pub fn mapping() -> Self {
        Self {
            check_multiple: true,
            ambiguity: AmbiguityPolicy::Warn,
            fix: true,
        }
    }

    /// Policy of the bidsify/process stages
    pub fn bidsify(ambiguity: AmbiguityPolicy) -> Self {
        Self {
            check_multiple: true,
            ambiguity,
            fix: false,
        }
    }
}

/// A successful match
#[derive(Debug)]
pub struct RunMatch {
    pub modality: String,
    pub index: usize,
    /// Snapshot of the matched run (fixed copy in fix mode). The run
    /// inside the map keeps any provenance backfill applied on match.
    pub run: Run,
    /// Positions of additional matching runs, already reported
    pub extras: Vec<(String, usize)>,
}

/// Match a recording against every candidate run of its
/// (module, format) section.
///
/// Returns `Ok(None)` when nothing matches; the caller decides whether
/// that is fatal (bidsify) or feeds the unknown bucket (map). The
/// matched run's provenance is back-filled with the recording's
/// current file if previously unset — first match wins, first use
/// wins.
pub fn match_run(
    map: &mut Bidsmap,
    rec: &dyn Recording,
    store: &mut AttributeStore,
    policy: &MatchPolicy,
) -> Result<Option<RunMatch>> {
    let recording_id = recording_label(rec);
    let Some(modalities) = map.runs_for_mut(rec.module(), rec.format()) else {
        tracing::debug!(
            "{}: no bidsmap section for {}",
            recording_id,
            rec.identity()
        );
        return Ok(None);
    };

    let mut first: Option<(String, usize)> = None;
    let mut extras: Vec<(String, usize)> = Vec::new();
    'outer: for (modality, runs) in modalities.iter_mut() {
        for (index, run) in runs.iter_mut().enumerate() {
            if !run.matches(rec, store) {
                continue;
            }
            match &first {
                None => {
                    first = Some((modality.clone(), index));
                    if run.provenance.is_none() {
                        run.provenance = rec.current_file().map(|p| p.to_path_buf());
                        run.checked = false;
                    }
                    tracing::debug!("{}: matched run {}/{}", recording_id, modality, index);
                    if !policy.check_multiple {
                        break 'outer;
                    }
                }
                Some((first_mod, first_idx)) => {
                    tracing::warn!(
                        "{}: run {}/{} also matched by {}/{}",
                        recording_id,
                        first_mod,
                        first_idx,
                        modality,
                        index
                    );
                    if policy.ambiguity == AmbiguityPolicy::Fail {
                        return Err(BidsError::Ambiguous {
                            recording: recording_id,
                            first: format!("{first_mod}/{first_idx}"),
                            extra: format!("{modality}/{index}"),
                        });
                    }
                    extras.push((modality.clone(), index));
                }
            }
        }
    }

    let Some((modality, index)) = first else {
        return Ok(None);
    };
    let mut run = map
        .run_at(rec.module(), rec.format(), &modality, index)
        .expect("matched run position is valid")
        .clone();
    if policy.fix {
        run.fix_attributes(rec, store);
    }
    Ok(Some(RunMatch {
        modality,
        index,
        run,
        extras,
    }))
}

fn recording_label(rec: &dyn Recording) -> String {
    match rec.current_file() {
        Some(file) => format!("{} ({})", rec.identity(), file.display()),
        None => rec.identity(),
    }
}
