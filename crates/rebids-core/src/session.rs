//! Session state: subject/session identity with a lock protocol,
//! per-session counters, accumulated table values and the participant
//! registry built from them
//!
//! The subject and session labels go through two phases. While
//! unlocked they may be rewritten freely (plugins, path parsing).
//! Locking normalizes them into their BIDS form (`sub-…`, `ses-…`) and
//! freezes them; any later write is an error instead of a silent
//! identity change halfway through a dataset.

use crate::attributes::AttrValue;
use crate::error::BidsError;
use crate::participants::ParticipantFields;
use crate::result::Result;
use crate::template::{cleanup_value, DeferredLookup};
use indexmap::IndexMap;
use std::fmt::Write as _;
use std::io::Write;
use std::path::PathBuf;

const SUB_PREFIX: &str = "sub-";
const SES_PREFIX: &str = "ses-";

/// Identity and accumulator state of the recording session currently
/// being processed
#[derive(Debug, Clone, Default)]
pub struct BidsSession {
    subject: Option<String>,
    session: Option<String>,
    sub_locked: bool,
    ses_locked: bool,
    /// Source directory the session was discovered in
    pub in_path: Option<PathBuf>,
    /// Values destined for the participants table
    pub sub_values: IndexMap<String, Option<AttrValue>>,
    /// Values destined for the per-session scans table
    pub rec_values: IndexMap<String, Option<AttrValue>>,
    counters: IndexMap<String, i64>,
}

impl BidsSession {
    pub fn new() -> BidsSession {
        BidsSession::default()
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Set the subject label. Fails once the subject is locked.
    pub fn set_subject(&mut self, subject: Option<String>) -> Result<()> {
        if self.sub_locked {
            return Err(BidsError::configuration(format!(
                "subject is locked to '{}'",
                self.subject.as_deref().unwrap_or("")
            )));
        }
        self.subject = subject;
        Ok(())
    }

    /// Set the session label. Fails once the session is locked.
    pub fn set_session(&mut self, session: Option<String>) -> Result<()> {
        if self.ses_locked {
            return Err(BidsError::configuration(format!(
                "session is locked to '{}'",
                self.session.as_deref().unwrap_or("")
            )));
        }
        self.session = session;
        Ok(())
    }

    /// Normalize the subject into its `sub-` form and freeze it
    pub fn lock_subject(&mut self) {
        if let Some(subject) = &self.subject {
            self.subject = Some(cleanup_value(subject, SUB_PREFIX));
        }
        self.sub_locked = true;
    }

    /// Normalize the session into its `ses-` form and freeze it. An
    /// unset session stays unset: session-less datasets are valid.
    pub fn lock_session(&mut self) {
        if let Some(session) = &self.session {
            self.session = Some(cleanup_value(session, SES_PREFIX));
        }
        self.ses_locked = true;
    }

    /// Lock both labels
    pub fn lock(&mut self) {
        self.lock_subject();
        self.lock_session();
    }

    pub fn is_subject_locked(&self) -> bool {
        self.sub_locked
    }

    pub fn is_session_locked(&self) -> bool {
        self.ses_locked
    }

    /// Reopen the subject for modification without clearing its value
    pub fn unlock_subject(&mut self) {
        self.sub_locked = false;
    }

    pub fn unlock_session(&mut self) {
        self.ses_locked = false;
    }

    /// A session is valid once both labels are locked and the subject
    /// carries a non-empty label
    pub fn is_valid(&self) -> bool {
        self.sub_locked
            && self.ses_locked
            && self.subject.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// `sub-xxx[_ses-yyy]` prefix used in bidsified file names
    pub fn prefix(&self) -> Result<String> {
        if !self.is_valid() {
            return Err(BidsError::configuration(
                "session must be locked with a non-empty subject before naming",
            ));
        }
        let mut prefix = self.subject.clone().unwrap_or_default();
        if let Some(session) = self.session.as_deref().filter(|s| !s.is_empty()) {
            let _ = write!(prefix, "_{session}");
        }
        Ok(prefix)
    }

    /// `sub-xxx[/ses-yyy]` directory fragment under the output root
    pub fn path(&self) -> Result<PathBuf> {
        if !self.is_valid() {
            return Err(BidsError::configuration(
                "session must be locked with a non-empty subject before naming",
            ));
        }
        let mut path = PathBuf::from(self.subject.as_deref().unwrap_or_default());
        if let Some(session) = self.session.as_deref().filter(|s| !s.is_empty()) {
            path.push(session);
        }
        Ok(path)
    }

    /// Current value of a named counter, 0 if never incremented
    pub fn counter(&self, name: &str) -> i64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Increment a named counter (`<<run>>` numbering) and return the
    /// new value
    pub fn increment_counter(&mut self, name: &str) -> i64 {
        let entry = self.counters.entry(name.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Reset per-session accumulators when moving to the next session,
    /// keeping the subject identity intact
    pub fn next_session(&mut self) {
        self.ses_locked = false;
        self.session = None;
        self.rec_values.clear();
        self.counters.clear();
    }
}

/// Answers deferred template lookups from the current session state
/// and the labels already resolved for the recording at hand
pub struct ResolveContext<'a> {
    pub session: &'a BidsSession,
    /// Entity labels resolved so far, in declaration order
    pub labels: &'a IndexMap<String, Option<String>>,
}

impl DeferredLookup for ResolveContext<'_> {
    fn characteristic(&self, key: &str) -> Option<AttrValue> {
        match key {
            "subject" => self.session.subject().map(AttrValue::from),
            "session" => self.session.session().map(AttrValue::from),
            _ => self
                .session
                .counters
                .get(key)
                .map(|count| AttrValue::Int(*count)),
        }
    }

    fn bids_label(&self, key: &str) -> Option<String> {
        self.labels.get(key).cloned().flatten()
    }

    fn subject_value(&self, key: &str) -> Option<AttrValue> {
        self.session.sub_values.get(key).cloned().flatten()
    }

    fn recording_value(&self, key: &str) -> Option<AttrValue> {
        self.session.rec_values.get(key).cloned().flatten()
    }
}

/// Accumulates one participants-table row per registered session and
/// writes the table at the end of a workflow. Lifecycle is explicit:
/// create, register every session, export, clear.
#[derive(Debug, Clone)]
pub struct ParticipantRegistry {
    fields: ParticipantFields,
    /// One entry per retained row, keyed by subject in the values
    records: Vec<IndexMap<String, Option<AttrValue>>>,
}

impl ParticipantRegistry {
    pub fn new(fields: ParticipantFields) -> ParticipantRegistry {
        ParticipantRegistry {
            fields,
            records: Vec::new(),
        }
    }

    pub fn fields(&self) -> &ParticipantFields {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut ParticipantFields {
        &mut self.fields
    }

    /// Record the session's subject values.
    ///
    /// A subject seen before is merged field by field: a field unset in
    /// the new record inherits the old value. Two set values that
    /// disagree are a conflict; with `conflicting` the new record is
    /// retained as an extra row and a warning logged, otherwise the
    /// registration fails.
    pub fn register(&mut self, session: &BidsSession, conflicting: bool) -> Result<()> {
        if !session.is_valid() {
            return Err(BidsError::configuration(
                "cannot register an unlocked or subject-less session",
            ));
        }
        let subject = session.subject().unwrap_or_default().to_string();
        let mut record = self.fields.template();
        record.insert(
            "participant_id".to_string(),
            Some(AttrValue::from(subject.as_str())),
        );
        for (key, value) in &session.sub_values {
            if !self.fields.contains(key) {
                tracing::warn!("{}: value for undeclared column '{}' dropped", subject, key);
                continue;
            }
            record.insert(key.clone(), value.clone());
        }

        let position = self
            .records
            .iter()
            .rposition(|r| r.get("participant_id") == record.get("participant_id"));
        let Some(position) = position else {
            self.records.push(record);
            return Ok(());
        };

        let mut conflict: Option<(String, String, String)> = None;
        for (key, new_value) in &record {
            let Some(new_set) = new_value else {
                continue;
            };
            if let Some(old_set) = self.records[position].get(key).and_then(|v| v.as_ref())
                && old_set != new_set
            {
                conflict = Some((key.clone(), old_set.to_string(), new_set.to_string()));
                break;
            }
        }
        if let Some((field, old, new)) = conflict {
            if !conflicting {
                return Err(BidsError::SubjectConflict {
                    subject,
                    field,
                    old,
                    new,
                });
            }
            tracing::warn!(
                "{}: conflicting '{}' value '{}' (was '{}'), keeping both rows",
                subject,
                field,
                new,
                old
            );
            self.records.push(record);
            return Ok(());
        }

        // unset fields inherit the previous registration
        for (key, new_value) in record.iter_mut() {
            if new_value.is_none() {
                *new_value = self.records[position].get(key).cloned().flatten();
            }
        }
        self.records[position] = record;
        Ok(())
    }

    /// Number of retained rows
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the participants table: header plus one line per retained
    /// row, sorted by subject, identical rows collapsed
    pub fn export(&self, out: &mut dyn Write) -> Result<()> {
        let mut lines: Vec<String> = self
            .records
            .iter()
            .map(|record| self.fields.line(record))
            .collect();
        lines.sort();
        lines.dedup();
        writeln!(out, "{}", self.fields.header()).map_err(write_error)?;
        for line in lines {
            writeln!(out, "{line}").map_err(write_error)?;
        }
        Ok(())
    }

    /// Write `participants.tsv` and its JSON sidecar under `root`
    pub fn export_to(&self, root: &std::path::Path) -> Result<()> {
        let tsv = root.join("participants.tsv");
        let mut file = std::fs::File::create(&tsv).map_err(|e| BidsError::io(&tsv, e))?;
        self.export(&mut file)?;
        self.fields.dump_definitions(&root.join("participants.json"))
    }

    /// Drop every accumulated row, keeping the column library
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

fn write_error(source: std::io::Error) -> BidsError {
    BidsError::io("participants.tsv", source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participants::FieldDefinition;

    fn locked_session(subject: &str) -> BidsSession {
        let mut session = BidsSession::new();
        session.set_subject(Some(subject.to_string())).unwrap();
        session.lock();
        session
    }

    fn age_fields() -> ParticipantFields {
        let mut fields = ParticipantFields::new();
        fields.add_field("age", FieldDefinition::default());
        fields
    }

    #[test]
    fn lock_normalizes_and_freezes() {
        let mut session = BidsSession::new();
        session.set_subject(Some("001-test".to_string())).unwrap();
        session.set_session(Some("ses-01".to_string())).unwrap();
        session.lock();
        assert_eq!(session.subject(), Some("sub-001test"));
        assert_eq!(session.session(), Some("ses-01"));
        assert!(session.is_valid());
        assert!(session.set_subject(Some("other".to_string())).is_err());
        assert!(session.set_session(None).is_err());
    }

    #[test]
    fn unlock_reopens_without_clearing() {
        let mut session = locked_session("001");
        session.unlock_subject();
        assert_eq!(session.subject(), Some("sub-001"));
        session.set_subject(Some("002".to_string())).unwrap();
        session.lock_subject();
        assert_eq!(session.subject(), Some("sub-002"));
    }

    #[test]
    fn sessionless_prefix_and_path() {
        let session = locked_session("001");
        assert_eq!(session.prefix().unwrap(), "sub-001");
        assert_eq!(session.path().unwrap(), PathBuf::from("sub-001"));

        let mut with_ses = BidsSession::new();
        with_ses.set_subject(Some("001".to_string())).unwrap();
        with_ses.set_session(Some("1".to_string())).unwrap();
        with_ses.lock();
        assert_eq!(with_ses.prefix().unwrap(), "sub-001_ses-1");
        assert_eq!(with_ses.path().unwrap(), PathBuf::from("sub-001/ses-1"));
    }

    #[test]
    fn unlocked_session_is_not_valid() {
        let mut session = BidsSession::new();
        session.set_subject(Some("001".to_string())).unwrap();
        assert!(!session.is_valid());
        assert!(session.prefix().is_err());
    }

    #[test]
    fn counters_are_per_name() {
        let mut session = BidsSession::new();
        assert_eq!(session.increment_counter("run"), 1);
        assert_eq!(session.increment_counter("run"), 2);
        assert_eq!(session.increment_counter("echo"), 1);
        assert_eq!(session.counter("run"), 2);
        session.next_session();
        assert_eq!(session.counter("run"), 0);
    }

    #[test]
    fn resolve_context_answers_queries() {
        let mut session = locked_session("001");
        session.increment_counter("run");
        session
            .sub_values
            .insert("age".to_string(), Some(AttrValue::Int(25)));
        let labels: IndexMap<String, Option<String>> =
            [("task".to_string(), Some("rest".to_string()))]
                .into_iter()
                .collect();
        let ctx = ResolveContext {
            session: &session,
            labels: &labels,
        };
        assert_eq!(ctx.characteristic("run"), Some(AttrValue::Int(1)));
        assert_eq!(ctx.characteristic("subject"), Some(AttrValue::from("sub-001")));
        assert_eq!(ctx.bids_label("task"), Some("rest".to_string()));
        assert_eq!(ctx.subject_value("age"), Some(AttrValue::Int(25)));
        assert_eq!(ctx.recording_value("acq_time"), None);
    }

    #[test]
    fn register_merges_unset_fields() {
        let mut registry = ParticipantRegistry::new(age_fields());
        let mut first = locked_session("001");
        first
            .sub_values
            .insert("age".to_string(), Some(AttrValue::Int(25)));
        registry.register(&first, false).unwrap();

        // second session of the same subject with age unset
        let second = locked_session("001");
        registry.register(&second, false).unwrap();
        assert_eq!(registry.len(), 1);

        let mut out = Vec::new();
        registry.export(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "participant_id\tage\nsub-001\t25\n");
    }

    #[test]
    fn conflicting_value_fails_by_default() {
        let mut registry = ParticipantRegistry::new(age_fields());
        let mut first = locked_session("001");
        first
            .sub_values
            .insert("age".to_string(), Some(AttrValue::Int(25)));
        registry.register(&first, false).unwrap();

        let mut second = locked_session("001");
        second
            .sub_values
            .insert("age".to_string(), Some(AttrValue::Int(26)));
        let err = registry.register(&second, false).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SubjectConflict);
    }

    #[test]
    fn conflicting_value_keeps_both_rows_when_allowed() {
        let mut registry = ParticipantRegistry::new(age_fields());
        let mut first = locked_session("001");
        first
            .sub_values
            .insert("age".to_string(), Some(AttrValue::Int(25)));
        registry.register(&first, true).unwrap();

        let mut second = locked_session("001");
        second
            .sub_values
            .insert("age".to_string(), Some(AttrValue::Int(26)));
        registry.register(&second, true).unwrap();
        assert_eq!(registry.len(), 2);

        let mut out = Vec::new();
        registry.export(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "participant_id\tage\nsub-001\t25\nsub-001\t26\n"
        );
    }

    #[test]
    fn export_sorts_and_deduplicates() {
        let mut registry = ParticipantRegistry::new(ParticipantFields::new());
        registry.register(&locked_session("002"), false).unwrap();
        registry.register(&locked_session("001"), false).unwrap();
        registry.register(&locked_session("002"), false).unwrap();
        let mut out = Vec::new();
        registry.export(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "participant_id\nsub-001\nsub-002\n");
    }

    #[test]
    fn undeclared_columns_are_dropped() {
        let mut registry = ParticipantRegistry::new(ParticipantFields::new());
        let mut session = locked_session("001");
        session
            .sub_values
            .insert("height".to_string(), Some(AttrValue::Float(1.8)));
        registry.register(&session, false).unwrap();
        let mut out = Vec::new();
        registry.export(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "participant_id\nsub-001\n");
    }
}
