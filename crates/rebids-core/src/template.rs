//! Dynamic field templates and their resolution
//!
//! A template is plain text interleaved with placeholders. Single
//! angle brackets `<name>` pull the named attribute from the recording
//! at match time; double brackets `<<name>>` are deferred lookups
//! answered by the session context (counters, previously resolved BIDS
//! labels, accumulated table values). Templates are parsed once, when
//! the bidsmap is loaded, into a closed segment grammar; nothing is
//! re-parsed per resolution call.

use crate::attributes::{AttrValue, AttributeStore};
use crate::error::BidsError;
use crate::recording::Recording;
use crate::result::Result;

/// A deferred placeholder query, selected by its `prefix:` qualifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// No prefix: a recording characteristic or session counter
    Characteristic(String),
    /// `bids:` — a previously resolved entity label
    BidsLabel(String),
    /// `sub_tsv:` — accumulated subject table value
    SubjectTable(String),
    /// `rec_tsv:` — accumulated recording table value
    RecordingTable(String),
}

impl Query {
    fn key(&self) -> &str {
        match self {
            Query::Characteristic(k)
            | Query::BidsLabel(k)
            | Query::SubjectTable(k)
            | Query::RecordingTable(k) => k,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `<name>`: attribute lookup, with the placeholder's byte offset
    Immediate { key: String, position: usize },
    /// `<<prefix:name>>`
    Deferred { query: Query, position: usize },
}

/// Answers deferred placeholder lookups during final materialization.
/// Implemented by the session-level resolve context.
pub trait DeferredLookup {
    /// Session counters and similar named arguments (`<<run>>`)
    fn characteristic(&self, key: &str) -> Option<AttrValue>;
    /// A previously resolved entity label (`<<bids:task>>`)
    fn bids_label(&self, key: &str) -> Option<String>;
    /// Accumulated per-subject table value (`<<sub_tsv:age>>`)
    fn subject_value(&self, key: &str) -> Option<AttrValue>;
    /// Accumulated per-recording table value (`<<rec_tsv:acq_time>>`)
    fn recording_value(&self, key: &str) -> Option<AttrValue>;
}

/// A parsed dynamic field template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a template string. Unterminated placeholders and unknown
    /// prefixes are reported here, at load time.
    pub fn parse(source: &str) -> Result<Template> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;
        while let Some(open) = rest.find('<') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let position = offset + open;
            let deferred = rest[open..].starts_with("<<");
            let (body_start, close_mark) = if deferred {
                (open + 2, ">>")
            } else {
                (open + 1, ">")
            };
            let close = rest[body_start..].find(close_mark).ok_or_else(|| {
                BidsError::resolution(
                    source,
                    &rest[open..],
                    position,
                    format!("closing '{close_mark}' not found"),
                )
            })?;
            let body = &rest[body_start..body_start + close];
            if deferred {
                let query = parse_query(body, source, position)?;
                segments.push(Segment::Deferred { query, position });
            } else {
                segments.push(Segment::Immediate {
                    key: body.to_string(),
                    position,
                });
            }
            let consumed = body_start + close + close_mark.len();
            rest = &rest[consumed..];
            offset += consumed;
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Template {
            source: source.to_string(),
            segments,
        })
    }

    /// The original template text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True if the template contains no placeholders at all
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// True if the template contains deferred (`<<…>>`) placeholders
    pub fn has_deferred(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Deferred { .. }))
    }

    /// Resolve to a native value, left to right, single pass. A
    /// template that is exactly one placeholder keeps the resolved
    /// value's original type; anything else produces a string.
    ///
    /// Without a deferred-lookup context, deferred placeholders are
    /// re-emitted verbatim so the template survives into a written
    /// bidsmap; with a context, an unresolved lookup is an error.
    pub fn resolve_value(
        &self,
        rec: &dyn Recording,
        store: &mut AttributeStore,
        ctx: Option<&dyn DeferredLookup>,
    ) -> Result<AttrValue> {
        if self.segments.len() == 1 {
            match &self.segments[0] {
                Segment::Literal(text) => return Ok(AttrValue::Str(text.clone())),
                Segment::Immediate { key, position } => {
                    return self.lookup_immediate(rec, store, key, *position);
                }
                Segment::Deferred { query, position } => {
                    if ctx.is_none() {
                        return Ok(AttrValue::Str(self.source.clone()));
                    }
                    return self.lookup_deferred(rec, ctx, query, *position);
                }
            }
        }
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Immediate { key, position } => {
                    let value = self.lookup_immediate(rec, store, key, *position)?;
                    out.push_str(&value.to_string());
                }
                Segment::Deferred { query, position } => match ctx {
                    None => {
                        out.push_str(&format!("<<{}>>", query_source(query)));
                    }
                    Some(_) => {
                        let value = self.lookup_deferred(rec, ctx, query, *position)?;
                        out.push_str(&value.to_string());
                    }
                },
            }
        }
        Ok(AttrValue::Str(out))
    }

    /// Resolve to a filename-bound label: stringified and passed
    /// through BIDS cleanup. All placeholders must resolve.
    pub fn resolve_label(
        &self,
        rec: &dyn Recording,
        store: &mut AttributeStore,
        ctx: Option<&dyn DeferredLookup>,
    ) -> Result<String> {
        if let Some(Segment::Deferred { query, position }) = self
            .segments
            .iter()
            .find(|s| matches!(s, Segment::Deferred { .. }))
            && ctx.is_none()
        {
            return Err(BidsError::resolution(
                &self.source,
                query_source(query),
                *position,
                "deferred placeholder in a label needs a session context",
            ));
        }
        let value = self.resolve_value(rec, store, ctx)?;
        Ok(cleanup_value(&value.to_string(), ""))
    }

    fn lookup_immediate(
        &self,
        rec: &dyn Recording,
        store: &mut AttributeStore,
        key: &str,
        position: usize,
    ) -> Result<AttrValue> {
        store.get(rec, key).ok_or_else(|| {
            BidsError::resolution(
                &self.source,
                key,
                position,
                format!("attribute not found in {}", rec.identity()),
            )
        })
    }

    fn lookup_deferred(
        &self,
        rec: &dyn Recording,
        ctx: Option<&dyn DeferredLookup>,
        query: &Query,
        position: usize,
    ) -> Result<AttrValue> {
        let ctx = ctx.expect("caller checked for context");
        let resolved = match query {
            Query::Characteristic(key) => ctx
                .characteristic(key)
                .or_else(|| rec.characteristic(key)),
            Query::BidsLabel(key) => ctx.bids_label(key).map(AttrValue::Str),
            Query::SubjectTable(key) => ctx.subject_value(key),
            Query::RecordingTable(key) => ctx.recording_value(key),
        };
        resolved.ok_or_else(|| {
            BidsError::resolution(
                &self.source,
                query_source(query),
                position,
                format!("'{}' not found", query.key()),
            )
        })
    }
}

fn query_source(query: &Query) -> String {
    match query {
        Query::Characteristic(k) => k.clone(),
        Query::BidsLabel(k) => format!("bids:{k}"),
        Query::SubjectTable(k) => format!("sub_tsv:{k}"),
        Query::RecordingTable(k) => format!("rec_tsv:{k}"),
    }
}

fn parse_query(body: &str, template: &str, position: usize) -> Result<Query> {
    match body.split_once(':') {
        None => Ok(Query::Characteristic(body.to_string())),
        Some((prefix, key)) => match prefix {
            "bids" => Ok(Query::BidsLabel(key.to_string())),
            "sub_tsv" => Ok(Query::SubjectTable(key.to_string())),
            "rec_tsv" => Ok(Query::RecordingTable(key.to_string())),
            other => Err(BidsError::resolution(
                template,
                body,
                position,
                format!("unknown prefix '{other}'"),
            )),
        },
    }
}

/// Converts a label into a BIDS-valid one: leading and trailing
/// whitespace removed, then every character outside ASCII
/// `[a-zA-Z0-9]` dropped. If `prefix` is given it is re-attached to
/// the result, and stripped first if the label already carries it, so
/// `cleanup_value("task-Joe's task", "task-")` gives `task-Joestask`.
pub fn cleanup_value(label: &str, prefix: &str) -> String {
    let mut label = label.trim();
    if !prefix.is_empty() {
        label = label.strip_prefix(prefix).unwrap_or(label);
    }
    if label.is_empty() {
        return String::new();
    }
    let body: String = label.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    format!("{prefix}{body}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Result;
    use std::path::{Path, PathBuf};

    struct StubRecording {
        file: PathBuf,
    }

    impl Recording for StubRecording {
        fn module(&self) -> &str {
            "MRI"
        }
        fn format(&self) -> &str {
            "stub"
        }
        fn file_count(&self) -> usize {
            1
        }
        fn load(&mut self, _index: usize) -> Result<()> {
            Ok(())
        }
        fn current_file(&self) -> Option<&Path> {
            Some(&self.file)
        }
        fn get_field(&self, path: &[&str]) -> Option<AttrValue> {
            match path {
                ["Manufacturer"] => Some(AttrValue::from("SIEMENS")),
                ["EchoTime"] => Some(AttrValue::Float(0.03)),
                ["SeriesNumber"] => Some(AttrValue::Int(7)),
                _ => None,
            }
        }
    }

    struct StubContext;

    impl DeferredLookup for StubContext {
        fn characteristic(&self, key: &str) -> Option<AttrValue> {
            (key == "run").then_some(AttrValue::Int(1))
        }
        fn bids_label(&self, key: &str) -> Option<String> {
            (key == "task").then(|| "rest".to_string())
        }
        fn subject_value(&self, key: &str) -> Option<AttrValue> {
            (key == "age").then_some(AttrValue::Int(25))
        }
        fn recording_value(&self, _key: &str) -> Option<AttrValue> {
            None
        }
    }

    fn rec() -> StubRecording {
        StubRecording {
            file: PathBuf::from("/data/f1.json"),
        }
    }

    #[test]
    fn immediate_and_deferred_mix() {
        let t = Template::parse("<Manufacturer>_<<run>>").unwrap();
        let rec = rec();
        let mut store = AttributeStore::new();
        let value = t
            .resolve_value(&rec, &mut store, Some(&StubContext))
            .unwrap();
        assert_eq!(value.to_string(), "SIEMENS_1");
    }

    #[test]
    fn raw_single_placeholder_keeps_native_type() {
        let t = Template::parse("<SeriesNumber>").unwrap();
        let rec = rec();
        let mut store = AttributeStore::new();
        let value = t.resolve_value(&rec, &mut store, None).unwrap();
        assert_eq!(value, AttrValue::Int(7));

        let t = Template::parse("<<sub_tsv:age>>").unwrap();
        let value = t
            .resolve_value(&rec, &mut store, Some(&StubContext))
            .unwrap();
        assert_eq!(value, AttrValue::Int(25));
    }

    #[test]
    fn surrounding_text_stringifies() {
        let t = Template::parse("te<EchoTime>ms").unwrap();
        let rec = rec();
        let mut store = AttributeStore::new();
        let value = t.resolve_value(&rec, &mut store, None).unwrap();
        assert_eq!(value, AttrValue::Str("te0.03ms".to_string()));
    }

    #[test]
    fn missing_attribute_is_resolution_error() {
        let t = Template::parse("<NotThere>").unwrap();
        let rec = rec();
        let mut store = AttributeStore::new();
        let err = t.resolve_value(&rec, &mut store, None).unwrap_err();
        match err {
            BidsError::Resolution {
                placeholder,
                position,
                ..
            } => {
                assert_eq!(placeholder, "NotThere");
                assert_eq!(position, 0);
            }
            other => panic!("expected resolution error, got {other:?}"),
        }
    }

    #[test]
    fn deferred_without_context_survives_verbatim() {
        let t = Template::parse("prefix_<<run>>").unwrap();
        let rec = rec();
        let mut store = AttributeStore::new();
        let value = t.resolve_value(&rec, &mut store, None).unwrap();
        assert_eq!(value, AttrValue::Str("prefix_<<run>>".to_string()));
    }

    #[test]
    fn label_with_deferred_needs_context() {
        let t = Template::parse("<<run>>").unwrap();
        let rec = rec();
        let mut store = AttributeStore::new();
        assert!(t.resolve_label(&rec, &mut store, None).is_err());
        assert_eq!(
            t.resolve_label(&rec, &mut store, Some(&StubContext)).unwrap(),
            "1"
        );
    }

    #[test]
    fn bids_label_lookup() {
        let t = Template::parse("<<bids:task>>").unwrap();
        let rec = rec();
        let mut store = AttributeStore::new();
        let value = t
            .resolve_value(&rec, &mut store, Some(&StubContext))
            .unwrap();
        assert_eq!(value, AttrValue::Str("rest".to_string()));
    }

    #[test]
    fn unknown_prefix_rejected_at_parse() {
        let err = Template::parse("<<nope:key>>").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Resolution);
    }

    #[test]
    fn unterminated_placeholder_rejected_at_parse() {
        assert!(Template::parse("<Manufacturer").is_err());
        assert!(Template::parse("<<run>").is_err());
    }

    #[test]
    fn resolution_is_single_pass() {
        // a resolved value containing bracket syntax is inserted
        // verbatim, never re-scanned
        struct Sneaky {
            file: PathBuf,
        }
        impl Recording for Sneaky {
            fn module(&self) -> &str {
                "MRI"
            }
            fn format(&self) -> &str {
                "stub"
            }
            fn file_count(&self) -> usize {
                1
            }
            fn load(&mut self, _index: usize) -> Result<()> {
                Ok(())
            }
            fn current_file(&self) -> Option<&Path> {
                Some(&self.file)
            }
            fn get_field(&self, path: &[&str]) -> Option<AttrValue> {
                (path == ["A"]).then_some(AttrValue::from("<B>"))
            }
        }
        let t = Template::parse("x<A>y").unwrap();
        let rec = Sneaky {
            file: PathBuf::from("/f"),
        };
        let mut store = AttributeStore::new();
        let value = t.resolve_value(&rec, &mut store, None).unwrap();
        assert_eq!(value, AttrValue::Str("x<B>y".to_string()));
    }

    #[test]
    fn cleanup_is_idempotent() {
        for label in ["Joe's reward_task", "task-Joe's reward_task", "épi-bold"] {
            let once = cleanup_value(label, "");
            assert_eq!(cleanup_value(&once, ""), once);
        }
        let once = cleanup_value("task-Joe's reward_task", "task-");
        assert_eq!(once, "task-Joesrewardtask");
        assert_eq!(cleanup_value(&once, "task-"), once);
    }

    #[test]
    fn cleanup_strips_non_alphanumerics() {
        assert_eq!(cleanup_value("Joe's reward_task", ""), "Joesrewardtask");
        assert_eq!(cleanup_value("  padded  ", ""), "padded");
        assert_eq!(cleanup_value("", "sub-"), "");
    }
}
