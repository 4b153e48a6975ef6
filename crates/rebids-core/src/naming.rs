//! Assembling bidsified names and metadata from a matched run
//!
//! Entity labels resolve in declaration order, so a later entity may
//! reference an earlier one through `<<bids:…>>`. Labels pass through
//! BIDS cleanup; JSON metadata keeps raw value semantics instead.

use crate::attributes::AttributeStore;
use crate::error::BidsError;
use crate::recording::Recording;
use crate::result::Result;
use crate::run::{JsonTemplate, Run};
use crate::session::{BidsSession, ResolveContext};
use indexmap::IndexMap;
use std::path::PathBuf;

/// The fully resolved name of one bidsified recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidsName {
    /// Resolved entity labels in declaration order; `None` for
    /// entities that resolved empty or carried no template
    pub labels: IndexMap<String, Option<String>>,
    pub suffix: String,
    /// `sub-xxx[_ses-yyy][_key-label…]_suffix`
    pub name: String,
    /// `sub-xxx[/ses-yyy]/<modality>` destination directory fragment
    pub path: PathBuf,
}

/// Resolve the entity labels of a run, left to right. Each resolved
/// label is visible to the templates that follow it.
pub fn resolve_labels(
    run: &Run,
    rec: &dyn Recording,
    store: &mut AttributeStore,
    session: &BidsSession,
) -> Result<IndexMap<String, Option<String>>> {
    let mut labels: IndexMap<String, Option<String>> = IndexMap::new();
    for (key, template) in run.entities() {
        let resolved = match template {
            None => None,
            Some(template) => {
                let ctx = ResolveContext {
                    session,
                    labels: &labels,
                };
                let label = template.resolve_label(rec, store, Some(&ctx))?;
                (!label.is_empty()).then_some(label)
            }
        };
        labels.insert(key.clone(), resolved);
    }
    Ok(labels)
}

/// Produce the complete bidsified name for a recording matched by
/// `run` within a locked session
pub fn bids_name(
    run: &Run,
    rec: &dyn Recording,
    store: &mut AttributeStore,
    session: &BidsSession,
) -> Result<BidsName> {
    let labels = resolve_labels(run, rec, store, session)?;
    let ctx = ResolveContext {
        session,
        labels: &labels,
    };
    let suffix = run.suffix().resolve_label(rec, store, Some(&ctx))?;
    if suffix.is_empty() {
        return Err(BidsError::configuration(format!(
            "run for modality '{}' resolves to an empty suffix",
            run.modality()
        )));
    }

    let mut name = session.prefix()?;
    for (key, label) in &labels {
        if let Some(label) = label {
            name.push('_');
            name.push_str(key);
            name.push('-');
            name.push_str(label);
        }
    }
    name.push('_');
    name.push_str(&suffix);

    let path = session.path()?.join(run.modality());
    Ok(BidsName {
        labels,
        suffix,
        name,
        path,
    })
}

/// Resolve the run's JSON metadata templates. Values keep their native
/// type: a single-placeholder template yields the attribute's JSON
/// form, not its string rendering.
pub fn resolve_json(
    run: &Run,
    rec: &dyn Recording,
    store: &mut AttributeStore,
    session: &BidsSession,
    labels: &IndexMap<String, Option<String>>,
) -> Result<IndexMap<String, serde_json::Value>> {
    let ctx = ResolveContext { session, labels };
    run.json()
        .iter()
        .map(|(key, template)| Ok((key.clone(), resolve_json_value(template, rec, store, &ctx)?)))
        .collect()
}

fn resolve_json_value(
    template: &JsonTemplate,
    rec: &dyn Recording,
    store: &mut AttributeStore,
    ctx: &ResolveContext,
) -> Result<serde_json::Value> {
    match template {
        JsonTemplate::Value(t) => {
            let value = t.resolve_value(rec, store, Some(ctx))?;
            Ok(value.as_json())
        }
        JsonTemplate::List(items) => Ok(serde_json::Value::Array(
            items
                .iter()
                .map(|item| resolve_json_value(item, rec, store, ctx))
                .collect::<Result<_>>()?,
        )),
        JsonTemplate::Static(value) => Ok(value.clone()),
    }
}

/// Shorthand used by map generation to stamp a run's example name
pub fn example_name(
    run: &Run,
    rec: &dyn Recording,
    store: &mut AttributeStore,
    session: &BidsSession,
) -> Option<String> {
    match bids_name(run, rec, store, session) {
        Ok(named) => Some(named.name),
        Err(err) => {
            tracing::debug!("no example name for {}: {}", rec.identity(), err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttrValue;
    use crate::run::RunDump;
    use std::path::Path;

    struct FuncRecording {
        file: PathBuf,
    }

    impl Recording for FuncRecording {
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
                ["ProtocolName"] => Some(AttrValue::from("rest task")),
                ["EchoTime"] => Some(AttrValue::Float(0.03)),
                _ => None,
            }
        }
    }

    fn rec() -> FuncRecording {
        FuncRecording {
            file: PathBuf::from("/data/f1.json"),
        }
    }

    fn session() -> BidsSession {
        let mut session = BidsSession::new();
        session.set_subject(Some("001".to_string())).unwrap();
        session.set_session(Some("1".to_string())).unwrap();
        session.lock();
        session
    }

    fn func_run() -> Run {
        let mut dump = RunDump {
            suffix: "bold".to_string(),
            ..Default::default()
        };
        dump.bids
            .insert("task".to_string(), Some("<ProtocolName>".to_string()));
        dump.bids.insert("acq".to_string(), None);
        dump.bids
            .insert("run".to_string(), Some("<<run>>".to_string()));
        dump.json.insert(
            "EchoTime".to_string(),
            serde_json::Value::String("<EchoTime>".to_string()),
        );
        dump.json.insert(
            "TaskName".to_string(),
            serde_json::Value::String("<<bids:task>>".to_string()),
        );
        Run::from_dump("func", dump).unwrap()
    }

    #[test]
    fn name_assembles_in_declaration_order() {
        let run = func_run();
        let rec = rec();
        let mut store = AttributeStore::new();
        let mut session = session();
        session.increment_counter("run");
        let named = bids_name(&run, &rec, &mut store, &session).unwrap();
        assert_eq!(named.name, "sub-001_ses-1_task-resttask_run-1_bold");
        assert_eq!(named.path, PathBuf::from("sub-001/ses-1/func"));
        assert_eq!(named.labels["acq"], None);
    }

    #[test]
    fn json_keeps_native_types() {
        let run = func_run();
        let rec = rec();
        let mut store = AttributeStore::new();
        let mut session = session();
        session.increment_counter("run");
        let labels = resolve_labels(&run, &rec, &mut store, &session).unwrap();
        let json = resolve_json(&run, &rec, &mut store, &session, &labels).unwrap();
        assert_eq!(json["EchoTime"], serde_json::json!(0.03));
        // bids: lookups see the cleaned label
        assert_eq!(json["TaskName"], serde_json::json!("resttask"));
    }

    #[test]
    fn empty_suffix_is_an_error() {
        let mut dump = RunDump::default();
        dump.bids
            .insert("task".to_string(), Some("rest".to_string()));
        let run = Run::from_dump("func", dump).unwrap();
        let rec = rec();
        let mut store = AttributeStore::new();
        let err = bids_name(&run, &rec, &mut store, &session()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn unresolvable_label_is_a_resolution_error() {
        let mut dump = RunDump {
            suffix: "bold".to_string(),
            ..Default::default()
        };
        dump.bids
            .insert("task".to_string(), Some("<NotThere>".to_string()));
        let run = Run::from_dump("func", dump).unwrap();
        let rec = rec();
        let mut store = AttributeStore::new();
        let err = bids_name(&run, &rec, &mut store, &session()).unwrap_err();
        assert!(err.is_recoverable());
    }
}
