//! A run: one mapping rule of a bidsmap
//!
//! A run associates a set of attribute match specifications with a
//! target modality, ordered entity label templates, a suffix template
//! and auxiliary JSON metadata templates. Specs and templates are
//! compiled when the run is built from its serialized form, so every
//! malformed entry surfaces at load time.

use crate::attributes::AttributeStore;
use crate::error::BidsError;
use crate::pattern::{self, MatchSpec, SpecValue};
use crate::recording::Recording;
use crate::result::Result;
use crate::template::Template;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Reserved modality for recordings to be skipped entirely
pub const IGNORE_MODALITY: &str = "__ignore__";
/// Reserved modality bucket for recordings no run matched
pub const UNKNOWN_MODALITY: &str = "__unknown__";

/// One attribute constraint: the raw spec as written in the bidsmap
/// plus its compiled form. An absent spec means "don't care".
#[derive(Debug, Clone)]
pub struct AttributeSpec {
    raw: Option<SpecValue>,
    compiled: Option<MatchSpec>,
}

impl AttributeSpec {
    fn parse(raw: Option<SpecValue>) -> Result<AttributeSpec> {
        let compiled = match &raw {
            Some(value) => Some(MatchSpec::parse(value)?),
            None => None,
        };
        Ok(AttributeSpec { raw, compiled })
    }

    /// A spec frozen to an exact literal value, bypassing pattern
    /// interpretation of the value's own characters
    fn literal(value: String) -> AttributeSpec {
        AttributeSpec {
            raw: Some(SpecValue::Text(value.clone())),
            compiled: Some(MatchSpec::Literal(value)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_none()
    }

    pub fn compiled(&self) -> Option<&MatchSpec> {
        self.compiled.as_ref()
    }

    pub fn raw(&self) -> Option<&SpecValue> {
        self.raw.as_ref()
    }
}

/// A JSON metadata template: a dynamic template, a list of them, or a
/// static non-string value carried through as-is
#[derive(Debug, Clone)]
pub enum JsonTemplate {
    Value(Template),
    List(Vec<JsonTemplate>),
    Static(serde_json::Value),
}

impl JsonTemplate {
    fn parse(value: &serde_json::Value) -> Result<JsonTemplate> {
        match value {
            serde_json::Value::String(s) => Ok(JsonTemplate::Value(Template::parse(s)?)),
            serde_json::Value::Array(items) => Ok(JsonTemplate::List(
                items.iter().map(JsonTemplate::parse).collect::<Result<_>>()?,
            )),
            other => Ok(JsonTemplate::Static(other.clone())),
        }
    }

    fn dump(&self) -> serde_json::Value {
        match self {
            JsonTemplate::Value(t) => serde_json::Value::String(t.source().to_string()),
            JsonTemplate::List(items) => {
                serde_json::Value::Array(items.iter().map(JsonTemplate::dump).collect())
            }
            JsonTemplate::Static(v) => v.clone(),
        }
    }
}

/// Serialized form of a run, as stored in the bidsmap document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunDump {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub template: bool,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub suffix: String,
    #[serde(default)]
    pub attributes: IndexMap<String, Option<SpecValue>>,
    #[serde(default)]
    pub bids: IndexMap<String, Option<String>>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub json: IndexMap<String, serde_json::Value>,
}

/// An inverse value returned by a run edit operation, applied back
/// through [`Run::revert`]
#[derive(Debug, Clone)]
pub enum RunEdit {
    Modality(String),
    Suffix(String),
    /// `previous: None` means the key did not exist before the edit
    Attribute {
        key: String,
        previous: Option<Option<SpecValue>>,
    },
    Entity {
        key: String,
        previous: Option<Option<String>>,
    },
    JsonField {
        key: String,
        previous: Option<serde_json::Value>,
    },
}

/// One mapping rule
#[derive(Debug, Clone)]
pub struct Run {
    modality: String,
    attributes: IndexMap<String, AttributeSpec>,
    entities: IndexMap<String, Option<Template>>,
    suffix: Template,
    json: IndexMap<String, JsonTemplate>,
    /// Source file that produced/validated this rule
    pub provenance: Option<PathBuf>,
    /// Example bidsified name generated from the provenance file
    pub example: Option<String>,
    /// Rule copied from a template map, not yet user-confirmed
    pub template: bool,
    /// Rule confirmed by the user
    pub checked: bool,
}

impl Run {
    /// Build a run from its serialized form, compiling every spec and
    /// template. The ignore modality carries no naming information, so
    /// its entities/suffix/json are discarded.
    pub fn from_dump(modality: &str, dump: RunDump) -> Result<Run> {
        let attributes = dump
            .attributes
            .into_iter()
            .map(|(key, raw)| Ok((key, AttributeSpec::parse(raw)?)))
            .collect::<Result<IndexMap<_, _>>>()?;
        if modality == IGNORE_MODALITY {
            return Ok(Run {
                modality: modality.to_string(),
                attributes,
                entities: IndexMap::new(),
                suffix: Template::parse("")?,
                json: IndexMap::new(),
                provenance: dump.provenance,
                example: None,
                template: dump.template,
                checked: dump.checked,
            });
        }
        // older map documents keep the suffix inside the bids block
        let mut bids = dump.bids;
        let legacy_suffix = bids.shift_remove("suffix").flatten();
        let suffix = if dump.suffix.is_empty() {
            legacy_suffix.unwrap_or_default()
        } else {
            dump.suffix
        };
        let entities = bids
            .into_iter()
            .map(|(key, raw)| {
                let tpl = match raw {
                    Some(s) => Some(Template::parse(&s)?),
                    None => None,
                };
                Ok((key, tpl))
            })
            .collect::<Result<IndexMap<_, _>>>()?;
        let json = dump
            .json
            .iter()
            .map(|(key, value)| Ok((key.clone(), JsonTemplate::parse(value)?)))
            .collect::<Result<IndexMap<_, _>>>()?;
        Ok(Run {
            modality: modality.to_string(),
            attributes,
            entities,
            suffix: Template::parse(&suffix)?,
            json,
            provenance: dump.provenance,
            example: dump.example,
            template: dump.template,
            checked: dump.checked,
        })
    }

    /// Serialize the run. With `empty_attributes` unset, attributes
    /// without a spec are dropped from the dump.
    pub fn dump(&self, empty_attributes: bool) -> RunDump {
        RunDump {
            provenance: self.provenance.clone(),
            example: self.example.clone(),
            template: self.template,
            checked: self.checked,
            suffix: self.suffix.source().to_string(),
            attributes: self
                .attributes
                .iter()
                .filter(|(_, spec)| empty_attributes || !spec.is_empty())
                .map(|(key, spec)| (key.clone(), spec.raw().cloned()))
                .collect(),
            bids: self
                .entities
                .iter()
                .map(|(key, tpl)| (key.clone(), tpl.as_ref().map(|t| t.source().to_string())))
                .collect(),
            json: self
                .json
                .iter()
                .map(|(key, tpl)| (key.clone(), tpl.dump()))
                .collect(),
        }
    }

    /// Build an unknown-bucket rule from a recording's extracted
    /// attributes, each frozen to its literal current value
    pub fn from_recording(rec: &dyn Recording, store: &AttributeStore) -> Run {
        let attributes = store
            .snapshot()
            .map(|(key, value)| {
                let spec = match value {
                    Some(v) => AttributeSpec::literal(v.to_string()),
                    None => AttributeSpec {
                        raw: None,
                        compiled: None,
                    },
                };
                (key.clone(), spec)
            })
            .collect();
        Run {
            modality: UNKNOWN_MODALITY.to_string(),
            attributes,
            entities: IndexMap::new(),
            suffix: Template::parse("").expect("empty template"),
            json: IndexMap::new(),
            provenance: rec.current_file().map(|p| p.to_path_buf()),
            example: None,
            template: false,
            checked: false,
        }
    }

    pub fn modality(&self) -> &str {
        &self.modality
    }

    pub fn suffix(&self) -> &Template {
        &self.suffix
    }

    pub fn attributes(&self) -> &IndexMap<String, AttributeSpec> {
        &self.attributes
    }

    pub fn entities(&self) -> &IndexMap<String, Option<Template>> {
        &self.entities
    }

    pub fn json(&self) -> &IndexMap<String, JsonTemplate> {
        &self.json
    }

    /// A run without a suffix cannot name anything
    pub fn has_suffix(&self) -> bool {
        !self.suffix.source().is_empty()
    }

    /// Evaluate the rule against a recording: every non-empty spec
    /// must match, and at least one spec must be non-empty. A run with
    /// all-empty specs never matches, so a rule with no constraints
    /// configured cannot become an accidental catch-all.
    pub fn matches(&self, rec: &dyn Recording, store: &mut AttributeStore) -> bool {
        let mut match_one = false;
        for (key, spec) in &self.attributes {
            let Some(compiled) = spec.compiled() else {
                continue;
            };
            let value = store.get(rec, key);
            if !pattern::matches_opt(Some(compiled), value.as_ref()) {
                return false;
            }
            match_one = true;
        }
        match_one
    }

    /// Set the target modality, returning the inverse edit
    pub fn set_modality(&mut self, modality: &str) -> RunEdit {
        let edit = RunEdit::Modality(self.modality.clone());
        self.modality = modality.to_string();
        edit
    }

    /// Set the suffix template, returning the inverse edit
    pub fn set_suffix(&mut self, suffix: &str) -> Result<RunEdit> {
        let edit = RunEdit::Suffix(self.suffix.source().to_string());
        self.suffix = Template::parse(suffix)?;
        Ok(edit)
    }

    /// Set (or add) an attribute spec, returning the inverse edit
    pub fn set_attribute(&mut self, key: &str, raw: Option<SpecValue>) -> Result<RunEdit> {
        let previous = self
            .attributes
            .get(key)
            .map(|spec| spec.raw().cloned());
        self.attributes
            .insert(key.to_string(), AttributeSpec::parse(raw)?);
        Ok(RunEdit::Attribute {
            key: key.to_string(),
            previous,
        })
    }

    /// Set (or add) an entity label template, returning the inverse edit
    pub fn set_entity(&mut self, key: &str, label: Option<&str>) -> Result<RunEdit> {
        let previous = self
            .entities
            .get(key)
            .map(|tpl| tpl.as_ref().map(|t| t.source().to_string()));
        let tpl = match label {
            Some(s) => Some(Template::parse(s)?),
            None => None,
        };
        self.entities.insert(key.to_string(), tpl);
        Ok(RunEdit::Entity {
            key: key.to_string(),
            previous,
        })
    }

    /// Set (or add) a JSON metadata template, returning the inverse edit
    pub fn set_json_field(&mut self, key: &str, value: &serde_json::Value) -> Result<RunEdit> {
        let previous = self.json.get(key).map(JsonTemplate::dump);
        self.json
            .insert(key.to_string(), JsonTemplate::parse(value)?);
        Ok(RunEdit::JsonField {
            key: key.to_string(),
            previous,
        })
    }

    /// Complete the entity set with declared-but-unset keys, used when
    /// promoting a rule into a modality with a wider naming schema
    pub fn ensure_entities<'a>(&mut self, keys: impl IntoIterator<Item = &'a str>) {
        for key in keys {
            self.entities.entry(key.to_string()).or_insert(None);
        }
    }

    /// Apply an inverse edit produced by a setter
    pub fn revert(&mut self, edit: RunEdit) -> Result<()> {
        match edit {
            RunEdit::Modality(previous) => {
                self.modality = previous;
            }
            RunEdit::Suffix(previous) => {
                self.suffix = Template::parse(&previous)?;
            }
            RunEdit::Attribute { key, previous } => match previous {
                None => {
                    self.attributes.shift_remove(&key);
                }
                Some(raw) => {
                    self.attributes.insert(key, AttributeSpec::parse(raw)?);
                }
            },
            RunEdit::Entity { key, previous } => match previous {
                None => {
                    self.entities.shift_remove(&key);
                }
                Some(raw) => {
                    let tpl = match raw {
                        Some(s) => Some(Template::parse(&s)?),
                        None => None,
                    };
                    self.entities.insert(key, tpl);
                }
            },
            RunEdit::JsonField { key, previous } => match previous {
                None => {
                    self.json.shift_remove(&key);
                }
                Some(value) => {
                    self.json.insert(key, JsonTemplate::parse(&value)?);
                }
            },
        }
        Ok(())
    }

    /// Freeze every originally non-empty spec to the recording's
    /// literal current value. Used by fix-mode matching to turn a
    /// generic template rule into a concrete, reviewable one.
    pub fn fix_attributes(&mut self, rec: &dyn Recording, store: &mut AttributeStore) {
        let keys: Vec<String> = self
            .attributes
            .iter()
            .filter(|(_, spec)| !spec.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(value) = store.get(rec, &key) {
                self.attributes
                    .insert(key, AttributeSpec::literal(value.to_string()));
            }
        }
        self.provenance = rec.current_file().map(|p| p.to_path_buf());
    }

}
