//! Participant table columns: the library of per-subject fields, their
//! sidecar definitions, and BIDS TSV value normalization

use crate::attributes::AttrValue;
use crate::error::BidsError;
use crate::result::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Sidecar description of one column
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldDefinition {
    #[serde(rename = "LongName", default, skip_serializing_if = "String::is_empty")]
    pub long_name: String,
    #[serde(rename = "Description", default)]
    pub description: String,
    /// Categorical variables: possible values and their descriptions
    #[serde(rename = "Levels", default, skip_serializing_if = "IndexMap::is_empty")]
    pub levels: IndexMap<String, String>,
    #[serde(rename = "Units", default, skip_serializing_if = "String::is_empty")]
    pub units: String,
    #[serde(rename = "TermURL", default, skip_serializing_if = "String::is_empty")]
    pub term_url: String,
}

#[derive(Debug, Clone)]
struct FieldEntry {
    definition: FieldDefinition,
    active: bool,
}

/// The ordered library of participant table columns. Column order is
/// declaration order and defines the TSV header.
#[derive(Debug, Clone)]
pub struct ParticipantFields {
    library: IndexMap<String, FieldEntry>,
}

impl Default for ParticipantFields {
    fn default() -> Self {
        let mut fields = ParticipantFields {
            library: IndexMap::new(),
        };
        fields.add_field(
            "participant_id",
            FieldDefinition {
                long_name: "Participant Id".to_string(),
                description: "Unique label associated with a participant".to_string(),
                ..Default::default()
            },
        );
        fields
    }
}

impl ParticipantFields {
    /// Library with only the mandatory `participant_id` column
    pub fn new() -> Self {
        Self::default()
    }

    /// Load column definitions from a participants JSON sidecar.
    /// Entries without a `Description` are ignored, as in hand-edited
    /// sidecars they tend to be free-form annotations.
    pub fn load_definitions(path: &Path) -> Result<ParticipantFields> {
        let text = fs::read_to_string(path).map_err(|e| BidsError::io(path, e))?;
        let raw: IndexMap<String, serde_json::Value> =
            serde_json::from_str(&text).map_err(|e| {
                BidsError::configuration(format!(
                    "malformed participants sidecar '{}': {e}",
                    path.display()
                ))
            })?;
        let mut fields = ParticipantFields {
            library: IndexMap::new(),
        };
        for (name, value) in raw {
            if !value.get("Description").is_some_and(|d| d.is_string()) {
                continue;
            }
            let definition: FieldDefinition =
                serde_json::from_value(value).map_err(|e| {
                    BidsError::configuration(format!(
                        "malformed definition for column '{name}': {e}"
                    ))
                })?;
            fields.add_field(&name, definition);
        }
        if fields.library.is_empty() {
            return Err(BidsError::configuration(format!(
                "participants sidecar '{}' defines no columns",
                path.display()
            )));
        }
        Ok(fields)
    }

    /// Write the sidecar for the active columns
    pub fn dump_definitions(&self, path: &Path) -> Result<()> {
        let doc: IndexMap<&String, &FieldDefinition> = self
            .library
            .iter()
            .filter(|(_, entry)| entry.active)
            .map(|(name, entry)| (name, &entry.definition))
            .collect();
        let text = serde_json::to_string_pretty(&doc)
            .map_err(|e| BidsError::configuration(format!("sidecar serialization: {e}")))?;
        fs::write(path, text).map_err(|e| BidsError::io(path, e))?;
        Ok(())
    }

    /// Append a column; an existing column of the same name is replaced
    pub fn add_field(&mut self, name: &str, definition: FieldDefinition) {
        self.library.insert(
            name.to_string(),
            FieldEntry {
                definition,
                active: true,
            },
        );
    }

    /// Change a column's active status
    pub fn activate(&mut self, name: &str, active: bool) -> Result<()> {
        let entry = self.library.get_mut(name).ok_or_else(|| {
            BidsError::configuration(format!("column '{name}' not defined"))
        })?;
        entry.active = active;
        Ok(())
    }

    /// Names of the active columns, in declaration order
    pub fn active(&self) -> impl Iterator<Item = &str> {
        self.library
            .iter()
            .filter(|(_, entry)| entry.active)
            .map(|(name, _)| name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.library.contains_key(name)
    }

    /// Tab-separated header of active column names
    pub fn header(&self) -> String {
        self.active().collect::<Vec<_>>().join("\t")
    }

    /// Tab-separated row for the given values; columns without a value
    /// render as `n/a`
    pub fn line(&self, values: &IndexMap<String, Option<AttrValue>>) -> String {
        self.active()
            .map(|name| normalize_tsv(values.get(name).and_then(|v| v.as_ref())))
            .collect::<Vec<_>>()
            .join("\t")
    }

    /// Value record with every column unset
    pub fn template(&self) -> IndexMap<String, Option<AttrValue>> {
        self.library
            .keys()
            .map(|name| (name.clone(), None))
            .collect()
    }
}

/// Normalize a value for a BIDS TSV cell: unset and empty values
/// become `n/a`, temporal values ISO-8601, durations total seconds,
/// and embedded tabs/newlines a single space.
pub fn normalize_tsv(value: Option<&AttrValue>) -> String {
    let Some(value) = value else {
        return "n/a".to_string();
    };
    let text = value
        .to_string()
        .replace(['\t', '\n'], " ");
    if text.is_empty() {
        return "n/a".to_string();
    }
    text
}
