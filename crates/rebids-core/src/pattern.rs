//! Match specifications for run attributes
//!
//! A spec is attached to one attribute key within a run and decides
//! whether a recording's value for that key satisfies the rule. Specs
//! are compiled once at bidsmap load time so a malformed pattern
//! surfaces as a configuration error instead of a silent mismatch at
//! run time.

use crate::attributes::AttrValue;
use crate::error::BidsError;
use crate::result::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Raw spec value as it appears in the bidsmap document: a scalar or a
/// list of alternatives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpecValue {
    Text(String),
    Int(i64),
    Float(f64),
    Many(Vec<SpecValue>),
}

impl SpecValue {
    /// Canonical string form used for literal comparison
    pub fn canonical(&self) -> String {
        match self {
            SpecValue::Text(s) => s.trim().to_string(),
            SpecValue::Int(i) => i.to_string(),
            SpecValue::Float(f) => f.to_string(),
            SpecValue::Many(items) => items
                .iter()
                .map(SpecValue::canonical)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

impl From<&str> for SpecValue {
    fn from(s: &str) -> Self {
        SpecValue::Text(s.to_string())
    }
}

/// A compiled match specification
#[derive(Debug, Clone)]
pub enum MatchSpec {
    /// Case-sensitive exact equality, both sides stripped
    Literal(String),
    /// Anchored pattern: the entire value must match
    Pattern { source: String, regex: Regex },
    /// OR over alternatives
    AnyOf(Vec<MatchSpec>),
}

impl MatchSpec {
    /// Compile a raw spec value. Strings with wildcard or regex syntax
    /// become anchored patterns; everything else is a literal.
    pub fn parse(raw: &SpecValue) -> Result<MatchSpec> {
        match raw {
            SpecValue::Many(items) => {
                let specs = items.iter().map(MatchSpec::parse).collect::<Result<_>>()?;
                Ok(MatchSpec::AnyOf(specs))
            }
            SpecValue::Int(i) => Ok(MatchSpec::Literal(i.to_string())),
            SpecValue::Float(f) => Ok(MatchSpec::Literal(f.to_string())),
            SpecValue::Text(s) => {
                let s = s.trim();
                if is_wildcard(s) {
                    let regex = compile_anchored(&wildcard_to_regex(s), s)?;
                    Ok(MatchSpec::Pattern {
                        source: s.to_string(),
                        regex,
                    })
                } else if has_regex_meta(s) {
                    let regex = compile_anchored(s, s)?;
                    Ok(MatchSpec::Pattern {
                        source: s.to_string(),
                        regex,
                    })
                } else {
                    Ok(MatchSpec::Literal(s.to_string()))
                }
            }
        }
    }

    /// Evaluate the spec against a recording value. Numeric values are
    /// coerced to their string form before comparison.
    pub fn matches(&self, value: &AttrValue) -> bool {
        let text = value.to_string();
        let text = text.trim();
        match self {
            MatchSpec::Literal(lit) => lit == text,
            MatchSpec::Pattern { regex, .. } => regex.is_match(text),
            MatchSpec::AnyOf(specs) => specs.iter().any(|s| s.matches(value)),
        }
    }

    /// The raw source of the spec, for serialization
    pub fn source(&self) -> SpecValue {
        match self {
            MatchSpec::Literal(lit) => SpecValue::Text(lit.clone()),
            MatchSpec::Pattern { source, .. } => SpecValue::Text(source.clone()),
            MatchSpec::AnyOf(specs) => {
                SpecValue::Many(specs.iter().map(MatchSpec::source).collect())
            }
        }
    }
}

/// Evaluate an optional spec: an absent spec never constrains, a
/// present spec requires an extractable value
pub fn matches_opt(spec: Option<&MatchSpec>, value: Option<&AttrValue>) -> bool {
    match spec {
        None => true,
        Some(spec) => match value {
            Some(value) => spec.matches(value),
            None => false,
        },
    }
}

fn compile_anchored(pattern: &str, source: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
        BidsError::configuration(format!("invalid match pattern '{source}': {e}"))
    })
}

const REGEX_META: &[char] = &[
    '.', '^', '$', '+', '?', '(', ')', '[', ']', '{', '}', '|', '\\',
];

fn has_regex_meta(s: &str) -> bool {
    s.contains('*') || s.contains(REGEX_META)
}

/// `*`-delimited wildcard syntax: `*` and nothing else from the regex
/// alphabet
fn is_wildcard(s: &str) -> bool {
    s.contains('*') && !s.contains(REGEX_META)
}

fn wildcard_to_regex(s: &str) -> String {
    s.split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*")
}
