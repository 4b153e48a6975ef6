//! The bidsmap: an ordered collection of runs grouped by
//! module / source format / modality, loaded from and saved to a
//! declarative YAML document. Within one modality list, run order is
//! match-priority order: the first satisfying run wins.

use crate::error::BidsError;
use crate::result::Result;
use crate::run::{Run, RunDump};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Schema version written into the `Options` section
pub const MAP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Map-wide options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Schema version the map was written with
    #[serde(default)]
    pub version: Option<String>,
    /// Source paths to be skipped without matching
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            version: Some(MAP_VERSION.to_string()),
            ignore: Vec::new(),
        }
    }
}

/// External plugin declaration, carried through untouched: hook
/// dispatch itself lives outside the core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plugins {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub options: IndexMap<String, serde_json::Value>,
}

/// Serialized document shape: `Options`, `PlugIns`, then one section
/// per module, each mapping format name to modality run lists
#[derive(Debug, Serialize, Deserialize)]
struct BidsmapDoc {
    #[serde(rename = "Options", default)]
    options: Options,
    #[serde(rename = "PlugIns", default, skip_serializing_if = "Option::is_none")]
    plugins: Option<Plugins>,
    #[serde(flatten)]
    modules: IndexMap<String, IndexMap<String, IndexMap<String, Vec<RunDump>>>>,
}

/// Counts reported by [`Bidsmap::count_runs`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub total: usize,
    pub template: usize,
    pub unchecked: usize,
}

/// Findings of [`Bidsmap::check_sanity`]
#[derive(Debug, Default)]
pub struct SanityReport {
    /// Provenance files that validated more than one run
    pub provenance_duplicates: IndexMap<PathBuf, usize>,
    /// Example names produced by more than one run
    pub example_duplicates: IndexMap<String, usize>,
}

/// The loaded rule set
#[derive(Debug, Default)]
pub struct Bidsmap {
    pub options: Options,
    pub plugins: Option<Plugins>,
    modules: IndexMap<String, IndexMap<String, IndexMap<String, Vec<Run>>>>,
}

impl Bidsmap {
    pub fn new() -> Self {
        Self {
            options: Options::default(),
            ..Self::default()
        }
    }

    /// Load a map from its YAML file. Every spec and template is
    /// compiled here, so a malformed entry fails the load instead of
    /// producing silent mismatches later.
    pub fn load(path: &Path) -> Result<Bidsmap> {
        let text = fs::read_to_string(path).map_err(|e| BidsError::io(path, e))?;
        let doc: BidsmapDoc = serde_yaml::from_str(&text).map_err(|e| {
            BidsError::configuration(format!(
                "failed to parse bidsmap '{}': {e}",
                path.display()
            ))
        })?;
        if doc.options.version.as_deref() != Some(MAP_VERSION) {
            tracing::warn!(
                "{}: written with schema version {:?}, this is {}",
                path.display(),
                doc.options.version,
                MAP_VERSION
            );
        }
        let mut modules = IndexMap::new();
        for (module, formats) in doc.modules {
            let mut format_map = IndexMap::new();
            for (format, modalities) in formats {
                let mut modality_map = IndexMap::new();
                for (modality, dumps) in modalities {
                    let mut runs = Vec::with_capacity(dumps.len());
                    for (index, dump) in dumps.into_iter().enumerate() {
                        let run = Run::from_dump(&modality, dump).map_err(|e| {
                            BidsError::configuration(format!(
                                "malformed run {module}/{format}/{modality}[{index}]: {e}"
                            ))
                        })?;
                        runs.push(run);
                    }
                    modality_map.insert(modality, runs);
                }
                format_map.insert(format, modality_map);
            }
            modules.insert(module, format_map);
        }
        Ok(Bidsmap {
            options: doc.options,
            plugins: doc.plugins,
            modules,
        })
    }

    /// Write the map atomically: serialize next to the target, then
    /// rename over it.
    pub fn save(&self, path: &Path, empty_attributes: bool) -> Result<()> {
        tracing::info!("writing bidsmap to {}", path.display());
        let mut doc = BidsmapDoc {
            options: self.options.clone(),
            plugins: self.plugins.clone(),
            modules: IndexMap::new(),
        };
        doc.options.version = Some(MAP_VERSION.to_string());
        for (module, formats) in &self.modules {
            let mut format_map = IndexMap::new();
            for (format, modalities) in formats {
                let mut modality_map = IndexMap::new();
                for (modality, runs) in modalities {
                    if runs.is_empty() {
                        continue;
                    }
                    modality_map.insert(
                        modality.clone(),
                        runs.iter().map(|r| r.dump(empty_attributes)).collect(),
                    );
                }
                if !modality_map.is_empty() {
                    format_map.insert(format.clone(), modality_map);
                }
            }
            if !format_map.is_empty() {
                doc.modules.insert(module.clone(), format_map);
            }
        }
        let text = serde_yaml::to_string(&doc).map_err(|e| {
            BidsError::configuration(format!("failed to serialize bidsmap: {e}"))
        })?;
        let tmp = path.with_extension("yaml.tmp");
        fs::write(&tmp, text).map_err(|e| BidsError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| BidsError::io(path, e))?;
        Ok(())
    }

    /// Modality run lists registered for a (module, format) pair
    pub fn runs_for(&self, module: &str, format: &str) -> Option<&IndexMap<String, Vec<Run>>> {
        self.modules.get(module).and_then(|m| m.get(format))
    }

    pub fn runs_for_mut(
        &mut self,
        module: &str,
        format: &str,
    ) -> Option<&mut IndexMap<String, Vec<Run>>> {
        self.modules.get_mut(module).and_then(|m| m.get_mut(format))
    }

    pub fn run_at(
        &self,
        module: &str,
        format: &str,
        modality: &str,
        index: usize,
    ) -> Option<&Run> {
        self.runs_for(module, format)
            .and_then(|m| m.get(modality))
            .and_then(|runs| runs.get(index))
    }

    /// Append a run under its own modality for the given module and
    /// format, creating the sections if needed. Returns the
    /// (modality, index) position of the inserted run.
    pub fn add_run(&mut self, module: &str, format: &str, run: Run) -> (String, usize) {
        let modality = run.modality().to_string();
        let runs = self
            .modules
            .entry(module.to_string())
            .or_default()
            .entry(format.to_string())
            .or_default()
            .entry(modality.clone())
            .or_default();
        runs.push(run);
        (modality, runs.len() - 1)
    }

    /// Count runs, template runs and unchecked runs, for one module or
    /// (with `None`) the whole map
    pub fn count_runs(&self, module: Option<&str>) -> RunCounts {
        let mut counts = RunCounts::default();
        for (name, formats) in &self.modules {
            if let Some(only) = module
                && name != only
            {
                continue;
            }
            for modalities in formats.values() {
                for runs in modalities.values() {
                    for run in runs {
                        counts.total += 1;
                        if run.template {
                            counts.template += 1;
                        }
                        if !run.checked {
                            counts.unchecked += 1;
                        }
                    }
                }
            }
        }
        counts
    }

    /// Scan the map for suspicious entries: several runs validated by
    /// one provenance file, several runs producing the same example
    /// name, runs without provenance or suffix. Warnings are logged;
    /// the duplicate counters are returned.
    pub fn check_sanity(&self) -> SanityReport {
        let mut provenance: IndexMap<PathBuf, usize> = IndexMap::new();
        let mut examples: IndexMap<String, usize> = IndexMap::new();
        for (module, formats) in &self.modules {
            for (format, modalities) in formats {
                for (modality, runs) in modalities {
                    if modality == crate::run::IGNORE_MODALITY {
                        continue;
                    }
                    for (index, run) in runs.iter().enumerate() {
                        if !run.has_suffix() {
                            tracing::warn!(
                                "{module}/{format}/{modality}[{index}]: suffix not defined"
                            );
                            continue;
                        }
                        if run.example.is_none() {
                            tracing::warn!(
                                "{module}/{format}/{modality}[{index}]: no matched recordings"
                            );
                            continue;
                        }
                        if let Some(prov) = &run.provenance {
                            *provenance.entry(prov.clone()).or_insert(0) += 1;
                        }
                        if let Some(example) = &run.example {
                            *examples.entry(example.clone()).or_insert(0) += 1;
                        }
                    }
                }
            }
        }
        SanityReport {
            provenance_duplicates: provenance.into_iter().filter(|(_, n)| *n > 1).collect(),
            example_duplicates: examples.into_iter().filter(|(_, n)| *n > 1).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::SpecValue;
    use tempfile::TempDir;

    const MAP: &str = r#"
Options:
  version: "0.1.0"
  ignore:
    - localizer
MRI:
  attr_dump:
    func:
      - provenance: /data/sub-001/f1.json
        checked: true
        suffix: bold
        attributes:
          SequenceName: epfid2d1rs
          ProtocolName: null
        bids:
          task: "<ProtocolName>"
          run: "<<run>>"
        json:
          EchoTime: "<EchoTime>"
          SliceTiming:
            - "<SliceTime0>"
            - "<SliceTime1>"
      - suffix: sbref
        attributes:
          SequenceName: ["epfid2d1rs", "fm2d2r"]
        bids:
          task: "<ProtocolName>"
    anat:
      - suffix: T1w
        template: true
        attributes:
          SequenceName: "tfl3d1*"
        bids:
          acq: null
"#;

    fn load_str(text: &str) -> Bidsmap {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bidsmap.yaml");
        std::fs::write(&path, text).unwrap();
        Bidsmap::load(&path).unwrap()
    }

    #[test]
    fn loads_nested_structure() {
        let map = load_str(MAP);
        let modalities = map.runs_for("MRI", "attr_dump").unwrap();
        assert_eq!(modalities["func"].len(), 2);
        assert_eq!(modalities["anat"].len(), 1);
        assert!(map.runs_for("EEG", "attr_dump").is_none());
        assert_eq!(map.options.ignore, vec!["localizer"]);
    }

    #[test]
    fn count_runs_tracks_template_and_unchecked() {
        let map = load_str(MAP);
        let counts = map.count_runs(None);
        assert_eq!(
            counts,
            RunCounts {
                total: 3,
                template: 1,
                unchecked: 2
            }
        );
        assert_eq!(map.count_runs(Some("EEG")), RunCounts::default());
    }

    #[test]
    fn round_trip_preserves_runs() {
        let map = load_str(MAP);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.yaml");
        map.save(&path, true).unwrap();
        let reloaded = Bidsmap::load(&path).unwrap();

        let before = map.run_at("MRI", "attr_dump", "func", 0).unwrap();
        let after = reloaded.run_at("MRI", "attr_dump", "func", 0).unwrap();
        let d1 = before.dump(true);
        let d2 = after.dump(true);
        assert_eq!(d1.provenance, d2.provenance);
        assert_eq!(d1.checked, d2.checked);
        assert_eq!(d1.suffix, d2.suffix);
        assert_eq!(d1.attributes, d2.attributes);
        assert_eq!(d1.bids, d2.bids);
        assert_eq!(d1.json, d2.json);

        let b2 = map.run_at("MRI", "attr_dump", "anat", 0).unwrap();
        let a2 = reloaded.run_at("MRI", "attr_dump", "anat", 0).unwrap();
        assert_eq!(b2.template, a2.template);
        assert_eq!(b2.dump(true).attributes, a2.dump(true).attributes);
    }

    #[test]
    fn malformed_pattern_fails_load() {
        let bad = r#"
MRI:
  attr_dump:
    func:
      - suffix: bold
        attributes:
          SequenceName: "epfid[2d"
"#;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, bad).unwrap();
        let err = Bidsmap::load(&path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn add_run_appends_in_priority_order() {
        let mut map = Bidsmap::new();
        let mut dump = RunDump {
            suffix: "bold".to_string(),
            ..Default::default()
        };
        dump.attributes
            .insert("SequenceName".to_string(), Some(SpecValue::from("a")));
        let run = Run::from_dump("func", dump).unwrap();
        let (modality, index) = map.add_run("MRI", "attr_dump", run.clone());
        assert_eq!((modality.as_str(), index), ("func", 0));
        let (_, index) = map.add_run("MRI", "attr_dump", run);
        assert_eq!(index, 1);
    }

    #[test]
    fn sanity_reports_duplicate_provenance() {
        let mut map = Bidsmap::new();
        for _ in 0..2 {
            let mut dump = RunDump {
                suffix: "bold".to_string(),
                provenance: Some(PathBuf::from("/data/f1.json")),
                example: Some("func/sub-001_task-rest_bold".to_string()),
                ..Default::default()
            };
            dump.attributes
                .insert("SequenceName".to_string(), Some(SpecValue::from("a")));
            map.add_run("MRI", "attr_dump", Run::from_dump("func", dump).unwrap());
        }
        let report = map.check_sanity();
        assert_eq!(
            report.provenance_duplicates.get(Path::new("/data/f1.json")),
            Some(&2)
        );
        assert_eq!(
            report
                .example_duplicates
                .get("func/sub-001_task-rest_bold"),
            Some(&2)
        );
    }
}
