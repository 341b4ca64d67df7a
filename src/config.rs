//! Dataset configuration.
//!
//! A dataset directory holds a `config.yaml` describing its tag schema, fold
//! layout, models and pipelines:
//!
//! ```yaml
//! title: Sample
//! part_tags: [CLASS, SHAPE]
//! assembly_tags: [TYPE]
//! meta_tags: [author]
//! folds: 10
//! train_folds: [0, 1, 2, 3, 4, 5, 6, 7]
//! test_folds: [8, 9]
//! defaults:
//!   join: "_"
//!   threshold: 0.5
//! models:
//!   detector: {task: detect, tag: CLASS, command: "./detect.sh"}
//! pipelines:
//!   full: {detect: detector, classify: {criterion: CLASS, "*": classifier}}
//! evaluation:
//!   match_threshold: 0.2
//! ```
//!
//! The file is read once into a [`DatasetConfig`]. Model entries are merged
//! with the built-in defaults and the `defaults` section at load time, and
//! the result is never mutated afterwards.

use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::codec::{TagCodec, TagSelector};
use crate::error::CompographError;
use crate::matching::DEFAULT_MATCH_THRESHOLD;
use crate::model::Task;

/// Name of the configuration file inside a dataset directory.
pub const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_FOLDS: u32 = 10;
const DEFAULT_JOIN: &str = "";
const DEFAULT_THRESHOLD: f64 = 0.5;

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    part_tags: Vec<String>,
    #[serde(default)]
    assembly_tags: Vec<String>,
    #[serde(default)]
    meta_tags: Vec<String>,
    #[serde(default)]
    folds: Option<u32>,
    #[serde(default)]
    train_folds: Option<Vec<u32>>,
    #[serde(default)]
    test_folds: Option<Vec<u32>>,
    #[serde(default)]
    defaults: RawDefaults,
    #[serde(default)]
    models: BTreeMap<String, RawModel>,
    #[serde(default)]
    pipelines: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    evaluation: RawEvaluation,
}

#[derive(Debug, Default, Deserialize)]
struct RawDefaults {
    join: Option<String>,
    threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEvaluation {
    match_threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawModel {
    task: Option<Task>,
    /// `None` when the key is absent; an explicit `~` is `Some(Empty)`.
    #[serde(default, deserialize_with = "present_tag")]
    tag: Option<TagSelector>,
    join: Option<String>,
    threshold: Option<f64>,
    #[serde(default)]
    command: Option<CommandSpec>,
    weights: Option<PathBuf>,
    label_map: Option<PathBuf>,
    subsets: Option<Vec<String>>,
}

fn present_tag<'de, D>(deserializer: D) -> Result<Option<TagSelector>, D::Error>
where
    D: Deserializer<'de>,
{
    TagSelector::deserialize(deserializer).map(Some)
}

/// A command line, either run through `sh -c` or given as an argv list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandSpec {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    fn into_argv(self) -> Vec<String> {
        match self {
            CommandSpec::Shell(line) => vec!["sh".into(), "-c".into(), line],
            CommandSpec::Argv(argv) => argv,
        }
    }
}

/// Resolved settings of one configured model.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelConfig {
    pub task: Task,
    pub tag: TagSelector,
    pub join: String,
    /// Predictions below this confidence are dropped.
    pub threshold: f64,
    /// Command run per image; empty when the model is provided in code.
    pub command: Vec<String>,
    pub weights: Option<PathBuf>,
    pub label_map: Option<PathBuf>,
    /// Subsets the model is trained on; `None` means all of them.
    pub subsets: Option<Vec<String>>,
}

impl ModelConfig {
    pub fn codec(&self) -> TagCodec {
        TagCodec::new(self.tag.clone(), self.join.clone())
    }
}

/// The immutable configuration of one dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct DatasetConfig {
    /// Dataset directory; relative paths in the file are resolved against it.
    pub root: PathBuf,
    pub title: String,
    pub description: String,
    pub part_tags: Vec<String>,
    pub assembly_tags: Vec<String>,
    pub meta_tags: Vec<String>,
    pub folds: u32,
    pub train_folds: Vec<u32>,
    pub test_folds: Vec<u32>,
    pub models: BTreeMap<String, ModelConfig>,
    pub pipelines: BTreeMap<String, serde_yaml::Value>,
    pub match_threshold: f64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        let (train_folds, test_folds) = default_fold_split(DEFAULT_FOLDS);
        Self {
            root: PathBuf::from("."),
            title: String::new(),
            description: String::new(),
            part_tags: Vec::new(),
            assembly_tags: Vec::new(),
            meta_tags: Vec::new(),
            folds: DEFAULT_FOLDS,
            train_folds,
            test_folds,
            models: BTreeMap::new(),
            pipelines: BTreeMap::new(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl DatasetConfig {
    /// Loads `config.yaml` from a dataset directory.
    pub fn load(root: &Path) -> Result<Self, CompographError> {
        let path = root.join(CONFIG_FILE);
        let text = fs::read_to_string(&path)?;
        let raw: RawConfig =
            serde_yaml::from_str(&text).map_err(|source| CompographError::ConfigParse {
                path: path.clone(),
                source,
            })?;
        Self::resolve(raw, root)
    }

    /// Parses a configuration from a YAML string, resolving paths against `root`.
    pub fn from_yaml_str(yaml: &str, root: &Path) -> Result<Self, CompographError> {
        let raw: RawConfig =
            serde_yaml::from_str(yaml).map_err(|source| CompographError::ConfigParse {
                path: root.join(CONFIG_FILE),
                source,
            })?;
        Self::resolve(raw, root)
    }

    fn resolve(raw: RawConfig, root: &Path) -> Result<Self, CompographError> {
        let folds = raw.folds.unwrap_or(DEFAULT_FOLDS);
        if folds == 0 {
            return Err(CompographError::InvalidConfig(
                "'folds' must be at least 1".into(),
            ));
        }
        let (default_train, default_test) = default_fold_split(folds);
        let train_folds = raw.train_folds.unwrap_or(default_train);
        let test_folds = raw.test_folds.unwrap_or(default_test);
        if let Some(bad) = train_folds.iter().chain(&test_folds).find(|f| **f >= folds) {
            return Err(CompographError::InvalidConfig(format!(
                "fold {} is out of range (there are {} folds)",
                bad, folds
            )));
        }

        let match_threshold = raw
            .evaluation
            .match_threshold
            .unwrap_or(DEFAULT_MATCH_THRESHOLD);
        check_unit_interval("evaluation.match_threshold", match_threshold)?;

        let defaults = raw.defaults;
        let mut models = BTreeMap::new();
        for (name, model) in raw.models {
            let resolved = resolve_model(&name, model, &defaults, &raw.part_tags, root)?;
            models.insert(name, resolved);
        }

        Ok(Self {
            root: root.to_path_buf(),
            title: raw.title,
            description: raw.description,
            part_tags: raw.part_tags,
            assembly_tags: raw.assembly_tags,
            meta_tags: raw.meta_tags,
            folds,
            train_folds,
            test_folds,
            models,
            pipelines: raw.pipelines,
            match_threshold,
        })
    }

    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name)
    }

    pub fn pipeline(&self, name: &str) -> Option<&serde_yaml::Value> {
        self.pipelines.get(name)
    }

    /// Returns true if `key` is a configured part or assembly tag.
    pub fn is_tag_key(&self, key: &str) -> bool {
        self.part_tags.iter().chain(&self.assembly_tags).any(|k| k == key)
    }

    pub fn is_meta_key(&self, key: &str) -> bool {
        self.meta_tags.iter().any(|k| k == key)
    }

    /// Codec on the first part tag, used when no model or tag is given.
    pub fn default_codec(&self) -> TagCodec {
        match self.part_tags.first() {
            Some(key) => TagCodec::single(key.as_str()),
            None => TagCodec::default(),
        }
    }

    /// The folds evaluated by default (`test_folds`), or the training folds.
    pub fn evaluation_folds(&self, on_train: bool) -> &[u32] {
        if on_train {
            &self.train_folds
        } else {
            &self.test_folds
        }
    }
}

fn resolve_model(
    name: &str,
    raw: RawModel,
    defaults: &RawDefaults,
    part_tags: &[String],
    root: &Path,
) -> Result<ModelConfig, CompographError> {
    let task = raw
        .task
        .ok_or_else(|| CompographError::InvalidConfig(format!("model '{}' has no task", name)))?;

    let tag = match raw.tag {
        Some(tag) => tag,
        None => match part_tags.first() {
            Some(first) => TagSelector::Single(first.clone()),
            None => TagSelector::Empty,
        },
    };
    if let Some(missing) = tag.keys().iter().find(|k| !part_tags.contains(*k)) {
        return Err(CompographError::InvalidConfig(format!(
            "Tag '{}' (chosen for model '{}') does not exist in the dataset",
            missing, name
        )));
    }

    let threshold = raw
        .threshold
        .or(defaults.threshold)
        .unwrap_or(DEFAULT_THRESHOLD);
    check_unit_interval(&format!("models.{}.threshold", name), threshold)?;

    let command = match raw.command {
        Some(spec) => {
            let argv = spec.into_argv();
            if argv.is_empty() {
                return Err(CompographError::InvalidConfig(format!(
                    "model '{}' has an empty command",
                    name
                )));
            }
            argv
        }
        None => Vec::new(),
    };

    Ok(ModelConfig {
        task,
        tag,
        join: raw
            .join
            .or_else(|| defaults.join.clone())
            .unwrap_or_else(|| DEFAULT_JOIN.to_string()),
        threshold,
        command,
        weights: raw.weights.map(|p| root.join(p)),
        label_map: raw.label_map.map(|p| root.join(p)),
        subsets: raw.subsets,
    })
}

fn check_unit_interval(field: &str, value: f64) -> Result<(), CompographError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(CompographError::InvalidConfig(format!(
            "'{}' must be between 0 and 1, got {}",
            field, value
        )))
    }
}

/// The first 80% of folds train and the rest test, keeping at least one
/// test fold when there are two or more folds.
fn default_fold_split(folds: u32) -> (Vec<u32>, Vec<u32>) {
    let train = ((folds * 8) / 10).clamp(1, folds.saturating_sub(1).max(1));
    ((0..train).collect(), (train..folds).collect())
}
