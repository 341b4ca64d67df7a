//! Stable class names for the labels a model is trained on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use super::TagCodec;
use crate::annotation::Tags;
use crate::error::CompographError;

/// The sorted, de-duplicated labels of a training set.
///
/// External engines see class names `C0001`, `C0002`, ... instead of raw
/// labels, so labels may contain characters the engine cannot handle. The
/// map is deterministic: the same label set always yields the same names.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMap {
    labels: Vec<String>,
}

impl LabelMap {
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = labels.into_iter().map(Into::into).collect();
        Self {
            labels: set.into_iter().collect(),
        }
    }

    /// Collects every label the codec produces for the given tag dictionaries.
    /// Dictionaries with no label are skipped.
    pub fn collect<'a>(codec: &TagCodec, tags: impl IntoIterator<Item = &'a Tags>) -> Self {
        Self::from_labels(tags.into_iter().filter_map(|t| codec.encode(t)))
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels
            .binary_search_by(|probe| probe.as_str().cmp(label))
            .ok()
    }

    /// Class name for the label at `index`.
    pub fn class_name(index: usize) -> String {
        format!("C{:04}", index + 1)
    }

    pub fn class_for_label(&self, label: &str) -> Option<String> {
        self.index_of(label).map(Self::class_name)
    }

    /// Reverse lookup from a class name produced by [`LabelMap::class_name`].
    pub fn label_for_class(&self, class: &str) -> Option<&str> {
        let number: usize = class.strip_prefix('C')?.parse().ok()?;
        self.labels
            .get(number.checked_sub(1)?)
            .map(String::as_str)
    }

    pub fn read(path: &Path) -> Result<Self, CompographError> {
        let file = File::open(path)?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            CompographError::InvalidConfig(format!("label map {}: {}", path.display(), e))
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), CompographError> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self).map_err(CompographError::Serialize)
    }
}
