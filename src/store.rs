//! Annotation storage.
//!
//! [`DirStore`] keeps a dataset in a directory tree:
//!
//! ```text
//! <root>/config.yaml
//! <root>/assemblies/<subset>/<name>.json
//! <root>/assemblies/<subset>/<name>.png
//! <root>/parts/<subset>/<name>.json
//! <root>/parts/<subset>/<name>.png
//! ```
//!
//! Annotation ids are `<subset>/<name>`. Images may be PNG, JPEG or BMP and
//! are only decoded when a model or crop needs their pixels.

use image::ImageFormat;
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::annotation::io_json::{read_assembly, read_part, write_assembly, write_part};
use crate::annotation::{Annotation, Assembly, ImageSource, IsolatedPart, Target};
use crate::error::CompographError;

pub const ASSEMBLY_DIR: &str = "assemblies";
pub const PART_DIR: &str = "parts";

const ANNOTATION_EXTENSION: &str = "json";
const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Supplies and persists annotations.
pub trait AnnotationStore {
    /// Assemblies of one subset, or of every subset, ordered by id.
    fn assemblies(&self, subset: Option<&str>) -> Result<Vec<Assembly>, CompographError>;

    /// Isolated parts of one subset, or of every subset, ordered by id.
    fn parts(&self, subset: Option<&str>) -> Result<Vec<IsolatedPart>, CompographError>;

    fn save(&self, annotation: &Annotation) -> Result<(), CompographError>;

    /// Annotations of the given target.
    fn annotations(
        &self,
        target: Target,
        subset: Option<&str>,
    ) -> Result<Vec<Annotation>, CompographError> {
        Ok(match target {
            Target::Assembly => self
                .assemblies(subset)?
                .into_iter()
                .map(Annotation::from)
                .collect(),
            Target::Part => self.parts(subset)?.into_iter().map(Annotation::from).collect(),
        })
    }
}

/// A dataset directory.
#[derive(Clone, Debug)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn target_dir(&self, target: Target) -> PathBuf {
        match target {
            Target::Assembly => self.root.join(ASSEMBLY_DIR),
            Target::Part => self.root.join(PART_DIR),
        }
    }

    /// Path of the JSON file of annotation `id`.
    pub fn annotation_path(&self, target: Target, id: &str) -> PathBuf {
        self.target_dir(target)
            .join(format!("{}.{}", id, ANNOTATION_EXTENSION))
    }

    /// Every `(id, json, image)` triple of a target, ordered by id.
    fn entries(
        &self,
        target: Target,
        subset: Option<&str>,
    ) -> Result<Vec<(String, PathBuf, ImageSource)>, CompographError> {
        let base = self.target_dir(target);
        let dir = match subset {
            Some(subset) => base.join(subset),
            None => base.clone(),
        };
        if !dir.is_dir() {
            return match subset {
                Some(subset) => Err(CompographError::InvalidConfig(format!(
                    "subset '{}' has no {} directory in {}",
                    subset,
                    target,
                    self.root.display()
                ))),
                None => Ok(Vec::new()),
            };
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&dir).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|e| CompographError::Io(e.into()))?;
            let path = entry.path();
            if !entry.file_type().is_file() || !has_extension(path, &[ANNOTATION_EXTENSION]) {
                continue;
            }
            let Some(id) = annotation_id(&base, path) else {
                continue;
            };
            let image = match find_image(path) {
                Some(image) => ImageSource::from_path(image),
                None => ImageSource::none(),
            };
            entries.push((id, path.to_path_buf(), image));
        }
        debug!(kind = %target, dir = %dir.display(), count = entries.len(), "listed annotations");
        Ok(entries)
    }
}

impl AnnotationStore for DirStore {
    fn assemblies(&self, subset: Option<&str>) -> Result<Vec<Assembly>, CompographError> {
        self.entries(Target::Assembly, subset)?
            .into_iter()
            .map(|(id, path, image)| read_assembly(&path, id, image))
            .collect()
    }

    fn parts(&self, subset: Option<&str>) -> Result<Vec<IsolatedPart>, CompographError> {
        self.entries(Target::Part, subset)?
            .into_iter()
            .map(|(id, path, image)| read_part(&path, id, image))
            .collect()
    }

    /// Writes the annotation's JSON file. In-memory images without a file are
    /// written next to it as PNG.
    fn save(&self, annotation: &Annotation) -> Result<(), CompographError> {
        let path = self.annotation_path(annotation.target(), annotation.id());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match annotation {
            Annotation::Assembly(assembly) => write_assembly(&path, assembly)?,
            Annotation::Part(part) => write_part(&path, part)?,
        }

        let image = annotation.image();
        if image.path().is_none() {
            if let Some(decoded) = image.load()? {
                decoded
                    .save_with_format(path.with_extension("png"), ImageFormat::Png)
                    .map_err(CompographError::ImageEncode)?;
            }
        }
        debug!(id = annotation.id(), path = %path.display(), "saved annotation");
        Ok(())
    }
}

/// Keeps the annotations assigned to one of `folds`. Annotations without a
/// fold are dropped.
pub fn filter_folds(annotations: Vec<Annotation>, folds: &[u32]) -> Vec<Annotation> {
    annotations
        .into_iter()
        .filter(|a| a.fold().is_some_and(|fold| folds.contains(&fold)))
        .collect()
}

/// Shuffles with a seeded RNG, then deals folds out round-robin.
pub fn split_folds(annotations: &mut [Annotation], folds: u32, seed: u64) {
    if folds == 0 {
        return;
    }
    let mut order: Vec<usize> = (0..annotations.len()).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);
    for (position, index) in order.into_iter().enumerate() {
        annotations[index].set_fold(Some((position % folds as usize) as u32));
    }
}

fn annotation_id(base: &Path, json: &Path) -> Option<String> {
    let relative = json.strip_prefix(base).ok()?.with_extension("");
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn find_image(json: &Path) -> Option<PathBuf> {
    IMAGE_EXTENSIONS
        .iter()
        .map(|ext| json.with_extension(ext))
        .find(|candidate| candidate.is_file())
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| allowed.iter().any(|a| a.eq_ignore_ascii_case(ext)))
}
