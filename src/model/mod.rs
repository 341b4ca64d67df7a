//! The boundary to external detection and classification engines.
//!
//! A [`ModelAdapter`] hides a concrete engine behind `predict`. The default
//! [`ModelAdapter::auto_annotate`] writes predictions back onto a
//! [`Subject`] through the adapter's [`TagCodec`], so engines only ever see
//! and produce flat labels.

mod command;

pub use command::CommandModel;

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use crate::annotation::{BBox, ImageInput, Normalized, Part, Subject, Target, CONFIDENCE_KEY};
use crate::codec::TagCodec;
use crate::error::CompographError;
use crate::matching::HasBox;

/// What a model does with an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    /// Finds parts in an assembly image.
    Detect,
    /// Labels a single part image.
    Classify,
}

impl Task {
    /// The kind of value this task annotates.
    pub fn target(&self) -> Target {
        match self {
            Task::Detect => Target::Assembly,
            Task::Classify => Target::Part,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Detect => f.write_str("detect"),
            Task::Classify => f.write_str("classify"),
        }
    }
}

/// One output of a model. Detection predictions carry a normalized box.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(alias = "name", alias = "tag")]
    pub label: String,
    pub confidence: f64,
    #[serde(default, rename = "box", skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BBox<Normalized>>,
}

impl Prediction {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox: None,
        }
    }

    pub fn with_bbox(mut self, bbox: BBox<Normalized>) -> Self {
        self.bbox = Some(bbox);
        self
    }
}

impl HasBox for Prediction {
    fn bbox(&self) -> Option<BBox<Normalized>> {
        self.bbox
    }
}

/// A trained engine that can predict on images.
///
/// `predict` must be idempotent and free of side effects. Adapters are shared
/// across evaluation workers, hence `Send + Sync`.
pub trait ModelAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn task(&self) -> Task;

    /// How labels map onto tags for this model.
    fn codec(&self) -> &TagCodec;

    fn is_trained(&self) -> bool;

    fn predict(&self, image: &ImageInput<'_>) -> Result<Vec<Prediction>, CompographError>;

    fn target(&self) -> Target {
        self.task().target()
    }

    /// Predicts on the subject's image and writes the result back.
    ///
    /// Detection replaces the assembly's parts (and so its relations) with
    /// one part per boxed prediction. Classification applies the label of
    /// the most confident prediction, leaving the subject untouched when
    /// there is none.
    fn auto_annotate(&self, subject: &mut Subject<'_>) -> Result<(), CompographError> {
        auto_annotate(self, subject)
    }
}

/// The default [`ModelAdapter::auto_annotate`], usable from overriding impls.
pub fn auto_annotate<M: ModelAdapter + ?Sized>(
    model: &M,
    subject: &mut Subject<'_>,
) -> Result<(), CompographError> {
    if !model.is_trained() {
        return Err(CompographError::ModelNotTrained {
            model: model.name().to_string(),
        });
    }
    if subject.target() != model.target() {
        return Err(CompographError::TargetMismatch {
            pipeline: model.name().to_string(),
            step: subject.id().to_string(),
            expected: model.target(),
            found: subject.target(),
        });
    }

    let predictions = model.predict(&subject.image_input())?;
    debug!(
        model = model.name(),
        id = subject.id(),
        predictions = predictions.len(),
        "predicted"
    );

    match model.task() {
        Task::Detect => {
            let codec = model.codec();
            let mut parts = Vec::with_capacity(predictions.len());
            for prediction in predictions {
                let Some(bbox) = prediction.bbox else {
                    warn!(
                        model = model.name(),
                        label = %prediction.label,
                        "detection without a box ignored"
                    );
                    continue;
                };
                let mut part = Part::new(bbox.clamped()).with_tags(codec.decode(&prediction.label));
                part.meta
                    .insert(CONFIDENCE_KEY, prediction.confidence.to_string());
                parts.push(part);
            }
            if let Some(assembly) = subject.as_assembly_mut() {
                assembly.replace_parts(parts);
            }
        }
        Task::Classify => {
            if let Some(best) = most_confident(&predictions) {
                model.codec().apply(subject.tags_mut(), &best.label);
                subject.set_confidence(best.confidence);
            }
        }
    }
    Ok(())
}

/// The highest-confidence prediction; the first one wins ties.
pub fn most_confident(predictions: &[Prediction]) -> Option<&Prediction> {
    predictions.iter().fold(None, |best, p| match best {
        Some(b) if b.confidence.total_cmp(&p.confidence).is_ge() => Some(b),
        _ => Some(p),
    })
}
