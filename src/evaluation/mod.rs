//! Evaluation of pipelines against annotated ground truth.
//!
//! Each annotation is copied, stripped of what the pipeline is expected to
//! produce, run through the pipeline and compared with the original. The
//! comparison yields `(prediction, truth)` label pairs that are folded into
//! a [`Stats`] aggregate:
//!
//! - Detection pipelines start from an assembly without parts; predicted
//!   parts are paired with the true ones by [`greedy_match`].
//! - Classification pipelines start from values whose codec keys have been
//!   cleared; labels are compared per part (or for the isolated part).
//!
//! Annotations are independent, so [`evaluate_batch`] runs them on the rayon
//! thread pool and folds the results in input order.

mod record;
mod report;

pub use record::{Observation, PredictionWriter};
pub use report::{Accuracy, ClassScores, EvaluationReport, OVERALL};

use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::annotation::{Annotation, Assembly, IsolatedPart, Part, Subject, CONFIDENCE_KEY};
use crate::codec::TagCodec;
use crate::error::CompographError;
use crate::matching::{greedy_match, DEFAULT_MATCH_THRESHOLD};
use crate::pipeline::Pipeline;
use report::safe_divide;

/// Incremental precision/recall counters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stats {
    true_positives: BTreeMap<String, usize>,
    false_positives: BTreeMap<String, usize>,
    false_negatives: BTreeMap<String, usize>,
    labels: BTreeSet<String>,
    observations: usize,
    hits: usize,
    detections: usize,
    correct: usize,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one observation.
    ///
    /// Observations without a truth label are ignored. A missing prediction
    /// is a false negative of the truth label; a wrong one is additionally a
    /// false positive of the predicted label.
    pub fn register(&mut self, prediction: Option<&str>, truth: Option<&str>) {
        let Some(truth) = truth else {
            return;
        };
        self.observations += 1;
        self.labels.insert(truth.to_string());

        match prediction {
            None => bump(&mut self.false_negatives, truth),
            Some(predicted) => {
                self.detections += 1;
                self.labels.insert(predicted.to_string());
                if predicted == truth {
                    self.hits += 1;
                    self.correct += 1;
                    bump(&mut self.true_positives, truth);
                } else {
                    bump(&mut self.false_positives, predicted);
                    bump(&mut self.false_negatives, truth);
                }
            }
        }
    }

    /// Adds the counters of another aggregate.
    pub fn merge(&mut self, other: Stats) {
        for (ours, theirs) in [
            (&mut self.true_positives, other.true_positives),
            (&mut self.false_positives, other.false_positives),
            (&mut self.false_negatives, other.false_negatives),
        ] {
            for (label, n) in theirs {
                *ours.entry(label).or_default() += n;
            }
        }
        self.labels.extend(other.labels);
        self.observations += other.observations;
        self.hits += other.hits;
        self.detections += other.detections;
        self.correct += other.correct;
    }

    pub fn observations(&self) -> usize {
        self.observations
    }

    pub fn get_results(&self) -> EvaluationReport {
        let count = |map: &BTreeMap<String, usize>, label: &str| map.get(label).copied().unwrap_or(0);

        let mut classes = BTreeMap::new();
        let (mut total_tp, mut total_fp, mut total_fn) = (0, 0, 0);
        for label in &self.labels {
            let tp = count(&self.true_positives, label);
            let fp = count(&self.false_positives, label);
            let fn_ = count(&self.false_negatives, label);
            total_tp += tp;
            total_fp += fp;
            total_fn += fn_;
            classes.insert(label.clone(), ClassScores::from_counts(tp, fp, fn_));
        }

        let observations = self.observations as f64;
        EvaluationReport {
            classes,
            overall: ClassScores::from_counts(total_tp, total_fp, total_fn),
            accuracy: Accuracy {
                overall: safe_divide(self.hits as f64, observations),
                detection: safe_divide(self.detections as f64, observations),
                classification: safe_divide(self.correct as f64, self.detections as f64),
            },
            observations: self.observations,
        }
    }
}

fn bump(map: &mut BTreeMap<String, usize>, label: &str) {
    *map.entry(label.to_string()).or_default() += 1;
}

/// Settings shared by every evaluated annotation.
#[derive(Clone, Debug)]
pub struct EvaluationOptions {
    /// Turns tags into the labels that are compared.
    pub codec: TagCodec,
    /// Minimum IoU for a predicted part to match a true one.
    pub match_threshold: f64,
    /// Keep one [`Observation`] per registered pair.
    pub record: bool,
    /// Evaluate on the calling thread only.
    pub sequential: bool,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            codec: TagCodec::default(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            record: false,
            sequential: false,
        }
    }
}

/// Counters and records of one evaluated annotation.
#[derive(Clone, Debug, Default)]
pub struct AnnotationOutcome {
    pub stats: Stats,
    pub observations: Vec<Observation>,
}

impl AnnotationOutcome {
    fn register(
        &mut self,
        options: &EvaluationOptions,
        prediction: Option<String>,
        truth: Option<String>,
        image: &str,
        confidence: Option<f64>,
        iou: Option<f64>,
    ) {
        self.stats.register(prediction.as_deref(), truth.as_deref());
        if options.record {
            self.observations.push(Observation {
                prediction,
                truth,
                image: image.to_string(),
                confidence,
                iou,
            });
        }
    }
}

/// Runs the pipeline on a stripped copy of `truth` and compares.
pub fn evaluate_annotation(
    pipeline: &Pipeline,
    truth: &Annotation,
    options: &EvaluationOptions,
) -> Result<AnnotationOutcome, CompographError> {
    let outcome = match truth {
        Annotation::Assembly(expected) if pipeline.detects() => {
            evaluate_detection(pipeline, expected, options)?
        }
        Annotation::Assembly(expected) => evaluate_assembly_parts(pipeline, expected, options)?,
        Annotation::Part(expected) => evaluate_isolated(pipeline, expected, options)?,
    };
    debug!(
        id = truth.id(),
        observations = outcome.stats.observations(),
        "evaluated"
    );
    Ok(outcome)
}

fn evaluate_detection(
    pipeline: &Pipeline,
    expected: &Assembly,
    options: &EvaluationOptions,
) -> Result<AnnotationOutcome, CompographError> {
    let codec = &options.codec;
    let mut predicted = expected.clone();
    predicted.clear_parts();
    pipeline.run(&mut Subject::Assembly(&mut predicted))?;

    let mut outcome = AnnotationOutcome::default();
    let matches = greedy_match(
        predicted.parts().map(|(_, p)| p),
        expected.parts().map(|(_, p)| p),
        options.match_threshold,
    );
    for m in matches {
        outcome.register(
            options,
            m.predicted().and_then(|p| codec.encode(&p.tags)),
            m.truth().and_then(|t| codec.encode(&t.tags)),
            &expected.id,
            m.predicted().and_then(Part::confidence),
            Some(m.score()),
        );
    }
    Ok(outcome)
}

/// Classification of the parts of an assembly; parts are paired by id.
fn evaluate_assembly_parts(
    pipeline: &Pipeline,
    expected: &Assembly,
    options: &EvaluationOptions,
) -> Result<AnnotationOutcome, CompographError> {
    let codec = &options.codec;
    let mut predicted = expected.clone();
    for mut part in predicted.part_subjects() {
        strip(codec, &mut part);
    }
    pipeline.run(&mut Subject::Assembly(&mut predicted))?;

    let mut outcome = AnnotationOutcome::default();
    for (id, true_part) in expected.parts() {
        let predicted_part = predicted.part(id);
        outcome.register(
            options,
            predicted_part.and_then(|p| codec.encode(&p.tags)),
            codec.encode(&true_part.tags),
            &expected.id,
            predicted_part.and_then(Part::confidence),
            None,
        );
    }
    Ok(outcome)
}

fn evaluate_isolated(
    pipeline: &Pipeline,
    expected: &IsolatedPart,
    options: &EvaluationOptions,
) -> Result<AnnotationOutcome, CompographError> {
    let codec = &options.codec;
    let mut predicted = expected.clone();
    let mut subject = Subject::Isolated(&mut predicted);
    strip(codec, &mut subject);
    pipeline.run(&mut subject)?;

    let mut outcome = AnnotationOutcome::default();
    outcome.register(
        options,
        codec.encode(&predicted.tags),
        codec.encode(&expected.tags),
        &expected.id,
        predicted.confidence(),
        None,
    );
    Ok(outcome)
}

fn strip(codec: &TagCodec, subject: &mut Subject<'_>) {
    codec.clear(subject.tags_mut());
    subject.meta_mut().remove(CONFIDENCE_KEY);
}

/// Aggregate result of [`evaluate_batch`].
#[derive(Clone, Debug, Default)]
pub struct BatchResult {
    pub stats: Stats,
    /// Observations in input order; empty unless recording was requested.
    pub observations: Vec<Observation>,
    pub evaluated: usize,
    pub skipped: usize,
}

/// Evaluates every annotation and folds the outcomes in input order.
///
/// Model failures abort the whole batch. Any other failure only skips the
/// annotation it happened on.
pub fn evaluate_batch(
    pipeline: &Pipeline,
    annotations: &[Annotation],
    options: &EvaluationOptions,
) -> Result<BatchResult, CompographError> {
    let evaluate = |annotation: &Annotation| -> Result<Option<AnnotationOutcome>, CompographError> {
        match evaluate_annotation(pipeline, annotation, options) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(id = annotation.id(), error = %e, "annotation skipped");
                Ok(None)
            }
        }
    };

    let outcomes: Vec<Option<AnnotationOutcome>> = if options.sequential {
        annotations.iter().map(evaluate).collect::<Result<_, _>>()?
    } else {
        annotations.par_iter().map(evaluate).collect::<Result<_, _>>()?
    };

    let mut result = BatchResult::default();
    for outcome in outcomes {
        match outcome {
            Some(outcome) => {
                result.stats.merge(outcome.stats);
                result.observations.extend(outcome.observations);
                result.evaluated += 1;
            }
            None => result.skipped += 1,
        }
    }
    info!(
        pipeline = pipeline.name(),
        evaluated = result.evaluated,
        skipped = result.skipped,
        observations = result.stats.observations(),
        "evaluation finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{BBox, ImageSource, Tags, Target};
    use crate::config::DatasetConfig;
    use crate::model::testing::FixedModel;
    use crate::model::{Prediction, Task};
    use crate::pipeline::{Function, Node};
    use std::sync::Arc;

    fn model_pipeline(model: FixedModel) -> Pipeline {
        let name = model.name.clone();
        Pipeline::new(
            name.clone(),
            Node::Model {
                name,
                model: Arc::new(model),
            },
            Arc::new(DatasetConfig::default()),
        )
    }

    fn options() -> EvaluationOptions {
        EvaluationOptions {
            codec: TagCodec::single("CLASS"),
            record: true,
            ..EvaluationOptions::default()
        }
    }

    fn part(cx: f64, label: &str) -> Part {
        Part::new(BBox::new(cx, 0.5, 0.2, 0.2)).with_tags(Tags::new().with("CLASS", label))
    }

    #[test]
    fn hand_computed_scores() {
        let mut stats = Stats::new();
        stats.register(Some("A"), Some("A"));
        stats.register(Some("A"), Some("A"));
        stats.register(Some("B"), Some("A"));
        stats.register(None, Some("B"));

        let report = stats.get_results();
        let a = report.classes["A"];
        assert_eq!(a.count, 3);
        assert_eq!(a.precision, 1.0);
        assert!((a.recall - 2.0 / 3.0).abs() < 1e-12);
        assert!((a.fscore - 0.8).abs() < 1e-12);

        let b = report.classes["B"];
        assert_eq!((b.count, b.precision, b.recall, b.fscore), (2, 0.0, 0.0, 0.0));

        assert_eq!(report.overall.count, 5);
        assert!((report.overall.precision - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(report.overall.recall, 0.5);
        assert_eq!(report.accuracy.overall, 0.5);
        assert_eq!(report.accuracy.detection, 0.75);
        assert!((report.accuracy.classification - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn missing_truth_changes_nothing() {
        let mut stats = Stats::new();
        stats.register(Some("A"), Some("A"));
        let before = stats.clone();
        stats.register(Some("B"), None);
        stats.register(None, None);
        assert_eq!(stats, before);
    }

    #[test]
    fn merge_equals_sequential_registration() {
        let pairs = [
            (Some("A"), Some("A")),
            (Some("B"), Some("A")),
            (None, Some("C")),
            (Some("C"), Some("C")),
        ];
        let mut all = Stats::new();
        for (p, t) in pairs {
            all.register(p, t);
        }
        let mut left = Stats::new();
        let mut right = Stats::new();
        for (p, t) in &pairs[..2] {
            left.register(*p, *t);
        }
        for (p, t) in &pairs[2..] {
            right.register(*p, *t);
        }
        left.merge(right);
        assert_eq!(left, all);
        assert_eq!(left.get_results(), all.get_results());
    }

    #[test]
    fn empty_stats_report_zeroes() {
        let report = Stats::new().get_results();
        assert!(report.classes.is_empty());
        assert_eq!(report.overall, ClassScores::default());
        assert_eq!(report.accuracy, Accuracy::default());
    }

    #[test]
    fn detection_matches_boxes() {
        let pipeline = model_pipeline(FixedModel::new(
            "det",
            Task::Detect,
            TagCodec::single("CLASS"),
            vec![
                Prediction::new("A", 0.9).with_bbox(BBox::new(0.2, 0.5, 0.2, 0.2)),
                Prediction::new("A", 0.8).with_bbox(BBox::new(0.5, 0.5, 0.2, 0.2)),
            ],
        ));
        let mut truth = Assembly::new("set/1");
        truth.add_part(part(0.2, "A"));
        truth.add_part(part(0.5, "B"));
        truth.add_part(part(0.8, "C"));

        let outcome =
            evaluate_annotation(&pipeline, &Annotation::Assembly(truth), &options()).unwrap();
        let report = outcome.stats.get_results();
        assert_eq!(report.classes["A"].precision, 0.5);
        assert_eq!(report.classes["C"].recall, 0.0);
        assert_eq!(outcome.observations.len(), 3);
        assert_eq!(outcome.observations[0].iou, Some(1.0));
        assert_eq!(outcome.observations[2].prediction, None);
        assert_eq!(outcome.observations[2].truth.as_deref(), Some("C"));
    }

    #[test]
    fn classification_compares_parts_by_id() {
        let pipeline = Pipeline::new(
            "fill",
            Node::Composite {
                name: "fill".into(),
                detect: None,
                classify: Some(Box::new(Node::Model {
                    name: "cls".into(),
                    model: Arc::new(FixedModel::new(
                        "cls",
                        Task::Classify,
                        TagCodec::single("CLASS"),
                        vec![Prediction::new("A", 0.6)],
                    )),
                })),
            },
            Arc::new(DatasetConfig::default()),
        );
        let mut truth = Assembly::new("set/1");
        truth.add_part(part(0.2, "A"));
        truth.add_part(part(0.5, "B"));

        let outcome =
            evaluate_annotation(&pipeline, &Annotation::Assembly(truth), &options()).unwrap();
        let report = outcome.stats.get_results();
        assert_eq!(report.observations, 2);
        assert_eq!(report.accuracy.overall, 0.5);
        assert!(outcome.observations.iter().all(|o| o.confidence == Some(0.6)));
    }

    #[test]
    fn composite_with_non_detecting_first_step_keeps_truth_parts() {
        let pipeline = Pipeline::new(
            "tidy",
            Node::Composite {
                name: "tidy".into(),
                detect: Some(Box::new(Node::Function(Function::new(
                    "l_noop",
                    Target::Assembly,
                    |_, _| Ok(()),
                )))),
                classify: Some(Box::new(Node::Model {
                    name: "cls".into(),
                    model: Arc::new(FixedModel::new(
                        "cls",
                        Task::Classify,
                        TagCodec::single("CLASS"),
                        vec![Prediction::new("A", 0.9)],
                    )),
                })),
            },
            Arc::new(DatasetConfig::default()),
        );
        assert!(!pipeline.detects());

        let mut truth = Assembly::new("set/1");
        truth.add_part(part(0.2, "A"));
        truth.add_part(part(0.5, "A"));

        let outcome =
            evaluate_annotation(&pipeline, &Annotation::Assembly(truth), &options()).unwrap();
        let report = outcome.stats.get_results();
        assert_eq!(report.observations, 2);
        assert_eq!(report.accuracy.overall, 1.0);
        assert_eq!(report.overall.recall, 1.0);
    }

    #[test]
    fn isolated_part_labels_are_cleared_first() {
        let pipeline = model_pipeline(FixedModel::new(
            "cls",
            Task::Classify,
            TagCodec::single("CLASS"),
            vec![],
        ));
        let mut truth = IsolatedPart::new("set/p1");
        truth.tags.insert("CLASS", "A");

        let outcome =
            evaluate_annotation(&pipeline, &Annotation::Part(truth), &options()).unwrap();
        assert_eq!(outcome.observations[0].prediction, None);
        assert_eq!(outcome.stats.get_results().classes["A"].recall, 0.0);
    }

    #[test]
    fn batch_skips_recoverable_and_aborts_on_fatal() {
        let pipeline = model_pipeline(FixedModel::new(
            "cls",
            Task::Classify,
            TagCodec::single("CLASS"),
            vec![Prediction::new("A", 1.0)],
        ));
        let mut part = IsolatedPart::new("p");
        part.tags.insert("CLASS", "A");
        let annotations = vec![
            Annotation::Part(part.clone()),
            Annotation::Assembly(Assembly::new("wrong-target")),
            Annotation::Part(part.clone().with_image(ImageSource::none())),
        ];

        for sequential in [true, false] {
            let options = EvaluationOptions {
                sequential,
                ..options()
            };
            let result = evaluate_batch(&pipeline, &annotations, &options).unwrap();
            assert_eq!(result.evaluated, 2);
            assert_eq!(result.skipped, 1);
            assert_eq!(result.stats.get_results().accuracy.overall, 1.0);
        }

        let mut untrained = FixedModel::new("cls", Task::Classify, TagCodec::default(), vec![]);
        untrained.trained = false;
        let err = evaluate_batch(&model_pipeline(untrained), &annotations, &options()).unwrap_err();
        assert!(err.is_fatal());
    }
}
