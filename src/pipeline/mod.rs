//! Executable pipelines of models and functions.
//!
//! A pipeline is a tree of [`Node`]s built once from configuration (see
//! [`build_pipeline`]) and then run any number of times on annotations. Every
//! node knows the [`Target`] it operates on; the builder checks that targets
//! agree, so a built tree never hands a node the wrong kind of value.
//!
//! Running mutates the subject in place. Children of a sequence run in order
//! on the same value, so later steps observe what earlier steps wrote.

mod build;
mod registry;

pub use build::{build_from_value, build_pipeline};
pub use registry::{target_from_name, Registry};

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::annotation::{Annotation, ImageSource, Subject, Target};
use crate::codec::TagCodec;
use crate::config::DatasetConfig;
use crate::error::CompographError;
use crate::model::{ModelAdapter, Task};

/// Branch key used when the criterion has no value or no branch matches it.
pub const WILDCARD: &str = "*";

/// Signature of user functions.
pub type FunctionFn =
    dyn Fn(&mut Subject<'_>, &DatasetConfig) -> Result<(), CompographError> + Send + Sync;

/// Signature of user branch predicates.
pub type PredicateFn = dyn Fn(&Subject<'_>) -> Option<String> + Send + Sync;

/// A registered user function with its target.
#[derive(Clone)]
pub struct Function {
    name: String,
    target: Target,
    call: Arc<FunctionFn>,
}

impl Function {
    pub fn new<F>(name: impl Into<String>, target: Target, call: F) -> Self
    where
        F: Fn(&mut Subject<'_>, &DatasetConfig) -> Result<(), CompographError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            target,
            call: Arc::new(call),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn call(
        &self,
        subject: &mut Subject<'_>,
        config: &DatasetConfig,
    ) -> Result<(), CompographError> {
        (self.call)(subject, config)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("target", &self.target)
            .finish()
    }
}

/// How a branch picks its child.
#[derive(Clone)]
pub enum Criterion {
    /// Value of a tag.
    Tag(String),
    /// Value of a meta key.
    Meta(String),
    /// Result of a registered predicate.
    Predicate { name: String, call: Arc<PredicateFn> },
}

impl Criterion {
    pub fn evaluate(&self, subject: &Subject<'_>) -> Option<String> {
        match self {
            Criterion::Tag(key) => subject.tags().get(key).map(str::to_string),
            Criterion::Meta(key) => subject.meta().get(key).map(str::to_string),
            Criterion::Predicate { call, .. } => call(subject),
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criterion::Tag(key) => write!(f, "tag {}", key),
            Criterion::Meta(key) => write!(f, "meta {}", key),
            Criterion::Predicate { name, .. } => write!(f, "predicate {}", name),
        }
    }
}

impl fmt::Debug for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Criterion({})", self)
    }
}

/// One step of a pipeline.
#[derive(Clone)]
pub enum Node {
    /// A model's `auto_annotate`.
    Model {
        name: String,
        model: Arc<dyn ModelAdapter>,
    },
    /// Children run in order on the same value.
    Sequence {
        name: String,
        target: Target,
        steps: Vec<Node>,
    },
    /// Optional detection on an assembly, then classification of each part.
    Composite {
        name: String,
        detect: Option<Box<Node>>,
        classify: Option<Box<Node>>,
    },
    /// Picks one child by evaluating a criterion.
    Branch {
        name: String,
        target: Target,
        criterion: Criterion,
        branches: BTreeMap<String, Node>,
    },
    Function(Function),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Model { name, .. }
            | Node::Sequence { name, .. }
            | Node::Composite { name, .. }
            | Node::Branch { name, .. } => name,
            Node::Function(function) => function.name(),
        }
    }

    pub fn target(&self) -> Target {
        match self {
            Node::Model { model, .. } => model.target(),
            Node::Sequence { target, .. } | Node::Branch { target, .. } => *target,
            Node::Composite { .. } => Target::Assembly,
            Node::Function(function) => function.target(),
        }
    }

    /// Returns true if running this node can add parts to an assembly.
    pub fn detects(&self) -> bool {
        match self {
            Node::Model { model, .. } => model.task() == Task::Detect,
            Node::Sequence { steps, .. } => steps.iter().any(Node::detects),
            Node::Composite { detect, .. } => detect.as_deref().is_some_and(Node::detects),
            Node::Branch { branches, .. } => branches.values().any(Node::detects),
            Node::Function(_) => false,
        }
    }

    /// Runs the node on a subject of its target.
    pub fn run(
        &self,
        subject: &mut Subject<'_>,
        config: &DatasetConfig,
    ) -> Result<(), CompographError> {
        if subject.target() != self.target() {
            return Err(CompographError::TargetMismatch {
                pipeline: self.name().to_string(),
                step: subject.id().to_string(),
                expected: self.target(),
                found: subject.target(),
            });
        }
        debug!(node = self.name(), id = subject.id(), "run");

        match self {
            Node::Model { model, .. } => model.auto_annotate(subject),
            Node::Sequence { steps, .. } => {
                for step in steps {
                    step.run(subject, config)?;
                }
                Ok(())
            }
            Node::Composite {
                detect, classify, ..
            } => {
                if let Some(detect) = detect {
                    detect.run(subject, config)?;
                }
                if let (Some(classify), Some(assembly)) = (classify, subject.as_assembly_mut()) {
                    for mut part in assembly.part_subjects() {
                        classify.run(&mut part, config)?;
                    }
                }
                Ok(())
            }
            Node::Branch {
                name,
                criterion,
                branches,
                ..
            } => {
                let value = criterion.evaluate(subject);
                let chosen = value
                    .as_deref()
                    .and_then(|v| branches.get(v))
                    .or_else(|| branches.get(WILDCARD));
                match chosen {
                    Some(node) => node.run(subject, config),
                    None => {
                        debug!(node = %name, value = ?value, "no branch taken");
                        Ok(())
                    }
                }
            }
            Node::Function(function) => function.call(subject, config),
        }
    }

    fn fmt_tree(&self, f: &mut fmt::Formatter<'_>, depth: usize, key: &str) -> fmt::Result {
        let indent = "  ".repeat(depth);
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{}: ", key)
        };
        match self {
            Node::Model { name, model } => {
                writeln!(f, "{}{}{} [{} model]", indent, prefix, name, model.task())
            }
            Node::Function(function) => writeln!(
                f,
                "{}{}{} [function on {}]",
                indent,
                prefix,
                function.name(),
                function.target()
            ),
            Node::Sequence {
                name,
                target,
                steps,
            } => {
                writeln!(f, "{}{}{} [sequence on {}]", indent, prefix, name, target)?;
                for (i, step) in steps.iter().enumerate() {
                    step.fmt_tree(f, depth + 1, &i.to_string())?;
                }
                Ok(())
            }
            Node::Composite {
                name,
                detect,
                classify,
            } => {
                writeln!(f, "{}{}{} [detect/classify]", indent, prefix, name)?;
                if let Some(detect) = detect {
                    detect.fmt_tree(f, depth + 1, "detect")?;
                }
                if let Some(classify) = classify {
                    classify.fmt_tree(f, depth + 1, "classify")?;
                }
                Ok(())
            }
            Node::Branch {
                name,
                target,
                criterion,
                branches,
            } => {
                writeln!(
                    f,
                    "{}{}{} [branch on {} of {}]",
                    indent, prefix, name, criterion, target
                )?;
                for (key, node) in branches {
                    node.fmt_tree(f, depth + 1, key)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("target", &self.target())
            .finish_non_exhaustive()
    }
}

/// A built, runnable pipeline.
#[derive(Clone, Debug)]
pub struct Pipeline {
    name: String,
    root: Node,
    config: Arc<DatasetConfig>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, root: Node, config: Arc<DatasetConfig>) -> Self {
        Self {
            name: name.into(),
            root,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn target(&self) -> Target {
        self.root.target()
    }

    pub fn detects(&self) -> bool {
        self.root.detects()
    }

    /// The codec of the root model, when the pipeline is a single model.
    pub fn model_codec(&self) -> Option<&TagCodec> {
        match &self.root {
            Node::Model { model, .. } => Some(model.codec()),
            _ => None,
        }
    }

    /// Runs the pipeline on a subject, mutating it in place.
    pub fn run(&self, subject: &mut Subject<'_>) -> Result<(), CompographError> {
        self.root.run(subject, &self.config)
    }

    pub fn run_annotation(&self, annotation: &mut Annotation) -> Result<(), CompographError> {
        self.run(&mut annotation.subject())
    }

    /// Builds a fresh annotation of the pipeline's target around an image and
    /// runs the pipeline on it.
    pub fn predict(&self, image: ImageSource) -> Result<Annotation, CompographError> {
        let id = image
            .path()
            .and_then(Path::file_stem)
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "prediction".to_string());
        let mut annotation = Annotation::empty(self.target(), id, image);
        self.run_annotation(&mut annotation)?;
        Ok(annotation)
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} (on {})", self.name, self.target())?;
        self.root.fmt_tree(f, 1, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{Assembly, BBox, IsolatedPart, Part, Tags};
    use crate::model::testing::FixedModel;
    use crate::model::Prediction;

    fn config() -> Arc<DatasetConfig> {
        Arc::new(DatasetConfig {
            part_tags: vec!["CLASS".into(), "SHAPE".into()],
            ..DatasetConfig::default()
        })
    }

    fn tagger(name: &str, key: &'static str, value: &'static str) -> Node {
        Node::Function(Function::new(name, Target::Part, move |subject, _| {
            subject.tags_mut().insert(key, value);
            Ok(())
        }))
    }

    #[test]
    fn sequence_steps_observe_earlier_writes() {
        let first = tagger("first", "CLASS", "A");
        let second = Node::Function(Function::new("second", Target::Part, |subject, _| {
            let seen = subject.tags().get("CLASS").unwrap_or("none").to_string();
            subject.tags_mut().insert("SEEN", seen);
            Ok(())
        }));
        let pipeline = Pipeline::new(
            "seq",
            Node::Sequence {
                name: "seq".into(),
                target: Target::Part,
                steps: vec![first, second],
            },
            config(),
        );

        let mut part = IsolatedPart::new("p");
        pipeline.run(&mut Subject::Isolated(&mut part)).unwrap();
        assert_eq!(part.tags.get("SEEN"), Some("A"));
    }

    #[test]
    fn branch_falls_back_to_wildcard() {
        let branches = BTreeMap::from([
            ("curve".to_string(), tagger("n1", "RAN", "n1")),
            (WILDCARD.to_string(), tagger("n2", "RAN", "n2")),
        ]);
        let node = Node::Branch {
            name: "b".into(),
            target: Target::Part,
            criterion: Criterion::Tag("SHAPE".into()),
            branches,
        };

        let mut part = IsolatedPart::new("p");
        node.run(&mut Subject::Isolated(&mut part), &config()).unwrap();
        assert_eq!(part.tags.get("RAN"), Some("n2"));

        let mut curved = IsolatedPart::new("q");
        curved.tags.insert("SHAPE", "curve");
        node.run(&mut Subject::Isolated(&mut curved), &config()).unwrap();
        assert_eq!(curved.tags.get("RAN"), Some("n1"));
    }

    #[test]
    fn branch_without_match_is_a_no_op() {
        let node = Node::Branch {
            name: "b".into(),
            target: Target::Part,
            criterion: Criterion::Tag("SHAPE".into()),
            branches: BTreeMap::from([("curve".to_string(), tagger("n1", "RAN", "n1"))]),
        };
        let mut part = IsolatedPart::new("p");
        part.tags.insert("SHAPE", "line");
        node.run(&mut Subject::Isolated(&mut part), &config()).unwrap();
        assert_eq!(part.tags.get("RAN"), None);
    }

    #[test]
    fn composite_classifies_detected_parts() {
        let detector = Arc::new(FixedModel::new(
            "det",
            Task::Detect,
            crate::codec::TagCodec::default(),
            vec![
                Prediction::new("", 0.9).with_bbox(BBox::new(0.3, 0.5, 0.2, 0.2)),
                Prediction::new("", 0.8).with_bbox(BBox::new(0.7, 0.5, 0.2, 0.2)),
            ],
        ));
        let node = Node::Composite {
            name: "full".into(),
            detect: Some(Box::new(Node::Model {
                name: "det".into(),
                model: detector,
            })),
            classify: Some(Box::new(tagger("cls", "CLASS", "X"))),
        };
        let pipeline = Pipeline::new("full", node, config());

        let mut assembly = Assembly::new("a");
        assembly.add_part(Part::default().with_tags(Tags::new().with("CLASS", "old")));
        pipeline.run(&mut Subject::Assembly(&mut assembly)).unwrap();

        assert_eq!(assembly.part_count(), 2);
        assert!(assembly.parts().all(|(_, p)| p.tags.get("CLASS") == Some("X")));
        assert!(pipeline.detects());
    }

    #[test]
    fn running_on_wrong_target_fails() {
        let node = tagger("t", "CLASS", "A");
        let mut assembly = Assembly::new("a");
        let err = node
            .run(&mut Subject::Assembly(&mut assembly), &config())
            .unwrap_err();
        assert!(matches!(err, CompographError::TargetMismatch { .. }));
    }

    #[test]
    fn predict_builds_value_of_pipeline_target() {
        let pipeline = Pipeline::new("t", tagger("t", "CLASS", "A"), config());
        let annotation = pipeline.predict(ImageSource::none()).unwrap();
        assert_eq!(annotation.target(), Target::Part);
        match annotation {
            Annotation::Part(part) => assert_eq!(part.tags.get("CLASS"), Some("A")),
            Annotation::Assembly(_) => panic!("expected a part"),
        }
    }
}
