//! Building node trees from configuration values.
//!
//! | configuration                       | node                   |
//! |-------------------------------------|------------------------|
//! | list                                | `Sequence`             |
//! | string                              | pipeline, model or function reference |
//! | mapping with `criterion`            | `Branch`               |
//! | mapping with `sequence`             | `Sequence`             |
//! | mapping with `detect` / `classify`  | `Composite`            |
//!
//! All validation happens here, so a pipeline that builds can run on any
//! value of its target.

use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::registry::Registry;
use super::{Criterion, Node, Pipeline};
use crate::annotation::Target;
use crate::config::DatasetConfig;
use crate::error::CompographError;

/// Builds the pipeline, model or function called `name`.
///
/// Configured pipelines take precedence over models, and models over
/// functions.
pub fn build_pipeline(
    name: &str,
    config: Arc<DatasetConfig>,
    registry: &Registry,
) -> Result<Pipeline, CompographError> {
    let root = Builder::new(name, &config, registry).reference(name)?;
    Ok(Pipeline::new(name, root, config))
}

/// Builds a pipeline from an inline configuration value.
pub fn build_from_value(
    name: &str,
    value: &Value,
    config: Arc<DatasetConfig>,
    registry: &Registry,
) -> Result<Pipeline, CompographError> {
    let root = Builder::new(name, &config, registry).node(name, value)?;
    Ok(Pipeline::new(name, root, config))
}

struct Builder<'a> {
    pipeline: String,
    config: &'a DatasetConfig,
    registry: &'a Registry,
    /// Configured pipelines currently being expanded, outermost first.
    stack: Vec<String>,
}

impl<'a> Builder<'a> {
    fn new(pipeline: &str, config: &'a DatasetConfig, registry: &'a Registry) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            config,
            registry,
            stack: Vec::new(),
        }
    }

    fn invalid(&self, message: impl Into<String>) -> CompographError {
        CompographError::InvalidPipeline {
            pipeline: self.pipeline.clone(),
            message: message.into(),
        }
    }

    fn node(&mut self, name: &str, value: &Value) -> Result<Node, CompographError> {
        match value {
            Value::Sequence(items) => self.sequence(name, items),
            Value::String(reference) => self.reference(reference),
            Value::Mapping(map) if map.contains_key("criterion") => self.branch(name, map),
            Value::Mapping(map) if map.contains_key("sequence") => match map.get("sequence") {
                Some(Value::Sequence(items)) if map.len() == 1 => self.sequence(name, items),
                _ => Err(self.invalid(format!(
                    "'{}': 'sequence' must be the only key and hold a list",
                    name
                ))),
            },
            Value::Mapping(map) if map.contains_key("detect") || map.contains_key("classify") => {
                self.composite(name, map)
            }
            Value::Mapping(_) => Err(self.invalid(format!(
                "'{}': a mapping needs a 'criterion', 'sequence', 'detect' or 'classify' key",
                name
            ))),
            other => Err(self.invalid(format!(
                "'{}': unexpected value {}",
                name,
                describe(other)
            ))),
        }
    }

    fn reference(&mut self, reference: &str) -> Result<Node, CompographError> {
        if let Some(value) = self.config.pipeline(reference) {
            if self.stack.iter().any(|s| s == reference) {
                let mut chain = self.stack.clone();
                chain.push(reference.to_string());
                return Err(CompographError::CyclicPipeline {
                    pipeline: self.pipeline.clone(),
                    chain: chain.join(" -> "),
                });
            }
            self.stack.push(reference.to_string());
            let node = self.node(reference, value);
            self.stack.pop();
            return node;
        }
        if let Some(model) = self.registry.model(reference) {
            return Ok(Node::Model {
                name: reference.to_string(),
                model,
            });
        }
        if let Some(function) = self.registry.function(reference) {
            return Ok(Node::Function(function.clone()));
        }
        Err(CompographError::UnknownReference {
            pipeline: self.pipeline.clone(),
            reference: reference.to_string(),
        })
    }

    fn sequence(&mut self, name: &str, items: &[Value]) -> Result<Node, CompographError> {
        if items.is_empty() {
            return Err(self.invalid(format!("'{}': empty sequence", name)));
        }
        let mut steps = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            steps.push(self.node(&format!("{}.{}", name, i), item)?);
        }
        let target = self.common_target(&steps)?;
        Ok(Node::Sequence {
            name: name.to_string(),
            target,
            steps,
        })
    }

    fn branch(&mut self, name: &str, map: &Mapping) -> Result<Node, CompographError> {
        let criterion = match map.get("criterion") {
            Some(Value::String(key)) => self.criterion(key)?,
            other => {
                return Err(CompographError::UnknownCriterion {
                    pipeline: self.pipeline.clone(),
                    criterion: other.map(describe).unwrap_or_default(),
                })
            }
        };

        let mut branches = BTreeMap::new();
        let mut order = Vec::new();
        for (key, value) in map {
            let Some(key) = scalar_key(key) else {
                return Err(self.invalid(format!("'{}': branch keys must be scalars", name)));
            };
            if key == "criterion" {
                continue;
            }
            let node = self.node(&format!("{}.{}", name, key), value)?;
            order.push(node.clone());
            branches.insert(key, node);
        }
        if branches.is_empty() {
            return Err(self.invalid(format!("'{}': branch has no branches", name)));
        }
        let target = self.common_target(&order)?;
        Ok(Node::Branch {
            name: name.to_string(),
            target,
            criterion,
            branches,
        })
    }

    fn criterion(&self, key: &str) -> Result<Criterion, CompographError> {
        if let Some(call) = self.registry.predicate(key) {
            return Ok(Criterion::Predicate {
                name: key.to_string(),
                call,
            });
        }
        if self.config.is_tag_key(key) {
            return Ok(Criterion::Tag(key.to_string()));
        }
        if self.config.is_meta_key(key) {
            return Ok(Criterion::Meta(key.to_string()));
        }
        Err(CompographError::UnknownCriterion {
            pipeline: self.pipeline.clone(),
            criterion: key.to_string(),
        })
    }

    fn composite(&mut self, name: &str, map: &Mapping) -> Result<Node, CompographError> {
        let mut detect = None;
        let mut classify = None;
        for (key, value) in map {
            match key.as_str() {
                Some("detect") => {
                    let node = self.node(&format!("{}.detect", name), value)?;
                    self.expect_target(&node, Target::Assembly)?;
                    detect = Some(Box::new(node));
                }
                Some("classify") => {
                    let node = self.node(&format!("{}.classify", name), value)?;
                    self.expect_target(&node, Target::Part)?;
                    classify = Some(Box::new(node));
                }
                _ => {
                    return Err(self.invalid(format!(
                        "'{}': unexpected key {} next to detect/classify",
                        name,
                        describe(key)
                    )))
                }
            }
        }
        Ok(Node::Composite {
            name: name.to_string(),
            detect,
            classify,
        })
    }

    /// The first child's target, checked against every other child.
    fn common_target(&self, nodes: &[Node]) -> Result<Target, CompographError> {
        let Some(first) = nodes.first() else {
            return Err(self.invalid("no steps"));
        };
        let expected = first.target();
        for node in &nodes[1..] {
            self.expect_target(node, expected)?;
        }
        Ok(expected)
    }

    fn expect_target(&self, node: &Node, expected: Target) -> Result<(), CompographError> {
        if node.target() == expected {
            Ok(())
        } else {
            Err(CompographError::TargetMismatch {
                pipeline: self.pipeline.clone(),
                step: node.name().to_string(),
                expected,
                found: node.target(),
            })
        }
    }
}

fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s),
        Value::Sequence(_) => "a list".to_string(),
        Value::Mapping(_) => "a mapping".to_string(),
        Value::Tagged(tagged) => format!("tagged value {}", tagged.tag),
    }
}
