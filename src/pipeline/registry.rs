use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{Function, PredicateFn};
use crate::annotation::{PartId, Relation, Subject, Target};
use crate::config::DatasetConfig;
use crate::error::CompographError;
use crate::matching::merge_overlapping;
use crate::model::{CommandModel, ModelAdapter};

/// Relation tag marking a part as a piece of another.
const FUNC_KEY: &str = "FUNC";
const PART_OF: &str = "partof";

/// Models, functions and predicates that pipelines can reference by name.
#[derive(Clone, Default)]
pub struct Registry {
    models: BTreeMap<String, Arc<dyn ModelAdapter>>,
    functions: BTreeMap<String, Function>,
    predicates: BTreeMap<String, Arc<PredicateFn>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the `builtin:` functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_function("builtin:merge_partof", Target::Assembly, merge_partof);
        registry.register_function(
            "builtin:merge_overlapping",
            Target::Assembly,
            merge_overlapping_parts,
        );
        registry
    }

    /// Registers a model under its own name, replacing any previous one.
    pub fn register_model(&mut self, model: Arc<dyn ModelAdapter>) {
        self.models.insert(model.name().to_string(), model);
    }

    pub fn register_function<F>(&mut self, name: &str, target: Target, call: F)
    where
        F: Fn(&mut Subject<'_>, &DatasetConfig) -> Result<(), CompographError>
            + Send
            + Sync
            + 'static,
    {
        self.functions
            .insert(name.to_string(), Function::new(name, target, call));
    }

    /// Registers a function whose target follows from its name, see
    /// [`target_from_name`].
    pub fn register_untyped_function<F>(&mut self, name: &str, call: F)
    where
        F: Fn(&mut Subject<'_>, &DatasetConfig) -> Result<(), CompographError>
            + Send
            + Sync
            + 'static,
    {
        self.register_function(name, target_from_name(name), call);
    }

    pub fn register_predicate<F>(&mut self, name: &str, call: F)
    where
        F: Fn(&Subject<'_>) -> Option<String> + Send + Sync + 'static,
    {
        self.predicates.insert(name.to_string(), Arc::new(call));
    }

    pub fn model(&self, name: &str) -> Option<Arc<dyn ModelAdapter>> {
        self.models.get(name).cloned()
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn predicate(&self, name: &str) -> Option<Arc<PredicateFn>> {
        self.predicates.get(name).cloned()
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Adds a [`CommandModel`] for every configured model with a command.
    ///
    /// Models registered in code keep precedence over configured ones.
    pub fn load_models(&mut self, config: &DatasetConfig) -> Result<(), CompographError> {
        for (name, model) in &config.models {
            if self.models.contains_key(name) {
                debug!(model = %name, "configured model shadowed by registered one");
                continue;
            }
            if model.command.is_empty() {
                warn!(model = %name, "model has no command and is not registered; skipped");
                continue;
            }
            let adapter = CommandModel::from_config(name, model)?;
            self.models.insert(name.clone(), Arc::new(adapter));
        }
        Ok(())
    }
}

/// Target of an untyped function by naming convention.
///
/// The segment after the last `:` decides: names starting with `assembly`,
/// `logogram` or `l_` target assemblies, all others target parts.
pub fn target_from_name(name: &str) -> Target {
    let last = name.rsplit(':').next().unwrap_or(name);
    if ["assembly", "logogram", "l_"]
        .iter()
        .any(|prefix| last.starts_with(prefix))
    {
        Target::Assembly
    } else {
        Target::Part
    }
}

/// Folds every part into the part it is `FUNC=partof`.
fn merge_partof(subject: &mut Subject<'_>, _: &DatasetConfig) -> Result<(), CompographError> {
    let Some(assembly) = subject.as_assembly_mut() else {
        return Ok(());
    };
    while let Some((from, into)) = next_partof(assembly.relations()) {
        assembly.merge_parts(from, into)?;
    }
    Ok(())
}

fn next_partof(relations: &[Relation]) -> Option<(PartId, PartId)> {
    relations
        .iter()
        .filter(|rel| rel.start() != rel.end())
        .find(|rel| rel.tags.get(FUNC_KEY) == Some(PART_OF))
        .map(|rel| (rel.start(), rel.end()))
}

fn merge_overlapping_parts(
    subject: &mut Subject<'_>,
    config: &DatasetConfig,
) -> Result<(), CompographError> {
    let Some(assembly) = subject.as_assembly_mut() else {
        return Ok(());
    };
    let codec = (!config.part_tags.is_empty()).then(|| config.default_codec());
    let merged = merge_overlapping(assembly, config.match_threshold, codec.as_ref())?;
    debug!(id = %assembly.id, merged, "merged overlapping parts");
    Ok(())
}
