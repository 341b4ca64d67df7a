//! Compograph: inference pipelines and evaluation for compositional notation
//! datasets.
//!
//! Images of *assemblies* (compound symbols, words, diagrams) are annotated
//! with *parts* (their components) and *relations* between parts. Compograph
//! runs configurable pipelines of detection models, classification models and
//! functions over such annotations, and evaluates them against ground truth.
//!
//! # Modules
//!
//! - [`annotation`]: The annotation graph (Assembly, Part, Relation, tags)
//! - [`codec`]: Tag dictionaries to flat model labels and back
//! - [`matching`]: IoU and the greedy prediction/truth matcher
//! - [`model`]: The model adapter boundary
//! - [`pipeline`]: Pipeline nodes, the pipeline factory and registry
//! - [`evaluation`]: Precision/recall aggregation and reports
//! - [`store`]: Directory-backed annotation storage
//! - [`config`]: Dataset configuration
//! - [`error`]: Error types

pub mod annotation;
pub mod codec;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod matching;
pub mod model;
pub mod pipeline;
pub mod store;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use annotation::io_json::{assembly_to_json_string, part_to_json_string};
use annotation::{Annotation, ImageSource, Tags, Target};
use codec::{LabelMap, TagCodec, TagSelector};
use config::{DatasetConfig, ModelConfig};
use evaluation::{evaluate_batch, EvaluationOptions, PredictionWriter};
use pipeline::{build_pipeline, Node, Pipeline, Registry};
use store::{filter_folds, split_folds, AnnotationStore, DirStore};

pub use error::CompographError;

/// The compograph CLI application.
#[derive(Parser)]
#[command(name = "compograph")]
#[command(version, about)]
#[command(propagate_version = true)]
struct Cli {
    /// Dataset directory (holding config.yaml).
    #[arg(short, long, global = true, env = "COMPOGRAPH_DATASET", default_value = ".")]
    dataset: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Predict on one image and print the resulting annotation as JSON.
    Predict(PredictArgs),
    /// Run a pipeline over stored annotations and save the results.
    Run(RunArgs),
    /// Evaluate a pipeline or model against the test folds.
    Test(TestArgs),
    /// Build every configured pipeline and print its tree.
    Check,
    /// Assign annotations to folds at random.
    Split(SplitArgs),
    /// Write the label maps of models from their training folds.
    Prepare(PrepareArgs),
}

/// Which pipeline or model to use.
#[derive(clap::Args)]
#[group(required = true, multiple = false)]
struct Selection {
    /// Name of a configured pipeline.
    #[arg(short, long)]
    pipeline: Option<String>,

    /// Name of a configured model, run alone even if a pipeline shares its name.
    #[arg(short, long)]
    model: Option<String>,
}

/// Arguments for the predict subcommand.
#[derive(clap::Args)]
struct PredictArgs {
    #[command(flatten)]
    selection: Selection,

    /// Image to predict on.
    #[arg(short, long)]
    image: PathBuf,
}

/// Arguments for the run subcommand.
#[derive(clap::Args)]
struct RunArgs {
    #[command(flatten)]
    selection: Selection,

    /// Only run on this subset.
    #[arg(short, long)]
    subset: Option<String>,
}

/// Arguments for the test subcommand.
#[derive(clap::Args)]
struct TestArgs {
    #[command(flatten)]
    selection: Selection,

    /// Tag keys compared by the evaluation (repeatable).
    #[arg(short, long)]
    tag: Vec<String>,

    /// String joining the values of several tags into one label.
    #[arg(long)]
    join: Option<String>,

    /// Minimum IoU for a detected part to match a true one.
    #[arg(long)]
    threshold: Option<f64>,

    /// Only evaluate on this subset.
    #[arg(short, long)]
    subset: Option<String>,

    /// Evaluate on the training folds instead of the test folds.
    #[arg(long)]
    on_train: bool,

    /// Write the results as JSON to this file.
    #[arg(long)]
    results_json: Option<PathBuf>,

    /// Write the results as CSV to this file.
    #[arg(long)]
    results_csv: Option<PathBuf>,

    /// Write every compared prediction as CSV to this file.
    #[arg(long)]
    predictions_csv: Option<PathBuf>,

    /// Output format for stdout ('text' or 'json').
    #[arg(long, default_value = "text")]
    output: String,

    /// Evaluate annotations one at a time.
    #[arg(long)]
    sequential: bool,
}

/// Arguments for the split subcommand.
#[derive(clap::Args)]
struct SplitArgs {
    /// Number of folds (defaults to the configured number).
    #[arg(long)]
    folds: Option<u32>,

    /// Seed of the shuffle.
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

/// Arguments for the prepare subcommand.
#[derive(clap::Args)]
struct PrepareArgs {
    /// Only prepare this model (defaults to every model with a label_map).
    #[arg(short, long)]
    model: Option<String>,
}

/// Run the compograph CLI.
///
/// This is the main entry point for the CLI, called from `main.rs`.
pub fn run() -> Result<(), CompographError> {
    let cli = Cli::parse();
    let dataset = cli.dataset;

    match cli.command {
        Commands::Predict(args) => run_predict(&dataset, args),
        Commands::Run(args) => run_pipeline(&dataset, args),
        Commands::Test(args) => run_test(&dataset, args),
        Commands::Check => run_check(&dataset),
        Commands::Split(args) => run_split(&dataset, args),
        Commands::Prepare(args) => run_prepare(&dataset, args),
    }
}

/// Loads the dataset configuration and every model it can reach.
fn load(dataset: &Path) -> Result<(Arc<DatasetConfig>, Registry), CompographError> {
    let config = DatasetConfig::load(dataset)?;
    let mut registry = Registry::with_builtins();
    registry.load_models(&config)?;
    Ok((Arc::new(config), registry))
}

fn select(
    selection: &Selection,
    config: Arc<DatasetConfig>,
    registry: &Registry,
) -> Result<Pipeline, CompographError> {
    match (&selection.pipeline, &selection.model) {
        (Some(name), _) => build_pipeline(name, config, registry),
        (None, Some(name)) => {
            let model = registry
                .model(name)
                .ok_or_else(|| CompographError::UnknownReference {
                    pipeline: name.clone(),
                    reference: name.clone(),
                })?;
            if config.pipeline(name).is_some() {
                warn!(
                    name = %name,
                    "a pipeline has the same name; --model runs the model alone"
                );
            }
            let root = Node::Model {
                name: name.clone(),
                model,
            };
            Ok(Pipeline::new(name.clone(), root, config))
        }
        (None, None) => Err(CompographError::InvalidConfig(
            "either --pipeline or --model is required".into(),
        )),
    }
}

fn annotation_to_json_string(annotation: &Annotation) -> Result<String, CompographError> {
    let json = match annotation {
        Annotation::Assembly(assembly) => assembly_to_json_string(assembly),
        Annotation::Part(part) => part_to_json_string(part),
    };
    json.map_err(CompographError::Serialize)
}

/// Execute the predict subcommand.
fn run_predict(dataset: &Path, args: PredictArgs) -> Result<(), CompographError> {
    let (config, registry) = load(dataset)?;
    let pipeline = select(&args.selection, config, &registry)?;
    let annotation = pipeline.predict(ImageSource::from_path(&args.image))?;
    println!("{}", annotation_to_json_string(&annotation)?);
    Ok(())
}

/// Execute the run subcommand.
fn run_pipeline(dataset: &Path, args: RunArgs) -> Result<(), CompographError> {
    let (config, registry) = load(dataset)?;
    let pipeline = select(&args.selection, config, &registry)?;
    let store = DirStore::new(dataset);

    let mut annotations = store.annotations(pipeline.target(), args.subset.as_deref())?;
    let (mut done, mut skipped) = (0, 0);
    for annotation in &mut annotations {
        match pipeline.run_annotation(annotation) {
            Ok(()) => {
                store.save(annotation)?;
                done += 1;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(id = annotation.id(), error = %e, "annotation skipped");
                skipped += 1;
            }
        }
    }
    info!(pipeline = pipeline.name(), done, skipped, "run finished");
    println!(
        "Ran '{}' on {} {} annotations ({} skipped)",
        pipeline.name(),
        done,
        pipeline.target(),
        skipped
    );
    Ok(())
}

/// Execute the test subcommand.
fn run_test(dataset: &Path, args: TestArgs) -> Result<(), CompographError> {
    let (config, registry) = load(dataset)?;
    let pipeline = select(&args.selection, config.clone(), &registry)?;

    let codec = evaluation_codec(&args, &pipeline, &config);
    let match_threshold = args.threshold.unwrap_or(config.match_threshold);
    if !(0.0..=1.0).contains(&match_threshold) {
        return Err(CompographError::InvalidConfig(format!(
            "'--threshold' must be between 0 and 1, got {}",
            match_threshold
        )));
    }

    let subsets: Vec<Option<String>> = match (&args.subset, &args.selection.model) {
        (Some(subset), _) => vec![Some(subset.clone())],
        (None, Some(model)) => match config.model(model).and_then(|m| m.subsets.clone()) {
            Some(subsets) => subsets.into_iter().map(Some).collect(),
            None => vec![None],
        },
        (None, None) => vec![None],
    };
    let store = DirStore::new(dataset);
    let mut annotations = Vec::new();
    for subset in &subsets {
        annotations.extend(store.annotations(pipeline.target(), subset.as_deref())?);
    }
    let annotations = filter_folds(annotations, config.evaluation_folds(args.on_train));
    info!(
        pipeline = pipeline.name(),
        annotations = annotations.len(),
        on_train = args.on_train,
        "evaluating"
    );

    let options = EvaluationOptions {
        codec,
        match_threshold,
        record: args.predictions_csv.is_some(),
        sequential: args.sequential,
    };
    let result = evaluate_batch(&pipeline, &annotations, &options)?;
    let report = result.stats.get_results();

    match args.output.as_str() {
        "json" => println!("{}", report.to_json_string()?),
        "text" => print!("{}", report),
        other => {
            return Err(CompographError::UnsupportedFormat(format!(
                "'{}' (supported: text, json)",
                other
            )))
        }
    }
    if result.skipped > 0 {
        eprintln!("{} annotation(s) skipped, see the log", result.skipped);
    }

    if let Some(path) = &args.results_json {
        fs::write(path, report.to_json_string()?)?;
        eprintln!("Printed results to '{}'", path.display());
    }
    if let Some(path) = &args.results_csv {
        report.write_csv(fs::File::create(path)?)?;
        eprintln!("Printed results to '{}'", path.display());
    }
    if let Some(path) = &args.predictions_csv {
        let mut writer = PredictionWriter::create(path)?;
        for observation in &result.observations {
            writer.write(observation)?;
        }
        writer.finish()?;
        eprintln!("Printed predictions to '{}'", path.display());
    }
    Ok(())
}

/// `--tag`/`--join` first, then the codec of a single-model pipeline, then
/// the first part tag of the dataset.
fn evaluation_codec(args: &TestArgs, pipeline: &Pipeline, config: &DatasetConfig) -> TagCodec {
    let join = args.join.clone().unwrap_or_default();
    match args.tag.as_slice() {
        [] => pipeline
            .model_codec()
            .cloned()
            .unwrap_or_else(|| config.default_codec()),
        [single] => TagCodec::new(TagSelector::Single(single.clone()), join),
        many => TagCodec::new(TagSelector::List(many.to_vec()), join),
    }
}

/// Execute the check subcommand.
fn run_check(dataset: &Path) -> Result<(), CompographError> {
    let (config, registry) = load(dataset)?;
    if config.pipelines.is_empty() {
        println!("No pipelines configured.");
    }
    for name in config.pipelines.keys() {
        let pipeline = build_pipeline(name, config.clone(), &registry)?;
        print!("{}", pipeline);
    }
    let models: Vec<&str> = registry.model_names().collect();
    if models.is_empty() {
        println!("Models: (none)");
    } else {
        println!("Models: {}", models.join(", "));
    }
    let functions: Vec<&str> = registry.function_names().collect();
    println!("Functions: {}", functions.join(", "));
    Ok(())
}

/// Execute the split subcommand.
fn run_split(dataset: &Path, args: SplitArgs) -> Result<(), CompographError> {
    let config = DatasetConfig::load(dataset)?;
    let folds = args.folds.unwrap_or(config.folds);
    if folds == 0 {
        return Err(CompographError::InvalidConfig(
            "'--folds' must be at least 1".into(),
        ));
    }

    let unused: Vec<u32> = (0..folds)
        .filter(|f| !config.train_folds.contains(f) && !config.test_folds.contains(f))
        .collect();
    if !unused.is_empty() {
        warn!(?unused, "folds are neither training nor test folds and will not be used");
    }
    let empty: Vec<u32> = config
        .train_folds
        .iter()
        .chain(&config.test_folds)
        .copied()
        .filter(|f| *f >= folds)
        .collect();
    if !empty.is_empty() {
        warn!(?empty, "configured folds will receive no annotations");
    }

    let store = DirStore::new(dataset);
    for target in [Target::Assembly, Target::Part] {
        let mut annotations = store.annotations(target, None)?;
        split_folds(&mut annotations, folds, args.seed);
        for annotation in &annotations {
            store.save(annotation)?;
        }
        println!(
            "Split {} {} annotations into {} folds",
            annotations.len(),
            target,
            folds
        );
    }
    Ok(())
}

/// Execute the prepare subcommand.
fn run_prepare(dataset: &Path, args: PrepareArgs) -> Result<(), CompographError> {
    let config = DatasetConfig::load(dataset)?;
    let selected: Vec<(&String, &ModelConfig)> = match &args.model {
        Some(name) => {
            let model = config
                .models
                .get_key_value(name)
                .ok_or_else(|| CompographError::UnknownReference {
                    pipeline: name.clone(),
                    reference: name.clone(),
                })?;
            if model.1.label_map.is_none() {
                return Err(CompographError::InvalidConfig(format!(
                    "model '{}' has no label_map path",
                    name
                )));
            }
            vec![model]
        }
        None => config
            .models
            .iter()
            .filter(|(_, model)| model.label_map.is_some())
            .collect(),
    };
    if selected.is_empty() {
        println!("No models with a label_map configured.");
    }

    let store = DirStore::new(dataset);
    for (name, model) in selected {
        let Some(path) = &model.label_map else {
            continue;
        };
        let label_map = training_labels(&store, &config, model)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        label_map.write(path)?;
        info!(
            model = %name,
            labels = label_map.len(),
            path = %path.display(),
            "label map written"
        );
        println!(
            "Wrote {} labels for '{}' to '{}'",
            label_map.len(),
            name,
            path.display()
        );
    }
    Ok(())
}

/// Labels of a model's training folds: parts of assemblies for detectors,
/// isolated parts for classifiers.
fn training_labels(
    store: &DirStore,
    config: &DatasetConfig,
    model: &ModelConfig,
) -> Result<LabelMap, CompographError> {
    let subsets: Vec<Option<&str>> = match &model.subsets {
        Some(subsets) => subsets.iter().map(|s| Some(s.as_str())).collect(),
        None => vec![None],
    };
    let mut annotations = Vec::new();
    for subset in subsets {
        annotations.extend(store.annotations(model.task.target(), subset)?);
    }
    let annotations = filter_folds(annotations, &config.train_folds);

    let tags: Vec<&Tags> = annotations
        .iter()
        .flat_map(|annotation| match annotation {
            Annotation::Assembly(assembly) => {
                assembly.parts().map(|(_, p)| &p.tags).collect::<Vec<_>>()
            }
            Annotation::Part(part) => vec![&part.tags],
        })
        .collect();
    Ok(LabelMap::collect(&model.codec(), tags))
}
