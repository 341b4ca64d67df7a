#![cfg(unix)]

mod common;

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;

use compograph::codec::LabelMap;

use common::{write_bmp, write_file, write_sample_dataset};

fn compograph(dataset: &Path) -> Command {
    let mut cmd = Command::cargo_bin("compograph").unwrap();
    cmd.arg("--dataset").arg(dataset).env_remove("RUST_LOG");
    cmd
}

#[test]
fn outputs_tool_name() {
    let mut cmd = Command::cargo_bin("compograph").unwrap();
    cmd.arg("-V");
    cmd.assert()
        .success()
        .stdout(predicate::str::starts_with("compograph "));
}

#[test]
fn check_prints_pipeline_trees() {
    let dir = tempfile::tempdir().unwrap();
    write_sample_dataset(dir.path());

    compograph(dir.path())
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("full (on assembly)"))
        .stdout(predicate::str::contains("detect: detector [detect model]"))
        .stdout(predicate::str::contains("shapes [branch on tag SHAPE of part]"))
        .stdout(predicate::str::contains("Models: classifier, detector"))
        .stdout(predicate::str::contains("builtin:merge_partof"));
}

#[test]
fn check_reports_configuration_errors() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        &dir.path().join("config.yaml"),
        "part_tags: [CLASS]\npipelines:\n  broken: [nowhere]\n",
    );

    compograph(dir.path())
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown model, pipeline or function 'nowhere'"));
}

#[test]
fn missing_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    compograph(dir.path())
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn predict_with_pipeline_prints_annotation() {
    let dir = tempfile::tempdir().unwrap();
    write_sample_dataset(dir.path());
    let image = dir.path().join("new.bmp");
    write_bmp(&image, 8, 4);

    let output = compograph(dir.path())
        .args(["predict", "--pipeline", "full", "--image"])
        .arg(&image)
        .output()
        .unwrap();
    assert!(output.status.success(), "{:?}", output);

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let parts = json["parts"].as_array().unwrap();
    assert_eq!(parts.len(), 2);
    assert!(parts.iter().all(|p| p["tags"]["CLASS"] == "B"));
    assert_eq!(parts[0]["meta"]["confidence"], "0.7");
}

#[test]
fn predict_with_classifier_model() {
    let dir = tempfile::tempdir().unwrap();
    write_sample_dataset(dir.path());
    let image = dir.path().join("glyph.bmp");
    write_bmp(&image, 4, 4);

    compograph(dir.path())
        .args(["predict", "--model", "classifier", "--image"])
        .arg(&image)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""CLASS": "B""#));
}

#[test]
fn model_selection_ignores_pipeline_of_same_name() {
    let dir = tempfile::tempdir().unwrap();
    write_sample_dataset(dir.path());
    let config_path = dir.path().join("config.yaml");
    let mut config = fs::read_to_string(&config_path).unwrap();
    config.push_str("  classifier: [detector]\n");
    write_file(&config_path, config);
    let image = dir.path().join("glyph.bmp");
    write_bmp(&image, 4, 4);

    compograph(dir.path())
        .args(["predict", "--model", "classifier", "--image"])
        .arg(&image)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""CLASS": "B""#))
        .stdout(predicate::str::contains("parts").not())
        .stderr(predicate::str::contains("runs the model alone"));
}

#[test]
fn predict_requires_a_selection() {
    let dir = tempfile::tempdir().unwrap();
    write_sample_dataset(dir.path());
    compograph(dir.path())
        .args(["predict", "--image", "x.bmp"])
        .assert()
        .failure();
}

#[test]
fn test_detector_on_test_folds() {
    let dir = tempfile::tempdir().unwrap();
    write_sample_dataset(dir.path());
    let results = dir.path().join("results.json");
    let predictions = dir.path().join("predictions.csv");

    compograph(dir.path())
        .args(["test", "--model", "detector", "--sequential", "--results-json"])
        .arg(&results)
        .arg("--predictions-csv")
        .arg(&predictions)
        .assert()
        .success()
        .stdout(predicate::str::contains("overall"));

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&results).unwrap()).unwrap();
    assert_eq!(json["observations"], 2);
    assert_eq!(json["classes"]["A"]["precision"], 0.5);
    assert_eq!(json["classes"]["A"]["recall"], 1.0);
    assert_eq!(json["classes"]["B"]["recall"], 0.0);
    assert_eq!(json["overall"]["fscore"], 0.5);

    let csv = fs::read_to_string(&predictions).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("prediction,truth,image,confidence,iou"));
    assert_eq!(lines.count(), 2);
}

#[test]
fn test_classifier_json_output() {
    let dir = tempfile::tempdir().unwrap();
    write_sample_dataset(dir.path());

    let output = compograph(dir.path())
        .args(["test", "--model", "classifier", "--output", "json"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{:?}", output);
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["accuracy"]["overall"], 1.0);
    assert_eq!(json["classes"]["B"]["fscore"], 1.0);
}

#[test]
fn run_saves_pipeline_results() {
    let dir = tempfile::tempdir().unwrap();
    write_sample_dataset(dir.path());

    compograph(dir.path())
        .args(["run", "--pipeline", "shapes", "--subset", "train"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Ran 'shapes' on 1 part annotations (0 skipped)"));

    let saved = fs::read_to_string(dir.path().join("parts/train/p.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&saved).unwrap();
    assert_eq!(json["tags"]["CLASS"], "B");
    assert_eq!(json["meta"]["confidence"], "0.7");
}

#[test]
fn split_assigns_folds() {
    let dir = tempfile::tempdir().unwrap();
    write_sample_dataset(dir.path());

    compograph(dir.path())
        .args(["split", "--folds", "2", "--seed", "7"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Split 2 assembly annotations into 2 folds"))
        .stdout(predicate::str::contains("Split 1 part annotations into 2 folds"));

    let mut folds = Vec::new();
    for name in ["a", "b"] {
        let path = dir.path().join(format!("assemblies/train/{}.json", name));
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        folds.push(json["fold"].as_u64().unwrap());
    }
    folds.sort();
    assert_eq!(folds, [0, 1]);
}

#[test]
fn split_warns_about_unused_folds() {
    let dir = tempfile::tempdir().unwrap();
    write_sample_dataset(dir.path());

    compograph(dir.path())
        .args(["split", "--folds", "3"])
        .assert()
        .success()
        .stderr(predicate::str::contains("neither training nor test folds"));
}

#[test]
fn prepare_writes_label_maps_from_training_folds() {
    let dir = tempfile::tempdir().unwrap();
    write_sample_dataset(dir.path());
    write_file(
        &dir.path().join("config.yaml"),
        r#"part_tags: [CLASS, SHAPE]
folds: 2
train_folds: [0]
test_folds: [1]
models:
  detector: {task: detect, tag: CLASS, label_map: nets/detector.json}
  classifier: {task: classify, tag: CLASS, label_map: nets/classifier.json}
  plain: {task: classify}
"#,
    );

    compograph(dir.path())
        .arg("prepare")
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote 2 labels for 'detector'"))
        .stdout(predicate::str::contains("Wrote 0 labels for 'classifier'"))
        .stdout(predicate::str::contains("'plain'").not());

    let detector = LabelMap::read(&dir.path().join("nets/detector.json")).unwrap();
    assert_eq!(detector.labels(), ["A", "B"]);
    assert_eq!(detector.class_for_label("B").as_deref(), Some("C0002"));
    let classifier = LabelMap::read(&dir.path().join("nets/classifier.json")).unwrap();
    assert!(classifier.is_empty());

    compograph(dir.path())
        .args(["prepare", "--model", "plain"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no label_map"));
}
