#![allow(dead_code)]

use std::fs;
use std::path::Path;

pub fn bmp_bytes(width: u32, height: u32) -> Vec<u8> {
    let row_stride = (width * 3).div_ceil(4) * 4;
    let pixel_array_size = row_stride * height;
    let file_size = 54 + pixel_array_size;

    let mut bytes = Vec::with_capacity(file_size as usize);
    bytes.extend_from_slice(b"BM");
    bytes.extend_from_slice(&file_size.to_le_bytes());
    bytes.extend_from_slice(&[0, 0, 0, 0]);
    bytes.extend_from_slice(&54u32.to_le_bytes());

    bytes.extend_from_slice(&40u32.to_le_bytes());
    bytes.extend_from_slice(&(width as i32).to_le_bytes());
    bytes.extend_from_slice(&(height as i32).to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&24u16.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&pixel_array_size.to_le_bytes());
    bytes.extend_from_slice(&2835u32.to_le_bytes());
    bytes.extend_from_slice(&2835u32.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());

    bytes.resize(file_size as usize, 0);
    bytes
}

pub fn write_bmp(path: &Path, width: u32, height: u32) {
    write_file(path, &bmp_bytes(width, height));
}

pub fn write_file(path: &Path, contents: impl AsRef<[u8]>) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dir");
    }
    fs::write(path, contents).expect("write file");
}

/// A shell command printing fixed predictions after draining the image.
pub fn fixed_command(predictions_json: &str) -> String {
    format!("cat >/dev/null; echo '{}'", predictions_json)
}

/// A small dataset with a detector, a classifier and two pipelines.
///
/// Assemblies `train/a` (fold 0) and `train/b` (fold 1) each hold two parts
/// labelled `A` and `B`; the detector finds both boxes and labels them `A`.
pub fn write_sample_dataset(root: &Path) {
    let detector = fixed_command(
        r#"[{"label": "A", "confidence": 0.9, "box": [0.25, 0.5, 0.3, 0.5]}, {"label": "A", "confidence": 0.8, "box": [0.75, 0.5, 0.3, 0.5]}]"#,
    );
    let classifier = fixed_command(r#"[{"label": "B", "confidence": 0.7}]"#);
    let config = format!(
        r#"title: Sample
part_tags: [CLASS, SHAPE]
assembly_tags: [TYPE]
folds: 2
train_folds: [0]
test_folds: [1]
models:
  detector:
    task: detect
    tag: CLASS
    command: "{detector}"
  classifier:
    task: classify
    tag: CLASS
    command: "{classifier}"
pipelines:
  full:
    detect: detector
    classify: classifier
  shapes:
    criterion: SHAPE
    "*": classifier
"#,
        detector = detector.replace('"', "\\\""),
        classifier = classifier.replace('"', "\\\""),
    );
    write_file(&root.join("config.yaml"), config);

    let assembly = r#"{
  "tags": {"TYPE": "word"},
  "fold": FOLD,
  "parts": [
    {"box": [0.25, 0.5, 0.3, 0.5], "tags": {"CLASS": "A"}},
    {"box": [0.75, 0.5, 0.3, 0.5], "tags": {"CLASS": "B"}}
  ],
  "relations": [{"start": 0, "end": 1, "tags": {"FUNC": "next"}}]
}"#;
    for (name, fold) in [("a", 0), ("b", 1)] {
        write_file(
            &root.join(format!("assemblies/train/{}.json", name)),
            assembly.replace("FOLD", &fold.to_string()),
        );
        write_bmp(&root.join(format!("assemblies/train/{}.bmp", name)), 8, 4);
    }
    write_file(
        &root.join("parts/train/p.json"),
        r#"{"tags": {"CLASS": "B", "SHAPE": "curve"}, "fold": 1}"#,
    );
    write_bmp(&root.join("parts/train/p.bmp"), 4, 4);
}
