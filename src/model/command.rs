//! A model adapter backed by an external command.
//!
//! The command receives the encoded image on stdin and must print a JSON
//! array of predictions on stdout:
//!
//! ```json
//! [{"label": "A", "confidence": 0.93, "box": [0.5, 0.5, 0.2, 0.3]}]
//! ```
//!
//! Boxes are normalized center-form `[cx, cy, w, h]` and only expected from
//! detectors. The model name, task and weights path are passed through the
//! `COMPOGRAPH_MODEL`, `COMPOGRAPH_TASK` and `COMPOGRAPH_WEIGHTS` environment
//! variables.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use tracing::debug;

use super::{ModelAdapter, Prediction, Task};
use crate::annotation::ImageInput;
use crate::codec::{LabelMap, TagCodec};
use crate::config::ModelConfig;
use crate::error::CompographError;

/// Runs a configured command once per image.
#[derive(Clone, Debug)]
pub struct CommandModel {
    name: String,
    task: Task,
    codec: TagCodec,
    command: Vec<String>,
    weights: Option<PathBuf>,
    threshold: f64,
    label_map: Option<LabelMap>,
}

impl CommandModel {
    pub fn new(name: impl Into<String>, task: Task, codec: TagCodec, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            task,
            codec,
            command,
            weights: None,
            threshold: 0.0,
            label_map: None,
        }
    }

    /// Sets the weights file whose existence marks the model as trained.
    pub fn with_weights(mut self, weights: impl Into<PathBuf>) -> Self {
        self.weights = Some(weights.into());
        self
    }

    /// Drops predictions below this confidence.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Translates class names printed by the command back into labels.
    pub fn with_label_map(mut self, label_map: LabelMap) -> Self {
        self.label_map = Some(label_map);
        self
    }

    /// Builds the adapter for a configured model.
    pub fn from_config(name: &str, config: &ModelConfig) -> Result<Self, CompographError> {
        let mut model = Self::new(name, config.task, config.codec(), config.command.clone())
            .with_threshold(config.threshold);
        if let Some(weights) = &config.weights {
            model = model.with_weights(weights);
        }
        if let Some(path) = &config.label_map {
            if path.exists() {
                model = model.with_label_map(LabelMap::read(path)?);
            }
        }
        Ok(model)
    }

    fn failed(&self, message: impl Into<String>) -> CompographError {
        CompographError::ModelFailed {
            model: self.name.clone(),
            message: message.into(),
        }
    }

    fn run_command(&self, input: Vec<u8>) -> Result<Vec<u8>, CompographError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(self.failed("no command configured"));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("COMPOGRAPH_MODEL", &self.name)
            .env("COMPOGRAPH_TASK", self.task.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(weights) = &self.weights {
            cmd.env("COMPOGRAPH_WEIGHTS", weights);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| self.failed(format!("cannot start '{}': {}", program, e)))?;

        // The child may fill stdout before draining stdin.
        let stdin = child.stdin.take();
        let (output, written) = thread::scope(|scope| {
            let writer = stdin.map(|mut stdin| scope.spawn(move || stdin.write_all(&input)));
            let output = child.wait_with_output();
            (output, writer.map(|handle| handle.join()))
        });

        let output = output.map_err(|e| self.failed(e.to_string()))?;
        match written {
            Some(Ok(Err(e))) if e.kind() != io::ErrorKind::BrokenPipe => {
                return Err(self.failed(format!("cannot write image: {}", e)));
            }
            Some(Err(_)) => return Err(self.failed("image writer panicked")),
            _ => {}
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.failed(format!("{}: {}", output.status, stderr.trim())));
        }
        Ok(output.stdout)
    }
}

impl ModelAdapter for CommandModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn task(&self) -> Task {
        self.task
    }

    fn codec(&self) -> &TagCodec {
        &self.codec
    }

    fn is_trained(&self) -> bool {
        self.weights.as_ref().is_none_or(|weights| weights.exists())
    }

    fn predict(&self, image: &ImageInput<'_>) -> Result<Vec<Prediction>, CompographError> {
        let stdout = self.run_command(image.encoded_bytes()?)?;
        let mut predictions: Vec<Prediction> = serde_json::from_slice(&stdout)
            .map_err(|e| self.failed(format!("invalid output: {}", e)))?;

        if let Some(map) = &self.label_map {
            for prediction in &mut predictions {
                if let Some(label) = map.label_for_class(&prediction.label) {
                    prediction.label = label.to_string();
                }
            }
        }
        let before = predictions.len();
        predictions.retain(|p| p.confidence >= self.threshold);
        debug!(
            model = %self.name,
            kept = predictions.len(),
            dropped = before - predictions.len(),
            "command predictions"
        );
        Ok(predictions)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::annotation::ImageSource;
    use std::fs;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn with_image<R>(f: impl FnOnce(ImageInput<'_>) -> R) -> R {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.png");
        fs::write(&path, b"not really an image").unwrap();
        let source = ImageSource::from_path(&path);
        f(ImageInput::Whole {
            id: "set/1",
            source: &source,
        })
    }

    #[test]
    fn parses_predictions_and_applies_threshold() {
        let model = CommandModel::new(
            "cls",
            Task::Classify,
            TagCodec::single("CLASS"),
            sh(r#"cat >/dev/null; echo '[{"label":"A","confidence":0.9},{"label":"B","confidence":0.1}]'"#),
        )
        .with_threshold(0.5);

        let predictions = with_image(|input| model.predict(&input)).unwrap();
        assert_eq!(predictions, vec![Prediction::new("A", 0.9)]);
    }

    #[test]
    fn translates_class_names() {
        let model = CommandModel::new(
            "cls",
            Task::Classify,
            TagCodec::single("CLASS"),
            sh(r#"cat >/dev/null; echo '[{"label":"C0002","confidence":1.0}]'"#),
        )
        .with_label_map(LabelMap::from_labels(["arrow", "circle"]));

        let predictions = with_image(|input| model.predict(&input)).unwrap();
        assert_eq!(predictions[0].label, "circle");
    }

    #[test]
    fn failing_command_is_a_model_error() {
        let model = CommandModel::new(
            "det",
            Task::Detect,
            TagCodec::default(),
            sh("echo boom >&2; exit 3"),
        );
        let err = with_image(|input| model.predict(&input)).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn missing_weights_means_untrained() {
        let model = CommandModel::new("det", Task::Detect, TagCodec::default(), sh("true"));
        assert!(model.is_trained());
        let model = model.with_weights("/nonexistent/weights.bin");
        assert!(!model.is_trained());
    }
}
