//! Evaluation report types and formatting.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;

use crate::error::CompographError;

/// Name of the micro-averaged row in tables and CSV output.
pub const OVERALL: &str = "overall";

/// Precision, recall and F-score of one label, or of all of them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ClassScores {
    /// True positives, false positives and false negatives together.
    pub count: usize,
    pub precision: f64,
    pub recall: f64,
    pub fscore: f64,
}

impl ClassScores {
    pub(crate) fn from_counts(tp: usize, fp: usize, fn_: usize) -> Self {
        let precision = safe_divide(tp as f64, (tp + fp) as f64);
        let recall = safe_divide(tp as f64, (tp + fn_) as f64);
        Self {
            count: tp + fp + fn_,
            precision,
            recall,
            fscore: safe_divide(2.0 * precision * recall, precision + recall),
        }
    }
}

/// Accuracy figures over every registered observation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Accuracy {
    /// Observations whose prediction equals the truth.
    pub overall: f64,
    /// Observations that received any prediction.
    pub detection: f64,
    /// Predicted observations whose prediction equals the truth.
    pub classification: f64,
}

/// The result of an evaluation.
///
/// `overall` is kept apart from `classes`, so a label literally called
/// "overall" keeps its own scores in JSON output.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub classes: BTreeMap<String, ClassScores>,
    pub overall: ClassScores,
    pub accuracy: Accuracy,
    /// Number of registered observations with a truth label.
    pub observations: usize,
}

impl EvaluationReport {
    /// Per-label rows in label order, then the overall row.
    pub fn rows(&self) -> impl Iterator<Item = (&str, &ClassScores)> {
        self.classes
            .iter()
            .map(|(label, scores)| (label.as_str(), scores))
            .chain(std::iter::once((OVERALL, &self.overall)))
    }

    /// Writes `class;count;precision;recall;f-score` rows.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), CompographError> {
        let mut csv_writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .from_writer(writer);
        csv_writer.write_record(["class", "count", "precision", "recall", "f-score"])?;
        for (label, scores) in self.rows() {
            csv_writer.write_record([
                label.to_string(),
                scores.count.to_string(),
                scores.precision.to_string(),
                scores.recall.to_string(),
                scores.fscore.to_string(),
            ])?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    pub fn to_json_string(&self) -> Result<String, CompographError> {
        serde_json::to_string_pretty(self).map_err(CompographError::Serialize)
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = "class           count precision  recall f-score";
        writeln!(f, "{}", header)?;
        writeln!(f, "{}", "-".repeat(header.len()))?;
        for (label, s) in self.rows() {
            writeln!(
                f,
                "{:15} {:5} {:9.2} {:7.2} {:7.2}",
                label, s.count, s.precision, s.recall, s.fscore
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "Accuracy: {:.2} overall, {:.2} detection, {:.2} classification ({} observations)",
            self.accuracy.overall,
            self.accuracy.detection,
            self.accuracy.classification,
            self.observations
        )
    }
}

pub(crate) fn safe_divide(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        0.0
    } else {
        a / b
    }
}
