//! Per-observation prediction records.
//!
//! With `test --predictions-csv`, every registered observation is written as
//! one CSV row so results can be analysed outside of compograph.

use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::CompographError;

const HEADER: [&str; 5] = ["prediction", "truth", "image", "confidence", "iou"];

/// One compared prediction/truth pair.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Observation {
    pub prediction: Option<String>,
    pub truth: Option<String>,
    /// Id of the evaluated annotation.
    pub image: String,
    pub confidence: Option<f64>,
    /// Overlap of the matched boxes, for detection only.
    pub iou: Option<f64>,
}

/// Writes [`Observation`]s as CSV.
pub struct PredictionWriter<W: Write> {
    inner: csv::Writer<W>,
}

impl PredictionWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self, CompographError> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file))
    }
}

impl<W: Write> PredictionWriter<W> {
    /// Wraps a writer and writes the header row.
    pub fn new(writer: W) -> Result<Self, CompographError> {
        let mut inner = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(writer);
        inner.write_record(HEADER)?;
        Ok(Self { inner })
    }

    pub fn write(&mut self, observation: &Observation) -> Result<(), CompographError> {
        self.inner.serialize(observation)?;
        Ok(())
    }

    /// Flushes and returns the underlying writer.
    pub fn finish(self) -> Result<W, CompographError> {
        let mut writer = self
            .inner
            .into_inner()
            .map_err(|e| CompographError::Io(e.into_error()))?;
        writer.flush()?;
        Ok(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_header_and_empty_fields() {
        let mut writer = PredictionWriter::new(Vec::new()).unwrap();
        writer
            .write(&Observation {
                prediction: None,
                truth: Some("A".into()),
                image: "set/1".into(),
                confidence: None,
                iou: Some(0.0),
            })
            .unwrap();
        writer
            .write(&Observation {
                prediction: Some("B".into()),
                truth: Some("A".into()),
                image: "set/1".into(),
                confidence: Some(0.75),
                iou: Some(0.5),
            })
            .unwrap();
        let text = String::from_utf8(writer.finish().unwrap()).unwrap();
        assert_eq!(
            text,
            "prediction,truth,image,confidence,iou\n,A,set/1,,0.0\nB,A,set/1,0.75,0.5\n"
        );
    }

    #[test]
    fn header_is_written_without_rows() {
        let writer = PredictionWriter::new(Vec::new()).unwrap();
        let text = String::from_utf8(writer.finish().unwrap()).unwrap();
        assert_eq!(text, "prediction,truth,image,confidence,iou\n");
    }
}
