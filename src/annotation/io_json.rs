//! JSON persistence for annotations.
//!
//! Each annotation is one JSON file next to its image. Parts are stored as a
//! list and relations refer to them by position in that list; part handles
//! are an in-memory concept and are reassigned on load.
//!
//! ```json
//! {
//!   "tags": {"TYPE": "word"},
//!   "fold": 3,
//!   "parts": [{"box": [0.5, 0.5, 0.2, 0.2], "tags": {"CLASS": "A"}}],
//!   "relations": [{"start": 0, "end": 0, "tags": {"FUNC": "partof"}}]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use super::bbox::BBox;
use super::ids::PartId;
use super::model::{Assembly, IsolatedPart, Part};
use super::source::ImageSource;
use super::space::Normalized;
use super::tags::Tags;
use crate::error::CompographError;

#[derive(Serialize, Deserialize)]
struct PartRecord {
    #[serde(rename = "box")]
    bbox: BBox<Normalized>,
    #[serde(default)]
    tags: Tags,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    meta: Tags,
}

#[derive(Serialize, Deserialize)]
struct RelationRecord {
    start: usize,
    end: usize,
    #[serde(default)]
    tags: Tags,
}

#[derive(Serialize, Deserialize)]
struct AssemblyRecord {
    #[serde(default)]
    tags: Tags,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    meta: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fold: Option<u32>,
    #[serde(default)]
    parts: Vec<PartRecord>,
    #[serde(default)]
    relations: Vec<RelationRecord>,
}

#[derive(Serialize, Deserialize)]
struct IsolatedPartRecord {
    #[serde(default)]
    tags: Tags,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    meta: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fold: Option<u32>,
}

/// Parses an assembly from JSON. `path` is only used in error messages.
pub fn parse_assembly(
    json: &str,
    path: &Path,
    id: impl Into<String>,
    image: ImageSource,
) -> Result<Assembly, CompographError> {
    let record: AssemblyRecord =
        serde_json::from_str(json).map_err(|source| CompographError::AnnotationParse {
            path: path.to_path_buf(),
            source,
        })?;
    assembly_from_record(record, path, id.into(), image)
}

/// Reads an assembly from a JSON file.
pub fn read_assembly(
    path: &Path,
    id: impl Into<String>,
    image: ImageSource,
) -> Result<Assembly, CompographError> {
    let file = File::open(path)?;
    let record: AssemblyRecord = serde_json::from_reader(BufReader::new(file)).map_err(|source| {
        CompographError::AnnotationParse {
            path: path.to_path_buf(),
            source,
        }
    })?;
    assembly_from_record(record, path, id.into(), image)
}

/// Writes an assembly to a JSON file.
pub fn write_assembly(path: &Path, assembly: &Assembly) -> Result<(), CompographError> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), &assembly_to_record(assembly)).map_err(
        |source| CompographError::AnnotationWrite {
            path: path.to_path_buf(),
            source,
        },
    )
}

/// Serializes an assembly to a JSON string.
pub fn assembly_to_json_string(assembly: &Assembly) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&assembly_to_record(assembly))
}

/// Parses an isolated part from JSON. `path` is only used in error messages.
pub fn parse_part(
    json: &str,
    path: &Path,
    id: impl Into<String>,
    image: ImageSource,
) -> Result<IsolatedPart, CompographError> {
    let record: IsolatedPartRecord =
        serde_json::from_str(json).map_err(|source| CompographError::AnnotationParse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(part_from_record(record, id.into(), image))
}

/// Reads an isolated part from a JSON file.
pub fn read_part(
    path: &Path,
    id: impl Into<String>,
    image: ImageSource,
) -> Result<IsolatedPart, CompographError> {
    let file = File::open(path)?;
    let record: IsolatedPartRecord = serde_json::from_reader(BufReader::new(file))
        .map_err(|source| CompographError::AnnotationParse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(part_from_record(record, id.into(), image))
}

/// Writes an isolated part to a JSON file.
pub fn write_part(path: &Path, part: &IsolatedPart) -> Result<(), CompographError> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), &part_to_record(part)).map_err(|source| {
        CompographError::AnnotationWrite {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Serializes an isolated part to a JSON string.
pub fn part_to_json_string(part: &IsolatedPart) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&part_to_record(part))
}

fn assembly_from_record(
    record: AssemblyRecord,
    path: &Path,
    id: String,
    image: ImageSource,
) -> Result<Assembly, CompographError> {
    let mut assembly = Assembly::new(id).with_image(image);
    assembly.tags = record.tags;
    assembly.meta = record.meta;
    assembly.fold = record.fold;

    let ids: Vec<PartId> = record
        .parts
        .into_iter()
        .map(|rec| {
            let mut part = Part::new(rec.bbox).with_tags(rec.tags);
            part.meta = rec.meta;
            assembly.add_part(part)
        })
        .collect();

    for (n, rel) in record.relations.into_iter().enumerate() {
        let (Some(&start), Some(&end)) = (ids.get(rel.start), ids.get(rel.end)) else {
            return Err(CompographError::InvalidAnnotation {
                path: path.to_path_buf(),
                message: format!(
                    "relation {} refers to part {} or {}, but there are only {} parts",
                    n,
                    rel.start,
                    rel.end,
                    ids.len()
                ),
            });
        };
        assembly.add_relation(start, end, rel.tags)?;
    }
    Ok(assembly)
}

fn assembly_to_record(assembly: &Assembly) -> AssemblyRecord {
    let positions: BTreeMap<PartId, usize> = assembly
        .part_ids()
        .into_iter()
        .enumerate()
        .map(|(pos, id)| (id, pos))
        .collect();

    AssemblyRecord {
        tags: assembly.tags.clone(),
        meta: assembly.meta.clone(),
        fold: assembly.fold,
        parts: assembly
            .parts()
            .map(|(_, part)| PartRecord {
                bbox: part.bbox(),
                tags: part.tags.clone(),
                meta: part.meta.clone(),
            })
            .collect(),
        // Every endpoint is owned, so both lookups succeed.
        relations: assembly
            .relations()
            .iter()
            .filter_map(|rel| {
                Some(RelationRecord {
                    start: *positions.get(&rel.start())?,
                    end: *positions.get(&rel.end())?,
                    tags: rel.tags.clone(),
                })
            })
            .collect(),
    }
}

fn part_from_record(record: IsolatedPartRecord, id: String, image: ImageSource) -> IsolatedPart {
    let mut part = IsolatedPart::new(id).with_image(image);
    part.tags = record.tags;
    part.meta = record.meta;
    part.fold = record.fold;
    part
}

fn part_to_record(part: &IsolatedPart) -> IsolatedPartRecord {
    IsolatedPartRecord {
        tags: part.tags.clone(),
        meta: part.meta.clone(),
        fold: part.fold,
    }
}
