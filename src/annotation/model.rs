//! Assemblies, parts and the relations between them.
//!
//! An [`Assembly`] owns its parts in an arena keyed by [`PartId`]. Relations
//! store handles into that arena instead of references, so removing or
//! merging parts is a single arena operation and a relation can never point
//! at a part the assembly no longer owns.

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::bbox::BBox;
use super::ids::PartId;
use super::source::{CropCache, ImageSource};
use super::space::Normalized;
use super::subject::Subject;
use super::tags::Tags;
use crate::error::CompographError;
use crate::matching::merge_boxes;

/// Meta key holding a prediction confidence.
pub const CONFIDENCE_KEY: &str = "confidence";

/// The kind of value a pipeline step operates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Assembly,
    Part,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Assembly => f.write_str("assembly"),
            Target::Part => f.write_str("part"),
        }
    }
}

/// A part bound inside an assembly.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Part {
    bbox: BBox<Normalized>,
    pub tags: Tags,
    pub meta: Tags,
    crop: CropCache,
}

impl Part {
    /// Creates an untagged part with the given box.
    pub fn new(bbox: BBox<Normalized>) -> Self {
        Self {
            bbox,
            ..Self::default()
        }
    }

    /// Builder-style setter for the tag dictionary.
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// The box, normalized to the owning assembly's image.
    pub fn bbox(&self) -> BBox<Normalized> {
        self.bbox
    }

    /// Replaces the box and drops any cached crop.
    pub fn set_bbox(&mut self, bbox: BBox<Normalized>) {
        self.bbox = bbox;
        self.crop.invalidate();
    }

    /// Confidence stored by the model that produced this part, if any.
    pub fn confidence(&self) -> Option<f64> {
        self.meta.get(CONFIDENCE_KEY).and_then(|v| v.parse().ok())
    }

    /// Returns true if a crop is cached for the current box.
    pub fn has_cached_crop(&self) -> bool {
        self.crop.get().is_some()
    }

    /// Crops this part out of the parent image, caching the result.
    ///
    /// `Ok(None)` means the parent has no image.
    pub fn crop(&self, parent: &ImageSource) -> Result<Option<Arc<DynamicImage>>, CompographError> {
        if let Some(cached) = self.crop.get() {
            return Ok(Some(cached));
        }
        let Some(image) = parent.load()? else {
            return Ok(None);
        };
        let (width, height) = (image.width(), image.height());
        let (x, y, w, h) = self
            .bbox
            .to_pixel(width as f64, height as f64)
            .crop_rect(width, height);
        Ok(Some(self.crop.store(Arc::new(image.crop_imm(x, y, w, h)))))
    }
}

/// A directed, tagged edge between two parts of the same assembly.
#[derive(Clone, Debug, PartialEq)]
pub struct Relation {
    start: PartId,
    end: PartId,
    pub tags: Tags,
}

impl Relation {
    pub fn start(&self) -> PartId {
        self.start
    }

    pub fn end(&self) -> PartId {
        self.end
    }

    fn touches(&self, id: PartId) -> bool {
        self.start == id || self.end == id
    }
}

/// A composite annotated unit: an image, its parts and their relations.
#[derive(Clone, Debug)]
pub struct Assembly {
    pub id: String,
    pub image: ImageSource,
    pub tags: Tags,
    pub meta: Tags,
    pub fold: Option<u32>,
    parts: BTreeMap<PartId, Part>,
    relations: Vec<Relation>,
    next_part: u32,
}

impl Assembly {
    /// Creates an empty assembly with no image.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image: ImageSource::none(),
            tags: Tags::new(),
            meta: Tags::new(),
            fold: None,
            parts: BTreeMap::new(),
            relations: Vec::new(),
            next_part: 0,
        }
    }

    /// Builder-style setter for the image.
    pub fn with_image(mut self, image: ImageSource) -> Self {
        self.image = image;
        self
    }

    /// Adds a part and returns its handle.
    pub fn add_part(&mut self, part: Part) -> PartId {
        let id = PartId(self.next_part);
        self.next_part += 1;
        self.parts.insert(id, part);
        id
    }

    pub fn part(&self, id: PartId) -> Option<&Part> {
        self.parts.get(&id)
    }

    /// Parts in insertion order.
    pub fn parts(&self) -> impl Iterator<Item = (PartId, &Part)> {
        self.parts.iter().map(|(id, part)| (*id, part))
    }

    pub fn part_ids(&self) -> Vec<PartId> {
        self.parts.keys().copied().collect()
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Removes a part together with every relation touching it.
    pub fn remove_part(&mut self, id: PartId) -> Option<Part> {
        let part = self.parts.remove(&id)?;
        self.relations.retain(|rel| !rel.touches(id));
        Some(part)
    }

    /// Removes every part and relation.
    pub fn clear_parts(&mut self) {
        self.parts.clear();
        self.relations.clear();
    }

    /// Replaces every part (and therefore drops every relation).
    pub fn replace_parts(&mut self, parts: impl IntoIterator<Item = Part>) -> Vec<PartId> {
        self.clear_parts();
        parts.into_iter().map(|part| self.add_part(part)).collect()
    }

    /// Adds a relation between two parts owned by this assembly.
    pub fn add_relation(
        &mut self,
        start: PartId,
        end: PartId,
        tags: Tags,
    ) -> Result<(), CompographError> {
        for id in [start, end] {
            self.ensure_owned(id)?;
        }
        self.relations.push(Relation { start, end, tags });
        Ok(())
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Relations ending at `id`.
    pub fn inbound(&self, id: PartId) -> impl Iterator<Item = &Relation> {
        self.relations.iter().filter(move |rel| rel.end == id)
    }

    /// Relations starting at `id`.
    pub fn outbound(&self, id: PartId) -> impl Iterator<Item = &Relation> {
        self.relations.iter().filter(move |rel| rel.start == id)
    }

    /// Merges part `from` into part `into`.
    ///
    /// Tags and meta of `from` override those of `into`, the box becomes the
    /// smallest box enclosing both, relations of `from` are redirected to
    /// `into` (self-loops are dropped) and `from` is removed.
    pub fn merge_parts(&mut self, from: PartId, into: PartId) -> Result<(), CompographError> {
        self.ensure_owned(from)?;
        self.ensure_owned(into)?;
        if from == into {
            return Ok(());
        }
        let Some(source) = self.parts.remove(&from) else {
            return Err(self.unknown_part(from));
        };
        let Some(target) = self.parts.get_mut(&into) else {
            return Err(self.unknown_part(into));
        };
        target.tags.update(&source.tags);
        target.meta.update(&source.meta);
        target.set_bbox(merge_boxes(&target.bbox(), &source.bbox()));

        for rel in &mut self.relations {
            if rel.start == from {
                rel.start = into;
            }
            if rel.end == from {
                rel.end = into;
            }
        }
        self.relations.retain(|rel| rel.start != rel.end);
        Ok(())
    }

    /// One [`Subject`] per part, each able to crop from this assembly's image.
    pub fn part_subjects(&mut self) -> impl Iterator<Item = Subject<'_>> {
        let Assembly {
            id, image, parts, ..
        } = self;
        let id: &str = id;
        let image: &ImageSource = image;
        parts
            .values_mut()
            .map(move |part| Subject::Bound { id, image, part })
    }

    fn ensure_owned(&self, id: PartId) -> Result<(), CompographError> {
        if self.parts.contains_key(&id) {
            Ok(())
        } else {
            Err(self.unknown_part(id))
        }
    }

    fn unknown_part(&self, part: PartId) -> CompographError {
        CompographError::UnknownPart {
            assembly: self.id.clone(),
            part,
        }
    }
}

/// A part annotated on its own, with no owning assembly.
#[derive(Clone, Debug)]
pub struct IsolatedPart {
    pub id: String,
    pub image: ImageSource,
    pub tags: Tags,
    pub meta: Tags,
    pub fold: Option<u32>,
}

impl IsolatedPart {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image: ImageSource::none(),
            tags: Tags::new(),
            meta: Tags::new(),
            fold: None,
        }
    }

    pub fn with_image(mut self, image: ImageSource) -> Self {
        self.image = image;
        self
    }

    pub fn confidence(&self) -> Option<f64> {
        self.meta.get(CONFIDENCE_KEY).and_then(|v| v.parse().ok())
    }
}

/// Either kind of stored annotation.
#[derive(Clone, Debug)]
pub enum Annotation {
    Assembly(Assembly),
    Part(IsolatedPart),
}

impl Annotation {
    /// Creates an empty annotation of the given kind around an image.
    pub fn empty(target: Target, id: impl Into<String>, image: ImageSource) -> Self {
        match target {
            Target::Assembly => Annotation::Assembly(Assembly::new(id).with_image(image)),
            Target::Part => Annotation::Part(IsolatedPart::new(id).with_image(image)),
        }
    }

    pub fn target(&self) -> Target {
        match self {
            Annotation::Assembly(_) => Target::Assembly,
            Annotation::Part(_) => Target::Part,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Annotation::Assembly(a) => &a.id,
            Annotation::Part(p) => &p.id,
        }
    }

    pub fn fold(&self) -> Option<u32> {
        match self {
            Annotation::Assembly(a) => a.fold,
            Annotation::Part(p) => p.fold,
        }
    }

    pub fn set_fold(&mut self, fold: Option<u32>) {
        match self {
            Annotation::Assembly(a) => a.fold = fold,
            Annotation::Part(p) => p.fold = fold,
        }
    }

    pub fn image(&self) -> &ImageSource {
        match self {
            Annotation::Assembly(a) => &a.image,
            Annotation::Part(p) => &p.image,
        }
    }

    /// Borrows the annotation as a pipeline subject.
    pub fn subject(&mut self) -> Subject<'_> {
        match self {
            Annotation::Assembly(a) => Subject::Assembly(a),
            Annotation::Part(p) => Subject::Isolated(p),
        }
    }
}

impl From<Assembly> for Annotation {
    fn from(assembly: Assembly) -> Self {
        Annotation::Assembly(assembly)
    }
}

impl From<IsolatedPart> for Annotation {
    fn from(part: IsolatedPart) -> Self {
        Annotation::Part(part)
    }
}
