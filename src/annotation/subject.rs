//! The mutable value a pipeline step runs on.

use super::model::{Assembly, IsolatedPart, Part, Target, CONFIDENCE_KEY};
use super::source::{ImageInput, ImageSource};
use super::tags::Tags;

/// A borrowed assembly, isolated part, or part bound inside an assembly.
///
/// Bound parts keep a reference to the parent image so models can predict
/// on the crop without the part owning any pixels.
#[derive(Debug)]
pub enum Subject<'a> {
    Assembly(&'a mut Assembly),
    Isolated(&'a mut IsolatedPart),
    Bound {
        id: &'a str,
        image: &'a ImageSource,
        part: &'a mut Part,
    },
}

impl Subject<'_> {
    pub fn target(&self) -> Target {
        match self {
            Subject::Assembly(_) => Target::Assembly,
            Subject::Isolated(_) | Subject::Bound { .. } => Target::Part,
        }
    }

    /// Identifier of the annotation this subject belongs to.
    pub fn id(&self) -> &str {
        match self {
            Subject::Assembly(a) => &a.id,
            Subject::Isolated(p) => &p.id,
            Subject::Bound { id, .. } => id,
        }
    }

    pub fn tags(&self) -> &Tags {
        match self {
            Subject::Assembly(a) => &a.tags,
            Subject::Isolated(p) => &p.tags,
            Subject::Bound { part, .. } => &part.tags,
        }
    }

    pub fn tags_mut(&mut self) -> &mut Tags {
        match self {
            Subject::Assembly(a) => &mut a.tags,
            Subject::Isolated(p) => &mut p.tags,
            Subject::Bound { part, .. } => &mut part.tags,
        }
    }

    pub fn meta(&self) -> &Tags {
        match self {
            Subject::Assembly(a) => &a.meta,
            Subject::Isolated(p) => &p.meta,
            Subject::Bound { part, .. } => &part.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut Tags {
        match self {
            Subject::Assembly(a) => &mut a.meta,
            Subject::Isolated(p) => &mut p.meta,
            Subject::Bound { part, .. } => &mut part.meta,
        }
    }

    /// Records a prediction confidence in the subject's meta.
    pub fn set_confidence(&mut self, confidence: f64) {
        self.meta_mut()
            .insert(CONFIDENCE_KEY, confidence.to_string());
    }

    /// The image a model should predict on for this subject.
    pub fn image_input(&self) -> ImageInput<'_> {
        match self {
            Subject::Assembly(a) => ImageInput::Whole {
                id: &a.id,
                source: &a.image,
            },
            Subject::Isolated(p) => ImageInput::Whole {
                id: &p.id,
                source: &p.image,
            },
            Subject::Bound { id, image, part } => ImageInput::Crop {
                id,
                parent: image,
                part: &**part,
            },
        }
    }

    /// The assembly, when this subject is one.
    pub fn as_assembly_mut(&mut self) -> Option<&mut Assembly> {
        match self {
            Subject::Assembly(a) => Some(a),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::BBox;

    #[test]
    fn bound_part_writes_through() {
        let mut assembly = Assembly::new("set/1");
        let id = assembly.add_part(Part::new(BBox::new(0.5, 0.5, 0.1, 0.1)));

        for mut subject in assembly.part_subjects() {
            assert_eq!(subject.target(), Target::Part);
            assert_eq!(subject.id(), "set/1");
            subject.set_confidence(0.75);
            assert!(matches!(subject.image_input(), ImageInput::Crop { .. }));
        }
        assert_eq!(assembly.part(id).unwrap().confidence(), Some(0.75));
    }

    #[test]
    fn assembly_subject_targets_assembly() {
        let mut assembly = Assembly::new("set/2");
        let mut subject = Subject::Assembly(&mut assembly);
        assert_eq!(subject.target(), Target::Assembly);
        subject.tags_mut().insert("TYPE", "word");
        assert!(subject.as_assembly_mut().is_some());
        assert_eq!(assembly.tags.get("TYPE"), Some("word"));
    }
}
