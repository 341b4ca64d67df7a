//! The annotation graph.
//!
//! An [`Assembly`] is a composite annotated unit: an image, a tag dictionary,
//! and an arena of [`Part`]s connected by directed [`Relation`]s. A part can
//! also be annotated on its own as an [`IsolatedPart`].
//!
//! # Design Principles
//!
//! 1. **Normalized placement**: part boxes are stored as [`BBox<Normalized>`]
//!    relative to the assembly image. Pixel rectangles are derived on demand.
//!
//! 2. **Handles, not references**: relations hold [`PartId`]s into the
//!    assembly's arena, so removing or merging parts cannot leave a relation
//!    pointing at a part the assembly no longer owns.
//!
//! 3. **Lazy pixels**: images are decoded on first use and part crops are
//!    cached until the part's box changes.
//!
//! # Example
//!
//! ```
//! use compograph::annotation::{Assembly, BBox, Part, Tags};
//!
//! let mut assembly = Assembly::new("train/0001");
//! let a = assembly.add_part(Part::new(BBox::new(0.3, 0.5, 0.2, 0.2)));
//! let b = assembly.add_part(
//!     Part::new(BBox::new(0.7, 0.5, 0.2, 0.2)).with_tags(Tags::new().with("CLASS", "B")),
//! );
//! assembly.add_relation(a, b, Tags::new()).unwrap();
//! assert_eq!(assembly.outbound(a).count(), 1);
//! ```

mod bbox;
mod ids;
pub mod io_json;
mod model;
mod source;
mod space;
mod subject;
mod tags;

pub use bbox::BBox;
pub use ids::PartId;
pub use model::{Annotation, Assembly, IsolatedPart, Part, Relation, Target, CONFIDENCE_KEY};
pub use source::{ImageInput, ImageSource};
pub use space::{Normalized, Pixel};
pub use subject::Subject;
pub use tags::Tags;
