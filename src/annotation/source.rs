//! Lazily decoded annotation images.
//!
//! Images are only decoded the first time pixel data is requested. A decoded
//! image is cached in the [`ImageSource`] and shared by reference counting, so
//! cloning an annotation never copies pixels. Part crops are cached in the
//! part itself and dropped whenever the part's box changes.

use image::{DynamicImage, ImageFormat};
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use super::model::Part;
use crate::error::CompographError;

/// Where an annotation's image comes from, plus the decoded-image cache.
#[derive(Clone, Default)]
pub struct ImageSource {
    path: Option<PathBuf>,
    decoded: OnceLock<Arc<DynamicImage>>,
}

impl ImageSource {
    /// An image stored on disk, decoded on first use.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            decoded: OnceLock::new(),
        }
    }

    /// An image already in memory.
    pub fn from_image(image: DynamicImage) -> Self {
        let decoded = OnceLock::new();
        let _ = decoded.set(Arc::new(image));
        Self {
            path: None,
            decoded,
        }
    }

    /// No image at all (annotations built in memory, tests).
    pub fn none() -> Self {
        Self::default()
    }

    /// The backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns true once pixel data has been decoded.
    pub fn is_loaded(&self) -> bool {
        self.decoded.get().is_some()
    }

    /// Returns true if there is a file or in-memory image behind this source.
    pub fn has_image(&self) -> bool {
        self.path.is_some() || self.is_loaded()
    }

    /// Decodes the image if needed. `Ok(None)` means there is no image.
    pub fn load(&self) -> Result<Option<Arc<DynamicImage>>, CompographError> {
        if let Some(image) = self.decoded.get() {
            return Ok(Some(Arc::clone(image)));
        }
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let image = image::open(path).map_err(|source| CompographError::ImageLoad {
            path: path.clone(),
            source,
        })?;
        Ok(Some(Arc::clone(self.decoded.get_or_init(|| Arc::new(image)))))
    }

    /// Image dimensions, read from the file header when not yet decoded.
    pub fn dimensions(&self) -> Result<Option<(u32, u32)>, CompographError> {
        if let Some(image) = self.decoded.get() {
            return Ok(Some((image.width(), image.height())));
        }
        if let Some(path) = &self.path {
            if let Ok(size) = imagesize::size(path) {
                return Ok(Some((size.width as u32, size.height as u32)));
            }
        }
        Ok(self.load()?.map(|image| (image.width(), image.height())))
    }
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageSource")
            .field("path", &self.path)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Cached crop of a part out of its assembly's image.
#[derive(Clone, Default)]
pub(crate) struct CropCache(OnceLock<Arc<DynamicImage>>);

impl CropCache {
    pub(crate) fn get(&self) -> Option<Arc<DynamicImage>> {
        self.0.get().cloned()
    }

    pub(crate) fn store(&self, image: Arc<DynamicImage>) -> Arc<DynamicImage> {
        Arc::clone(self.0.get_or_init(|| image))
    }

    pub(crate) fn invalidate(&mut self) {
        self.0 = OnceLock::new();
    }
}

impl fmt::Debug for CropCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CropCache(cached: {})", self.0.get().is_some())
    }
}

// The cache never takes part in equality.
impl PartialEq for CropCache {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

/// The image a model is asked to predict on.
#[derive(Clone, Copy, Debug)]
pub enum ImageInput<'a> {
    /// The whole image of an assembly or isolated part.
    Whole {
        id: &'a str,
        source: &'a ImageSource,
    },
    /// A part bound inside an assembly, cropped out of the assembly image.
    Crop {
        id: &'a str,
        parent: &'a ImageSource,
        part: &'a Part,
    },
}

impl<'a> ImageInput<'a> {
    /// Identifier of the annotation the image belongs to.
    pub fn id(&self) -> &'a str {
        match self {
            ImageInput::Whole { id, .. } | ImageInput::Crop { id, .. } => id,
        }
    }

    /// The file to read, when the input maps one-to-one onto a file.
    pub fn path(&self) -> Option<&'a Path> {
        match self {
            ImageInput::Whole { source, .. } => source.path(),
            ImageInput::Crop { .. } => None,
        }
    }

    /// Decoded pixels.
    pub fn image(&self) -> Result<Arc<DynamicImage>, CompographError> {
        let image = match self {
            ImageInput::Whole { source, .. } => source.load()?,
            ImageInput::Crop { parent, part, .. } => part.crop(parent)?,
        };
        image.ok_or_else(|| CompographError::MissingImage {
            id: self.id().to_string(),
        })
    }

    /// Width and height in pixels.
    pub fn dimensions(&self) -> Result<(u32, u32), CompographError> {
        let dims = match self {
            ImageInput::Whole { source, .. } => source.dimensions()?,
            ImageInput::Crop { .. } => {
                let image = self.image()?;
                Some((image.width(), image.height()))
            }
        };
        dims.ok_or_else(|| CompographError::MissingImage {
            id: self.id().to_string(),
        })
    }

    /// Encoded bytes to hand to an external engine: the original file when
    /// there is one, otherwise a PNG encoding of the pixels.
    pub fn encoded_bytes(&self) -> Result<Vec<u8>, CompographError> {
        if let Some(path) = self.path() {
            return Ok(std::fs::read(path)?);
        }
        let image = self.image()?;
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(CompographError::ImageEncode)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{BBox, Part};
    use image::{Rgb, RgbImage};

    fn checkerboard(width: u32, height: u32) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for (x, y, px) in img.enumerate_pixels_mut() {
            *px = if (x + y) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            };
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn in_memory_source_is_loaded() {
        let source = ImageSource::from_image(checkerboard(10, 20));
        assert!(source.is_loaded());
        assert_eq!(source.dimensions().unwrap(), Some((10, 20)));
    }

    #[test]
    fn missing_image_is_reported() {
        let source = ImageSource::none();
        assert!(source.load().unwrap().is_none());

        let input = ImageInput::Whole {
            id: "set/1",
            source: &source,
        };
        let err = input.image().unwrap_err();
        assert!(matches!(err, CompographError::MissingImage { .. }));
    }

    #[test]
    fn crop_is_cached_and_invalidated_by_box_change() {
        let source = ImageSource::from_image(checkerboard(100, 50));
        let mut part = Part::new(BBox::new(0.5, 0.5, 0.2, 0.4));

        let crop = part.crop(&source).unwrap().unwrap();
        assert_eq!((crop.width(), crop.height()), (20, 20));
        assert!(part.has_cached_crop());

        part.set_bbox(BBox::new(0.5, 0.5, 0.5, 0.4));
        assert!(!part.has_cached_crop());
        let crop = part.crop(&source).unwrap().unwrap();
        assert_eq!((crop.width(), crop.height()), (50, 20));
    }

    #[test]
    fn crop_input_encodes_png() {
        let source = ImageSource::from_image(checkerboard(8, 8));
        let part = Part::new(BBox::new(0.5, 0.5, 0.5, 0.5));
        let input = ImageInput::Crop {
            id: "set/1",
            parent: &source,
            part: &part,
        };
        let bytes = input.encoded_bytes().unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
        assert_eq!(input.dimensions().unwrap(), (4, 4));
    }
}
