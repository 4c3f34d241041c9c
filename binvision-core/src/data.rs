use crate::error::{ClassifyError, DatasetError};
use burn::{
    data::dataloader::{batcher::Batcher, Dataset},
    prelude::*,
    tensor::TensorData,
};
use image::{imageops::FilterType, DynamicImage};
use mime_guess::MimeGuess;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Side length of the square model input.
pub const SIZE: usize = 224;
/// Number of class directories a training dataset must have.
pub const CATEGORY_COUNT: usize = 2;

/// Decodes an uploaded file into a pixel grid.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ClassifyError> {
    let img = image::load_from_memory(bytes)?;
    if img.width() == 0 || img.height() == 0 {
        return Err(ClassifyError::Empty);
    }
    Ok(img)
}

/// Resizes to `SIZE`x`SIZE` RGB and scales to [0, 1].
///
/// The result is channel-major, `[3, SIZE, SIZE]` flattened.
pub fn preprocess(img: &DynamicImage) -> Vec<f32> {
    let size = SIZE as u32;
    let rgb = if img.width() == size && img.height() == size {
        img.to_rgb8()
    } else {
        img.resize_exact(size, size, FilterType::Triangle).to_rgb8()
    };
    debug!(width = img.width(), height = img.height(), "resized to {SIZE}x{SIZE}");

    let plane = SIZE * SIZE;
    let mut data = vec![0.0; 3 * plane];
    for (i, pixel) in rgb.pixels().enumerate() {
        for (c, value) in pixel.0.iter().enumerate() {
            data[c * plane + i] = *value as f32 / 255.0;
        }
    }
    data
}

/// Adds the batch dimension: `[1, 3, SIZE, SIZE]`.
pub fn to_batch<B: Backend>(pixels: Vec<f32>, device: &B::Device) -> Tensor<B, 4> {
    Tensor::from_data(TensorData::new(pixels, [1, 3, SIZE, SIZE]), device)
}

/// An image MIME type whose header the `image` crate can read.
fn is_image(path: &Path) -> bool {
    matches!(MimeGuess::from_path(path).first(), Some(mime) if mime.type_() == "image")
        && image::image_dimensions(path).is_ok_and(|(w, h)| w > 0 && h > 0)
}

fn collect_images(dir: &Path) -> Vec<PathBuf> {
    let mut images = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|res| res.ok())
        .filter(|e| e.file_type().is_file() && is_image(e.path()))
        .map(|e| e.into_path())
        .collect::<Vec<_>>();
    images.sort();
    images
}

/// A validated training directory: one subdirectory per class.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    classes: Vec<(String, Vec<PathBuf>)>,
}

impl DatasetLayout {
    /// Checks `root` holds exactly [`CATEGORY_COUNT`] non-empty class directories.
    pub fn inspect(root: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(DatasetError::Missing(root.to_path_buf()));
        }
        info!("Dataset directory {} exists", root.display());

        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        if dirs.len() != CATEGORY_COUNT {
            return Err(DatasetError::CategoryCount {
                found: dirs.len(),
                expected: CATEGORY_COUNT,
            });
        }
        dirs.sort();

        let mut classes = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let images = collect_images(&dir);
            info!("Checking {name}... {} images found", images.len());
            if images.is_empty() {
                return Err(DatasetError::EmptyCategory(name));
            }
            classes.push((name, images));
        }
        Ok(Self { classes })
    }

    /// Class names in label order.
    pub fn class_names(&self) -> Vec<&str> {
        self.classes.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Splits every class, the first `validation_split` of its files going to validation.
    pub fn split(&self, validation_split: f64) -> (ImageDataSet, ImageDataSet) {
        let mut train = Vec::new();
        let mut valid = Vec::new();
        for (label, (_, images)) in self.classes.iter().enumerate() {
            let cut = (images.len() as f64 * validation_split) as usize;
            let (v, t) = images.split_at(cut.min(images.len()));
            valid.extend(v.iter().map(|p| (p.clone(), label)));
            train.extend(t.iter().map(|p| (p.clone(), label)));
        }
        (ImageDataSet { inner: train }, ImageDataSet { inner: valid })
    }
}

#[derive(Debug, Clone)]
pub struct ImageItem {
    pixels: Vec<f32>,
    label: usize,
}

pub struct ImageDataSet {
    inner: Vec<(PathBuf, usize)>,
}

impl Dataset<ImageItem> for ImageDataSet {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.inner.get(index).map(|(path, label)| ImageItem {
            pixels: open_image(path)
                .unwrap_or_else(|| panic!("Failed to load image {}", path.display())),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

fn open_image(path: impl AsRef<Path>) -> Option<Vec<f32>> {
    let img = image::open(path).ok()?;
    if img.width() == 0 || img.height() == 0 {
        return None;
    }
    Some(preprocess(&img))
}

#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
}

#[derive(Debug, Clone)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ImageBatch<B> {
        let images = items
            .iter()
            .map(|item| to_batch::<B>(item.pixels.clone(), &self.device))
            .collect::<Vec<_>>();
        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    TensorData::from([item.label as i64]),
                    &self.device,
                )
            })
            .collect::<Vec<_>>();

        ImageBatch {
            images: Tensor::cat(images, 0),
            targets: Tensor::cat(targets, 0),
        }
    }
}
