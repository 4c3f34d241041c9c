use crate::{
    data::{decode_image, preprocess, to_batch},
    error::{ClassifyError, LoadError},
    labels::{label_at, LABELS},
    model::{ClassifierConfig, WasteClassifier},
};
use burn::{
    prelude::*,
    record::{CompactRecorder, Recorder},
};
use image::DynamicImage;
use std::path::Path;
use tracing::{debug, info};

/// Anything that maps an image to one of [`LABELS`].
pub trait ImageClassifier: Send + Sync {
    fn classify(&self, image: &DynamicImage) -> Result<&'static str, ClassifyError>;

    /// Decodes raw upload bytes, then classifies them.
    fn classify_bytes(&self, bytes: &[u8]) -> Result<&'static str, ClassifyError> {
        let image = decode_image(bytes)?;
        debug!(
            width = image.width(),
            height = image.height(),
            "Image successfully read"
        );
        self.classify(&image)
    }
}

/// A trained waste classifier, loaded once and read-only afterwards.
pub struct Classifier<B: Backend> {
    model: WasteClassifier<B>,
    device: B::Device,
}

impl<B: Backend> Classifier<B> {
    /// Loads the weights at `path` (and `path` with a `.json` extension, if present).
    ///
    /// The recorder always reads `path` with an `.mpk` extension. Fails when that
    /// file is missing or the model does not have one output per label.
    pub fn load(path: impl AsRef<Path>, device: B::Device) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let weights = path.with_extension("mpk");
        if !weights.is_file() {
            return Err(LoadError::MissingModel(weights));
        }

        let config_path = path.with_extension("json");
        let config = if config_path.is_file() {
            ClassifierConfig::load(&config_path)
                .map_err(|err| LoadError::Config(config_path.clone(), format!("{err:?}")))?
        } else {
            ClassifierConfig::new(LABELS.len())
        };
        if config.num_classes != LABELS.len() {
            return Err(LoadError::ClassCount {
                found: config.num_classes,
                expected: LABELS.len(),
            });
        }

        let record = CompactRecorder::new()
            .load(path.to_path_buf(), &device)
            .map_err(|err| LoadError::Record(format!("{err:?}")))?;
        let model = config.init::<B>(&device).load_record(record);
        info!("Model loaded successfully with {} classes", LABELS.len());
        Self::new(model, device)
    }

    /// Wraps an already built model.
    pub fn new(model: WasteClassifier<B>, device: B::Device) -> Result<Self, LoadError> {
        if model.num_classes() != LABELS.len() {
            return Err(LoadError::ClassCount {
                found: model.num_classes(),
                expected: LABELS.len(),
            });
        }
        Ok(Self { model, device })
    }

    /// Probability of every label, in [`LABELS`] order.
    pub fn probabilities(&self, image: &DynamicImage) -> Result<Vec<f32>, ClassifyError> {
        let batch = to_batch::<B>(preprocess(image), &self.device);
        self.model
            .probabilities(batch)
            .into_data()
            .to_vec::<f32>()
            .map_err(|err| ClassifyError::Inference(format!("{err:?}")))
    }
}

impl<B: Backend> ImageClassifier for Classifier<B>
where
    Classifier<B>: Send + Sync,
{
    fn classify(&self, image: &DynamicImage) -> Result<&'static str, ClassifyError> {
        let probabilities = self.probabilities(image)?;
        debug!(?probabilities, "Raw model predictions");
        let index = arg_max(&probabilities)
            .ok_or_else(|| ClassifyError::Inference("empty prediction".to_string()))?;
        let label = label_at(index).ok_or(ClassifyError::LabelOutOfRange(index))?;
        debug!(label, "Predicted class");
        Ok(label)
    }
}

/// Index of the largest value; the first one on ties. NaN never wins.
pub fn arg_max(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}
