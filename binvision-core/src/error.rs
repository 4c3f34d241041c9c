use std::path::PathBuf;

/// Errors raised while loading the classifier at startup.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("model file '{}' not found", .0.display())]
    MissingModel(PathBuf),
    #[error("failed to read model config {}: {1}", .0.display())]
    Config(PathBuf, String),
    #[error("model has {found} output classes, expected {expected}")]
    ClassCount { found: usize, expected: usize },
    #[error("failed to load model weights: {0}")]
    Record(String),
}

/// Errors raised while classifying a single upload.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image has no pixels")]
    Empty,
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("predicted index {0} is outside the label set")]
    LabelOutOfRange(usize),
}

/// Errors raised while inspecting a training dataset directory.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("dataset folder not found at {}", .0.display())]
    Missing(PathBuf),
    #[error("expected {expected} categories, but found {found}")]
    CategoryCount { found: usize, expected: usize },
    #[error("no images found in category '{0}'")]
    EmptyCategory(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by a training run.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to save {}: {1}", .0.display())]
    Save(PathBuf, String),
    #[error("refusing to recreate artifact directory {}: it contains the dataset or the working directory", .0.display())]
    ArtifactDir(PathBuf),
    #[error("failed to load pretrained backbone: {0}")]
    Pretrained(String),
}
