mod cli;
mod data;
mod error;
mod labels;
mod model;
mod predict;
mod server;
mod train;

pub use cli::run;
pub use data::{decode_image, preprocess, to_batch, DatasetLayout, CATEGORY_COUNT, SIZE};
pub use error::{ClassifyError, DatasetError, LoadError, TrainError};
pub use labels::{group_of, label_at, Group, BIODEGRADABLE, LABELS, NON_BIODEGRADABLE};
pub use model::{ClassifierConfig, WasteClassifier};
pub use predict::{arg_max, Classifier, ImageClassifier};
pub use server::{
    handle_rejection, routes, serve, ClassificationResponse, ErrorResponse, ServerConfig,
    SharedClassifier, IMAGE_FIELD,
};
pub use train::{train, TrainingConfig};
