use crate::{
    data::{DatasetLayout, ImageBatcher},
    error::TrainError,
    model::ClassifierConfig,
};
use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    optim::AdamConfig,
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
    train::{
        metric::{AccuracyMetric, LossMetric},
        LearnerBuilder,
    },
};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ClassifierConfig,
    pub optimizer: AdamConfig,
    pub dataset: PathBuf,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 1)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    #[config(default = 0.2)]
    pub validation_split: f64,
}

/// Fails when wiping `artifact_dir` would also wipe `dataset` or the working directory.
fn check_artifact_dir(artifact_dir: &Path, dataset: &Path) -> Result<(), TrainError> {
    let Ok(dir) = artifact_dir.canonicalize() else {
        return Ok(());
    };
    let dataset = dataset.canonicalize()?;
    let cwd = std::env::current_dir()?.canonicalize()?;
    if dataset.starts_with(&dir) || cwd.starts_with(&dir) {
        return Err(TrainError::ArtifactDir(artifact_dir.to_path_buf()));
    }
    Ok(())
}

fn create_artifact_dir(artifact_dir: &Path) -> std::io::Result<()> {
    // Remove existing artifacts before to get an accurate learner summary
    std::fs::remove_dir_all(artifact_dir).ok();
    std::fs::create_dir_all(artifact_dir)
}

/// Fine-tunes the classifier head on `config.dataset` and saves it to `output`.
///
/// The dataset layout is checked before anything is created on disk. Returns
/// the path of the saved weights.
pub fn train<B: AutodiffBackend>(
    artifact_dir: impl AsRef<Path>,
    output: impl AsRef<Path>,
    config: TrainingConfig,
    device: B::Device,
) -> Result<PathBuf, TrainError> {
    let artifact_dir = artifact_dir.as_ref();
    let output = output.as_ref();

    let layout = DatasetLayout::inspect(&config.dataset)?;
    info!(classes = ?layout.class_names(), "Dataset layout is valid");

    check_artifact_dir(artifact_dir, &config.dataset)?;
    create_artifact_dir(artifact_dir)?;
    B::seed(config.seed);

    let config_path = artifact_dir.join("train_config.json");
    config
        .save(&config_path)
        .map_err(|err| TrainError::Save(config_path, err.to_string()))?;

    let model_config = ClassifierConfig {
        num_classes: layout.num_classes(),
        ..config.model.clone()
    };
    let model = model_config
        .init_pretrained::<B>(&device)
        .map_err(TrainError::Pretrained)?;
    info!("Pretrained backbone loaded and frozen");

    let (train_set, valid_set) = layout.split(config.validation_split);
    info!(
        train = train_set.len(),
        valid = valid_set.len(),
        "Split dataset"
    );

    let dataloader_train = DataLoaderBuilder::new(ImageBatcher::<B>::new(device.clone()))
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(train_set);

    let dataloader_valid =
        DataLoaderBuilder::new(ImageBatcher::<B::InnerBackend>::new(device.clone()))
            .batch_size(config.batch_size)
            .num_workers(config.num_workers)
            .build(valid_set);

    let learner = LearnerBuilder::new(artifact_dir)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .with_file_checkpointer(CompactRecorder::new())
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .summary()
        .build(model, config.optimizer.init(), config.learning_rate);

    let model_trained = learner.fit(dataloader_train, dataloader_valid);

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let config_out = output.with_extension("json");
    model_config
        .save(&config_out)
        .map_err(|err| TrainError::Save(config_out, err.to_string()))?;
    model_trained
        .save_file(output.to_path_buf(), &CompactRecorder::new())
        .map_err(|err| TrainError::Save(output.to_path_buf(), format!("{err:?}")))?;

    let weights = output.with_extension("mpk");
    info!("Model trained and saved as {}", weights.display());
    Ok(weights)
}
