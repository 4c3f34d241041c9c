use crate::{
    predict::Classifier,
    server::{self, ServerConfig, SharedClassifier, DEFAULT_MAX_UPLOAD_BYTES},
    train, ClassifierConfig, TrainingConfig, CATEGORY_COUNT,
};
use anyhow::Context as _;
use burn::{backend::Autodiff, optim::AdamConfig};
use clap::{CommandFactory as _, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::{net::IpAddr, path::PathBuf, sync::Arc};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[clap(subcommand)]
    subcmd: SubCmd,
}

#[derive(Debug, Subcommand)]
enum SubCmd {
    /// Serve the waste classifier over HTTP (POST /classify)
    Serve {
        /// Path to the trained model weights
        #[arg(short, long, default_value = "waste_classifier.mpk")]
        model: PathBuf,
        /// Bind address
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: IpAddr,
        #[arg(short, long, default_value = "5000")]
        port: u16,
        /// Largest accepted upload, in bytes
        #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
        max_upload_bytes: u64,
        /// Also copy every upload into this directory (debugging aid)
        #[arg(long)]
        stage_uploads: Option<PathBuf>,
    },
    /// Fine-tune a MobileNetV2 classifier on a directory with two class folders
    Train {
        /// Dataset root, containing exactly two class directories
        dataset: PathBuf,
        /// Where to save the trained weights (`.mpk` is appended)
        #[arg(short, long, default_value = "waste_classifier")]
        output: PathBuf,
        /// Directory to save checkpoints and metrics (The directory will be recreated if it exists)
        #[arg(short, long, default_value = "binvision_artifact")]
        artifact_dir: PathBuf,
        #[arg(short, long, default_value = "10")]
        num_epochs: usize,
        #[arg(short, long, default_value = "32")]
        batch_size: usize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "1")]
        num_workers: usize,
        /// Learning rate for the optimizer
        #[arg(short, long, default_value = "1.0e-3")]
        learning_rate: f64,
        /// Random seed for reproducibility
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
    /// generate auto completion script
    GenCompletion {
        /// shell name
        shell: Shell,
    },
}

#[cfg(feature = "tch")]
type MyBackend = burn::backend::LibTorch<f32, i8>;
#[cfg(all(feature = "candle", not(feature = "tch")))]
type MyBackend = burn::backend::Candle<f32, u8>;
#[cfg(not(any(feature = "tch", feature = "candle")))]
type MyBackend = burn::backend::NdArray<f32>;

type MyAutodiffBackend = Autodiff<MyBackend>;

fn device() -> <MyBackend as burn::tensor::backend::Backend>::Device {
    #[cfg(all(feature = "tch", target_os = "macos"))]
    let device = burn::backend::libtorch::LibTorchDevice::Mps;
    #[cfg(all(feature = "tch", not(target_os = "macos")))]
    let device = burn::backend::libtorch::LibTorchDevice::Cuda(0);

    #[cfg(all(feature = "candle", not(feature = "tch"), target_os = "macos"))]
    let device = burn::backend::candle::CandleDevice::Metal(0);
    #[cfg(all(feature = "candle", not(feature = "tch"), not(target_os = "macos")))]
    let device = burn::backend::candle::CandleDevice::Cuda(0);

    #[cfg(not(any(feature = "tch", feature = "candle")))]
    let device = burn::backend::ndarray::NdArrayDevice::Cpu;

    device
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

pub fn run() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_logging(&args.log_level);

    match args.subcmd {
        SubCmd::Serve {
            model,
            bind,
            port,
            max_upload_bytes,
            stage_uploads,
        } => {
            let classifier = Classifier::<MyBackend>::load(&model, device())
                .with_context(|| format!("failed to load model {}", model.display()))?;
            let classifier: SharedClassifier = Arc::new(classifier);
            let config = ServerConfig {
                addr: (bind, port).into(),
                max_upload_bytes,
                stage_uploads,
            };
            tokio::runtime::Runtime::new()
                .context("failed to start the async runtime")?
                .block_on(server::serve(classifier, config));
        }
        SubCmd::Train {
            dataset,
            output,
            artifact_dir,
            num_epochs,
            batch_size,
            num_workers,
            learning_rate,
            seed,
        } => {
            let weights = train::<MyAutodiffBackend>(
                artifact_dir,
                output,
                TrainingConfig::new(
                    ClassifierConfig::new(CATEGORY_COUNT),
                    AdamConfig::new(),
                    dataset,
                )
                .with_num_epochs(num_epochs)
                .with_batch_size(batch_size)
                .with_num_workers(num_workers)
                .with_learning_rate(learning_rate)
                .with_seed(seed),
                device(),
            )
            .context("training aborted")?;
            info!("Weights written to {}", weights.display());
        }
        SubCmd::GenCompletion { shell } => {
            generate(shell, &mut Cli::command(), "binvision", &mut std::io::stdout());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["binvision", "serve"]).unwrap();
        match cli.subcmd {
            SubCmd::Serve {
                model,
                port,
                stage_uploads,
                ..
            } => {
                assert_eq!(model, PathBuf::from("waste_classifier.mpk"));
                assert_eq!(port, 5000);
                assert!(stage_uploads.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_train_requires_dataset() {
        assert!(Cli::try_parse_from(["binvision", "train"]).is_err());
        let cli = Cli::try_parse_from(["binvision", "train", "data", "-n", "3"]).unwrap();
        assert!(matches!(
            cli.subcmd,
            SubCmd::Train { num_epochs: 3, batch_size: 32, .. }
        ));
    }

    #[test]
    fn test_cli_asserts() {
        Cli::command().debug_assert();
    }
}
