use crate::data::ImageBatch;
use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::backend::AutodiffBackend;
use burn::train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep};
use mobilenetv2_burn::model::{
    mobilenetv2::{MobileNetV2, MobileNetV2Config},
    weights,
};
use nn::loss::CrossEntropyLossConfig;
use nn::{Dropout, DropoutConfig, Linear, LinearConfig, Relu};

/// Width of the backbone output (ImageNet classes).
const BACKBONE_FEATURES: usize = 1000;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Frozen MobileNetV2 with a small trainable head.
///
/// The head reads the backbone's 1000 ImageNet logits, not its pooled 1280-d
/// features, since the pretrained network is only available whole.
#[derive(Module, Debug)]
pub struct WasteClassifier<B: Backend> {
    backbone: MobileNetV2<B>,
    hidden: Linear<B>,
    activation: Relu,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> WasteClassifier<B> {
    /// # Shapes
    ///   - Images [batch_size, 3, 224, 224], values in [0, 1]
    ///   - Output [batch_size, num_classes] logits
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(normalize(images));
        self.head(features)
    }

    /// Class probabilities, `[batch_size, num_classes]`.
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    pub fn num_classes(&self) -> usize {
        self.output.weight.dims()[1]
    }

    fn head(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.hidden.forward(features);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);
        self.output.forward(x) // [batch_size, num_classes]
    }

    fn forward_classification(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let loss = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits.clone(), targets.clone());
        ClassificationOutput::new(loss, logits, targets)
    }
}

impl<B: AutodiffBackend> WasteClassifier<B> {
    /// Runs the backbone outside the autodiff graph with batch-norm statistics fixed.
    fn frozen_features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let backbone = self.backbone.valid();
        Tensor::from_inner(backbone.forward(normalize(images.inner())))
    }
}

impl<B: AutodiffBackend> TrainStep<ImageBatch<B>, ClassificationOutput<B>> for WasteClassifier<B> {
    fn step(&self, batch: ImageBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let logits = self.head(self.frozen_features(batch.images));
        let item = self.forward_classification(logits, batch.targets);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<ImageBatch<B>, ClassificationOutput<B>> for WasteClassifier<B> {
    fn step(&self, batch: ImageBatch<B>) -> ClassificationOutput<B> {
        let logits = self.forward(batch.images);
        self.forward_classification(logits, batch.targets)
    }
}

fn normalize<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = images.device();
    let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, &device).reshape([1, 3, 1, 1]);
    let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, &device).reshape([1, 3, 1, 1]);
    (images - mean) / std
}

#[derive(Config, Debug)]
pub struct ClassifierConfig {
    pub num_classes: usize,
    #[config(default = 128)]
    pub hidden_size: usize,
    #[config(default = 0.3)]
    pub dropout: f64,
}

impl ClassifierConfig {
    /// Builds the classifier with an untrained backbone, ready to receive a record.
    pub fn init<B: Backend>(&self, device: &B::Device) -> WasteClassifier<B> {
        self.with_backbone(MobileNetV2Config::new().init(device), device)
    }

    /// Builds the classifier on a frozen ImageNet backbone for fine-tuning.
    pub fn init_pretrained<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<WasteClassifier<B>, String> {
        let backbone = MobileNetV2::pretrained(weights::MobileNetV2::ImageNet1kV2, device)
            .map_err(|err| format!("{err:?}"))?;
        Ok(self.with_backbone(backbone.no_grad(), device))
    }

    fn with_backbone<B: Backend>(
        &self,
        backbone: MobileNetV2<B>,
        device: &B::Device,
    ) -> WasteClassifier<B> {
        WasteClassifier {
            backbone,
            hidden: LinearConfig::new(BACKBONE_FEATURES, self.hidden_size).init(device),
            activation: Relu::new(),
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
        }
    }
}
