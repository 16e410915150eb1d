//! Training program configuration format.

use crate::common::*;

pub use dataset::*;
pub use geometry::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub geometry: GeometryConfig,
    pub dataset: DatasetConfig,
    pub logging: LoggingConfig,
    pub training: TrainingConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let config = json5::from_str(&text)?;
        Ok(config)
    }
}

mod geometry {
    use super::*;

    /// Detection geometry options. Omitted fields follow the stock 416x416 setting.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct GeometryConfig {
        /// Input image size in `[height, width]` pixels.
        pub input_size: Option<[usize; 2]>,
        pub num_classes: usize,
        /// Strides and anchors of the three scales, from the coarsest grid to the finest.
        pub scales: Option<Vec<ScaleInit>>,
        pub ignore_iou_thresh: Option<R64>,
    }

    impl GeometryConfig {
        pub fn to_init(&self) -> GeometryInit {
            let default = GeometryInit::default_voc();
            GeometryInit {
                input_size: self.input_size.unwrap_or(default.input_size),
                num_classes: self.num_classes,
                scales: self.scales.clone().unwrap_or(default.scales),
                ignore_iou_thresh: self.ignore_iou_thresh.unwrap_or(default.ignore_iou_thresh),
            }
        }
    }
}

/// Data logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    /// If set, run detection on this image after each epoch and save the result.
    pub test_image: Option<PathBuf>,
    /// The score threshold of detections drawn on the test image.
    #[serde(default = "default_confidence_thresh")]
    pub confidence_thresh: R64,
}

fn default_confidence_thresh() -> R64 {
    r64(0.5)
}

mod dataset {
    use super::*;

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        /// The label file with one image per line.
        pub label_file: PathBuf,
        /// The directory that relative image paths are resolved against.
        /// It defaults to the directory of the label file.
        pub image_dir: Option<PathBuf>,
        /// Shuffle records every epoch.
        #[serde(default = "default_shuffle")]
        pub shuffle: bool,
        /// If set, shuffling is reproducible across runs.
        pub shuffle_seed: Option<u64>,
        /// The maximum number of batches prepared ahead of training.
        #[serde(default = "default_prefetch")]
        pub prefetch: NonZeroUsize,
    }

    impl DatasetConfig {
        pub fn image_dir(&self) -> PathBuf {
            match &self.image_dir {
                Some(dir) => dir.clone(),
                None => self
                    .label_file
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default(),
            }
        }
    }

    fn default_shuffle() -> bool {
        true
    }

    fn default_prefetch() -> NonZeroUsize {
        NonZeroUsize::new(2).unwrap()
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        /// The batch size.
        pub batch_size: NonZeroUsize,
        /// The number of epochs to train.
        pub epochs: usize,
        /// The optimizer options.
        pub optimizer: OptimizerConfig,
        /// The loss function options.
        #[serde(default)]
        pub loss: LossConfig,
        /// If set, it saves a checkpoint file whenever the number of finished
        /// epochs is a multiple of this value. Unlike counting from epoch zero,
        /// nothing is saved before the first epoch completes.
        pub save_checkpoint_epochs: Option<NonZeroUsize>,
        /// Checkpoint file loading method.
        pub load_checkpoint: LoadCheckpoint,
        /// Training device.
        #[serde(with = "tch_serde::serde_device")]
        pub device: Device,
    }

    /// RMSprop optimizer options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct OptimizerConfig {
        /// Learning rate scheduling strategy, an exponential decay by default.
        #[serde(default)]
        pub lr_schedule: LearningRateSchedule,
        /// The smoothing constant.
        #[serde(default = "default_alpha")]
        pub alpha: R64,
        /// The momentum parameter for optimizer.
        #[serde(default = "default_zero")]
        pub momentum: R64,
        /// The weight decay parameter for optimizer.
        #[serde(default = "default_zero")]
        pub weight_decay: R64,
    }

    fn default_alpha() -> R64 {
        r64(0.9)
    }

    fn default_zero() -> R64 {
        r64(0.0)
    }

    /// The learning rate scheduling strategy.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LearningRateSchedule {
        /// Use constant learning rate.
        Constant { lr: R64 },
        /// Use specific learning rate at specified steps.
        StepWise { steps: Vec<(usize, R64)> },
        /// Multiply the rate by `decay_rate` every `decay_steps` steps.
        ExponentialDecay {
            initial_lr: R64,
            decay_steps: NonZeroUsize,
            decay_rate: R64,
            #[serde(default)]
            staircase: bool,
        },
    }

    impl Default for LearningRateSchedule {
        fn default() -> Self {
            Self::ExponentialDecay {
                initial_lr: r64(1e-3),
                decay_steps: NonZeroUsize::new(3000).unwrap(),
                decay_rate: r64(0.96),
                staircase: true,
            }
        }
    }

    /// Checkpoint file loading method.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LoadCheckpoint {
        /// Disable checkpoint file loading.
        Disabled,
        /// Load the most recent checkpoint file.
        FromRecent,
        /// Load the checkpoint file at specified path.
        FromFile { file: PathBuf },
    }

    /// The loss function configuration.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct LossConfig {
        pub localization_weight: Option<R64>,
        pub objectness_weight: Option<R64>,
        pub no_object_weight: Option<R64>,
        pub classification_weight: Option<R64>,
        /// The extra localization weight of small boxes.
        pub small_box_weight: Option<R64>,
        pub classification_loss_kind: Option<ClassificationLossKind>,
        /// Also exclude no-object slots whose predicted box matches a ground truth.
        pub ignore_from_predictions: Option<bool>,
        pub eps: Option<R64>,
    }

    impl LossConfig {
        pub fn to_init(&self) -> YoloLossInit {
            let Self {
                localization_weight,
                objectness_weight,
                no_object_weight,
                classification_weight,
                small_box_weight,
                classification_loss_kind,
                ignore_from_predictions,
                eps,
            } = *self;

            YoloLossInit {
                localization_weight: localization_weight.map(|val| val.raw()),
                objectness_weight: objectness_weight.map(|val| val.raw()),
                no_object_weight: no_object_weight.map(|val| val.raw()),
                classification_weight: classification_weight.map(|val| val.raw()),
                small_box_weight: small_box_weight.map(|val| val.raw()),
                classification_loss_kind,
                ignore_from_predictions,
                eps: eps.map(|val| val.raw()),
            }
        }
    }
}
