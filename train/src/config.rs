//! Training program configuration format.

use crate::common::*;

fn default_device() -> Device {
    Device::cuda_if_available()
}

fn default_tensorboard_dir() -> PathBuf {
    PathBuf::from("logs")
}

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub valid: ValidConfig,
}

/// The model options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// The lower bound of the network input size in pixels.
    pub min_input_size: NonZeroUsize,
    /// The upper bound of the network input size in pixels.
    pub max_input_size: NonZeroUsize,
    /// Anchor sizes in pixels, 9 (width, height) pairs flattened, finest
    /// scale first.
    pub anchors: Vec<usize>,
    /// The maximum number of ground truth boxes kept per image.
    pub max_box_per_image: NonZeroUsize,
    /// The class names to train on. An empty list trains on every label
    /// found in the annotations.
    #[serde(default)]
    pub labels: Vec<String>,
}

/// The training options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub train_image_folder: PathBuf,
    pub train_annot_folder: PathBuf,
    /// The number of passes over the training set per epoch.
    pub train_times: NonZeroUsize,
    pub batch_size: NonZeroUsize,
    pub learning_rate: R64,
    pub nb_epochs: usize,
    /// The number of leading epochs that ramp the learning rate up.
    pub warmup_epochs: usize,
    /// Predicted boxes overlapping ground truth above this IoU are exempt
    /// from the no-object penalty.
    pub ignore_thresh: R64,
    /// The checkpoint file. Loaded at startup when it exists.
    pub saved_weights_name: PathBuf,
    /// If set, print the loss of every training batch.
    #[serde(default)]
    pub debug: bool,
    /// The directory for TensorBoard event files.
    #[serde(default = "default_tensorboard_dir")]
    pub tensorboard_dir: PathBuf,
    #[serde(with = "tch_serde::serde_device", default = "default_device")]
    pub device: Device,
}

/// The validation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidConfig {
    pub valid_image_folder: PathBuf,
    pub valid_annot_folder: PathBuf,
    /// The number of passes over the validation set per epoch.
    pub valid_times: NonZeroUsize,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = fs::read_to_string(path)?;
        let config: Self = json5::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let Self { model, train, .. } = self;
        ensure!(
            model.anchors.len() == 18,
            "expect 18 anchor values, get {}",
            model.anchors.len()
        );
        ensure!(
            model.min_input_size <= model.max_input_size,
            "min_input_size {} exceeds max_input_size {}",
            model.min_input_size,
            model.max_input_size
        );
        ensure!(
            train.learning_rate > 0.0,
            "learning_rate must be positive"
        );
        ensure!(
            (0.0..=1.0).contains(&train.ignore_thresh.raw()),
            "ignore_thresh must be in range [0, 1]"
        );
        Ok(())
    }

    /// The anchor sizes grouped into (width, height) pairs and reordered
    /// coarsest scale first, the order the loss and the evaluator consume.
    pub fn anchor_pairs(&self) -> Vec<(R64, R64)> {
        self.model
            .anchors
            .chunks(6)
            .rev()
            .flat_map(|scale| {
                scale
                    .chunks(2)
                    .map(|pair| (r64(pair[0] as f64), r64(pair[1] as f64)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_config() -> Config {
        json5::from_str(
            r#"{
                "model": {
                    "min_input_size": 288,
                    "max_input_size": 448,
                    "anchors": [10,13, 16,30, 33,23, 30,61, 62,45, 59,119, 116,90, 156,198, 373,326],
                    "max_box_per_image": 30,
                    "labels": ["cat", "dog"]
                },
                "train": {
                    "train_image_folder": "images/",
                    "train_annot_folder": "annots/",
                    "train_times": 1,
                    "batch_size": 8,
                    "learning_rate": 1e-4,
                    "nb_epochs": 100,
                    "warmup_epochs": 3,
                    "ignore_thresh": 0.5,
                    "saved_weights_name": "trained.ot"
                },
                "valid": {
                    "valid_image_folder": "images/",
                    "valid_annot_folder": "annots/",
                    "valid_times": 1
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn anchor_pairs_are_coarsest_first() {
        let config = example_config();
        let pairs = config.anchor_pairs();
        assert_eq!(pairs.len(), 9);
        assert_eq!(pairs[0], (r64(116.0), r64(90.0)));
        assert_eq!(pairs[2], (r64(373.0), r64(326.0)));
        assert_eq!(pairs[8], (r64(33.0), r64(23.0)));
    }

    #[test]
    fn validation_rejects_truncated_anchor_list() {
        let mut config = example_config();
        config.model.anchors.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let config = example_config();
        assert!(!config.train.debug);
        assert_eq!(config.train.tensorboard_dir, PathBuf::from("logs"));
    }
}
