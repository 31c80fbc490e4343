//! Training configuration.
//!
//! All hyperparameters live in [`DcmConfig`]. Configs deserialize from JSON
//! with every field optional (missing fields take the defaults below) and
//! must pass [`DcmConfig::validate`] before any model component is built.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DcmError;

/// Input modality of one autoencoder branch.
///
/// # Example
///
/// ```
/// use dcm_core::Modality;
///
/// assert_eq!(Modality::Frame.channels(), 3);
/// assert_eq!("flow".parse::<Modality>().unwrap(), Modality::Flow);
/// assert!("depth".parse::<Modality>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// RGB appearance frames.
    Frame,
    /// Two-channel optical flow.
    Flow,
}

impl Modality {
    /// Both modalities in training order.
    pub const ALL: [Modality; 2] = [Modality::Frame, Modality::Flow];

    /// Number of input channels.
    pub fn channels(&self) -> usize {
        match self {
            Self::Frame => 3,
            Self::Flow => 2,
        }
    }

    /// Short label used in variable names and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Frame => "frame",
            Self::Flow => "flow",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Modality {
    type Err = DcmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "frame" => Ok(Self::Frame),
            "flow" => Ok(Self::Flow),
            other => Err(DcmError::config(format!(
                "unknown modality '{other}' (expected frame or flow)"
            ))),
        }
    }
}

/// Which dataset the clips come from. Only used for labelling runs and
/// outputs; loading is the caller's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    /// Collective Activity dataset.
    Collective,
    /// Volleyball dataset.
    Volleyball,
    /// Free-form video.
    Video,
}

impl DatasetKind {
    /// Lower-case label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Collective => "collective",
            Self::Volleyball => "volleyball",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DatasetKind {
    type Err = DcmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collective" => Ok(Self::Collective),
            "volleyball" => Ok(Self::Volleyball),
            "video" => Ok(Self::Video),
            other => Err(DcmError::config(format!(
                "unknown dataset '{other}' (expected collective, volleyball or video)"
            ))),
        }
    }
}

/// Input image size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSize {
    /// Width (W).
    pub width: usize,
    /// Height (H).
    pub height: usize,
}

impl Default for ImageSize {
    fn default() -> Self {
        Self {
            width: 128,
            height: 96,
        }
    }
}

/// Autoencoder widths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoencoderConfig {
    /// Channels of the encoder output volume.
    pub latent_channels: usize,

    /// Base width of the hidden convolution layers.
    pub hidden_channels: usize,
}

impl Default for AutoencoderConfig {
    fn default() -> Self {
        Self {
            latent_channels: 480,
            hidden_channels: 64,
        }
    }
}

/// RoI-align pooling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiAlignConfig {
    /// Side of the pooled grid (output is `output_size × output_size`).
    pub output_size: usize,

    /// Extra scale applied to box coordinates after rescaling to the
    /// feature map.
    pub spatial_scale: f32,

    /// Shift box corners by half a pixel before sampling.
    pub aligned: bool,
}

impl Default for RoiAlignConfig {
    fn default() -> Self {
        Self {
            output_size: 3,
            spatial_scale: 1.0,
            aligned: true,
        }
    }
}

/// Clustering head parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Number of clusters K. Fixed for the lifetime of the model.
    pub n_clusters: usize,

    /// Student-t degrees of freedom.
    pub alpha: f64,

    /// Embedding dimension D shared by actors and centroids.
    pub embed_dim: usize,

    /// Region pooling.
    pub roi_align: RoiAlignConfig,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            n_clusters: 10,
            alpha: 1.0,
            embed_dim: 256,
            roi_align: RoiAlignConfig::default(),
        }
    }
}

/// Optimizer and loss weighting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    /// Learning rate of the frame encoder and decoder.
    pub lr_frame: f64,

    /// Learning rate of the flow encoder and decoder.
    pub lr_flow: f64,

    /// Learning rate of the clustering head.
    pub lr_cluster: f64,

    /// Weight of the clustering loss in the encoder phases.
    pub lambda_cluster: f64,

    /// Multiplicative learning-rate decay applied at each schedule boundary.
    pub lr_gamma: f64,

    /// Decoupled weight decay. Zero gives plain Adam.
    pub weight_decay: f64,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            lr_frame: 1e-4,
            lr_flow: 1e-4,
            lr_cluster: 1e-3,
            lambda_cluster: 0.1,
            lr_gamma: 0.1,
            weight_decay: 0.0,
        }
    }
}

/// Top-level configuration.
///
/// # Example
///
/// ```
/// use dcm_core::DcmConfig;
///
/// let config = DcmConfig::from_json_str(r#"{ "epochs": 20, "clustering": { "n_clusters": 4 } }"#).unwrap();
/// assert_eq!(config.epochs, 20);
/// assert_eq!(config.clustering.n_clusters, 4);
/// assert_eq!(config.clustering.alpha, 1.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DcmConfig {
    /// Source dataset label.
    pub dataset: DatasetKind,

    /// Total number of training epochs.
    pub epochs: usize,

    /// Epochs between target distribution refreshes.
    pub update_interval: usize,

    /// Micro-batches per optimizer step.
    pub accumulate_grad_batches: usize,

    /// Epoch (1-based) from which the clustering phase runs.
    pub clustering_start_epoch: usize,

    /// Keep the summed latents attached so the weighted clustering term of
    /// the encoder phases reaches the encoders. Off by default: both latent
    /// codes are detached before clustering.
    pub cluster_grad_to_encoders: bool,

    /// Seed for centroid initialisation and synthetic data.
    pub seed: u64,

    /// Input image size.
    pub image: ImageSize,

    /// Autoencoder widths.
    pub autoencoder: AutoencoderConfig,

    /// Clustering head.
    pub clustering: ClusteringConfig,

    /// Optimizers.
    pub optim: OptimConfig,
}

impl Default for DcmConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetKind::Collective,
            epochs: 100,
            update_interval: 10,
            accumulate_grad_batches: 1,
            clustering_start_epoch: 10,
            cluster_grad_to_encoders: false,
            seed: 42,
            image: ImageSize::default(),
            autoencoder: AutoencoderConfig::default(),
            clustering: ClusteringConfig::default(),
            optim: OptimConfig::default(),
        }
    }
}

/// Encoders downsample by this factor in each spatial dimension.
pub const SPATIAL_STRIDE: usize = 8;

impl DcmConfig {
    /// Parses and validates a JSON config.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Config`] on malformed JSON, unknown selector
    /// strings or values rejected by [`DcmConfig::validate`].
    pub fn from_json_str(json: &str) -> Result<Self, DcmError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DcmError::config(format!("invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Io`] if the file cannot be read, otherwise as
    /// [`DcmConfig::from_json_str`].
    pub fn from_json_file(path: &Path) -> Result<Self, DcmError> {
        let json = std::fs::read_to_string(path).map_err(|e| DcmError::Io {
            message: format!("{}: {e}", path.display()),
        })?;
        Self::from_json_str(&json)
    }

    /// Checks every hyperparameter.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), DcmError> {
        let positive = |name: &str, v: usize| {
            if v == 0 {
                Err(DcmError::config(format!("{name} must be at least 1")))
            } else {
                Ok(())
            }
        };
        let positive_f = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(DcmError::config(format!("{name} must be positive, got {v}")))
            }
        };

        positive("epochs", self.epochs)?;
        positive("update_interval", self.update_interval)?;
        positive("accumulate_grad_batches", self.accumulate_grad_batches)?;
        positive("clustering.n_clusters", self.clustering.n_clusters)?;
        positive("clustering.embed_dim", self.clustering.embed_dim)?;
        positive("clustering.roi_align.output_size", self.clustering.roi_align.output_size)?;
        positive("autoencoder.latent_channels", self.autoencoder.latent_channels)?;
        positive("autoencoder.hidden_channels", self.autoencoder.hidden_channels)?;

        for (name, v) in [("image.width", self.image.width), ("image.height", self.image.height)] {
            if v == 0 || v % SPATIAL_STRIDE != 0 {
                return Err(DcmError::config(format!(
                    "{name} must be a positive multiple of {SPATIAL_STRIDE}, got {v}"
                )));
            }
        }

        positive_f("clustering.alpha", self.clustering.alpha)?;
        positive_f(
            "clustering.roi_align.spatial_scale",
            self.clustering.roi_align.spatial_scale as f64,
        )?;
        positive_f("optim.lr_frame", self.optim.lr_frame)?;
        positive_f("optim.lr_flow", self.optim.lr_flow)?;
        positive_f("optim.lr_cluster", self.optim.lr_cluster)?;

        if !(self.optim.lr_gamma > 0.0 && self.optim.lr_gamma <= 1.0) {
            return Err(DcmError::config(format!(
                "optim.lr_gamma must be in (0, 1], got {}",
                self.optim.lr_gamma
            )));
        }
        if !(self.optim.lambda_cluster.is_finite() && self.optim.lambda_cluster >= 0.0) {
            return Err(DcmError::config(format!(
                "optim.lambda_cluster must be non-negative, got {}",
                self.optim.lambda_cluster
            )));
        }
        if !(self.optim.weight_decay.is_finite() && self.optim.weight_decay >= 0.0) {
            return Err(DcmError::config(format!(
                "optim.weight_decay must be non-negative, got {}",
                self.optim.weight_decay
            )));
        }
        Ok(())
    }

    /// Index of the last epoch.
    pub fn final_epoch(&self) -> usize {
        self.epochs.saturating_sub(1)
    }

    /// Whether the target distribution is refreshed during `epoch`.
    ///
    /// # Example
    ///
    /// ```
    /// use dcm_core::DcmConfig;
    ///
    /// let config = DcmConfig { epochs: 5, update_interval: 2, ..DcmConfig::default() };
    /// let refresh: Vec<bool> = (0..5).map(|e| config.refreshes_target(e)).collect();
    /// assert_eq!(refresh, [true, false, true, false, true]);
    /// ```
    pub fn refreshes_target(&self, epoch: usize) -> bool {
        epoch % self.update_interval == 0 || epoch == self.final_epoch()
    }

    /// Whether the clustering phase and clustering loss term are active
    /// during `epoch` (0-based).
    pub fn clustering_active(&self, epoch: usize) -> bool {
        epoch + 1 >= self.clustering_start_epoch
    }

    /// Schedule period of the encoder and decoder learning rates.
    pub fn reconstruction_decay_period(&self) -> usize {
        ((self.epochs + self.clustering_start_epoch).saturating_sub(1) / 2).max(1)
    }

    /// Schedule period of the clustering learning rate.
    pub fn cluster_decay_period(&self) -> usize {
        ((self.epochs + 1).saturating_sub(self.clustering_start_epoch) / 2).max(1)
    }

    /// Learning rate of the autoencoder branch for `modality`.
    pub fn modality_lr(&self, modality: Modality) -> f64 {
        match modality {
            Modality::Frame => self.optim.lr_frame,
            Modality::Flow => self.optim.lr_flow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        DcmConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_json_gives_defaults() {
        let config = DcmConfig::from_json_str("{}").unwrap();
        assert_eq!(config, DcmConfig::default());
    }

    #[test]
    fn unknown_dataset_is_config_error() {
        let err = DcmConfig::from_json_str(r#"{ "dataset": "kinetics" }"#).unwrap_err();
        assert!(matches!(err, DcmError::Config { .. }));
    }

    #[test]
    fn dataset_roundtrips_through_label() {
        for kind in [DatasetKind::Collective, DatasetKind::Volleyball, DatasetKind::Video] {
            assert_eq!(kind.label().parse::<DatasetKind>().unwrap(), kind);
        }
    }

    #[test]
    fn rejects_zero_clusters() {
        let mut config = DcmConfig::default();
        config.clustering.n_clusters = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_alpha() {
        let mut config = DcmConfig::default();
        config.clustering.alpha = 0.0;
        assert!(config.validate().is_err());
        config.clustering.alpha = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_image_not_multiple_of_stride() {
        let mut config = DcmConfig::default();
        config.image.width = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_update_interval() {
        let config = DcmConfig {
            update_interval: 0,
            ..DcmConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn final_epoch_always_refreshes() {
        let config = DcmConfig {
            epochs: 7,
            update_interval: 4,
            ..DcmConfig::default()
        };
        assert!(config.refreshes_target(0));
        assert!(!config.refreshes_target(5));
        assert!(config.refreshes_target(6));
    }

    #[test]
    fn warm_up_gate() {
        let config = DcmConfig {
            clustering_start_epoch: 3,
            ..DcmConfig::default()
        };
        assert!(!config.clustering_active(0));
        assert!(!config.clustering_active(1));
        assert!(config.clustering_active(2));
    }

    #[test]
    fn decay_periods() {
        let config = DcmConfig {
            epochs: 100,
            clustering_start_epoch: 10,
            ..DcmConfig::default()
        };
        assert_eq!(config.reconstruction_decay_period(), 54);
        assert_eq!(config.cluster_decay_period(), 45);

        let late = DcmConfig {
            epochs: 2,
            clustering_start_epoch: 10,
            ..DcmConfig::default()
        };
        assert_eq!(late.cluster_decay_period(), 1);
    }
}
