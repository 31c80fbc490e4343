//! Epoch-level training driver.

use std::time::Instant;

use candle_core::Device;
use dcm_core::DcmError;
use dcm_nn::ActorBatch;
use tracing::info;

use crate::model::DeepClusteringModel;

/// Supplies the batches of one epoch.
pub trait BatchSource {
    /// Clips in the whole dataset.
    fn n_clips(&self) -> usize;

    /// Actor slots per clip.
    fn capacity(&self) -> usize;

    /// Batches of `epoch`, placed on `device`.
    ///
    /// # Errors
    ///
    /// Implementations report loader failures as [`DcmError`].
    fn epoch_batches(&mut self, epoch: usize, device: &Device)
        -> Result<Vec<ActorBatch>, DcmError>;
}

/// Mean losses of one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    /// Epoch index.
    pub epoch: usize,
    /// Steps run.
    pub steps: usize,
    /// Mean frame reconstruction MSE.
    pub frame_reconstruction: f32,
    /// Mean flow reconstruction MSE.
    pub flow_reconstruction: f32,
    /// Mean clustering loss over the steps that computed one.
    pub cluster: Option<f32>,
    /// Whether the target was refreshed during this epoch.
    pub target_refreshed: bool,
}

/// Result of [`DeepClusteringModel::fit`].
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    /// One entry per epoch run.
    pub epochs: Vec<EpochSummary>,
    /// Total training steps.
    pub steps_completed: usize,
}

impl FitReport {
    /// Summary of the last epoch run.
    pub fn last(&self) -> Option<&EpochSummary> {
        self.epochs.last()
    }
}

impl DeepClusteringModel {
    /// Trains from the current epoch up to the configured epoch count.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Config`] if `source` disagrees with the target
    /// matrix layout, otherwise the first error of a step.
    pub fn fit<S: BatchSource>(&mut self, source: &mut S) -> Result<FitReport, DcmError> {
        let target = self.target_distribution();
        if source.capacity() != target.capacity()
            || source.n_clips() * source.capacity() != target.n_rows()
        {
            return Err(DcmError::config(format!(
                "batch source has {} clips x {} slots, model expects {} rows x {} slots",
                source.n_clips(),
                source.capacity(),
                target.n_rows(),
                target.capacity()
            )));
        }

        let device = self.device().clone();
        let mut epochs = Vec::new();
        let mut steps_completed = 0;
        while self.epoch() < self.config().epochs {
            let epoch = self.epoch();
            let start = Instant::now();
            let batches = source.epoch_batches(epoch, &device)?;

            let mut frame = 0f32;
            let mut flow = 0f32;
            let mut cluster = (0f32, 0usize);
            let mut refreshed = false;
            for batch in &batches {
                let losses = self.train_step(batch)?;
                frame += losses.frame_reconstruction;
                flow += losses.flow_reconstruction;
                if let Some(lc) = losses.cluster {
                    cluster.0 += lc;
                    cluster.1 += 1;
                }
                refreshed |= losses.target_refreshed;
            }

            let steps = batches.len();
            let denom = steps.max(1) as f32;
            let summary = EpochSummary {
                epoch,
                steps,
                frame_reconstruction: frame / denom,
                flow_reconstruction: flow / denom,
                cluster: (cluster.1 > 0).then(|| cluster.0 / cluster.1 as f32),
                target_refreshed: refreshed,
            };
            info!(
                epoch,
                steps,
                frame = summary.frame_reconstruction,
                flow = summary.flow_reconstruction,
                cluster = ?summary.cluster,
                refreshed,
                secs = start.elapsed().as_secs_f32(),
                "epoch complete"
            );
            epochs.push(summary);
            steps_completed += steps;
            self.end_epoch();
        }

        Ok(FitReport {
            epochs,
            steps_completed,
        })
    }
}
