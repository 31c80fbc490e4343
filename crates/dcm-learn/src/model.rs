//! The deep clustering model and its five-phase training step.
//!
//! Per step:
//!
//! 1. one shared forward pass ([`DeepClusteringModel::forward`])
//! 2. target refresh on update epochs, before any phase reads it
//! 3. frame decoder, flow decoder, cluster, frame encoder, flow encoder,
//!    each with its own loss, backward pass, accumulated gradients,
//!    optimizer and schedule
//!
//! Each phase back-propagates its own loss and steps only its own
//! parameter group, so the other groups' gradients from that backward
//! pass are discarded.

use candle_core::{Device, Tensor};
use dcm_core::{
    AccumulationCounter, DcmConfig, DcmError, ImageSize, Modality, PhaseKind, TargetDistribution,
};
use dcm_nn::{cluster_loss, last_slice, ActorBatch, Autoencoder, ClusterAssigner, ClusterOutput};
use tracing::{debug, info};

use crate::optim::PhaseOptimizer;

/// Tensors of the shared forward pass. Every phase of a step reads the
/// same context.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Reconstruction of the last input frame, `[B, 3, H, W]`.
    pub frame_reconstruction: Tensor,
    /// Reconstruction of the last input flow, `[B, 2, H, W]`.
    pub flow_reconstruction: Tensor,
    /// Embeddings, assignments and validity of every slot.
    pub clusters: ClusterOutput,
}

/// Scalar losses and bookkeeping of one training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLosses {
    /// Frame reconstruction MSE.
    pub frame_reconstruction: f32,
    /// Flow reconstruction MSE.
    pub flow_reconstruction: f32,
    /// Clustering KL loss; `None` during warm-up or without valid actors.
    pub cluster: Option<f32>,
    /// Whether the target distribution was refreshed this step.
    pub target_refreshed: bool,
    /// Whether this step closed an accumulation window.
    pub optimizer_boundary: bool,
}

/// Reconstruction error on a held-out batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconstructionMetrics {
    /// Frame MSE on the last temporal slice.
    pub frame_mse: f32,
    /// Flow MSE on the last temporal slice.
    pub flow_mse: f32,
}

/// Both autoencoders, the cluster assigner, the target store and the five
/// phase optimizers.
///
/// # Example
///
/// ```ignore
/// use candle_core::Device;
/// use dcm_core::DcmConfig;
/// use dcm_learn::{DeepClusteringModel, SyntheticClips};
///
/// let config = DcmConfig::default();
/// let mut clips = SyntheticClips::new(&config, 64, 12, 4, 8);
/// let mut model = DeepClusteringModel::new(config, 64, 12, &Device::Cpu).unwrap();
/// let report = model.fit(&mut clips).unwrap();
/// ```
pub struct DeepClusteringModel {
    config: DcmConfig,
    device: Device,
    frame_ae: Autoencoder,
    flow_ae: Autoencoder,
    assigner: ClusterAssigner,
    target: TargetDistribution,
    phases: [PhaseOptimizer; 5],
    accumulation: AccumulationCounter,
    epoch: usize,
    global_step: usize,
}

impl std::fmt::Debug for DeepClusteringModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeepClusteringModel")
            .field("frame_ae", &self.frame_ae)
            .field("flow_ae", &self.flow_ae)
            .field("assigner", &self.assigner)
            .field("phases", &self.phases)
            .field("epoch", &self.epoch)
            .field("global_step", &self.global_step)
            .finish()
    }
}

impl DeepClusteringModel {
    /// Builds every module for a dataset of `n_clips` clips with
    /// `capacity` actor slots each.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Config`] if `config` fails validation or the
    /// dataset is empty, and [`DcmError::Internal`] if a module cannot be
    /// created.
    pub fn new(
        config: DcmConfig,
        n_clips: usize,
        capacity: usize,
        device: &Device,
    ) -> Result<Self, DcmError> {
        config.validate()?;
        let frame_ae = Autoencoder::new(Modality::Frame, &config.autoencoder, device)?;
        let flow_ae = Autoencoder::new(Modality::Flow, &config.autoencoder, device)?;
        let assigner = ClusterAssigner::new(
            config.autoencoder.latent_channels,
            &config.clustering,
            config.image,
            config.seed,
            device,
        )?;
        let target = TargetDistribution::new(n_clips, capacity, config.clustering.n_clusters)?;

        let mut phases = Vec::with_capacity(PhaseKind::ORDER.len());
        for kind in PhaseKind::ORDER {
            let vars = match kind {
                PhaseKind::FrameDecoder => frame_ae.decoder_vars(),
                PhaseKind::FlowDecoder => flow_ae.decoder_vars(),
                PhaseKind::Cluster => assigner.vars(),
                PhaseKind::FrameEncoder => frame_ae.encoder_vars(),
                PhaseKind::FlowEncoder => flow_ae.encoder_vars(),
            };
            phases.push(PhaseOptimizer::new(
                kind,
                vars,
                kind.schedule(&config),
                config.optim.weight_decay,
            )?);
        }
        let phases: [PhaseOptimizer; 5] = phases.try_into().map_err(|_| DcmError::Internal {
            message: "DeepClusteringModel::new: phase count".to_string(),
        })?;

        info!(
            dataset = %config.dataset,
            n_clips,
            capacity,
            n_clusters = config.clustering.n_clusters,
            epochs = config.epochs,
            "deep clustering model built"
        );
        Ok(Self {
            accumulation: AccumulationCounter::new(config.accumulate_grad_batches),
            config,
            device: device.clone(),
            frame_ae,
            flow_ae,
            assigner,
            target,
            phases,
            epoch: 0,
            global_step: 0,
        })
    }

    /// Configuration the model was built with.
    pub fn config(&self) -> &DcmConfig {
        &self.config
    }

    /// Device every module lives on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Current epoch, 0-based.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Training steps taken so far.
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Read-only view of the target distribution.
    pub fn target_distribution(&self) -> &TargetDistribution {
        &self.target
    }

    /// Host snapshot of the centroid bank.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Internal`] if the device copy fails.
    pub fn centroids(&self) -> Result<Vec<Vec<f32>>, DcmError> {
        self.assigner.centroid_snapshot()
    }

    /// The cluster assigner.
    pub fn assigner(&self) -> &ClusterAssigner {
        &self.assigner
    }

    /// Optimizer state of `kind`.
    pub fn phase(&self, kind: PhaseKind) -> &PhaseOptimizer {
        &self.phases[phase_index(kind)]
    }

    /// Moves to the next epoch.
    pub fn end_epoch(&mut self) {
        self.epoch += 1;
        debug!(epoch = self.epoch, "epoch advanced");
    }

    /// Shared forward pass: both autoencoders, summed latents, cluster
    /// assignment. The latents are detached unless
    /// `cluster_grad_to_encoders` is set.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::ShapeMismatch`] if the batch does not match the
    /// configured image size or the target's slot capacity, and
    /// [`DcmError::Internal`] on tensor failures.
    pub fn forward(&self, batch: &ActorBatch) -> Result<StepContext, DcmError> {
        let map_err = |e: candle_core::Error| DcmError::Internal {
            message: format!("DeepClusteringModel::forward: {e}"),
        };
        self.check_batch(batch)?;

        let frame = self.frame_ae.forward(batch.input(Modality::Frame))?;
        let flow = self.flow_ae.forward(batch.input(Modality::Flow))?;
        let latent = if self.config.cluster_grad_to_encoders {
            frame.latent.add(&flow.latent)
        } else {
            frame.latent.detach().add(&flow.latent.detach())
        }
        .map_err(map_err)?;

        let clusters = self.assigner.forward(&latent, &batch.actor_boxes()?)?;
        Ok(StepContext {
            frame_reconstruction: frame.reconstruction,
            flow_reconstruction: flow.reconstruction,
            clusters,
        })
    }

    /// Runs one training step on `batch`.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::SampleOutOfRange`] if a clip offset lies past the
    /// target matrix, otherwise as [`DeepClusteringModel::forward`].
    pub fn train_step(&mut self, batch: &ActorBatch) -> Result<StepLosses, DcmError> {
        let map_err = |e: candle_core::Error| DcmError::Internal {
            message: format!("DeepClusteringModel::train_step: {e}"),
        };
        let ctx = self.forward(batch)?;
        let mask = &ctx.clusters.mask;

        let target_refreshed = self.config.refreshes_target(self.epoch);
        if target_refreshed {
            let soft = ctx.clusters.soft_host()?;
            let written = self.target.update(&soft, mask, batch.offsets())?;
            debug!(epoch = self.epoch, rows = written, "target distribution refreshed");
        }

        let frame_loss = reconstruction_loss(batch, Modality::Frame, &ctx.frame_reconstruction)
            .map_err(map_err)?;
        let flow_loss = reconstruction_loss(batch, Modality::Flow, &ctx.flow_reconstruction)
            .map_err(map_err)?;

        let clustering = self.config.clustering_active(self.epoch);
        let rows = self.target.gather(mask, batch.offsets())?;
        let cluster = match (&ctx.clusters.soft_valid, clustering) {
            (Some(soft_valid), true) => Some(cluster_loss(soft_valid, &rows)?),
            _ => None,
        };
        let weighted_cluster = cluster
            .as_ref()
            .map(|l| l.affine(self.config.optim.lambda_cluster, 0.0))
            .transpose()
            .map_err(map_err)?;

        let boundary = self.accumulation.advance();
        for phase in self.phases.iter_mut() {
            let kind = phase.kind();
            if kind.waits_for_warm_up() && !clustering {
                continue;
            }
            let reconstruction = match kind.modality() {
                Some(Modality::Frame) => Some(&frame_loss),
                Some(Modality::Flow) => Some(&flow_loss),
                None => None,
            };
            let clustering_term = match (kind.uses_cluster_loss(), reconstruction) {
                (false, _) => None,
                (true, Some(_)) => weighted_cluster.as_ref(),
                (true, None) => cluster.as_ref(),
            };
            let loss = match reconstruction {
                Some(base) => Some(add_optional(base, clustering_term).map_err(map_err)?),
                None => clustering_term.cloned(),
            };
            if let Some(loss) = loss {
                let grads = loss.backward().map_err(map_err)?;
                phase.accumulate(&grads)?;
            }
            if boundary {
                phase.apply(&self.device)?;
            }
            phase.advance_schedule();
        }
        self.global_step += 1;

        let losses = StepLosses {
            frame_reconstruction: frame_loss.to_scalar::<f32>().map_err(map_err)?,
            flow_reconstruction: flow_loss.to_scalar::<f32>().map_err(map_err)?,
            cluster: cluster
                .as_ref()
                .map(|l| l.to_scalar::<f32>())
                .transpose()
                .map_err(map_err)?,
            target_refreshed,
            optimizer_boundary: boundary,
        };
        debug!(
            epoch = self.epoch,
            step = self.global_step,
            frame = losses.frame_reconstruction,
            flow = losses.flow_reconstruction,
            cluster = ?losses.cluster,
            "train step"
        );
        Ok(losses)
    }

    /// Reconstruction error of both autoencoders on `batch`. No optimizer
    /// or target state is touched.
    ///
    /// # Errors
    ///
    /// As [`DeepClusteringModel::forward`].
    pub fn validate_batch(&self, batch: &ActorBatch) -> Result<ReconstructionMetrics, DcmError> {
        let map_err = |e: candle_core::Error| DcmError::Internal {
            message: format!("DeepClusteringModel::validate_batch: {e}"),
        };
        self.check_batch(batch)?;
        let mut mse = [0f32; 2];
        for (out, (ae, modality)) in mse.iter_mut().zip([
            (&self.frame_ae, Modality::Frame),
            (&self.flow_ae, Modality::Flow),
        ]) {
            let rec = ae.forward(batch.input(modality))?.reconstruction.detach();
            *out = reconstruction_loss(batch, modality, &rec)
                .and_then(|l| l.to_scalar::<f32>())
                .map_err(map_err)?;
        }
        Ok(ReconstructionMetrics {
            frame_mse: mse[0],
            flow_mse: mse[1],
        })
    }

    fn check_batch(&self, batch: &ActorBatch) -> Result<(), DcmError> {
        let image = batch.image_size();
        if image != self.config.image {
            return Err(DcmError::shape(
                "batch image size",
                size_label(self.config.image),
                size_label(image),
            ));
        }
        if batch.capacity() != self.target.capacity() {
            return Err(DcmError::shape(
                "slot capacity",
                self.target.capacity(),
                batch.capacity(),
            ));
        }
        Ok(())
    }
}

fn phase_index(kind: PhaseKind) -> usize {
    match kind {
        PhaseKind::FrameDecoder => 0,
        PhaseKind::FlowDecoder => 1,
        PhaseKind::Cluster => 2,
        PhaseKind::FrameEncoder => 3,
        PhaseKind::FlowEncoder => 4,
    }
}

fn size_label(image: ImageSize) -> String {
    format!("{}x{}", image.width, image.height)
}

/// MSE between the last input slice of `modality` and its reconstruction.
fn reconstruction_loss(
    batch: &ActorBatch,
    modality: Modality,
    reconstruction: &Tensor,
) -> candle_core::Result<Tensor> {
    let input = last_slice(batch.input(modality))?;
    candle_nn::loss::mse(reconstruction, &input)
}

fn add_optional(base: &Tensor, extra: Option<&Tensor>) -> candle_core::Result<Tensor> {
    match extra {
        Some(extra) => base.add(extra),
        None => Ok(base.clone()),
    }
}
