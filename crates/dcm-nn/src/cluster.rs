//! Student-t soft assignment against a learnable centroid bank.

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{VarBuilder, VarMap};
use dcm_core::{ActorBoxes, ClusteringConfig, DcmError, ImageSize, SimpleRng, ValidityMask};
use tracing::info;

use crate::region::{random_projection_inputs, RegionEmbedder, RegionEmbedding};

/// Floor applied to soft assignments before taking the log.
pub const LOG_FLOOR: f64 = 1e-10;

const DIST_EPS: f64 = 1e-12;

/// Soft assignment of `z [N, D]` to `centroids [K, D]`, `[N, K]`.
///
/// `q_ij = (1 + ‖z_i − μ_j‖ / α)^(−(α+1)/2)`, rows normalised to 1. The
/// distance is Euclidean, not squared.
///
/// # Errors
///
/// Propagates candle failures, including a D mismatch.
pub fn student_t(z: &Tensor, centroids: &Tensor, alpha: f64) -> candle_core::Result<Tensor> {
    let dist = z
        .unsqueeze(1)?
        .broadcast_sub(&centroids.unsqueeze(0)?)?
        .sqr()?
        .sum(D::Minus1)?
        .affine(1.0, DIST_EPS)?
        .sqrt()?;
    let q = dist.affine(1.0 / alpha, 1.0)?.powf(-(alpha + 1.0) / 2.0)?;
    q.broadcast_div(&q.sum_keepdim(D::Minus1)?)
}

/// Summed KL divergence `Σ t·(log t − log s)` between target rows and
/// soft assignments of the valid slots.
///
/// `target` is the flat `[N, K]` buffer matching `soft_valid`. Zero target
/// entries contribute nothing.
///
/// # Errors
///
/// Returns [`DcmError::ShapeMismatch`] on a length mismatch and
/// [`DcmError::Internal`] on tensor failures.
pub fn cluster_loss(soft_valid: &Tensor, target: &[f32]) -> Result<Tensor, DcmError> {
    let map_err = |e: candle_core::Error| DcmError::Internal {
        message: format!("cluster_loss: {e}"),
    };
    let (n, k) = soft_valid.dims2().map_err(map_err)?;
    if target.len() != n * k {
        return Err(DcmError::shape("target rows", n * k, target.len()));
    }
    let entropy: f64 = target
        .iter()
        .filter(|&&t| t > 0.0)
        .map(|&t| f64::from(t) * f64::from(t).ln())
        .sum();
    let t = Tensor::from_slice(target, (n, k), soft_valid.device()).map_err(map_err)?;
    soft_valid
        .clamp(LOG_FLOOR, 1.0)
        .and_then(|s| s.log())
        .and_then(|log_s| log_s.mul(&t))
        .and_then(|cross| cross.sum_all())
        .and_then(|cross| cross.affine(-1.0, entropy))
        .map_err(map_err)
}

/// Everything the assigner computes for one batch.
#[derive(Debug, Clone)]
pub struct ClusterOutput {
    /// `[B, S, D]` embeddings, zero for padded slots.
    pub z: Tensor,
    /// `[B, S, K]`; padded rows are zero. Detached from the graph.
    pub soft: Tensor,
    /// `[B, S]` argmax of `soft`. Meaningless on padded slots.
    pub labels: Tensor,
    /// Which slots are real.
    pub mask: ValidityMask,
    /// `[N_valid, K]` soft assignment of the valid slots in
    /// [`ValidityMask::flat_indices`] order, attached to the graph. `None`
    /// when the batch has no valid actor.
    pub soft_valid: Option<Tensor>,
}

impl ClusterOutput {
    /// Host copy of `soft`, flat `[B, S, K]`.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Internal`] if the device copy fails.
    pub fn soft_host(&self) -> Result<Vec<f32>, DcmError> {
        self.soft
            .flatten_all()
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| DcmError::Internal {
                message: format!("ClusterOutput::soft_host: {e}"),
            })
    }

    /// Host copy of `labels`, flat `[B, S]`.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Internal`] if the device copy fails.
    pub fn labels_host(&self) -> Result<Vec<u32>, DcmError> {
        self.labels
            .flatten_all()
            .and_then(|t| t.to_vec1::<u32>())
            .map_err(|e| DcmError::Internal {
                message: format!("ClusterOutput::labels_host: {e}"),
            })
    }
}

/// Owns the region embedder and the `K × D` centroid bank.
///
/// All of its parameters form one group held in a single [`VarMap`].
pub struct ClusterAssigner {
    embedder: RegionEmbedder,
    centroids: Var,
    vars: VarMap,
    alpha: f64,
    n_clusters: usize,
}

impl std::fmt::Debug for ClusterAssigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ClusterAssigner(K={}, D={}, alpha={})",
            self.n_clusters,
            self.embedder.embed_dim(),
            self.alpha
        )
    }
}

impl ClusterAssigner {
    /// Builds the embedder and initialises centroids in embedding space by
    /// projecting random crops and random spatial norms.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Config`] for zero clusters, a non-positive
    /// alpha or a zero embedding dimension, and [`DcmError::Internal`] if
    /// parameter creation fails.
    pub fn new(
        latent_channels: usize,
        config: &ClusteringConfig,
        image: ImageSize,
        seed: u64,
        device: &Device,
    ) -> Result<Self, DcmError> {
        if config.n_clusters == 0 || config.embed_dim == 0 {
            return Err(DcmError::config("n_clusters and embed_dim must be positive"));
        }
        if !(config.alpha > 0.0) {
            return Err(DcmError::config(format!("alpha must be > 0, got {}", config.alpha)));
        }
        let map_err = |e: candle_core::Error| DcmError::Internal {
            message: format!("ClusterAssigner::new: {e}"),
        };

        let vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&vars, DType::F32, device);
        let embedder = RegionEmbedder::new(
            latent_channels,
            config.embed_dim,
            config.roi_align,
            image,
            vb.pp("cluster"),
        )?;

        let mut rng = SimpleRng::new(seed);
        let (visual, norms) =
            random_projection_inputs(&mut rng, config.n_clusters, embedder.visual_dim(), device)
                .map_err(map_err)?;
        let init = embedder
            .project(&visual, &norms)
            .map(|t| t.detach())
            .map_err(map_err)?;
        let centroids = Var::from_tensor(&init).map_err(map_err)?;
        vars.data()
            .lock()
            .map_err(|e| DcmError::Internal {
                message: format!("ClusterAssigner::new: var map lock poisoned: {e}"),
            })?
            .insert("cluster.centroids".to_string(), centroids.clone());

        info!(
            n_clusters = config.n_clusters,
            embed_dim = config.embed_dim,
            alpha = config.alpha,
            "cluster assigner initialised"
        );
        Ok(Self {
            embedder,
            centroids,
            vars,
            alpha: config.alpha,
            n_clusters: config.n_clusters,
        })
    }

    /// K.
    pub fn n_clusters(&self) -> usize {
        self.n_clusters
    }

    /// D.
    pub fn embed_dim(&self) -> usize {
        self.embedder.embed_dim()
    }

    /// Student-t degrees-of-freedom parameter.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// The embedder feeding this assigner.
    pub fn embedder(&self) -> &RegionEmbedder {
        &self.embedder
    }

    /// Live centroid tensor `[K, D]`.
    pub fn centroids(&self) -> &Tensor {
        self.centroids.as_tensor()
    }

    /// Host snapshot of the centroids, one `Vec` per cluster.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Internal`] if the device copy fails.
    pub fn centroid_snapshot(&self) -> Result<Vec<Vec<f32>>, DcmError> {
        self.centroids
            .as_tensor()
            .to_vec2::<f32>()
            .map_err(|e| DcmError::Internal {
                message: format!("ClusterAssigner::centroid_snapshot: {e}"),
            })
    }

    /// Overwrites the centroid bank from a snapshot. Training never calls this;
    /// centroids move only through the cluster phase optimizer.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::ShapeMismatch`] unless `values` is `[K, D]`.
    pub fn load_centroids(&self, values: &Tensor) -> Result<(), DcmError> {
        let expected = [self.n_clusters, self.embed_dim()];
        if values.dims() != expected {
            return Err(DcmError::shape(
                "centroids",
                format!("{expected:?}"),
                format!("{:?}", values.dims()),
            ));
        }
        self.centroids
            .set(&values.to_dtype(DType::F32).map_err(|e| DcmError::Internal {
                message: format!("ClusterAssigner::load_centroids: {e}"),
            })?)
            .map_err(|e| DcmError::Internal {
                message: format!("ClusterAssigner::load_centroids: {e}"),
            })
    }

    /// Parameter group: both projections and the centroids.
    pub fn vars(&self) -> Vec<Var> {
        self.vars.all_vars()
    }

    /// Embeds the batch and assigns every valid slot.
    ///
    /// # Errors
    ///
    /// See [`RegionEmbedder::forward`] and [`ClusterAssigner::assign`].
    pub fn forward(&self, volume: &Tensor, boxes: &ActorBoxes) -> Result<ClusterOutput, DcmError> {
        let RegionEmbedding { z, mask } = self.embedder.forward(volume, boxes)?;
        self.assign(z, mask)
    }

    /// Assigns precomputed embeddings `z [B, S, D]`.
    ///
    /// Padded slots are never fed to the kernel: their `soft` rows stay
    /// zero and they are absent from `soft_valid`.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::ShapeMismatch`] if `z` does not match the mask
    /// layout or the centroid dimension, and [`DcmError::Internal`] on
    /// tensor failures.
    pub fn assign(&self, z: Tensor, mask: ValidityMask) -> Result<ClusterOutput, DcmError> {
        let map_err = |e: candle_core::Error| DcmError::Internal {
            message: format!("ClusterAssigner::assign: {e}"),
        };
        let (b, s, d) = z.dims3().map_err(map_err)?;
        if (b, s) != (mask.batch(), mask.capacity()) {
            return Err(DcmError::shape(
                "embedding layout",
                format!("[{}, {}, D]", mask.batch(), mask.capacity()),
                format!("{:?}", z.dims()),
            ));
        }
        if d != self.embed_dim() {
            return Err(DcmError::shape("embedding dimension", self.embed_dim(), d));
        }
        let k = self.n_clusters;
        let device = z.device().clone();

        let (soft, soft_valid) = if mask.total() == 0 {
            let zeros = Tensor::zeros((b, s, k), DType::F32, &device).map_err(map_err)?;
            (zeros, None)
        } else {
            let idx = Tensor::new(mask.flat_indices(), &device).map_err(map_err)?;
            let z_valid = z
                .reshape((b * s, d))
                .and_then(|t| t.index_select(&idx, 0))
                .map_err(map_err)?;
            let s_valid =
                student_t(&z_valid, self.centroids.as_tensor(), self.alpha).map_err(map_err)?;
            let soft = Tensor::zeros((b * s, k), DType::F32, &device)
                .and_then(|t| t.index_add(&idx, &s_valid.detach(), 0))
                .and_then(|t| t.reshape((b, s, k)))
                .map_err(map_err)?;
            (soft, Some(s_valid))
        };
        let labels = soft.argmax(D::Minus1).map_err(map_err)?;

        Ok(ClusterOutput {
            z,
            soft,
            labels,
            mask,
            soft_valid,
        })
    }
}
