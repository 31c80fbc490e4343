//! Per-actor embeddings from a latent volume and actor boxes.
//!
//! Architecture: RoI-align(last slice) → flatten → Linear(Cz·P·P → D), plus
//! Linear(1 → D) on the spatial norm of the box; padded slots zeroed.

use candle_core::{Device, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};
use dcm_core::{
    roi_align_weights, ActorBoxes, DcmError, FeatureGrid, ImageSize, RoiAlignConfig, ValidityMask,
};

use crate::autoencoder::last_slice;

/// Embeddings of one batch.
#[derive(Debug, Clone)]
pub struct RegionEmbedding {
    /// `[B, S, D]`, zero rows for padded slots.
    pub z: Tensor,
    /// Which slots hold a real actor.
    pub mask: ValidityMask,
}

/// Projects actor crops and their spatial feature into embedding space.
#[derive(Debug, Clone)]
pub struct RegionEmbedder {
    emb_visual: Linear,
    emb_spatial: Linear,
    roi: RoiAlignConfig,
    image: ImageSize,
    latent_channels: usize,
    embed_dim: usize,
}

impl RegionEmbedder {
    /// Creates the two projections under `vb`.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Internal`] if parameter creation fails.
    pub fn new(
        latent_channels: usize,
        embed_dim: usize,
        roi: RoiAlignConfig,
        image: ImageSize,
        vb: VarBuilder,
    ) -> Result<Self, DcmError> {
        let map_err = |e: candle_core::Error| DcmError::Internal {
            message: format!("RegionEmbedder::new: {e}"),
        };
        let visual_in = latent_channels * roi.output_size * roi.output_size;
        let emb_visual = linear(visual_in, embed_dim, vb.pp("emb_visual")).map_err(map_err)?;
        let emb_spatial = linear(1, embed_dim, vb.pp("emb_spatial")).map_err(map_err)?;
        Ok(Self {
            emb_visual,
            emb_spatial,
            roi,
            image,
            latent_channels,
            embed_dim,
        })
    }

    /// Output dimension D.
    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    /// Width of one flattened crop, Cz·P·P.
    pub fn visual_dim(&self) -> usize {
        self.latent_channels * self.roi.output_size * self.roi.output_size
    }

    /// Sum of both projections: `visual [N, Cz·P·P]`, `norms [N, 1]` → `[N, D]`.
    ///
    /// # Errors
    ///
    /// Propagates candle failures.
    pub fn project(&self, visual: &Tensor, norms: &Tensor) -> candle_core::Result<Tensor> {
        self.emb_visual
            .forward(visual)?
            .add(&self.emb_spatial.forward(norms)?)
    }

    /// Embeds every slot of the batch.
    ///
    /// `volume` is the `[B, Cz, T, h, w]` latent; only its last slice is
    /// pooled. Boxes are in image pixels.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::ShapeMismatch`] if the volume's batch or channel
    /// count disagrees with `boxes` or the projection, and
    /// [`DcmError::Internal`] on tensor failures.
    pub fn forward(&self, volume: &Tensor, boxes: &ActorBoxes) -> Result<RegionEmbedding, DcmError> {
        let map_err = |e: candle_core::Error| DcmError::Internal {
            message: format!("RegionEmbedder::forward: {e}"),
        };
        let (b, cz, _t, h, w) = volume.dims5().map_err(map_err)?;
        if b != boxes.batch() {
            return Err(DcmError::shape("latent batch", boxes.batch(), b));
        }
        if cz != self.latent_channels {
            return Err(DcmError::shape("latent channels", self.latent_channels, cz));
        }
        let s = boxes.capacity();
        let bins = self.roi.output_size * self.roi.output_size;
        let device = volume.device();

        // [B, Cz, h, w] -> [B, h·w, Cz]
        let features = last_slice(volume)
            .and_then(|t| t.reshape((b, cz, h * w)))
            .and_then(|t| t.transpose(1, 2))
            .and_then(|t| t.contiguous())
            .map_err(map_err)?;

        let grid = FeatureGrid {
            height: h,
            width: w,
        };
        let weights = roi_align_weights(&boxes.sanitized(), self.image, grid, &self.roi);
        let weights = Tensor::from_vec(weights, (b, s * bins, h * w), device).map_err(map_err)?;

        // [B, S·P·P, Cz] -> [B·S, Cz·P·P], channel-major like a flattened crop
        let pooled = weights
            .matmul(&features)
            .and_then(|t| t.reshape((b, s, bins, cz)))
            .and_then(|t| t.transpose(2, 3))
            .and_then(|t| t.contiguous())
            .and_then(|t| t.reshape((b * s, cz * bins)))
            .map_err(map_err)?;

        let norms = Tensor::from_vec(boxes.spatial_norms(self.image), (b * s, 1), device)
            .map_err(map_err)?;
        let mask = boxes.validity();
        let keep = Tensor::from_vec(mask.as_f32(), (b * s, 1), device).map_err(map_err)?;

        let z = self
            .project(&pooled, &norms)
            .and_then(|z| z.broadcast_mul(&keep))
            .and_then(|z| z.reshape((b, s, self.embed_dim)))
            .map_err(map_err)?;
        Ok(RegionEmbedding { z, mask })
    }
}

/// Random projection inputs used to seed centroids: `[rows, visual_dim]`
/// standard-normal crops and `[rows, 1]` uniform norms.
pub(crate) fn random_projection_inputs(
    rng: &mut dcm_core::SimpleRng,
    rows: usize,
    visual_dim: usize,
    device: &Device,
) -> candle_core::Result<(Tensor, Tensor)> {
    let visual = Tensor::from_vec(rng.normal_vec(rows * visual_dim), (rows, visual_dim), device)?;
    let norms: Vec<f32> = (0..rows).map(|_| rng.next_f32()).collect();
    let norms = Tensor::from_vec(norms, (rows, 1), device)?;
    Ok((visual, norms))
}
