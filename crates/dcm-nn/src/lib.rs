//! # dcm-nn
//!
//! candle modules of the deep clustering model.
//!
//! ## Key Components
//!
//! - [`ActorBatch`]: frames, flows, padded actor boxes, global clip offsets
//! - [`Autoencoder`]: per-modality [`FeatureExtractor`] + [`ImageGenerator`]
//! - [`RegionEmbedder`]: RoI-align crops + spatial norm → `[B, S, D]`
//! - [`ClusterAssigner`]: centroid bank and Student-t soft assignment
//! - [`cluster_loss`]: KL divergence against the self-training target
//!
//! ## Architecture Rules
//!
//! - All tensor code lives here and in `dcm-learn`; host-side bookkeeping
//!   stays in `dcm-core`.
//! - Every module keeps its parameters in its own `VarMap` so the trainer
//!   can step parameter groups independently.
//! - Padded slots never reach the Student-t kernel.
//!
//! ## GPU Support
//!
//! ```bash
//! cargo test -p dcm-nn --features cuda
//! ```

pub use dcm_core;

pub mod autoencoder;
pub mod batch;
pub mod cluster;
pub mod region;

pub use autoencoder::{
    last_slice, Autoencoder, AutoencoderOutput, ConvDecoder, ConvEncoder, FeatureExtractor,
    ImageGenerator,
};
pub use batch::ActorBatch;
pub use cluster::{cluster_loss, student_t, ClusterAssigner, ClusterOutput, LOG_FLOOR};
pub use region::{RegionEmbedder, RegionEmbedding};
