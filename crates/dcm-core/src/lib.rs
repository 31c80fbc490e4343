//! # dcm-core
//!
//! Host-side data model of the deep clustering model (DCM): jointly
//! learning per-actor embeddings of video clips and a partition of the
//! actors into behaviour clusters, DEC style.
//!
//! Nothing in this crate touches a tensor library. It holds the pieces whose
//! correctness is easiest to pin down on plain slices:
//!
//! - [`DcmConfig`]: every hyperparameter, JSON-loadable, validated up front
//! - [`ActorBoxes`] / [`ValidityMask`]: padded actor slots and which are real
//! - [`roi_align_weights`]: RoI-align expressed as a pooling matrix
//! - [`TargetDistribution`]: the `N × K` self-training target store
//! - [`StepLr`]: step-decay learning-rate schedule
//! - [`PhaseKind`] / [`AccumulationCounter`]: the five optimisation phases
//! - [`SimpleRng`]: seedable PRNG for initialisation and synthetic data
//!
//! ## Architecture Rules
//!
//! - No tensor code here; `dcm-nn` owns candle.
//! - No `unwrap` outside tests. Degenerate numeric rows are skipped, not
//!   reported; wiring mistakes are [`DcmError`]s.

pub mod config;
pub mod error;
pub mod mask;
pub mod phase;
pub mod rng;
pub mod roi;
pub mod schedule;
pub mod target;

pub use config::{
    AutoencoderConfig, ClusteringConfig, DatasetKind, DcmConfig, ImageSize, Modality,
    OptimConfig, RoiAlignConfig, SPATIAL_STRIDE,
};
pub use error::DcmError;
pub use mask::{ActorBoxes, BoxCoords, ValidityMask};
pub use phase::{AccumulationCounter, PhaseKind};
pub use rng::SimpleRng;
pub use roi::{roi_align_weights, FeatureGrid};
pub use schedule::StepLr;
pub use target::TargetDistribution;
