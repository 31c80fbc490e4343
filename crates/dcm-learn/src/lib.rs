//! # dcm-learn
//!
//! Alternating optimisation of the deep clustering model.
//!
//! ## Key Components
//!
//! - [`DeepClusteringModel`]: both autoencoders, the cluster assigner, the
//!   target distribution and five [`PhaseOptimizer`]s
//! - [`DeepClusteringModel::train_step`]: one shared forward pass, a
//!   conditional target refresh, then the five phases in fixed order
//! - [`DeepClusteringModel::fit`]: epoch loop over a [`BatchSource`]
//! - [`DeepClusteringModel::predict`]: per-slot [`PredictionRecord`]s
//! - [`SyntheticClips`]: deterministic stand-in for the video loader
//!
//! ## Architecture Rules
//!
//! - Single-threaded. Phases never reorder relative to the target refresh.
//! - The target matrix has one writer, the step itself, through `&mut self`.
//! - Gradients are summed per phase and applied only at accumulation
//!   boundaries; schedules advance every step.

pub use dcm_core;
pub use dcm_nn;

pub mod fit;
pub mod model;
pub mod optim;
pub mod predict;
pub mod synthetic;

pub use fit::{BatchSource, EpochSummary, FitReport};
pub use model::{DeepClusteringModel, ReconstructionMetrics, StepContext, StepLosses};
pub use optim::PhaseOptimizer;
pub use predict::{write_jsonl, PredictionRecord, SlotFilter};
pub use synthetic::SyntheticClips;
