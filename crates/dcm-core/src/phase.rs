//! Optimisation phases and gradient-accumulation bookkeeping.
//!
//! Each training step runs five phases in the fixed order of
//! [`PhaseKind::ORDER`]. Every phase owns one parameter group, one
//! optimizer and one learning-rate schedule.

use std::fmt;

use crate::config::{DcmConfig, Modality};
use crate::schedule::StepLr;

/// What a phase optimises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseKind {
    /// Frame decoder on frame reconstruction.
    FrameDecoder,
    /// Flow decoder on flow reconstruction.
    FlowDecoder,
    /// Centroids and embedding projections on the clustering loss.
    Cluster,
    /// Frame encoder on reconstruction plus weighted clustering loss.
    FrameEncoder,
    /// Flow encoder on reconstruction plus weighted clustering loss.
    FlowEncoder,
}

impl PhaseKind {
    /// Execution order within one step.
    pub const ORDER: [PhaseKind; 5] = [
        PhaseKind::FrameDecoder,
        PhaseKind::FlowDecoder,
        PhaseKind::Cluster,
        PhaseKind::FrameEncoder,
        PhaseKind::FlowEncoder,
    ];

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::FrameDecoder => "frame_decoder",
            Self::FlowDecoder => "flow_decoder",
            Self::Cluster => "cluster",
            Self::FrameEncoder => "frame_encoder",
            Self::FlowEncoder => "flow_encoder",
        }
    }

    /// Autoencoder branch this phase trains, if any.
    pub fn modality(&self) -> Option<Modality> {
        match self {
            Self::FrameDecoder | Self::FrameEncoder => Some(Modality::Frame),
            Self::FlowDecoder | Self::FlowEncoder => Some(Modality::Flow),
            Self::Cluster => None,
        }
    }

    /// Whether the phase only runs once warm-up is over.
    pub fn waits_for_warm_up(&self) -> bool {
        matches!(self, Self::Cluster)
    }

    /// Whether the phase loss includes the clustering term.
    pub fn uses_cluster_loss(&self) -> bool {
        matches!(self, Self::Cluster | Self::FrameEncoder | Self::FlowEncoder)
    }

    /// Learning-rate schedule of this phase for `config`.
    ///
    /// # Example
    ///
    /// ```
    /// use dcm_core::{DcmConfig, PhaseKind};
    ///
    /// let config = DcmConfig::default();
    /// let sched = PhaseKind::Cluster.schedule(&config);
    /// assert_eq!(sched.learning_rate(), config.optim.lr_cluster);
    /// assert_eq!(sched.period(), config.cluster_decay_period());
    /// ```
    pub fn schedule(&self, config: &DcmConfig) -> StepLr {
        let gamma = config.optim.lr_gamma;
        match self.modality() {
            Some(m) => StepLr::new(config.modality_lr(m), config.reconstruction_decay_period(), gamma),
            None => StepLr::new(config.optim.lr_cluster, config.cluster_decay_period(), gamma),
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Counts micro-batches and reports accumulation-window boundaries.
///
/// The count is global across epochs, so a window that is still open at
/// the end of an epoch closes during the next one.
///
/// # Example
///
/// ```
/// use dcm_core::AccumulationCounter;
///
/// let mut acc = AccumulationCounter::new(2);
/// assert!(!acc.advance());
/// assert!(acc.advance());
/// assert!(!acc.advance());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulationCounter {
    window: usize,
    seen: usize,
}

impl AccumulationCounter {
    /// A zero `window` is treated as 1.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            seen: 0,
        }
    }

    /// Registers one micro-batch; true if it closes a window.
    pub fn advance(&mut self) -> bool {
        self.seen += 1;
        self.seen % self.window == 0
    }

    /// Micro-batches registered so far.
    pub fn seen(&self) -> usize {
        self.seen
    }

    /// Window size.
    pub fn window(&self) -> usize {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_decoders_cluster_encoders() {
        let labels: Vec<&str> = PhaseKind::ORDER.iter().map(|p| p.label()).collect();
        assert_eq!(
            labels,
            ["frame_decoder", "flow_decoder", "cluster", "frame_encoder", "flow_encoder"]
        );
    }

    #[test]
    fn only_cluster_waits() {
        let waiting: Vec<PhaseKind> = PhaseKind::ORDER
            .into_iter()
            .filter(|p| p.waits_for_warm_up())
            .collect();
        assert_eq!(waiting, vec![PhaseKind::Cluster]);
    }

    #[test]
    fn decoders_skip_cluster_loss() {
        assert!(!PhaseKind::FrameDecoder.uses_cluster_loss());
        assert!(!PhaseKind::FlowDecoder.uses_cluster_loss());
        assert!(PhaseKind::FrameEncoder.uses_cluster_loss());
    }

    #[test]
    fn reconstruction_schedules_use_modality_rate() {
        let mut config = DcmConfig::default();
        config.optim.lr_frame = 0.5;
        config.optim.lr_flow = 0.25;
        assert_eq!(PhaseKind::FrameEncoder.schedule(&config).learning_rate(), 0.5);
        assert_eq!(PhaseKind::FlowDecoder.schedule(&config).learning_rate(), 0.25);
        assert_eq!(
            PhaseKind::FlowDecoder.schedule(&config).period(),
            config.reconstruction_decay_period()
        );
    }

    #[test]
    fn window_of_one_always_steps() {
        let mut acc = AccumulationCounter::new(1);
        assert!((0..5).all(|_| acc.advance()));
        assert_eq!(acc.seen(), 5);
    }

    #[test]
    fn window_of_three() {
        let mut acc = AccumulationCounter::new(3);
        let boundaries: Vec<bool> = (0..6).map(|_| acc.advance()).collect();
        assert_eq!(boundaries, [false, false, true, false, false, true]);
    }
}
