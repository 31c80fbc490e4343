//! One parameter group with its optimizer, schedule and accumulated
//! gradients.

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use dcm_core::{DcmError, PhaseKind, StepLr};
use tracing::debug;

/// Optimizer state of one training phase.
///
/// Gradients from every backward pass are summed into `pending` and only
/// handed to the optimizer at an accumulation boundary.
pub struct PhaseOptimizer {
    kind: PhaseKind,
    vars: Vec<Var>,
    optimizer: AdamW,
    schedule: StepLr,
    pending: Vec<Option<Tensor>>,
    updates: usize,
}

impl std::fmt::Debug for PhaseOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PhaseOptimizer({}, {} tensors, lr={:.3e}, {} updates)",
            self.kind,
            self.vars.len(),
            self.schedule.learning_rate(),
            self.updates
        )
    }
}

impl PhaseOptimizer {
    /// Creates an AdamW optimizer over `vars` starting at the schedule's
    /// base rate.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Internal`] if the optimizer cannot be built.
    pub fn new(
        kind: PhaseKind,
        vars: Vec<Var>,
        schedule: StepLr,
        weight_decay: f64,
    ) -> Result<Self, DcmError> {
        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: schedule.learning_rate(),
                weight_decay,
                ..Default::default()
            },
        )
        .map_err(|e| DcmError::Internal {
            message: format!("PhaseOptimizer::new({kind}): {e}"),
        })?;
        let pending = vec![None; vars.len()];
        Ok(Self {
            kind,
            vars,
            optimizer,
            schedule,
            pending,
            updates: 0,
        })
    }

    /// Which phase this is.
    pub fn kind(&self) -> PhaseKind {
        self.kind
    }

    /// Parameters owned by this phase.
    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.schedule.learning_rate()
    }

    /// Optimizer updates applied so far.
    pub fn updates(&self) -> usize {
        self.updates
    }

    /// Whether gradients are waiting for the next boundary.
    pub fn has_pending(&self) -> bool {
        self.pending.iter().any(Option::is_some)
    }

    /// Adds this phase's share of `grads` to the pending sums.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Internal`] on tensor failures.
    pub fn accumulate(&mut self, grads: &GradStore) -> Result<(), DcmError> {
        let map_err = |e: candle_core::Error| DcmError::Internal {
            message: format!("PhaseOptimizer::accumulate({}): {e}", self.kind),
        };
        for (var, slot) in self.vars.iter().zip(self.pending.iter_mut()) {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let grad = grad.detach();
            *slot = Some(match slot.take() {
                Some(sum) => sum.add(&grad).map_err(map_err)?,
                None => grad,
            });
        }
        Ok(())
    }

    /// Applies the pending gradient sums and clears them. Returns false if
    /// there was nothing to apply.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Internal`] if the optimizer step fails.
    pub fn apply(&mut self, device: &Device) -> Result<bool, DcmError> {
        let map_err = |e: candle_core::Error| DcmError::Internal {
            message: format!("PhaseOptimizer::apply({}): {e}", self.kind),
        };
        if !self.has_pending() {
            return Ok(false);
        }
        let mut store = empty_grad_store(device).map_err(map_err)?;
        for (var, slot) in self.vars.iter().zip(self.pending.iter_mut()) {
            if let Some(sum) = slot.take() {
                store.insert(var.as_tensor(), sum);
            }
        }
        self.optimizer.step(&store).map_err(map_err)?;
        self.updates += 1;
        debug!(phase = %self.kind, updates = self.updates, "optimizer step");
        Ok(true)
    }

    /// Advances the learning-rate schedule by one step.
    pub fn advance_schedule(&mut self) {
        let lr = self.schedule.step();
        self.optimizer.set_learning_rate(lr);
    }
}

/// A gradient store tracking nothing but a detached scalar.
fn empty_grad_store(device: &Device) -> candle_core::Result<GradStore> {
    Tensor::new(0f32, device)?.backward()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn var(value: f32) -> Var {
        Var::from_tensor(&Tensor::new(&[value], &Device::Cpu).unwrap()).unwrap()
    }

    fn value(v: &Var) -> f32 {
        v.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn accumulates_until_applied() {
        let dev = Device::Cpu;
        let w = var(1.0);
        let mut phase = PhaseOptimizer::new(
            PhaseKind::FrameDecoder,
            vec![w.clone()],
            StepLr::new(0.1, 10, 0.1),
            0.0,
        )
        .unwrap();

        for _ in 0..2 {
            let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
            phase.accumulate(&loss.backward().unwrap()).unwrap();
        }
        assert!(phase.has_pending());
        assert_eq!(value(&w), 1.0);

        assert!(phase.apply(&dev).unwrap());
        assert!(!phase.has_pending());
        assert!(value(&w) < 1.0);
        assert_eq!(phase.updates(), 1);
    }

    #[test]
    fn apply_without_gradients_is_noop() {
        let w = var(2.0);
        let mut phase =
            PhaseOptimizer::new(PhaseKind::Cluster, vec![w.clone()], StepLr::new(0.1, 1, 0.5), 0.0)
                .unwrap();
        assert!(!phase.apply(&Device::Cpu).unwrap());
        assert_eq!(value(&w), 2.0);
    }

    #[test]
    fn ignores_foreign_gradients() {
        let mine = var(1.0);
        let other = var(1.0);
        let mut phase = PhaseOptimizer::new(
            PhaseKind::FlowEncoder,
            vec![mine.clone()],
            StepLr::new(0.1, 1, 0.5),
            0.0,
        )
        .unwrap();
        let loss = other.as_tensor().sqr().unwrap().sum_all().unwrap();
        phase.accumulate(&loss.backward().unwrap()).unwrap();
        assert!(!phase.has_pending());
    }

    #[test]
    fn schedule_drives_learning_rate() {
        let w = Var::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let mut phase =
            PhaseOptimizer::new(PhaseKind::Cluster, vec![w], StepLr::new(1.0, 2, 0.1), 0.0)
                .unwrap();
        phase.advance_schedule();
        assert_eq!(phase.learning_rate(), 1.0);
        phase.advance_schedule();
        assert!((phase.learning_rate() - 0.1).abs() < 1e-12);
    }
}
