//! Step-decay learning-rate schedule.

/// Multiplies the base learning rate by `gamma` every `period` steps.
///
/// # Example
///
/// ```
/// use dcm_core::StepLr;
///
/// let mut sched = StepLr::new(1e-2, 2, 0.1);
/// assert_eq!(sched.learning_rate(), 1e-2);
/// sched.step();
/// sched.step();
/// assert!((sched.learning_rate() - 1e-3).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct StepLr {
    base_lr: f64,
    period: usize,
    gamma: f64,
    steps: usize,
}

impl StepLr {
    /// A zero `period` is treated as 1.
    pub fn new(base_lr: f64, period: usize, gamma: f64) -> Self {
        Self {
            base_lr,
            period: period.max(1),
            gamma,
            steps: 0,
        }
    }

    /// Advances by one step and returns the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.steps += 1;
        self.learning_rate()
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.base_lr * self.gamma.powi((self.steps / self.period) as i32)
    }

    /// Steps taken so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Decay period in steps.
    pub fn period(&self) -> usize {
        self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_within_period() {
        let mut sched = StepLr::new(1.0, 3, 0.5);
        assert_eq!(sched.step(), 1.0);
        assert_eq!(sched.step(), 1.0);
        assert_eq!(sched.step(), 0.5);
        assert_eq!(sched.steps(), 3);
    }

    #[test]
    fn decays_repeatedly() {
        let mut sched = StepLr::new(1.0, 1, 0.1);
        for _ in 0..3 {
            sched.step();
        }
        assert!((sched.learning_rate() - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn zero_period_clamped() {
        let sched = StepLr::new(1.0, 0, 0.1);
        assert_eq!(sched.period(), 1);
    }
}
