//! Learning Rate Scheduler Module
//!
//! Polynomial decay from an initial to a final learning rate, stepped once
//! per epoch by the trainer. Without `lr_decay.enabled` the schedule is
//! constant at the configured rate.

use serde::{Deserialize, Serialize};

/// `lr = (initial - end) * (1 - step / max_decay_steps)^power + end`,
/// held at `end_lr` once `step >= max_decay_steps`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolynomialDecay {
    pub initial_lr: f64,
    pub end_lr: f64,
    pub max_decay_steps: usize,
    pub power: f64,
}

impl PolynomialDecay {
    pub fn new(initial_lr: f64, end_lr: f64, max_decay_steps: usize, power: f64) -> Self {
        Self {
            initial_lr,
            end_lr,
            max_decay_steps,
            power,
        }
    }

    /// Constant schedule
    pub fn constant(lr: f64) -> Self {
        Self::new(lr, lr, 0, 1.0)
    }

    /// Learning rate after `step` decay steps
    pub fn get_lr(&self, step: usize) -> f64 {
        if self.max_decay_steps == 0 || step >= self.max_decay_steps {
            return self.end_lr;
        }
        let remaining = 1.0 - step as f64 / self.max_decay_steps as f64;
        (self.initial_lr - self.end_lr) * remaining.powf(self.power) + self.end_lr
    }

    pub fn description(&self) -> String {
        if self.max_decay_steps == 0 {
            return format!("Constant: lr={:.6}", self.end_lr);
        }
        format!(
            "Polynomial decay: initial={:.6}, end={:.6}, steps={}, power={}",
            self.initial_lr, self.end_lr, self.max_decay_steps, self.power
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints() {
        let scheduler = PolynomialDecay::new(1e-3, 1e-4, 100, 2.0);
        assert!((scheduler.get_lr(0) - 1e-3).abs() < 1e-12);
        assert!((scheduler.get_lr(100) - 1e-4).abs() < 1e-12);
        assert!((scheduler.get_lr(500) - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_monotonic_decay() {
        let scheduler = PolynomialDecay::new(1e-2, 0.0, 50, 2.0);
        let mut prev = f64::INFINITY;
        for step in 0..=50 {
            let lr = scheduler.get_lr(step);
            assert!(lr <= prev);
            prev = lr;
        }
    }

    #[test]
    fn test_power_one_is_linear() {
        let scheduler = PolynomialDecay::new(1.0, 0.0, 10, 1.0);
        assert!((scheduler.get_lr(5) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_constant() {
        let scheduler = PolynomialDecay::constant(0.001);
        assert_eq!(scheduler.get_lr(0), 0.001);
        assert_eq!(scheduler.get_lr(1000), 0.001);
        assert_eq!(scheduler.description(), "Constant: lr=0.001000");
        assert!(PolynomialDecay::new(1e-3, 0.0, 10, 0.9)
            .description()
            .starts_with("Polynomial decay"));
    }
}
