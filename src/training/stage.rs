//! Training stages and their contrastive-weight policy

use std::fmt;

use serde::{Deserialize, Serialize};

/// The three training stages run per fold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    SupervisedPretraining,
    SslReliableSt1,
    SslReliableSt2,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [
        StageKind::SupervisedPretraining,
        StageKind::SslReliableSt1,
        StageKind::SslReliableSt2,
    ];

    /// Name used in checkpoint and loss-log file names
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::SupervisedPretraining => "supervised-Pretraining",
            StageKind::SslReliableSt1 => "SSL-reliable-st1",
            StageKind::SslReliableSt2 => "SSL-reliable-st2",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Weight of the contrastive term in `total = sup + w * con`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WeightPolicy {
    Fixed(f64),
    /// Ramp from `start` toward `max` in steps of `interval` epochs
    Dynamic { start: f64, max: f64, interval: usize },
}

/// Fixed weight of both SSL stages
pub const SSL_STAGE_WEIGHT: f64 = 0.5;

impl WeightPolicy {
    /// Ramp used by pretraining when no fixed weight is configured
    pub fn default_dynamic() -> Self {
        WeightPolicy::Dynamic {
            start: 0.1,
            max: 1.0,
            interval: 10,
        }
    }

    /// Resolve the policy of a stage once, before its first epoch
    ///
    /// Pretraining uses `contrastive_weight` when it is non-zero and the
    /// dynamic ramp otherwise; the SSL stages always use 0.5.
    pub fn for_stage(kind: StageKind, contrastive_weight: f64) -> Self {
        match kind {
            StageKind::SupervisedPretraining if contrastive_weight != 0.0 => {
                WeightPolicy::Fixed(contrastive_weight)
            }
            StageKind::SupervisedPretraining => Self::default_dynamic(),
            StageKind::SslReliableSt1 | StageKind::SslReliableSt2 => {
                WeightPolicy::Fixed(SSL_STAGE_WEIGHT)
            }
        }
    }

    /// Weight at a 1-based epoch of a stage ending at `end_epoch`
    pub fn weight(&self, epoch: usize, end_epoch: usize) -> f64 {
        match *self {
            WeightPolicy::Fixed(w) => w,
            WeightPolicy::Dynamic {
                start,
                max,
                interval,
            } => dynamic_weight(epoch, end_epoch, start, max, interval),
        }
    }
}

/// Step-wise ramp: `start` for the first `interval` epochs, then one
/// increment of `(max - start) / max(end / interval, 1)` per interval
pub fn dynamic_weight(epoch: usize, end_epoch: usize, start: f64, max: f64, interval: usize) -> f64 {
    let interval = interval.max(1);
    if epoch < interval {
        return start;
    }
    let steps = (end_epoch / interval).max(1) as f64;
    start + (epoch / interval) as f64 * (max - start) / steps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(StageKind::SupervisedPretraining.name(), "supervised-Pretraining");
        assert_eq!(StageKind::SslReliableSt1.name(), "SSL-reliable-st1");
        assert_eq!(StageKind::SslReliableSt2.to_string(), "SSL-reliable-st2");
    }

    #[test]
    fn test_dynamic_ramp() {
        let policy = WeightPolicy::for_stage(StageKind::SupervisedPretraining, 0.0);
        assert!(close(policy.weight(1, 100), 0.1));
        assert!(close(policy.weight(5, 100), 0.1));
        assert!(close(policy.weight(15, 100), 0.19));
        assert!(close(policy.weight(95, 100), 0.91));
        assert!(close(policy.weight(100, 100), 1.0));
    }

    #[test]
    fn test_short_stage_does_not_divide_by_zero() {
        let w = dynamic_weight(12, 5, 0.1, 1.0, 10);
        assert!(w.is_finite());
        assert!(close(w, 1.0));
    }

    #[test]
    fn test_fixed_override_and_ssl_stages() {
        let policy = WeightPolicy::for_stage(StageKind::SupervisedPretraining, 0.3);
        assert_eq!(policy, WeightPolicy::Fixed(0.3));
        assert!(close(policy.weight(50, 100), 0.3));

        for kind in [StageKind::SslReliableSt1, StageKind::SslReliableSt2] {
            let policy = WeightPolicy::for_stage(kind, 0.3);
            assert!(close(policy.weight(1, 100), 0.5));
        }
    }
}
