//! K-fold cross-validation over the labeled set
//!
//! Fold sizes follow the usual convention: with `n` samples and `k` folds the
//! first `n % k` folds hold one extra validation sample. Folds are disjoint
//! and together cover every index exactly once.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, SslError};

/// Train/validation indices of one fold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldIndices {
    pub train: Vec<usize>,
    pub valid: Vec<usize>,
}

/// K-fold splitter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KFold {
    pub n_splits: usize,
    pub shuffle: bool,
    pub seed: u64,
}

impl KFold {
    pub fn new(n_splits: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            n_splits,
            shuffle,
            seed,
        }
    }

    /// Split `0..n` into folds
    pub fn split(&self, n: usize) -> Result<Vec<FoldIndices>> {
        if self.n_splits < 2 {
            return Err(SslError::Config(format!(
                "k-fold needs at least 2 splits, got {}",
                self.n_splits
            )));
        }
        if n < self.n_splits {
            return Err(SslError::Dataset(format!(
                "cannot split {} samples into {} folds",
                n, self.n_splits
            )));
        }

        let mut order: Vec<usize> = (0..n).collect();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
            order.shuffle(&mut rng);
        }

        let base = n / self.n_splits;
        let extra = n % self.n_splits;

        let mut folds = Vec::with_capacity(self.n_splits);
        let mut start = 0;
        for fold in 0..self.n_splits {
            let size = base + usize::from(fold < extra);
            let end = start + size;
            let valid = order[start..end].to_vec();
            let train = order[..start]
                .iter()
                .chain(order[end..].iter())
                .copied()
                .collect();
            folds.push(FoldIndices { train, valid });
            start = end;
        }

        Ok(folds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_sizes() {
        let folds = KFold::new(5, false, 0).split(12).unwrap();
        let sizes: Vec<usize> = folds.iter().map(|f| f.valid.len()).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2, 2]);
        assert!(folds.iter().all(|f| f.train.len() + f.valid.len() == 12));
        assert_eq!(folds[0].valid, vec![0, 1, 2]);
    }

    #[test]
    fn test_folds_partition_indices() {
        let folds = KFold::new(4, true, 42).split(10).unwrap();
        let mut all: Vec<usize> = folds.iter().flat_map(|f| f.valid.clone()).collect();
        all.sort();
        assert_eq!(all, (0..10).collect::<Vec<_>>());

        for f in &folds {
            assert!(f.valid.iter().all(|v| !f.train.contains(v)));
        }
    }

    #[test]
    fn test_reproducible() {
        let a = KFold::new(3, true, 7).split(9).unwrap();
        let b = KFold::new(3, true, 7).split(9).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_too_few_samples() {
        assert!(KFold::new(5, true, 0).split(3).is_err());
        assert!(KFold::new(1, true, 0).split(3).is_err());
    }
}
