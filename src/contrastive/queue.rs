//! Per-class embedding memory bank
//!
//! Holds recent teacher embeddings, one bounded FIFO per class. The queues
//! are owned by the training loop and mutated once per step.

use std::collections::VecDeque;

use rand::seq::index::sample;
use rand::Rng;

use crate::contrastive::patches::ClassAligned;

/// Default number of embeddings kept per class
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct EmbeddingQueues {
    queues: Vec<VecDeque<Vec<f32>>>,
    capacities: Vec<usize>,
}

impl EmbeddingQueues {
    /// Same capacity for every class
    pub fn new(num_classes: usize, capacity: usize) -> Self {
        Self::with_capacities(vec![capacity; num_classes])
    }

    pub fn with_capacities(capacities: Vec<usize>) -> Self {
        Self {
            queues: capacities.iter().map(|_| VecDeque::new()).collect(),
            capacities,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.queues.len()
    }

    /// Append every present embedding of each class column
    pub fn enqueue(&mut self, embeddings: &ClassAligned<Vec<f32>>) {
        for (class, _image, emb) in embeddings.iter_present() {
            if class < self.queues.len() {
                self.push(class, emb.clone());
            }
        }
    }

    /// Append one embedding, evicting the oldest entries beyond capacity
    pub fn push(&mut self, class: usize, embedding: Vec<f32>) {
        let capacity = self.capacities[class];
        let queue = &mut self.queues[class];
        if capacity == 0 {
            return;
        }
        queue.push_back(embedding);
        while queue.len() > capacity {
            queue.pop_front();
        }
    }

    pub fn len(&self, class: usize) -> usize {
        self.queues[class].len()
    }

    pub fn is_empty(&self, class: usize) -> bool {
        self.queues[class].is_empty()
    }

    pub fn capacity(&self, class: usize) -> usize {
        self.capacities[class]
    }

    /// All entries when there are at most `psi`, otherwise `psi` distinct
    /// entries drawn at random
    pub fn sample<R: Rng>(&self, class: usize, psi: usize, rng: &mut R) -> Vec<&[f32]> {
        let queue = &self.queues[class];
        if queue.len() <= psi {
            return queue.iter().map(|e| e.as_slice()).collect();
        }
        sample(rng, queue.len(), psi)
            .into_iter()
            .map(|i| queue[i].as_slice())
            .collect()
    }
}
