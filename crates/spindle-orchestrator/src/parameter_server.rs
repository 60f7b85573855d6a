//! Sharded parameter store for asynchronous data-parallel SGD.
//!
//! Class rows of the softmax weights are split across shards, one per
//! parameter-server executor. Workers pull a full model, compute a gradient
//! locally and push it back; each push advances the global step.

use crate::error::{OrchestrationError, Result};
use spindle_training::{Gradient, SoftmaxModel, TrainingError};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use tracing::debug;

#[derive(Debug, Default)]
struct Shard {
    classes: Range<usize>,
    weights: Vec<f32>,
    bias: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Dims {
    input_dim: usize,
    num_classes: usize,
}

#[derive(Debug)]
pub struct ParameterServer {
    shards: Vec<Mutex<Shard>>,
    dims: OnceLock<Dims>,
    global_step: AtomicU64,
    learning_rate: f32,
}

impl ParameterServer {
    /// A store with `num_shards` shards (at least one).
    #[must_use]
    pub fn new(num_shards: usize, learning_rate: f32) -> Self {
        let shards = (0..num_shards.max(1)).map(|_| Mutex::new(Shard::default())).collect();
        Self { shards, dims: OnceLock::new(), global_step: AtomicU64::new(0), learning_rate }
    }

    #[must_use]
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    #[must_use]
    pub fn global_step(&self) -> u64 {
        self.global_step.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.dims.get().is_some()
    }

    /// Zero-initialize the weights. Only the first call allocates; later
    /// calls must agree on the shape.
    pub fn initialize(&self, input_dim: usize, num_classes: usize) -> Result<()> {
        let requested = Dims { input_dim, num_classes };
        let dims = self.dims.get_or_init(|| {
            let per_shard = num_classes.div_ceil(self.shards.len()).max(1);
            for (idx, shard) in self.shards.iter().enumerate() {
                let start = (idx * per_shard).min(num_classes);
                let end = (start + per_shard).min(num_classes);
                let mut shard = shard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                shard.weights = vec![0.0; (end - start) * input_dim];
                shard.bias = vec![0.0; end - start];
                shard.classes = start..end;
            }
            debug!(input_dim, num_classes, shards = self.shards.len(), "Parameter server initialized");
            requested
        });

        if *dims != requested {
            return Err(TrainingError::Model(format!(
                "parameter server holds a {}x{} model, got {}x{}",
                dims.num_classes, dims.input_dim, num_classes, input_dim
            ))
            .into());
        }
        Ok(())
    }

    /// Assemble the current weights from every shard.
    pub fn pull(&self) -> Result<SoftmaxModel> {
        let dims = self.dims()?;
        let mut model = SoftmaxModel::new(dims.input_dim, dims.num_classes);
        for shard in &self.shards {
            let shard = lock(shard)?;
            let rows = shard.classes.start * dims.input_dim..shard.classes.end * dims.input_dim;
            model.weights[rows].copy_from_slice(&shard.weights);
            model.bias[shard.classes.clone()].copy_from_slice(&shard.bias);
        }
        Ok(model)
    }

    /// Apply a gradient shard by shard. Returns the new global step.
    pub fn push(&self, gradient: &Gradient) -> Result<u64> {
        let dims = self.dims()?;
        if gradient.weights.len() != dims.input_dim * dims.num_classes
            || gradient.bias.len() != dims.num_classes
        {
            return Err(TrainingError::Model("gradient shape does not match parameter server".to_string()).into());
        }

        for shard in &self.shards {
            let mut shard = lock(shard)?;
            let rows = shard.classes.start * dims.input_dim..shard.classes.end * dims.input_dim;
            let classes = shard.classes.clone();
            for (w, g) in shard.weights.iter_mut().zip(&gradient.weights[rows]) {
                *w -= self.learning_rate * g;
            }
            for (b, g) in shard.bias.iter_mut().zip(&gradient.bias[classes]) {
                *b -= self.learning_rate * g;
            }
        }

        Ok(self.global_step.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn dims(&self) -> Result<Dims> {
        self.dims
            .get()
            .copied()
            .ok_or_else(|| OrchestrationError::Other("parameter server is not initialized".to_string()))
    }
}

fn lock(shard: &Mutex<Shard>) -> Result<MutexGuard<'_, Shard>> {
    shard.lock().map_err(|_| OrchestrationError::Other("parameter shard lock poisoned".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_training::synthetic_records;

    #[test]
    fn test_shards_recombine_to_single_model() {
        let records = synthetic_records(50, 3);
        let mut reference = SoftmaxModel::new(784, 10);

        let server = ParameterServer::new(4, 0.5);
        server.initialize(784, 10).unwrap();

        for batch in records.chunks(10) {
            let gradient = server.pull().unwrap().gradient(batch).unwrap();
            server.push(&gradient).unwrap();
            reference.apply(&reference.gradient(batch).unwrap(), 0.5).unwrap();
        }

        assert_eq!(server.global_step(), 5);
        assert_eq!(server.pull().unwrap(), reference);
    }

    #[test]
    fn test_more_shards_than_classes() {
        let server = ParameterServer::new(7, 1.0);
        server.initialize(2, 3).unwrap();
        let gradient = Gradient { weights: vec![1.0; 6], bias: vec![1.0; 3], loss: 0.0, examples: 1 };

        assert_eq!(server.push(&gradient).unwrap(), 1);
        let model = server.pull().unwrap();
        assert_eq!(model.weights, vec![-1.0; 6]);
        assert_eq!(model.bias, vec![-1.0; 3]);
    }

    #[test]
    fn test_uninitialized_and_mismatched_shapes() {
        let server = ParameterServer::new(1, 0.1);
        assert!(server.pull().is_err());

        server.initialize(4, 2).unwrap();
        server.initialize(4, 2).unwrap();
        assert!(server.initialize(8, 2).is_err());

        let bad = Gradient { weights: vec![0.0; 3], bias: vec![0.0; 2], loss: 0.0, examples: 1 };
        assert!(server.push(&bad).is_err());
        assert_eq!(server.global_step(), 0);
    }
}
