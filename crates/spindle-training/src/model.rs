use crate::dataset::PairedRecord;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

const LOG_EPSILON: f32 = 1e-7;

/// Multinomial logistic regression over normalized pixel intensities.
///
/// Weights are stored row-major: row `c` holds the `input_dim` weights of class `c`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftmaxModel {
    pub input_dim: usize,
    pub num_classes: usize,
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

/// Mean gradient of the cross-entropy loss over one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradient {
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
    pub loss: f32,
    pub examples: usize,
}

impl SoftmaxModel {
    /// A zero-initialized model.
    #[must_use]
    pub fn new(input_dim: usize, num_classes: usize) -> Self {
        Self {
            input_dim,
            num_classes,
            weights: vec![0.0; input_dim * num_classes],
            bias: vec![0.0; num_classes],
        }
    }

    /// Scale raw 0..=255 pixels into 0.0..=1.0.
    #[must_use]
    pub fn features(image: &[i32]) -> Vec<f32> {
        image.iter().map(|&px| px.clamp(0, 255) as f32 / 255.0).collect()
    }

    fn check_image(&self, image: &[i32]) -> TrainingResult<()> {
        if self.input_dim == 0 || self.num_classes == 0 {
            return Err(TrainingError::Model("model has an empty input or class dimension".to_string()));
        }
        if image.len() != self.input_dim {
            return Err(TrainingError::Model(format!(
                "image has {} values, model expects {}",
                image.len(),
                self.input_dim
            )));
        }
        Ok(())
    }

    fn logits(&self, features: &[f32]) -> Vec<f32> {
        self.weights
            .chunks_exact(self.input_dim)
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(features).map(|(w, x)| w * x).sum::<f32>() + b)
            .collect()
    }

    pub fn probabilities(&self, image: &[i32]) -> TrainingResult<Vec<f32>> {
        self.check_image(image)?;
        let mut logits = self.logits(&Self::features(image));
        softmax(&mut logits);
        Ok(logits)
    }

    pub fn predict(&self, image: &[i32]) -> TrainingResult<usize> {
        Ok(argmax(&self.probabilities(image)?))
    }

    pub fn gradient(&self, batch: &[PairedRecord]) -> TrainingResult<Gradient> {
        if batch.is_empty() {
            return Err(TrainingError::Model("cannot compute a gradient over an empty batch".to_string()));
        }

        let mut weights = vec![0.0f32; self.weights.len()];
        let mut bias = vec![0.0f32; self.num_classes];
        let mut loss = 0.0f32;

        for record in batch {
            self.check_image(&record.image)?;
            if record.label.len() != self.num_classes {
                return Err(TrainingError::Model(format!(
                    "label has {} values, model expects {}",
                    record.label.len(),
                    self.num_classes
                )));
            }

            let features = Self::features(&record.image);
            let mut probs = self.logits(&features);
            softmax(&mut probs);

            for (class, (p, y)) in probs.iter().zip(&record.label).enumerate() {
                loss -= y * (p + LOG_EPSILON).ln();
                let delta = p - y;
                bias[class] += delta;
                let row = &mut weights[class * self.input_dim..(class + 1) * self.input_dim];
                for (g, x) in row.iter_mut().zip(&features) {
                    *g += delta * x;
                }
            }
        }

        let scale = 1.0 / batch.len() as f32;
        weights.iter_mut().for_each(|g| *g *= scale);
        bias.iter_mut().for_each(|g| *g *= scale);

        Ok(Gradient { weights, bias, loss: loss * scale, examples: batch.len() })
    }

    /// Plain SGD update.
    pub fn apply(&mut self, gradient: &Gradient, learning_rate: f32) -> TrainingResult<()> {
        if gradient.weights.len() != self.weights.len() || gradient.bias.len() != self.bias.len() {
            return Err(TrainingError::Model("gradient shape does not match model".to_string()));
        }
        for (w, g) in self.weights.iter_mut().zip(&gradient.weights) {
            *w -= learning_rate * g;
        }
        for (b, g) in self.bias.iter_mut().zip(&gradient.bias) {
            *b -= learning_rate * g;
        }
        Ok(())
    }

    /// Fraction of records whose predicted class matches the label class.
    pub fn accuracy(&self, records: &[PairedRecord]) -> TrainingResult<f32> {
        if records.is_empty() {
            return Ok(0.0);
        }
        let mut correct = 0usize;
        for record in records {
            if Some(self.predict(&record.image)?) == record.label_class() {
                correct += 1;
            }
        }
        Ok(correct as f32 / records.len() as f32)
    }

    pub fn save(&self, path: &Path) -> TrainingResult<()> {
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> TrainingResult<Self> {
        if !path.exists() {
            return Err(TrainingError::Artifact(format!("no checkpoint at {}", path.display())));
        }
        let bytes = std::fs::read(path)?;
        let model: Self = serde_json::from_slice(&bytes)?;
        if model.weights.len() != model.input_dim * model.num_classes || model.bias.len() != model.num_classes {
            return Err(TrainingError::Artifact(format!("checkpoint {} has inconsistent shapes", path.display())));
        }
        Ok(model)
    }
}

fn softmax(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(0, |(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::synthetic_records;
    use tempfile::TempDir;

    #[test]
    fn test_zero_model_is_uniform() {
        let model = SoftmaxModel::new(4, 2);
        let probs = model.probabilities(&[0, 255, 0, 255]).unwrap();
        assert!((probs[0] - 0.5).abs() < 1e-6);
        assert!((probs[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_training_reduces_loss() {
        let records = synthetic_records(200, 7);
        let mut model = SoftmaxModel::new(records[0].image.len(), records[0].label.len());

        let first = model.gradient(&records).unwrap();
        for _ in 0..20 {
            let g = model.gradient(&records).unwrap();
            model.apply(&g, 0.5).unwrap();
        }
        let last = model.gradient(&records).unwrap();

        assert!(last.loss < first.loss);
        assert!(model.accuracy(&records).unwrap() > 0.9);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let model = SoftmaxModel::new(4, 2);
        let record = PairedRecord { image: vec![1, 2, 3], label: vec![1.0, 0.0] };
        assert!(matches!(model.gradient(&[record]), Err(TrainingError::Model(_))));
    }

    #[test]
    fn test_checkpoint_roundtrip_and_missing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("checkpoint.json");
        assert!(matches!(SoftmaxModel::load(&path), Err(TrainingError::Artifact(_))));

        let mut model = SoftmaxModel::new(3, 2);
        model.bias = vec![0.25, -0.25];
        model.save(&path).unwrap();
        assert_eq!(SoftmaxModel::load(&path).unwrap(), model);
    }
}
