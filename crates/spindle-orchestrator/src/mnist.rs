//! The MNIST worker: asynchronous SGD in train mode, batch prediction in
//! inference mode.

use crate::cluster::{WorkerContext, WorkerFn};
use crate::error::Result;
use crate::progress::ClusterEvent;
use async_trait::async_trait;
use chrono::Utc;
use spindle_training::{
    ModelLayout, PairedRecord, RunMode, SoftmaxModel, TrainingError, TrainingResult, IMAGE_PIXELS, NUM_CLASSES,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct MnistWorker;

#[async_trait]
impl WorkerFn for MnistWorker {
    async fn run(&self, ctx: &mut WorkerContext) -> Result<()> {
        match ctx.config().mode {
            RunMode::Train => train(ctx).await,
            RunMode::Inference => infer(ctx).await,
        }
    }
}

async fn train(ctx: &mut WorkerContext) -> Result<()> {
    let worker = ctx.index();
    let batch_size = ctx.config().batch_size as usize;
    let steps = ctx.config().steps;
    ctx.params().initialize(IMAGE_PIXELS, NUM_CLASSES)?;

    loop {
        if ctx.params().global_step() >= steps {
            info!(worker, steps, "Step limit reached");
            ctx.feed().terminate();
            break;
        }
        let Some(batch) = ctx.feed().next_batch(batch_size).await else { break };

        let model = ctx.params().pull()?;
        let gradient = tokio::task::spawn_blocking(move || model.gradient(&batch)).await??;
        let step = ctx.params().push(&gradient)?;
        debug!(worker, step, loss = gradient.loss, "Step");
        ctx.progress().emit(ClusterEvent::StepCompleted {
            worker,
            step,
            loss: f64::from(gradient.loss),
            examples: gradient.examples,
        });
    }

    if ctx.is_chief() {
        ctx.finish_training();
        ctx.feed().drain().await;
        ctx.wait_for_peers().await?;
        if ctx.run_failed() {
            warn!(worker, "Run failed; checkpoint not written");
            return Ok(());
        }

        let layout = ModelLayout::new(ctx.config().model.clone());
        layout.ensure_dirs()?;
        let model = ctx.params().pull()?;
        model.save(&layout.checkpoint_path())?;
        info!(
            path = %layout.checkpoint_path().display(),
            global_step = ctx.params().global_step(),
            "Checkpoint saved"
        );
    }
    Ok(())
}

async fn infer(ctx: &mut WorkerContext) -> Result<()> {
    let batch_size = ctx.config().batch_size as usize;
    let checkpoint = ModelLayout::new(ctx.config().model.clone()).checkpoint_path();
    let model = Arc::new(SoftmaxModel::load(&checkpoint)?);
    debug!(worker = ctx.index(), path = %checkpoint.display(), "Checkpoint loaded");

    while let Some(batch) = ctx.feed().next_batch(batch_size).await {
        let model = Arc::clone(&model);
        let lines = tokio::task::spawn_blocking(move || prediction_lines(&model, &batch)).await??;
        ctx.feed().batch_results(lines)?;
    }
    Ok(())
}

/// `"<timestamp> Label: L, Prediction: P"` per record.
fn prediction_lines(model: &SoftmaxModel, batch: &[PairedRecord]) -> TrainingResult<Vec<String>> {
    batch
        .iter()
        .map(|record| {
            let label = record
                .label_class()
                .ok_or_else(|| TrainingError::Model("record has an empty label".to_string()))?;
            let prediction = model.predict(&record.image)?;
            Ok(format!("{} Label: {label}, Prediction: {prediction}", Utc::now().to_rfc3339()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_training::synthetic_records;

    #[test]
    fn test_prediction_line_format() {
        let records = synthetic_records(3, 9);
        let lines = prediction_lines(&SoftmaxModel::new(IMAGE_PIXELS, NUM_CLASSES), &records).unwrap();

        assert_eq!(lines.len(), 3);
        let (_, tail) = lines[1].split_once(" Label: 1, Prediction: ").unwrap();
        assert!(tail.parse::<usize>().unwrap() < NUM_CLASSES);
        assert!(chrono::DateTime::parse_from_rfc3339(lines[0].split(' ').next().unwrap()).is_ok());
    }

    #[test]
    fn test_empty_label_rejected() {
        let record = PairedRecord { image: vec![0; IMAGE_PIXELS], label: vec![] };
        assert!(prediction_lines(&SoftmaxModel::new(IMAGE_PIXELS, NUM_CLASSES), &[record]).is_err());
    }
}
