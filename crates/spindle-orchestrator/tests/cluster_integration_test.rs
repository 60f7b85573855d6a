//! End-to-end runs through `RunExecutor` on synthetic MNIST data.

use spindle_orchestrator::{ClusterResources, OrchestrationError, RunExecutor, RunReport};
use spindle_training::{
    count_lines, write_csv_dataset, RunConfig, RunManifest, SoftmaxModel, TrainingError, synthetic_records,
};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Workspace {
    _temp: TempDir,
    root: PathBuf,
    images: PathBuf,
    labels: PathBuf,
}

impl Workspace {
    fn new(records: usize) -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let (images, labels) = write_csv_dataset(&root.join("csv"), records, 42, 2).unwrap();
        Self { _temp: temp, root, images, labels }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn config(&self, extra: &[&str]) -> RunConfig {
        let model = self.path("mnist_model");
        let output = self.path("predictions");
        let mut args = vec![
            "--images".to_string(),
            self.images.display().to_string(),
            "--labels".to_string(),
            self.labels.display().to_string(),
            "--model".to_string(),
            model.display().to_string(),
            "--output".to_string(),
            output.display().to_string(),
        ];
        args.extend(extra.iter().map(|s| (*s).to_string()));
        RunConfig::from_args(args).unwrap()
    }
}

async fn execute(config: RunConfig) -> Result<RunReport, OrchestrationError> {
    RunExecutor::new(config).with_resources(ClusterResources::new(4)).execute().await
}

fn names(report: &RunReport) -> Vec<String> {
    report.artifacts.iter().map(|e| e.name.clone()).collect()
}

fn write_lines(path: &Path, count: usize, line: &str) {
    let content: String = std::iter::repeat_n(format!("{line}\n"), count).collect();
    std::fs::write(path, content).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_train_produces_model_directory() {
    let ws = Workspace::new(600);
    let report = execute(ws.config(&["--epochs", "1", "--steps", "600"])).await.unwrap();

    assert_eq!(report.cluster.records_submitted, 600);
    assert_eq!(report.cluster.records_consumed, 600);
    assert_eq!(report.cluster.global_step, 6);
    assert!(!report.artifacts.is_empty());
    assert_eq!(names(&report), vec!["checkpoint.json", "run_manifest.json"]);

    let manifest = RunManifest::read(&ws.path("mnist_model/run_manifest.json")).unwrap();
    assert_eq!(manifest.metrics.global_step, Some(6));
    assert_eq!(manifest.artifacts.len(), 1);

    let model = SoftmaxModel::load(&ws.path("mnist_model/checkpoint.json")).unwrap();
    assert!(model.accuracy(&synthetic_records(200, 7)).unwrap() > 0.8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_train_then_inference_writes_one_line_per_record() {
    let ws = Workspace::new(600);
    execute(ws.config(&["--steps", "600"])).await.unwrap();

    let (images, labels) = write_csv_dataset(&ws.path("test_csv"), 100, 7, 3).unwrap();
    let mut config = ws.config(&["--mode", "inference", "--partition_size", "30"]);
    config.images = images;
    config.labels = labels;
    let report = execute(config).await.unwrap();

    assert_eq!(report.prediction_lines, Some(100));
    assert_eq!(count_lines(&ws.path("predictions")).unwrap(), 100);
    assert_eq!(report.cluster.partitions_written, 4);
    assert!(names(&report).contains(&"_SUCCESS".to_string()));
    assert!(names(&report).contains(&"part-00003".to_string()));
    assert!(report.manifest.is_none());

    let first = std::fs::read_to_string(ws.path("predictions/part-00000")).unwrap();
    let line = first.lines().next().unwrap();
    assert!(line.contains(" Label: 0, Prediction: "));

    // Inference never touches the model directory
    assert!(ws.path("mnist_model/checkpoint.json").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_step_limit_drains_remaining_records() {
    let ws = Workspace::new(600);
    let report =
        execute(ws.config(&["--steps", "2", "--batch_size", "10", "--partition_size", "50"])).await.unwrap();

    let cluster = &report.cluster;
    assert!(cluster.global_step >= 2);
    assert!(cluster.global_step < 2 + cluster.workers as u64);
    assert!(cluster.records_drained > 0);
    assert_eq!(cluster.records_consumed + cluster.records_drained, cluster.records_submitted);
    assert!(ws.path("mnist_model/checkpoint.json").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_direct_input_mode_trains() {
    let ws = Workspace::new(300);
    let report = execute(ws.config(&[
        "--input_mode",
        "direct",
        "--epochs",
        "2",
        "--partition_size",
        "50",
        "--cluster_size",
        "4",
    ]))
    .await
    .unwrap();

    assert_eq!(report.cluster.workers, 3);
    assert_eq!(report.cluster.records_submitted, 600);
    assert_eq!(report.cluster.records_consumed, 600);
    assert!(ws.path("mnist_model/checkpoint.json").exists());
}

#[tokio::test]
async fn test_too_many_executors_is_rejected() {
    let ws = Workspace::new(10);
    let err = execute(ws.config(&["--cluster_size", "8"])).await.unwrap_err();

    assert!(matches!(err, OrchestrationError::InsufficientResources { requested: 8, available: 4 }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_length_mismatch_fails_unless_truncation_allowed() {
    let ws = Workspace::new(10);
    let images = ws.path("mismatch/images.csv");
    let labels = ws.path("mismatch/labels.csv");
    std::fs::create_dir_all(ws.path("mismatch")).unwrap();
    write_lines(&images, 10, &vec!["0"; 784].join(","));
    write_lines(&labels, 8, "1,0,0,0,0,0,0,0,0,0");

    let mut config = ws.config(&[]);
    config.images = images.clone();
    config.labels = labels.clone();
    let err = execute(config).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestrationError::Training(TrainingError::LengthMismatch { images: 10, labels: 8 })
    ));

    let mut config = ws.config(&["--allow_truncation"]);
    config.images = images;
    config.labels = labels;
    let report = execute(config).await.unwrap();
    assert_eq!(report.cluster.records_consumed, 8);
}

/// Writes 10 image lines and 8 label lines under `dir`.
fn write_mismatched(ws: &Workspace, dir: &str) -> (PathBuf, PathBuf) {
    std::fs::create_dir_all(ws.path(dir)).unwrap();
    let images = ws.path(&format!("{dir}/images.csv"));
    let labels = ws.path(&format!("{dir}/labels.csv"));
    write_lines(&images, 10, &vec!["0"; 784].join(","));
    write_lines(&labels, 8, "1,0,0,0,0,0,0,0,0,0");
    (images, labels)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_train_leaves_no_checkpoint() {
    let ws = Workspace::new(10);
    let (images, labels) = write_mismatched(&ws, "mismatch");

    let mut config = ws.config(&["--batch_size", "2"]);
    config.images = images;
    config.labels = labels;
    let err = execute(config).await.unwrap_err();

    assert!(matches!(err, OrchestrationError::Training(TrainingError::LengthMismatch { .. })));
    assert!(!ws.path("mnist_model/checkpoint.json").exists());
    assert!(!ws.path("mnist_model/run_manifest.json").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_inference_is_not_marked_complete() {
    let ws = Workspace::new(200);
    execute(ws.config(&[])).await.unwrap();
    let (images, labels) = write_mismatched(&ws, "mismatch");

    let mut config = ws.config(&["--mode", "inference", "--partition_size", "4"]);
    config.images = images;
    config.labels = labels;
    let err = execute(config).await.unwrap_err();

    assert!(matches!(err, OrchestrationError::Training(TrainingError::LengthMismatch { .. })));
    assert!(!ws.path("predictions/_SUCCESS").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inference_over_empty_input_writes_zero_lines() {
    let ws = Workspace::new(200);
    execute(ws.config(&[])).await.unwrap();
    std::fs::create_dir_all(ws.path("empty")).unwrap();
    std::fs::write(ws.path("empty/images.csv"), "").unwrap();
    std::fs::write(ws.path("empty/labels.csv"), "").unwrap();

    let mut config = ws.config(&["--mode", "inference"]);
    config.images = ws.path("empty/images.csv");
    config.labels = ws.path("empty/labels.csv");
    let report = execute(config).await.unwrap();

    assert_eq!(report.prediction_lines, Some(0));
    assert_eq!(report.cluster.records_submitted, 0);
    assert!(ws.path("predictions/_SUCCESS").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dashboard_writes_event_log() {
    let ws = Workspace::new(200);
    let report = execute(ws.config(&["--tensorboard", "--batch_size", "50"])).await.unwrap();

    assert!(names(&report).contains(&"events.jsonl".to_string()));
    let content = std::fs::read_to_string(ws.path("mnist_model/events.jsonl")).unwrap();
    let events: Vec<serde_json::Value> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();

    assert_eq!(events.first().unwrap()["event"], "cluster_started");
    assert_eq!(events.last().unwrap()["event"], "cluster_stopped");
    assert_eq!(events.iter().filter(|e| e["event"] == "step_completed").count(), 4);
    assert_eq!(Some(events.len() as u64), report.cluster.dashboard_events);

    let manifest = RunManifest::read(&ws.path("mnist_model/run_manifest.json")).unwrap();
    assert_eq!(manifest.artifacts.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inference_without_checkpoint_fails() {
    let ws = Workspace::new(20);
    let err = execute(ws.config(&["--mode", "inference"])).await.unwrap_err();

    assert!(matches!(err, OrchestrationError::Training(TrainingError::Artifact(_))));
}
