//! Spindle Training
//!
//! Backend-agnostic training primitives for:
//! - Describing a run (`RunConfig`) from command-line style tokens
//! - Reading image/label records and pairing them by position
//! - The softmax classifier trained by cluster workers (`SoftmaxModel`)
//! - Writing run artifacts + manifests
//! - Filesystem pre/postcondition checks around a run

pub mod artifacts;
pub mod config;
pub mod dataset;
pub mod error;
pub mod layout;
pub mod model;
pub mod precheck;
pub mod run;
pub mod synthetic;

pub use artifacts::{ArtifactKind, RunManifest, RunMetrics, TrainingArtifact};
pub use config::{DataFormat, InputMode, RunConfig, RunMode};
pub use dataset::{
    open_images, open_labels, pair_records, read_paired, FileRecordSource, MemoryRecordSource,
    PairedRecord, PairedRecords, PairingPolicy, RecordSource, RecordStream, IMAGE_PIXELS,
    NUM_CLASSES,
};
pub use error::{TrainingError, TrainingResult};
pub use layout::{ModelLayout, OutputLayout};
pub use model::{Gradient, SoftmaxModel};
pub use precheck::{clear_path, count_lines, list_dir, ListedEntry};
pub use run::RunId;
pub use synthetic::{synthetic_records, write_csv_dataset};
