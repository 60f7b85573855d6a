//! Deterministic MNIST-shaped data for demos and tests.
//!
//! Digit `d` lights up a horizontal band of rows starting at `2 * d + 4`,
//! so the classes are linearly separable.

use crate::dataset::{PairedRecord, IMAGE_PIXELS, NUM_CLASSES};
use crate::error::TrainingResult;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

const IMAGE_SIDE: usize = 28;
const BAND_ROWS: usize = 3;

#[must_use]
pub fn synthetic_records(count: usize, seed: u64) -> Vec<PairedRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|idx| {
            let digit = idx % NUM_CLASSES;
            let band = 2 * digit + 4;
            let image: Vec<i32> = (0..IMAGE_PIXELS)
                .map(|px| {
                    let row = px / IMAGE_SIDE;
                    if (band..band + BAND_ROWS).contains(&row) {
                        rng.gen_range(200..=255)
                    } else {
                        rng.gen_range(0..=30)
                    }
                })
                .collect();
            let mut label = vec![0.0; NUM_CLASSES];
            label[digit] = 1.0;
            PairedRecord { image, label }
        })
        .collect()
}

/// Write `count` records as CSV under `root/images` and `root/labels`,
/// split across `partitions` part files. Returns the two directories.
pub fn write_csv_dataset(root: &Path, count: usize, seed: u64, partitions: usize) -> TrainingResult<(PathBuf, PathBuf)> {
    let images_dir = root.join("images");
    let labels_dir = root.join("labels");
    std::fs::create_dir_all(&images_dir)?;
    std::fs::create_dir_all(&labels_dir)?;

    let records = synthetic_records(count, seed);
    let partitions = partitions.max(1);
    let per_part = count.div_ceil(partitions).max(1);

    for (part, chunk) in records.chunks(per_part).enumerate() {
        let mut images = String::new();
        let mut labels = String::new();
        for record in chunk {
            let pixels: Vec<String> = record.image.iter().map(ToString::to_string).collect();
            images.push_str(&pixels.join(","));
            images.push('\n');
            let values: Vec<String> = record.label.iter().map(|v| format!("{v:.1}")).collect();
            labels.push_str(&values.join(","));
            labels.push('\n');
        }
        let name = format!("part-{part:05}");
        std::fs::write(images_dir.join(&name), images)?;
        std::fs::write(labels_dir.join(&name), labels)?;
    }

    Ok((images_dir, labels_dir))
}
