use crate::config::DataFormat;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use walkdir::WalkDir;

/// Pixels in one 28x28 MNIST image.
pub const IMAGE_PIXELS: usize = 784;

/// Digit classes.
pub const NUM_CLASSES: usize = 10;

const IDX_IMAGES_MAGIC: u32 = 2051;
const IDX_LABELS_MAGIC: u32 = 2049;
/// Largest image record accepted from an IDX header (4096 x 4096 pixels).
const MAX_IDX_RECORD_LEN: usize = 1 << 24;

pub type ImageRecord = Vec<i32>;
pub type LabelRecord = Vec<f32>;

/// Lazy, fallible sequence of records.
pub type RecordStream<T> = Box<dyn Iterator<Item = TrainingResult<T>> + Send>;

/// One image joined with the label at the same position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairedRecord {
    pub image: ImageRecord,
    pub label: LabelRecord,
}

impl PairedRecord {
    /// Index of the largest label value (the digit for one-hot labels).
    #[must_use]
    pub fn label_class(&self) -> Option<usize> {
        self.label
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(idx, _)| idx)
    }
}

/// What to do when the image and label sources differ in length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingPolicy {
    /// Fail with `LengthMismatch` carrying both totals.
    #[default]
    Strict,
    /// Stop at the shorter source.
    Truncate,
}

/// Something that can (re)open a paired record stream, once per epoch.
pub trait RecordSource: Send + Sync {
    fn open(&self) -> TrainingResult<RecordStream<PairedRecord>>;
}

/// Images and labels read from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecordSource {
    pub images: PathBuf,
    pub labels: PathBuf,
    pub format: DataFormat,
    pub policy: PairingPolicy,
}

impl RecordSource for FileRecordSource {
    fn open(&self) -> TrainingResult<RecordStream<PairedRecord>> {
        Ok(Box::new(read_paired(&self.images, &self.labels, self.format, self.policy)?))
    }
}

/// Records already in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordSource {
    records: Arc<Vec<PairedRecord>>,
}

impl MemoryRecordSource {
    #[must_use]
    pub fn new(records: Vec<PairedRecord>) -> Self {
        Self { records: Arc::new(records) }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordSource for MemoryRecordSource {
    fn open(&self) -> TrainingResult<RecordStream<PairedRecord>> {
        let records = Arc::clone(&self.records);
        Ok(Box::new((0..records.len()).map(move |idx| Ok(records[idx].clone()))))
    }
}

/// Partition files under `path`, in name order.
///
/// A plain file is its own single partition. Names starting with `.` or `_`
/// (`_SUCCESS`, editor droppings) are skipped.
pub fn partition_files(path: &Path) -> TrainingResult<Vec<PathBuf>> {
    let files = partition_entries(path)?;
    if files.is_empty() {
        return Err(TrainingError::Dataset(format!("no partition files under {}", path.display())));
    }
    Ok(files)
}

/// Like `partition_files`, but a directory without partitions is empty rather
/// than an error.
pub(crate) fn partition_entries(path: &Path) -> TrainingResult<Vec<PathBuf>> {
    if !path.exists() {
        return Err(TrainingError::Dataset(format!("input path does not exist: {}", path.display())));
    }
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| TrainingError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') || name.starts_with('_') {
            continue;
        }
        files.push(entry.into_path());
    }
    Ok(files)
}

pub fn open_images(path: &Path, format: DataFormat) -> TrainingResult<RecordStream<ImageRecord>> {
    let open: fn(&Path) -> TrainingResult<RecordStream<ImageRecord>> = match format {
        DataFormat::Csv => csv_images,
        DataFormat::Json => json_images,
        DataFormat::Idx => IdxImages::open,
    };
    Ok(Box::new(FileChain::new(partition_files(path)?, open)))
}

pub fn open_labels(path: &Path, format: DataFormat) -> TrainingResult<RecordStream<LabelRecord>> {
    let open: fn(&Path) -> TrainingResult<RecordStream<LabelRecord>> = match format {
        DataFormat::Csv => csv_labels,
        DataFormat::Json => json_labels,
        DataFormat::Idx => IdxLabels::open,
    };
    Ok(Box::new(FileChain::new(partition_files(path)?, open)))
}

pub fn read_paired(
    images: &Path,
    labels: &Path,
    format: DataFormat,
    policy: PairingPolicy,
) -> TrainingResult<PairedRecords> {
    Ok(pair_records(open_images(images, format)?, open_labels(labels, format)?, policy))
}

#[must_use]
pub fn pair_records(
    images: RecordStream<ImageRecord>,
    labels: RecordStream<LabelRecord>,
    policy: PairingPolicy,
) -> PairedRecords {
    PairedRecords { images, labels, policy, paired: 0, done: false }
}

/// Zips image and label streams by position.
pub struct PairedRecords {
    images: RecordStream<ImageRecord>,
    labels: RecordStream<LabelRecord>,
    policy: PairingPolicy,
    paired: usize,
    done: bool,
}

impl PairedRecords {
    /// Number of pairs yielded so far.
    #[must_use]
    pub fn paired(&self) -> usize {
        self.paired
    }

    fn mismatch(&mut self, extra_images: usize, extra_labels: usize) -> Option<TrainingResult<PairedRecord>> {
        self.done = true;
        match self.policy {
            PairingPolicy::Truncate => {
                warn!(paired = self.paired, "image and label sources differ in length; truncating to the shorter");
                None
            }
            PairingPolicy::Strict => {
                let images = self.paired + extra_images + self.images.by_ref().count();
                let labels = self.paired + extra_labels + self.labels.by_ref().count();
                Some(Err(TrainingError::LengthMismatch { images, labels }))
            }
        }
    }
}

impl Iterator for PairedRecords {
    type Item = TrainingResult<PairedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match (self.images.next(), self.labels.next()) {
            (Some(Ok(image)), Some(Ok(label))) => {
                self.paired += 1;
                Some(Ok(PairedRecord { image, label }))
            }
            (Some(Err(e)), _) | (_, Some(Err(e))) => {
                self.done = true;
                Some(Err(e))
            }
            (None, None) => {
                self.done = true;
                None
            }
            (Some(Ok(_)), None) => self.mismatch(1, 0),
            (None, Some(Ok(_))) => self.mismatch(0, 1),
        }
    }
}

/// Concatenates per-file record streams, opening each file lazily.
struct FileChain<T> {
    files: std::vec::IntoIter<PathBuf>,
    current: Option<RecordStream<T>>,
    open: fn(&Path) -> TrainingResult<RecordStream<T>>,
}

impl<T> FileChain<T> {
    fn new(files: Vec<PathBuf>, open: fn(&Path) -> TrainingResult<RecordStream<T>>) -> Self {
        Self { files: files.into_iter(), current: None, open }
    }
}

impl<T> Iterator for FileChain<T> {
    type Item = TrainingResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(stream) = self.current.as_mut() {
                match stream.next() {
                    Some(item) => return Some(item),
                    None => self.current = None,
                }
            }
            let path = self.files.next()?;
            match (self.open)(&path) {
                Ok(stream) => self.current = Some(stream),
                Err(e) => {
                    self.files = Vec::new().into_iter();
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Newline-delimited records, one per non-blank line.
struct LineRecords<T> {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line: usize,
    parse: fn(&str) -> Result<T, String>,
}

impl<T: Send + 'static> LineRecords<T> {
    fn open(path: &Path, parse: fn(&str) -> Result<T, String>) -> TrainingResult<RecordStream<T>> {
        let file = File::open(path)?;
        Ok(Box::new(Self { path: path.to_path_buf(), lines: BufReader::new(file).lines(), line: 0, parse }))
    }
}

impl<T> Iterator for LineRecords<T> {
    type Item = TrainingResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let line_no = self.line;
            return Some((self.parse)(trimmed).map_err(|reason| TrainingError::Parse {
                path: self.path.clone(),
                line: line_no,
                reason,
            }));
        }
    }
}

fn csv_images(path: &Path) -> TrainingResult<RecordStream<ImageRecord>> {
    LineRecords::open(path, parse_csv::<i32>)
}

fn csv_labels(path: &Path) -> TrainingResult<RecordStream<LabelRecord>> {
    LineRecords::open(path, parse_csv::<f32>)
}

fn json_images(path: &Path) -> TrainingResult<RecordStream<ImageRecord>> {
    LineRecords::open(path, parse_json::<i32>)
}

fn json_labels(path: &Path) -> TrainingResult<RecordStream<LabelRecord>> {
    LineRecords::open(path, parse_json::<f32>)
}

fn parse_csv<T>(line: &str) -> Result<Vec<T>, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    line.split(',')
        .map(|field| {
            let field = field.trim();
            field.parse::<T>().map_err(|e| format!("invalid field {field:?}: {e}"))
        })
        .collect()
}

fn parse_json<T: serde::de::DeserializeOwned>(line: &str) -> Result<Vec<T>, String> {
    serde_json::from_str(line).map_err(|e| e.to_string())
}

fn read_idx_header(reader: &mut impl Read, path: &Path, magic: u32, dims: usize) -> TrainingResult<Vec<u32>> {
    let mut word = [0u8; 4];
    reader.read_exact(&mut word)?;
    let found = u32::from_be_bytes(word);
    if found != magic {
        return Err(TrainingError::Parse {
            path: path.to_path_buf(),
            line: 0,
            reason: format!("bad IDX magic number {found}, expected {magic}"),
        });
    }
    let mut sizes = Vec::with_capacity(dims);
    for _ in 0..dims {
        reader.read_exact(&mut word)?;
        sizes.push(u32::from_be_bytes(word));
    }
    Ok(sizes)
}

/// IDX3 image file: magic, count, rows, cols, then `count * rows * cols` bytes.
struct IdxImages {
    path: PathBuf,
    reader: BufReader<File>,
    remaining: u32,
    record_len: usize,
    index: usize,
}

impl IdxImages {
    fn open(path: &Path) -> TrainingResult<RecordStream<ImageRecord>> {
        let mut reader = BufReader::new(File::open(path)?);
        let header = read_idx_header(&mut reader, path, IDX_IMAGES_MAGIC, 3)?;
        let (rows, cols) = (header[1] as usize, header[2] as usize);
        let record_len = rows
            .checked_mul(cols)
            .filter(|len| (1..=MAX_IDX_RECORD_LEN).contains(len))
            .ok_or_else(|| TrainingError::Parse {
                path: path.to_path_buf(),
                line: 0,
                reason: format!("unsupported IDX image size {rows}x{cols}"),
            })?;
        Ok(Box::new(Self { path: path.to_path_buf(), reader, remaining: header[0], record_len, index: 0 }))
    }
}

impl Iterator for IdxImages {
    type Item = TrainingResult<ImageRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.index += 1;
        let mut buf = vec![0u8; self.record_len];
        if let Err(e) = self.reader.read_exact(&mut buf) {
            self.remaining = 0;
            return Some(Err(TrainingError::Parse {
                path: self.path.clone(),
                line: self.index,
                reason: format!("truncated image record: {e}"),
            }));
        }
        Some(Ok(buf.into_iter().map(i32::from).collect()))
    }
}

/// IDX1 label file: magic, count, then one digit byte per record.
struct IdxLabels {
    path: PathBuf,
    reader: BufReader<File>,
    remaining: u32,
    index: usize,
}

impl IdxLabels {
    fn open(path: &Path) -> TrainingResult<RecordStream<LabelRecord>> {
        let mut reader = BufReader::new(File::open(path)?);
        let header = read_idx_header(&mut reader, path, IDX_LABELS_MAGIC, 1)?;
        Ok(Box::new(Self { path: path.to_path_buf(), reader, remaining: header[0], index: 0 }))
    }
}

impl Iterator for IdxLabels {
    type Item = TrainingResult<LabelRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.index += 1;
        let mut byte = [0u8; 1];
        if let Err(e) = self.reader.read_exact(&mut byte) {
            self.remaining = 0;
            return Some(Err(TrainingError::Parse {
                path: self.path.clone(),
                line: self.index,
                reason: format!("truncated label record: {e}"),
            }));
        }
        let digit = usize::from(byte[0]);
        if digit >= NUM_CLASSES {
            return Some(Err(TrainingError::Parse {
                path: self.path.clone(),
                line: self.index,
                reason: format!("label {digit} is not a digit"),
            }));
        }
        let mut one_hot = vec![0.0; NUM_CLASSES];
        one_hot[digit] = 1.0;
        Some(Ok(one_hot))
    }
}
