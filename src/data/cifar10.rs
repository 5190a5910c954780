// ============================================================
// Layer 4 — CIFAR-10 Loader
// ============================================================
// Reads the "binary version" of CIFAR-10:
//
//   cifar-10-batches-bin/
//     data_batch_1.bin ... data_batch_5.bin   ← 50 000 train images
//     test_batch.bin                          ← 10 000 test images
//
// Each file is a flat sequence of 3073-byte records:
//
//   [label: 1 byte][red: 1024][green: 1024][blue: 1024]
//
// The colour planes are already 32x32 row-major, which is
// exactly the CHW layout RawImage uses.
//
// Reference: https://www.cs.toronto.edu/~kriz/cifar.html

use anyhow::{bail, Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::config::CIFAR10_CLASSES;
use crate::domain::{
    image::{LabeledImage, RawImage, Split},
    traits::ImageSource,
};

const SIDE:        usize = 32;
const IMAGE_BYTES: usize = 3 * SIDE * SIDE;
const RECORD_LEN:  usize = 1 + IMAGE_BYTES;
const BATCH_DIR:   &str  = "cifar-10-batches-bin";

pub struct Cifar10Source {
    root: PathBuf,
}

impl Cifar10Source {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        // Accept either the parent directory or the batch directory itself
        let nested = data_dir.join(BATCH_DIR);
        let root   = if nested.is_dir() { nested } else { data_dir.to_path_buf() };
        Self { root }
    }

    fn files(split: Split) -> Vec<String> {
        match split {
            Split::Train => (1..=5).map(|i| format!("data_batch_{i}.bin")).collect(),
            Split::Test  => vec!["test_batch.bin".to_string()],
        }
    }
}

impl ImageSource for Cifar10Source {
    fn name(&self) -> &str {
        "cifar10"
    }

    fn classes(&self) -> Result<Vec<String>> {
        Ok(CIFAR10_CLASSES.iter().map(|c| c.to_string()).collect())
    }

    fn load(&self, split: Split) -> Result<Vec<LabeledImage>> {
        let mut samples = Vec::new();
        for file in Self::files(split) {
            let path  = self.root.join(&file);
            let bytes = fs::read(&path).with_context(|| {
                format!(
                    "Cannot read CIFAR-10 file '{}'. Place the binary batches under '{}'",
                    path.display(),
                    self.root.display()
                )
            })?;
            let batch = parse_batch(&bytes).with_context(|| format!("Corrupt batch '{file}'"))?;
            tracing::debug!("Loaded {} images from {}", batch.len(), file);
            samples.extend(batch);
        }
        tracing::info!("CIFAR-10 {}: {} images", split.as_str(), samples.len());
        Ok(samples)
    }
}

/// Parse one binary batch file into labelled images.
pub fn parse_batch(bytes: &[u8]) -> Result<Vec<LabeledImage>> {
    if bytes.len() % RECORD_LEN != 0 {
        bail!(
            "Length {} is not a multiple of the {}-byte record size",
            bytes.len(),
            RECORD_LEN
        );
    }

    bytes
        .chunks_exact(RECORD_LEN)
        .enumerate()
        .map(|(i, record)| {
            let label = record[0] as usize;
            if label >= CIFAR10_CLASSES.len() {
                bail!("Record {i} has label {label}, expected 0..10");
            }
            let image = RawImage::new(3, SIDE, SIDE, record[1..].to_vec())
                .context("Record has the wrong pixel count")?;
            Ok(LabeledImage::new(image, label))
        })
        .collect()
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn record(label: u8, fill: u8) -> Vec<u8> {
        let mut r = vec![label];
        r.extend(std::iter::repeat(fill).take(IMAGE_BYTES));
        r
    }

    #[test]
    fn test_parse_two_records() {
        let mut bytes = record(3, 10);
        bytes.extend(record(9, 200));
        let samples = parse_batch(&bytes).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].label, 3);
        assert_eq!(samples[1].label, 9);
        assert_eq!(samples[1].image.at(2, 31, 31), 200);
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let bytes = record(1, 0);
        assert!(parse_batch(&bytes[..100]).is_err());
    }

    #[test]
    fn test_bad_label_is_rejected() {
        assert!(parse_batch(&record(10, 0)).is_err());
    }

    #[test]
    fn test_load_from_nested_dir() {
        let tmp  = tempfile::tempdir().unwrap();
        let dir  = tmp.path().join(BATCH_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("test_batch.bin"), record(4, 1)).unwrap();

        let source = Cifar10Source::new(tmp.path());
        let test   = source.load(Split::Test).unwrap();
        assert_eq!(test.len(), 1);
        assert_eq!(test[0].label, 4);
        // train batches are missing → error, not an empty set
        assert!(source.load(Split::Train).is_err());
    }
}
