// ============================================================
// Layer 4 — MNIST Loader
// ============================================================
// Reads the original IDX files (uncompressed):
//
//   train-images-idx3-ubyte   magic 2051, n, rows, cols, pixels...
//   train-labels-idx1-ubyte   magic 2049, n, labels...
//   t10k-images-idx3-ubyte
//   t10k-labels-idx1-ubyte
//
// All header integers are big-endian u32. Files are looked up in
// <data_dir>/MNIST/raw first (the layout most download tools
// produce) and then directly in <data_dir>.
//
// Reference: http://yann.lecun.com/exdb/mnist/

use anyhow::{bail, Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::domain::{
    image::{LabeledImage, RawImage, Split},
    traits::ImageSource,
};

const IMAGES_MAGIC: u32 = 2051;
const LABELS_MAGIC: u32 = 2049;

pub struct MnistSource {
    data_dir: PathBuf,
}

impl MnistSource {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self { data_dir: data_dir.as_ref().to_path_buf() }
    }

    fn find(&self, file: &str) -> Result<PathBuf> {
        [self.data_dir.join("MNIST").join("raw"), self.data_dir.clone()]
            .into_iter()
            .map(|dir| dir.join(file))
            .find(|p| p.is_file())
            .with_context(|| {
                format!("Cannot find MNIST file '{}' under '{}'", file, self.data_dir.display())
            })
    }
}

impl ImageSource for MnistSource {
    fn name(&self) -> &str {
        "mnist"
    }

    fn classes(&self) -> Result<Vec<String>> {
        Ok((0..10).map(|d| d.to_string()).collect())
    }

    fn load(&self, split: Split) -> Result<Vec<LabeledImage>> {
        let prefix = match split {
            Split::Train => "train",
            Split::Test  => "t10k",
        };

        let images_path = self.find(&format!("{prefix}-images-idx3-ubyte"))?;
        let labels_path = self.find(&format!("{prefix}-labels-idx1-ubyte"))?;

        let images = parse_images(&fs::read(&images_path)?)
            .with_context(|| format!("Corrupt IDX file '{}'", images_path.display()))?;
        let labels = parse_labels(&fs::read(&labels_path)?)
            .with_context(|| format!("Corrupt IDX file '{}'", labels_path.display()))?;

        if images.len() != labels.len() {
            bail!("MNIST {prefix}: {} images but {} labels", images.len(), labels.len());
        }

        let samples: Vec<LabeledImage> = images
            .into_iter()
            .zip(labels)
            .map(|(img, label)| LabeledImage::new(img, label as usize))
            .collect();
        tracing::info!("MNIST {}: {} images", split.as_str(), samples.len());
        Ok(samples)
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let slice: [u8; 4] = bytes
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .context("Unexpected end of IDX header")?;
    Ok(u32::from_be_bytes(slice))
}

/// Parse an idx3 image file into grayscale images.
pub fn parse_images(bytes: &[u8]) -> Result<Vec<RawImage>> {
    let magic = read_u32(bytes, 0)?;
    if magic != IMAGES_MAGIC {
        bail!("Bad magic number {magic}, expected {IMAGES_MAGIC}");
    }
    let count = read_u32(bytes, 4)? as usize;
    let rows  = read_u32(bytes, 8)? as usize;
    let cols  = read_u32(bytes, 12)? as usize;

    let pixels = &bytes[16..];
    let size   = rows * cols;
    if size == 0 || pixels.len() != count * size {
        bail!("Expected {} pixel bytes, found {}", count * size, pixels.len());
    }

    pixels
        .chunks_exact(size)
        .map(|chunk| {
            RawImage::new(1, rows, cols, chunk.to_vec()).context("Inconsistent image size")
        })
        .collect()
}

/// Parse an idx1 label file.
pub fn parse_labels(bytes: &[u8]) -> Result<Vec<u8>> {
    let magic = read_u32(bytes, 0)?;
    if magic != LABELS_MAGIC {
        bail!("Bad magic number {magic}, expected {LABELS_MAGIC}");
    }
    let count  = read_u32(bytes, 4)? as usize;
    let labels = &bytes[8..];
    if labels.len() != count {
        bail!("Expected {count} labels, found {}", labels.len());
    }
    if let Some(bad) = labels.iter().find(|&&l| l > 9) {
        bail!("Label {bad} outside 0..10");
    }
    Ok(labels.to_vec())
}
