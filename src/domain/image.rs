// ============================================================
// Layer 3 — Image Domain Types
// ============================================================
// A decoded image is stored channel-planar (CHW) as raw bytes:
//
//   data = [ R plane (h*w) | G plane (h*w) | B plane (h*w) ]
//
// This is the layout CIFAR-10 ships on disk and the layout the
// model consumes, so loaders never need to transpose. Grayscale
// images simply have one plane.
//
// Reference: Rust Book §5 (Structs)

use serde::{Deserialize, Serialize};

/// A decoded 8-bit image in CHW order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawImage {
    pub channels: usize,
    pub height:   usize,
    pub width:    usize,
    pub data:     Vec<u8>,
}

impl RawImage {
    /// Build an image, checking the buffer matches the dimensions.
    pub fn new(channels: usize, height: usize, width: usize, data: Vec<u8>) -> Option<Self> {
        if data.len() != channels * height * width || channels == 0 {
            return None;
        }
        Some(Self { channels, height, width, data })
    }

    pub fn plane_len(&self) -> usize {
        self.height * self.width
    }

    /// One channel plane, row-major.
    pub fn plane(&self, channel: usize) -> &[u8] {
        let n = self.plane_len();
        &self.data[channel * n..(channel + 1) * n]
    }

    /// Pixel value at (channel, y, x).
    pub fn at(&self, channel: usize, y: usize, x: usize) -> u8 {
        self.data[channel * self.plane_len() + y * self.width + x]
    }
}

/// A training / evaluation sample: image plus class index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledImage {
    pub image: RawImage,
    pub label: usize,
}

impl LabeledImage {
    pub fn new(image: RawImage, label: usize) -> Self {
        Self { image, label }
    }
}

/// Which partition of a dataset to read from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test  => "test",
        }
    }
}
