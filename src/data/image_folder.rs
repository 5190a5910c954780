// ============================================================
// Layer 4 — Image Folder Loader
// ============================================================
// Generic dataset laid out one directory per class:
//
//   <data_dir>/
//     train/
//       cat/  img001.png  img002.jpg ...
//       dog/  ...
//     test/
//       cat/  ...
//       dog/  ...
//
// Class names are the sorted directory names under train/, so
// label indices are stable across runs. Images are decoded and
// resized once at load time; files that fail to decode are
// skipped with a warning instead of aborting the run.
//
// Reference: image crate documentation
//            Rust Book §12 (I/O and File Handling)

use anyhow::{bail, Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::data::transform::{decode_image, prepare};
use crate::domain::{
    image::{LabeledImage, Split},
    traits::ImageSource,
};

const EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

pub struct ImageFolderSource {
    root:     PathBuf,
    channels: usize,
    size:     usize,
}

impl ImageFolderSource {
    pub fn new(data_dir: impl AsRef<Path>, channels: usize, size: usize) -> Self {
        Self { root: data_dir.as_ref().to_path_buf(), channels, size }
    }

    fn split_dir(&self, split: Split) -> PathBuf {
        self.root.join(split.as_str())
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Cannot read directory '{}'", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();
    Ok(entries)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl ImageSource for ImageFolderSource {
    fn name(&self) -> &str {
        "image_folder"
    }

    fn classes(&self) -> Result<Vec<String>> {
        let train = self.split_dir(Split::Train);
        let classes: Vec<String> = sorted_entries(&train)?
            .into_iter()
            .filter(|p| p.is_dir())
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        if classes.is_empty() {
            bail!("No class directories found under '{}'", train.display());
        }
        Ok(classes)
    }

    fn load(&self, split: Split) -> Result<Vec<LabeledImage>> {
        let classes = self.classes()?;
        let dir     = self.split_dir(split);
        let mut samples = Vec::new();
        let mut skipped = 0usize;

        for class_dir in sorted_entries(&dir)?.into_iter().filter(|p| p.is_dir()) {
            let name = class_dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let Some(label) = classes.iter().position(|c| c == name) else {
                tracing::warn!("Skipping '{}': class not present in train/", class_dir.display());
                continue;
            };

            for file in sorted_entries(&class_dir)?.into_iter().filter(|p| is_image(p)) {
                let decoded = fs::read(&file)
                    .map_err(anyhow::Error::from)
                    .and_then(|bytes| decode_image(&bytes, self.channels))
                    .and_then(|img| prepare(&img, self.channels, self.size));
                match decoded {
                    Ok(image) => samples.push(LabeledImage::new(image, label)),
                    Err(e) => {
                        skipped += 1;
                        tracing::warn!("Skipping unreadable image '{}': {e:#}", file.display());
                    }
                }
            }
        }

        if samples.is_empty() {
            bail!("No images found under '{}'", dir.display());
        }
        tracing::info!(
            "Image folder {}: {} images in {} classes ({} skipped)",
            split.as_str(), samples.len(), classes.len(), skipped
        );
        Ok(samples)
    }
}
