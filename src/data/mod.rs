// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// This layer handles everything from files on disk all the way
// to tensor batches.
//
//   CIFAR-10 batches / MNIST IDX / class folders
//       │
//       ▼
//   ImageSource       → decodes files into LabeledImage
//       │
//       ▼
//   split_train_val   → seeded train / validation partition
//       │
//       ▼
//   ImageDataset      → implements Burn's Dataset trait
//       │
//       ▼
//   ImageBatcher      → transform + augment, stack into tensors
//       │
//       ▼
//   DataLoader        → feeds batches to the training loop
//
// Reference: Burn Book §4 (Datasets and Dataloaders)

/// CIFAR-10 binary batch reader
pub mod cifar10;

/// MNIST IDX reader
pub mod mnist;

/// One-directory-per-class image reader
pub mod image_folder;

/// Resize, normalise and augment images
pub mod transform;

/// Implements Burn's Dataset trait and assembles the splits
pub mod dataset;

/// Implements Burn's Batcher trait to create tensor batches
pub mod batcher;

/// Seeded train/validation split
pub mod splitter;
