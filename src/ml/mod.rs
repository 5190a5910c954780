// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// This layer contains the Burn code that builds, trains and
// runs the networks. Data batching lives in Layer 4 and
// checkpoint files in Layer 6; anything generic over a Burn
// backend is here.
//
// What's in this layer:
//
//   model.rs      : SimpleCnn and ResNet image classifiers
//                   behind the ImageClassifier trait
//
//   scheduler.rs  : step / cosine / plateau learning-rate
//                   schedules, stepped once per epoch
//
//   trainer.rs    : The training loop
//                   Handles forward pass, loss computation,
//                   backward pass, optimiser step, validation,
//                   best-checkpoint saving and early stopping
//
//   inferencer.rs : The inference engine
//                   Loads a checkpoint, preprocesses images,
//                   runs the model, ranks class probabilities
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)
//            He et al. (2016) Deep Residual Learning

/// SimpleCnn / ResNet architectures
pub mod model;

/// Learning-rate schedules
pub mod scheduler;

/// Full training loop with validation and checkpointing
pub mod trainer;

/// Inference engine: loads checkpoint and classifies images
pub mod inferencer;
