// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Cross-cutting concerns used by training, prediction and
// serving:
//
//   checkpoint.rs  : best-model weights (CompactRecorder) plus a
//                    JSON sidecar with epoch, val_acc, classes
//                    and the config snapshot
//
//   metrics.rs     : AverageMeter, per-epoch metrics, the
//                    history.json curves and metrics.csv
//
//   evaluation.rs  : accuracy / macro precision / recall / F1,
//                    confusion matrix, text report
//
//   plots.rs       : training-history and confusion-matrix PNGs
//
// Reference: Rust Book §7 (Modules)
//            Burn Book §5 (Checkpointing)

/// Model checkpoint saving and loading
pub mod checkpoint;

/// Training metrics and CSV logger
pub mod metrics;

/// Test-set classification metrics
pub mod evaluation;

/// PNG report plots
pub mod plots;
