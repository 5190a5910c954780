// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Train + validation loop using Burn's DataLoader.
//
//   for epoch in 1..=num_epochs:
//     train    forward → cross-entropy (label smoothing) → backward
//              → optimiser step at the scheduler's learning rate
//     validate model.valid() on the inner backend (no autodiff,
//              dropout off, batch-norm uses running stats)
//     report   println line, metrics.csv row, tracker metrics
//     keep     val_acc improved → save {model}_best checkpoint
//              and hand it to the tracker
//     schedule step / cosine advance per epoch, plateau watches
//              val_loss
//     stop     no improvement for early_stopping_patience epochs
//
// After the loop the best checkpoint is reloaded and run over
// the test split to produce (y_true, y_pred) for the reports.
//
// Backend choice (config `device`):
//
//   cpu   Autodiff<NdArray>
//   gpu   Autodiff<Wgpu>   (needs the `wgpu` feature)
//   auto  gpu when compiled in, otherwise cpu
//
// Key Burn insight:
//   - argmax(1) returns [batch, 1] so we flatten before .equal()
//   - the validation loader must produce inner-backend batches
//
// Reference: Burn Book §5, Kingma & Ba (2015) Adam

use anyhow::{anyhow, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, Autodiff, NdArray},
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    grad_clipping::GradientClippingConfig,
    module::AutodiffModule,
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    optim::{
        decay::WeightDecayConfig, momentum::MomentumConfig, AdamConfig, GradientsParams,
        Optimizer, SgdConfig,
    },
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use std::{
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use crate::config::{AppConfig, DeviceKind, ModelName, OptimizerKind};
use crate::data::{
    batcher::{ImageBatch, ImageBatcher},
    dataset::{DataSplits, ImageDataset},
    transform::ImageTransform,
};
use crate::infra::{
    checkpoint::{load_weights, CheckpointManager, CheckpointMeta},
    metrics::{AverageMeter, EpochMetrics, MetricsLogger, TrainingHistory},
};
use crate::ml::{
    model::{resnet_config, simple_cnn_config, ImageClassifier},
    scheduler::LrScheduler,
};
use crate::tracking::ExperimentTracker;

type CpuBackend = Autodiff<NdArray>;
#[cfg(feature = "wgpu")]
type GpuBackend = Autodiff<burn::backend::Wgpu>;

/// Where the collaborators of one training run live.
pub struct TrainContext<'a> {
    pub cfg:         &'a AppConfig,
    pub checkpoints: &'a CheckpointManager,
    pub logger:      &'a MetricsLogger,
    pub tracker:     &'a mut ExperimentTracker,
}

/// What a finished training run hands back to the use case.
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub model_name:      ModelName,
    pub num_params:      usize,
    pub history:         TrainingHistory,
    pub best_val_acc:    f64,
    pub best_epoch:      usize,
    /// Weights file of the best epoch, if any epoch improved
    pub best_checkpoint: Option<PathBuf>,
    pub stopped_early:   bool,
    /// Test-split labels and predictions of the best model
    pub y_true:          Vec<usize>,
    pub y_pred:          Vec<usize>,
}

/// Concrete backend for a device setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedDevice {
    Cpu,
    Gpu,
}

pub fn resolve_device(kind: DeviceKind) -> ResolvedDevice {
    match kind {
        DeviceKind::Cpu => ResolvedDevice::Cpu,
        DeviceKind::Gpu if cfg!(feature = "wgpu") => ResolvedDevice::Gpu,
        DeviceKind::Gpu => {
            tracing::warn!("GPU requested but built without the `wgpu` feature, using CPU");
            ResolvedDevice::Cpu
        }
        DeviceKind::Auto if cfg!(feature = "wgpu") => ResolvedDevice::Gpu,
        DeviceKind::Auto => ResolvedDevice::Cpu,
    }
}

/// Train the configured model on `splits` and evaluate it on the test split.
pub fn run_training(ctx: &mut TrainContext<'_>, splits: DataSplits) -> Result<TrainOutcome> {
    match resolve_device(ctx.cfg.device) {
        ResolvedDevice::Cpu => {
            tracing::info!("Using CPU (ndarray) backend");
            train_on::<CpuBackend>(ctx, splits, NdArrayDevice::default())
        }
        #[cfg(feature = "wgpu")]
        ResolvedDevice::Gpu => {
            let device = burn::backend::wgpu::WgpuDevice::default();
            tracing::info!("Using WGPU device: {:?}", device);
            train_on::<GpuBackend>(ctx, splits, device)
        }
        #[cfg(not(feature = "wgpu"))]
        ResolvedDevice::Gpu => train_on::<CpuBackend>(ctx, splits, NdArrayDevice::default()),
    }
}

fn train_on<B: AutodiffBackend>(
    ctx:    &mut TrainContext<'_>,
    splits: DataSplits,
    device: B::Device,
) -> Result<TrainOutcome> {
    B::seed(ctx.cfg.seed);
    let num_classes = splits.classes.len();

    match ctx.cfg.model.name {
        ModelName::SimpleCnn => {
            let model = simple_cnn_config(ctx.cfg, num_classes).init::<B>(&device);
            with_optimizer(ctx, model, splits, device)
        }
        ModelName::Resnet => {
            let model = resnet_config(ctx.cfg, num_classes).init::<B>(&device);
            with_optimizer(ctx, model, splits, device)
        }
    }
}

fn with_optimizer<B, M>(
    ctx:    &mut TrainContext<'_>,
    model:  M,
    splits: DataSplits,
    device: B::Device,
) -> Result<TrainOutcome>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ImageClassifier<B>,
    M::InnerModule: ImageClassifier<B::InnerBackend>,
{
    let hp       = &ctx.cfg.hyperparameters;
    let decay    = (hp.weight_decay > 0.0).then(|| WeightDecayConfig::new(hp.weight_decay as f32));
    let clipping = hp.clip_grad_norm.map(GradientClippingConfig::Norm);

    match hp.optimizer {
        OptimizerKind::Adam => {
            let optim = AdamConfig::new()
                .with_epsilon(1e-8)
                .with_weight_decay(decay)
                .with_grad_clipping(clipping)
                .init::<B, M>();
            fit(ctx, model, optim, splits, device)
        }
        OptimizerKind::Sgd => {
            let momentum = (hp.momentum > 0.0)
                .then(|| MomentumConfig::new().with_momentum(hp.momentum).with_dampening(0.0));
            let optim = SgdConfig::new()
                .with_weight_decay(decay)
                .with_momentum(momentum)
                .with_gradient_clipping(clipping)
                .init::<B, M>();
            fit(ctx, model, optim, splits, device)
        }
    }
}

// ─── Epoch helpers ────────────────────────────────────────────────────────────

/// (mean loss, accuracy) of `model` over every batch of `loader`.
fn evaluate<B: Backend, M: ImageClassifier<B>>(
    model:  &M,
    loader: &Arc<dyn DataLoader<ImageBatch<B>>>,
    ce:     &CrossEntropyLoss<B>,
) -> (f64, f64) {
    let mut loss = AverageMeter::new();
    let mut acc  = AverageMeter::new();

    for batch in loader.iter() {
        let n      = batch.targets.dims()[0];
        let logits = model.forward(batch.images);
        let batch_loss = ce.forward(logits.clone(), batch.targets.clone());
        loss.update(batch_loss.into_scalar().elem::<f64>(), n);
        acc.update(correct(logits, batch.targets) as f64 / n.max(1) as f64, n);
    }
    (loss.avg, acc.avg)
}

fn correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> i64 {
    logits
        .argmax(1)
        .flatten::<1>(0, 1)
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>()
}

fn int_vec<B: Backend>(t: Tensor<B, 1, Int>) -> Result<Vec<usize>> {
    t.into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map(|v| v.into_iter().map(|x| x.max(0) as usize).collect())
        .map_err(|e| anyhow!("Cannot read tensor data: {e:?}"))
}

/// Labels and predicted classes over a whole loader.
pub fn predict_labels<B: Backend, M: ImageClassifier<B>>(
    model:  &M,
    loader: &Arc<dyn DataLoader<ImageBatch<B>>>,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let mut y_true = Vec::new();
    let mut y_pred = Vec::new();
    for batch in loader.iter() {
        let pred = model.forward(batch.images).argmax(1).flatten::<1>(0, 1);
        y_true.extend(int_vec(batch.targets)?);
        y_pred.extend(int_vec(pred)?);
    }
    Ok((y_true, y_pred))
}

fn eval_loader<B: Backend>(
    cfg:       &AppConfig,
    transform: &ImageTransform,
    device:    &B::Device,
    dataset:   ImageDataset,
) -> Arc<dyn DataLoader<ImageBatch<B>>> {
    DataLoaderBuilder::new(ImageBatcher::<B>::new(device.clone(), transform.clone(), cfg.seed))
        .batch_size(cfg.hyperparameters.batch_size)
        .num_workers(cfg.num_workers.max(1))
        .build(dataset)
}

// ─── Fit ──────────────────────────────────────────────────────────────────────

fn fit<B, M, O>(
    ctx:       &mut TrainContext<'_>,
    mut model: M,
    mut optim: O,
    splits:    DataSplits,
    device:    B::Device,
) -> Result<TrainOutcome>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ImageClassifier<B>,
    M::InnerModule: ImageClassifier<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    let cfg        = ctx.cfg;
    let hp         = &cfg.hyperparameters;
    let model_name = cfg.model.name;
    let num_params = model.num_params();
    let classes    = splits.classes.clone();
    let has_val    = splits.val.len() > 0;

    if !has_val {
        tracing::warn!(
            "Validation split is empty: every epoch is kept as the best model and early stopping is off"
        );
    }

    tracing::info!(
        "Model {} ready: {} trainable parameters, {} classes",
        model_name.as_str(), num_params, classes.len()
    );

    // ── Data loaders ──────────────────────────────────────────────────────────
    let train_tf = ImageTransform::for_training(&cfg.data);
    let eval_tf  = ImageTransform::for_eval(&cfg.data);

    let train_loader = DataLoaderBuilder::new(ImageBatcher::<B>::new(device.clone(), train_tf, cfg.seed))
        .batch_size(hp.batch_size)
        .shuffle(cfg.seed)
        .num_workers(cfg.num_workers.max(1))
        .build(splits.train);

    let val_loader  = eval_loader::<B::InnerBackend>(cfg, &eval_tf, &device, splits.val);
    let test_loader = eval_loader::<B::InnerBackend>(cfg, &eval_tf, &device, splits.test);

    // ── Loss, schedule, bookkeeping ───────────────────────────────────────────
    let smoothing = (hp.label_smoothing > 0.0).then_some(hp.label_smoothing);
    let train_ce  = CrossEntropyLossConfig::new().with_smoothing(smoothing).init::<B>(&device);
    let val_ce    = CrossEntropyLossConfig::new().with_smoothing(smoothing).init::<B::InnerBackend>(&device);

    let mut scheduler     = LrScheduler::from_hyperparameters(hp);
    let mut history       = TrainingHistory::default();
    let mut best_val_acc  = 0.0f64;
    let mut best_epoch    = 0usize;
    let mut best_ckpt     = None::<PathBuf>;
    let mut stale_epochs  = 0usize;
    let mut stopped_early = false;
    let best_stem         = ctx.checkpoints.best_stem(model_name);

    // ── Epoch loop ────────────────────────────────────────────────────────────
    for epoch in 1..=hp.num_epochs {
        let started = Instant::now();
        let lr      = scheduler.lr();

        // ── Training phase ────────────────────────────────────────────────────
        let mut train_loss = AverageMeter::new();
        let mut train_acc  = AverageMeter::new();

        for (i, batch) in train_loader.iter().enumerate() {
            let n      = batch.targets.dims()[0];
            let logits = model.forward(batch.images);
            let loss   = train_ce.forward(logits.clone(), batch.targets.clone());

            train_loss.update(loss.clone().into_scalar().elem::<f64>(), n);
            train_acc.update(correct(logits, batch.targets) as f64 / n.max(1) as f64, n);

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(lr, model, grads);

            if (i + 1) % 50 == 0 {
                tracing::debug!("epoch {} batch {}: loss={:.4} acc={:.4}", epoch, i + 1, train_loss.avg, train_acc.avg);
            }
        }

        // ── Validation phase ──────────────────────────────────────────────────
        let (val_loss, val_acc) = evaluate(&model.valid(), &val_loader, &val_ce);

        let metrics = EpochMetrics {
            epoch,
            train_loss: train_loss.avg,
            train_acc:  train_acc.avg,
            val_loss,
            val_acc,
            learning_rate: lr,
        };

        println!(
            "Epoch {:>3}/{} | train_loss={:.4} | train_acc={:.2}% | val_loss={:.4} | val_acc={:.2}% | lr={:.2e} | {:.1}s",
            epoch, hp.num_epochs, metrics.train_loss, metrics.train_acc * 100.0,
            metrics.val_loss, metrics.val_acc * 100.0, lr, started.elapsed().as_secs_f64(),
        );

        history.push(&metrics);
        ctx.logger.log(&metrics)?;
        ctx.tracker.log_metrics(&metrics.as_pairs(), Some(epoch as u64));

        // ── Checkpointing ─────────────────────────────────────────────────────
        let meta = CheckpointMeta {
            model_name,
            epoch,
            val_acc,
            classes: classes.clone(),
            config:  cfg.clone(),
        };

        // without validation data the latest epoch is the best one
        if !has_val || metrics.is_improvement(best_val_acc) {
            best_val_acc = val_acc;
            best_epoch   = epoch;
            stale_epochs = 0;
            let saved    = ctx.checkpoints.save::<B, M>(&model, &best_stem, &meta)?;
            tracing::info!("New best model (val_acc={:.4}) saved at epoch {}", val_acc, epoch);
            ctx.tracker.log_model(&saved);
            best_ckpt = Some(saved);
        } else {
            stale_epochs += 1;
        }

        if !cfg.save_best_only {
            let stem = ctx.checkpoints.dir().join(format!("{}_epoch_{}", model_name.as_str(), epoch));
            ctx.checkpoints.save::<B, M>(&model, &stem, &meta)?;
        }

        scheduler.step(val_loss);

        if has_val && cfg.early_stopping_patience > 0 && stale_epochs >= cfg.early_stopping_patience {
            tracing::info!(
                "Early stopping at epoch {}: no improvement for {} epochs",
                epoch, stale_epochs
            );
            stopped_early = true;
            break;
        }
    }

    tracing::info!("Training complete! Best val_acc={:.4} at epoch {}", best_val_acc, best_epoch);

    // ── Test evaluation with the best weights ─────────────────────────────────
    let final_model = model.valid();
    let eval_model  = match &best_ckpt {
        Some(path) => load_weights::<B::InnerBackend, M::InnerModule>(final_model, path, &device)?,
        None => {
            tracing::warn!("No checkpoint was saved, evaluating the last epoch's weights");
            final_model
        }
    };
    let (y_true, y_pred) = predict_labels(&eval_model, &test_loader)?;

    Ok(TrainOutcome {
        model_name,
        num_params,
        history,
        best_val_acc,
        best_epoch,
        best_checkpoint: best_ckpt,
        stopped_early,
        y_true,
        y_pred,
    })
}
