// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// This is the entry point for all user interaction.
// It uses the `clap` crate to parse command line arguments.
// All business logic is delegated to Layer 2 (application)
// and, for `serve`, to Layer 8.
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use commands::{Commands, ConfigArgs, PredictArgs, RunsArgs};

use crate::config::AppConfig;

#[derive(Parser, Debug)]
#[command(
    name = "image-classifier",
    version,
    about = "Train, track and serve CNN image classifiers."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Dispatch to the matching use case.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args)   => run_train(&args.config),
            Commands::Serve(args)   => run_serve(&args.config),
            Commands::Predict(args) => run_predict(&args),
            Commands::Runs(args)    => run_runs(&args),
        }
    }
}

fn load_config(args: &ConfigArgs) -> Result<AppConfig> {
    AppConfig::load(args.config.as_deref(), &args.overrides)
}

fn run_train(args: &ConfigArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    let cfg = load_config(args)?;
    tracing::info!(
        "Training {} on {} for {} epochs",
        cfg.model.name.as_str(), cfg.data.name.as_str(), cfg.hyperparameters.num_epochs
    );
    tracing::debug!("Config:\n{}", cfg.to_json()?);

    let report = TrainUseCase::new(cfg).execute()?;

    println!("\nTraining complete.");
    println!("  Best val acc:  {:.4} (epoch {})", report.best_val_acc, report.best_epoch);
    println!("  Test accuracy: {:.4}", report.test.accuracy);
    println!("  Test F1:       {:.4}", report.test.f1);
    if let Some(ckpt) = &report.best_checkpoint {
        println!("  Checkpoint:    {}", ckpt.display());
    }
    println!("  Reports:       {}", report.report_dir.display());
    Ok(())
}

fn run_serve(args: &ConfigArgs) -> Result<()> {
    let cfg = load_config(args)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Cannot start the async runtime")?;
    runtime.block_on(crate::serve::run(cfg))
}

fn run_predict(args: &PredictArgs) -> Result<()> {
    use crate::application::predict_use_case::{format_prediction, PredictUseCase};

    let use_case   = PredictUseCase::new(&args.checkpoint)?;
    let prediction = use_case.predict_file(&args.image)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&prediction)?);
    } else {
        println!("{}", format_prediction(&prediction));
    }
    Ok(())
}

fn run_runs(args: &RunsArgs) -> Result<()> {
    use crate::application::compare_use_case::CompareUseCase;
    use crate::tracking::compare::format_table;

    let use_case = CompareUseCase::new(&args.tracking_uri)?;

    if args.list {
        let experiments = use_case.list_experiments()?;
        if experiments.is_empty() {
            println!("No experiments found in '{}'", args.tracking_uri);
        }
        for e in experiments {
            println!("{:>4}  {}", e.experiment_id, e.name);
        }
        return Ok(());
    }

    if let Some(path) = &args.export {
        let n = use_case.export(args.experiment.as_deref(), path)?;
        println!("Exported {} runs to {}", n, path.display());
        return Ok(());
    }

    let runs = use_case.top_runs(args.experiment.as_deref(), &args.metric, args.top_n)?;
    if runs.is_empty() {
        println!("No runs found");
    } else {
        println!("Top {} runs by {}:\n", runs.len(), args.metric);
        print!("{}", format_table(&runs));
    }
    Ok(())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_train_accepts_overrides() {
        let cli = Cli::try_parse_from([
            "image-classifier", "train", "--config", "c.toml", "model=resnet", "hyperparameters.batch_size=16",
        ])
        .unwrap();
        match cli.command {
            Commands::Train(a) => {
                assert_eq!(a.config.config.as_deref(), Some(std::path::Path::new("c.toml")));
                assert_eq!(a.config.overrides, vec!["model=resnet", "hyperparameters.batch_size=16"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_runs_defaults() {
        let cli = Cli::try_parse_from(["image-classifier", "runs"]).unwrap();
        match cli.command {
            Commands::Runs(a) => {
                assert_eq!(a.metric, "val_acc");
                assert_eq!(a.top_n, 10);
                assert_eq!(a.tracking_uri, "./mlruns");
                assert!(!a.list);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_predict_requires_image() {
        assert!(Cli::try_parse_from(["image-classifier", "predict", "--checkpoint", "m"]).is_err());
    }
}
