// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the four subcommands and their flags:
//
//   train    run the training pipeline
//   serve    start the HTTP prediction API
//   predict  classify one image with a checkpoint
//   runs     list / compare / export tracked runs
//
// `train` and `serve` take a config file plus any number of
// `key.path=value` overrides, e.g.
//
//   image-classifier train model=resnet hyperparameters.learning_rate=0.01
//
// Reference: Rust Book §12 (Building a CLI Program)

use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a model with the configured dataset and hyperparameters
    Train(TrainArgs),

    /// Serve a trained checkpoint over HTTP
    Serve(ServeArgs),

    /// Classify a single image
    Predict(PredictArgs),

    /// List and compare MLflow runs
    Runs(RunsArgs),
}

/// Config file and overrides shared by `train` and `serve`.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// TOML config file (default: configs/config.toml if present)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Overrides in key.path=value form; data=<name> and model=<name>
    /// switch the preset
    #[arg(value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Args, Debug)]
pub struct PredictArgs {
    /// Checkpoint stem or file, e.g. models/simple_cnn_best
    #[arg(long)]
    pub checkpoint: PathBuf,

    /// Image file to classify
    #[arg(long)]
    pub image: PathBuf,

    /// Print the prediction as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct RunsArgs {
    /// List experiments and exit
    #[arg(long)]
    pub list: bool,

    /// Experiment name (default: the Default experiment)
    #[arg(long)]
    pub experiment: Option<String>,

    /// Metric to rank runs by, highest first
    #[arg(long, default_value = "val_acc")]
    pub metric: String,

    /// Number of runs to show
    #[arg(long, default_value_t = 10)]
    pub top_n: usize,

    /// Write every run of the experiment to this CSV file
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// MLflow tracking URI (directory or http(s) server)
    #[arg(long, default_value = "./mlruns")]
    pub tracking_uri: String,
}
