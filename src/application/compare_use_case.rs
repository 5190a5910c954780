// ============================================================
// Layer 2 — Compare Runs Use Case
// ============================================================
// Reads finished runs back out of MLflow (file store or server)
// so experiments can be compared without the MLflow UI:
//
//   list_experiments()        every experiment id + name
//   top_runs(metric, n)       best runs of one experiment
//   export(path)              every run of one experiment as CSV

use anyhow::{bail, Result};
use std::path::Path;

use crate::tracking::compare::{
    export_csv, find_experiment, open_store, rank_runs, ExperimentInfo, RunStore, RunSummary,
};

pub struct CompareUseCase {
    store: Box<dyn RunStore>,
}

impl CompareUseCase {
    pub fn new(tracking_uri: &str) -> Result<Self> {
        Ok(Self { store: open_store(tracking_uri)? })
    }

    pub fn with_store(store: Box<dyn RunStore>) -> Self {
        Self { store }
    }

    pub fn list_experiments(&self) -> Result<Vec<ExperimentInfo>> {
        Ok(self.store.experiments()?)
    }

    fn experiment(&self, name: Option<&str>) -> Result<ExperimentInfo> {
        match find_experiment(self.store.as_ref(), name)? {
            Some(e) => Ok(e),
            None    => bail!("Experiment '{}' not found", name.unwrap_or("Default")),
        }
    }

    /// Best `top_n` runs ordered by `metric`, highest first.
    pub fn top_runs(&self, experiment: Option<&str>, metric: &str, top_n: usize) -> Result<Vec<RunSummary>> {
        let exp  = self.experiment(experiment)?;
        let runs = self.store.runs(&exp.experiment_id)?;
        tracing::debug!("{} runs in experiment '{}'", runs.len(), exp.name);
        Ok(rank_runs(runs, metric, top_n))
    }

    /// Write all runs of an experiment to `path`; returns how many.
    pub fn export(&self, experiment: Option<&str>, path: &Path) -> Result<usize> {
        let exp  = self.experiment(experiment)?;
        let runs = self.store.runs(&exp.experiment_id)?;
        export_csv(&runs, path)?;
        tracing::info!("Exported {} runs of '{}' to '{}'", runs.len(), exp.name, path.display());
        Ok(runs.len())
    }
}
