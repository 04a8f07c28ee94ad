use std::{
    collections::BTreeMap,
    path::Path,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::info;

use plane::{
    checkpoint::write_atomic,
    ml::{linear::Linear, model::Observation, NodeValue},
};

pub const MAIN: &str = "main/";
pub const VALIDATION: &str = "validation/main/";
pub const LOSS_KEYS: [&str; 3] = ["loss", "mse_loss", "bce_loss"];

/// Running mean of named scalars.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    totals: BTreeMap<String, (NodeValue, usize)>,
}

impl Summary {
    /// Non-finite values are dropped so every summary stays serializable.
    pub fn add(&mut self, prefix: &str, observation: &Observation) {
        for (key, value) in observation.iter().filter(|(_, x)| x.is_finite()) {
            let entry = self.totals.entry(format!("{prefix}{key}")).or_default();
            entry.0 += value;
            entry.1 += 1;
        }
    }

    pub fn compute_mean(&self) -> BTreeMap<String, NodeValue> {
        self.totals
            .iter()
            .map(|(key, (sum, count))| (key.clone(), sum / *count as NodeValue))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    pub fn clear(&mut self) {
        self.totals.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub epoch: usize,
    pub iteration: usize,
    pub elapsed_time: f64,
    #[serde(flatten)]
    pub values: BTreeMap<String, NodeValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub values: BTreeMap<String, NodeValue>,
}

/// Collects observations between reports and keeps the run's log and per-epoch history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reporter {
    interval: Summary,
    epoch: Summary,
    validation: BTreeMap<String, NodeValue>,
    log: Vec<LogEntry>,
    history: Vec<EpochRecord>,
}

impl Reporter {
    pub fn observe(&mut self, observation: &Observation) {
        self.interval.add(MAIN, observation);
        self.epoch.add(MAIN, observation);
    }

    pub fn observe_validation(&mut self, means: BTreeMap<String, NodeValue>) {
        self.validation = means.into_iter().filter(|(_, x)| x.is_finite()).collect();
    }

    pub fn validation_loss(&self) -> Option<NodeValue> {
        self.validation.get(&format!("{VALIDATION}loss")).copied()
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn history(&self) -> &[EpochRecord] {
        &self.history
    }

    /// Means since the last report plus pending validation values.
    pub fn log_report(&mut self, epoch: usize, iteration: usize, elapsed: Duration) -> &LogEntry {
        let mut values = self.interval.compute_mean();
        values.extend(std::mem::take(&mut self.validation));
        self.interval.clear();

        let entry = LogEntry {
            epoch,
            iteration,
            elapsed_time: elapsed.as_secs_f64(),
            values,
        };
        log_training_report(&entry);
        self.log.push(entry);
        &self.log[self.log.len() - 1]
    }

    pub fn end_epoch(&mut self, epoch: usize) {
        let mut values = self.epoch.compute_mean();
        values.extend(self.validation.iter().map(|(k, v)| (k.clone(), *v)));
        self.epoch.clear();
        self.history.push(EpochRecord { epoch, values });
    }

    pub fn write_log(&self, outdir: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.log)?;
        write_atomic(outdir.join("log"), &json).context("unable to write log report")?;
        Ok(())
    }
}

fn log_training_report(entry: &LogEntry) {
    let values = entry
        .values
        .iter()
        .map(|(key, value)| format!("{key} = {value:<10.6}"))
        .join(", ");
    info!(
        "epoch = {:<4} iteration = {:<8} | {values} (elapsed={:.1}s)",
        entry.epoch, entry.iteration, entry.elapsed_time
    );
}

/// Logs throughput and time remaining.
pub struct ProgressReport {
    started: Instant,
    start_iteration: usize,
    total_iterations: usize,
}

impl ProgressReport {
    pub fn new(start_iteration: usize, total_iterations: usize) -> Self {
        Self {
            started: Instant::now(),
            start_iteration,
            total_iterations,
        }
    }

    pub fn iters_per_sec(&self, iteration: usize) -> f64 {
        let done = iteration.saturating_sub(self.start_iteration) as f64;
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 {
            done / secs
        } else {
            0.0
        }
    }

    pub fn log(&self, epoch: usize, epochs: usize, iteration: usize) {
        let rate = self.iters_per_sec(iteration);
        let remaining = self.total_iterations.saturating_sub(iteration) as f64;
        let eta = if rate > 0.0 {
            format_duration(Duration::from_secs_f64(remaining / rate))
        } else {
            "unknown".to_string()
        };
        info!(
            "{iteration:>8} iter, {epoch} epoch / {epochs} epochs | {rate:.3} iters/sec | estimated time to finish: {eta}"
        );
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Writes each utterance's attention matrix under `dir`.
pub fn save_attention(dir: &Path, iteration: usize, ids: &[String], weights: &[Linear]) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    for (id, weight) in ids.iter().zip(weights) {
        let nested = weight.to_nested();
        let path = dir.join(format!("{id}.iter.{iteration}.json"));
        write_atomic(&path, &serde_json::to_vec(&nested)?)
            .with_context(|| format!("unable to write attention weights for '{id}'"))?;

        #[cfg(feature = "plot")]
        {
            let mut plot = plotly::Plot::new();
            plot.add_trace(plotly::HeatMap::new_z(nested));
            let title = plotly::common::Title::new(&format!("{id} [iteration {iteration}]"));
            plot.set_layout(plot.layout().clone().title(title));
            plot.write_html(dir.join(format!("{id}.iter.{iteration}.html")));
        }
    }
    Ok(())
}

#[cfg(feature = "plot")]
pub fn plot_losses(outdir: &Path, history: &[EpochRecord]) -> Result<()> {
    use plotly::{Plot, Scatter};

    for key in LOSS_KEYS {
        let mut plot = Plot::new();
        for prefix in [MAIN, VALIDATION] {
            let name = format!("{prefix}{key}");
            let (x_points, y_points): (Vec<_>, Vec<_>) = history
                .iter()
                .filter_map(|record| record.values.get(&name).map(|y| (record.epoch, *y)))
                .unzip();
            if !x_points.is_empty() {
                plot.add_trace(Scatter::new(x_points, y_points).name(&name));
            }
        }
        let title = plotly::common::Title::new(key);
        plot.set_layout(plot.layout().clone().title(title));
        plot.write_html(outdir.join(format!("{key}.html")));
    }
    Ok(())
}

#[cfg(not(feature = "plot"))]
pub fn plot_losses(_outdir: &Path, _history: &[EpochRecord]) -> Result<()> {
    Ok(())
}
