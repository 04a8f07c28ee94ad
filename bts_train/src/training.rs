use std::{
    cmp::Reverse,
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{info, instrument, warn};

use plane::{
    checkpoint::{self, paths, BestModelTracker, RunConfig},
    data::{
        planner::make_batchset,
        store::{ArchiveReader, FeatureReader},
        BatchPlan, Converter, DatasetIndex, UtteranceRecord,
    },
    device::Device,
    ml::{
        clip::clip_grad_norm,
        model::{Synthesizer, Trainable},
        parallel::ModelHandle,
        solver::{AdamOptimizer, Optimizer},
        tacotron::Tacotron,
        NodeValue, RngStrategy, RNG,
    },
};

use crate::{
    config::TrainConfig,
    evaluate,
    report::{self, ProgressReport, Reporter},
};

/// What one update step did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Updated { grad_norm: NodeValue },
    /// Gradient norm was NaN or infinite; the optimizer step was skipped.
    Diverged { grad_norm: NodeValue },
    /// Too few utterances to feed every replica.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Evaluating,
    Checkpointing,
    Terminated,
}

/// Everything a run owns and needs to persist to resume.
pub struct RunState<M, O> {
    pub model: ModelHandle<M>,
    pub optimizer: O,
    pub reporter: Reporter,
    pub best: BestModelTracker,
    pub epoch: usize,
    pub iteration: usize,
    pub divergences: usize,
    pub skipped: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
struct TrainerSnapshot<O> {
    epoch: usize,
    iteration: usize,
    divergences: usize,
    skipped: usize,
    elapsed_time: f64,
    optimizer: O,
    reporter: Reporter,
    best: BestModelTracker,
}

impl<M, O> RunState<M, O>
where
    M: Trainable + Clone + Send + Sync,
    O: Optimizer + Clone + Serialize + DeserializeOwned,
{
    pub fn new(model: ModelHandle<M>, optimizer: O) -> Self {
        Self {
            model,
            optimizer,
            reporter: Reporter::default(),
            best: BestModelTracker::default(),
            epoch: 0,
            iteration: 0,
            divergences: 0,
            skipped: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Writes `snapshot.ep.N` with the loop state and `model.ep.N` with the weights.
    pub fn save(&self, outdir: &Path) -> Result<()> {
        let snapshot = TrainerSnapshot {
            epoch: self.epoch,
            iteration: self.iteration,
            divergences: self.divergences,
            skipped: self.skipped,
            elapsed_time: self.elapsed.as_secs_f64(),
            optimizer: self.optimizer.clone(),
            reporter: self.reporter.clone(),
            best: self.best.clone(),
        };
        checkpoint::save_snapshot(paths::snapshot(outdir, self.epoch), &snapshot)?;
        checkpoint::save_weights(
            paths::model(outdir, self.epoch),
            self.model.module().parameters(),
        )?;
        Ok(())
    }

    /// Restores loop state from `snapshot_path`, then the weights of the same epoch
    /// from the snapshot's directory.
    pub fn resume(&mut self, snapshot_path: &Path) -> Result<()> {
        let snapshot: TrainerSnapshot<O> = checkpoint::load_snapshot(snapshot_path)?;
        let dir = snapshot_path.parent().unwrap_or_else(|| Path::new("."));
        let model_path = paths::model(dir, snapshot.epoch);
        checkpoint::load_weights(&model_path, self.model.module_mut().parameters_mut())
            .with_context(|| format!("unable to restore weights for epoch {}", snapshot.epoch))?;

        self.epoch = snapshot.epoch;
        self.iteration = snapshot.iteration;
        self.divergences = snapshot.divergences;
        self.skipped = snapshot.skipped;
        self.elapsed = Duration::from_secs_f64(snapshot.elapsed_time.max(0.0));
        self.optimizer = snapshot.optimizer;
        self.reporter = snapshot.reporter;
        self.best = snapshot.best;

        info!(
            "resumed from epoch {} (iteration {})",
            self.epoch, self.iteration
        );
        Ok(())
    }
}

/// Materialize, forward, backward, clip, then step.
pub struct StandardUpdater {
    converter: Converter,
    grad_clip: NodeValue,
    ngpu: usize,
}

impl StandardUpdater {
    pub fn new(converter: Converter, grad_clip: NodeValue, ngpu: usize) -> Self {
        Self {
            converter,
            grad_clip,
            ngpu,
        }
    }

    #[instrument(level = "trace", skip_all, fields(rows = group.len()))]
    pub fn update<M, O>(
        &self,
        state: &mut RunState<M, O>,
        group: &[Arc<UtteranceRecord>],
    ) -> Result<StepOutcome>
    where
        M: Trainable + Clone + Send + Sync,
        O: Optimizer,
    {
        if group.len() < self.ngpu {
            warn!("batch size is less than gpu #. skip the update.");
            return Ok(StepOutcome::Skipped);
        }

        let batch = self.converter.convert(group)?;
        if batch.is_empty() || batch.len() < self.ngpu {
            warn!("batch has {} usable utterances. skip the update.", batch.len());
            return Ok(StepOutcome::Skipped);
        }

        state.model.zero_grad();
        let observation = state.model.forward_backward(&batch)?;
        state.reporter.observe(&observation);

        let grad_norm = clip_grad_norm(state.model.parameters_mut(), self.grad_clip);
        if !grad_norm.is_finite() {
            warn!("grad norm is {grad_norm}. Do not update model.");
            return Ok(StepOutcome::Diverged { grad_norm });
        }

        state.optimizer.step(state.model.parameters_mut())?;
        Ok(StepOutcome::Updated { grad_norm })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub epochs: usize,
    pub eval_interval_epochs: usize,
    pub log_interval: usize,
    pub plot_interval: usize,
    pub shuffle_batch_order: bool,
}

impl From<&TrainConfig> for Schedule {
    fn from(config: &TrainConfig) -> Self {
        Self {
            epochs: config.epochs,
            eval_interval_epochs: config.eval_interval_epochs,
            log_interval: config.log_interval,
            plot_interval: config.plot_interval,
            shuffle_batch_order: config.shuffle_batch_order,
        }
    }
}

fn triggered(count: usize, interval: usize) -> bool {
    interval > 0 && count % interval == 0
}

pub type StepFn<'a, M, O> =
    Box<dyn FnMut(&mut RunState<M, O>, &[Arc<UtteranceRecord>]) -> Result<StepOutcome> + 'a>;
pub type EvalFn<'a, M> =
    Box<dyn FnMut(&mut ModelHandle<M>) -> Result<BTreeMap<String, NodeValue>> + 'a>;
pub type PlotFn<'a, M> = Box<dyn FnMut(&ModelHandle<M>, usize) -> Result<()> + 'a>;

/// Epoch/iteration driver with the update and evaluation injected.
pub struct TrainLoop<'a, M, O> {
    outdir: PathBuf,
    schedule: Schedule,
    rng: Arc<dyn RNG>,
    step: StepFn<'a, M, O>,
    eval: EvalFn<'a, M>,
    plot: Option<PlotFn<'a, M>>,
    state: LoopState,
}

impl<'a, M, O> TrainLoop<'a, M, O>
where
    M: Trainable + Clone + Send + Sync,
    O: Optimizer + Clone + Serialize + DeserializeOwned,
{
    pub fn new(
        outdir: PathBuf,
        schedule: Schedule,
        rng: Arc<dyn RNG>,
        step: StepFn<'a, M, O>,
        eval: EvalFn<'a, M>,
    ) -> Self {
        Self {
            outdir,
            schedule,
            rng,
            step,
            eval,
            plot: None,
            state: LoopState::Running,
        }
    }

    pub fn with_plot(mut self, plot: PlotFn<'a, M>) -> Self {
        self.plot = Some(plot);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn run(&mut self, run: &mut RunState<M, O>, plan: &BatchPlan) -> Result<()> {
        let started = Instant::now();
        let base_elapsed = run.elapsed;
        let epochs = self.schedule.epochs;
        let progress = ProgressReport::new(run.iteration, epochs * plan.len());
        if plan.is_empty() {
            warn!("no minibatches planned, nothing to train on");
        }

        while run.epoch < epochs {
            self.state = LoopState::Running;
            let order = if self.schedule.shuffle_batch_order {
                plan.shuffled(&self.rng)
            } else {
                plan.clone()
            };

            for group in order.iter() {
                match (self.step)(run, group)? {
                    StepOutcome::Updated { .. } => {}
                    StepOutcome::Diverged { .. } => run.divergences += 1,
                    StepOutcome::Skipped => run.skipped += 1,
                }
                run.iteration += 1;

                if triggered(run.iteration, self.schedule.log_interval) {
                    let elapsed = base_elapsed + started.elapsed();
                    run.reporter.log_report(run.epoch, run.iteration, elapsed);
                    run.reporter.write_log(&self.outdir)?;
                    progress.log(run.epoch, epochs, run.iteration);
                }
                if let Some(plot) = self.plot.as_mut() {
                    if triggered(run.iteration, self.schedule.plot_interval) {
                        plot(&run.model, run.iteration)?;
                    }
                }
            }
            run.epoch += 1;

            if triggered(run.epoch, self.schedule.eval_interval_epochs) {
                self.state = LoopState::Evaluating;
                let means = (self.eval)(&mut run.model)?;
                run.reporter.observe_validation(means);
                if let Some(loss) = run.reporter.validation_loss() {
                    run.best
                        .save_if_improved(&self.outdir, loss, run.model.module().parameters())?;
                }
            }

            self.state = LoopState::Checkpointing;
            run.reporter.end_epoch(run.epoch);
            run.elapsed = base_elapsed + started.elapsed();
            run.save(&self.outdir)?;
            report::plot_losses(&self.outdir, run.reporter.history())?;
        }

        self.state = LoopState::Terminated;
        info!(
            "training finished: {} epochs, {} iterations, {} diverged steps, {} skipped batches",
            run.epoch, run.iteration, run.divergences, run.skipped
        );
        Ok(())
    }
}

/// The first `n` utterances of the index, longest token sequence first.
fn attention_records(records: &[Arc<UtteranceRecord>], n: usize) -> Vec<Arc<UtteranceRecord>> {
    let mut records = records[..n.min(records.len())].to_vec();
    records.sort_by_key(|x| Reverse(x.tokens.len()));
    records
}

/// Builds everything from the command line configuration and trains to completion.
pub fn run_training(config: &TrainConfig) -> Result<()> {
    let rng_strategy = RngStrategy::from_seed(Some(config.seed));
    let rng = rng_strategy.to_arc();
    let device = Device::select(config.ngpu);
    info!("device: {device}");

    let train_index = DatasetIndex::load(&config.train_json)
        .with_context(|| format!("unable to read {}", config.train_json.display()))?;
    let valid_index = DatasetIndex::load(&config.valid_json)
        .with_context(|| format!("unable to read {}", config.valid_json.display()))?;

    // the manifest describes the recognition direction
    let (declared_idim, declared_odim) = train_index.declared_dims()?;
    let (idim, odim) = (declared_odim, declared_idim);
    info!("#input dims : {idim}");
    info!("#output dims: {odim}");

    std::fs::create_dir_all(&config.outdir)?;
    let model_config = config.model_config(idim, odim);
    let run_config = RunConfig {
        idim,
        odim,
        model: model_config.clone(),
        args: serde_json::to_value(config)?,
    };
    run_config.save(paths::run_config(&config.outdir))?;

    let model = Tacotron::new(model_config, &rng_strategy)?;
    let model = ModelHandle::new(model, config.ngpu, config.debugmode >= 1);
    let optimizer = AdamOptimizer::new_builder()
        .with_eta(config.lr)
        .with_epsilon(config.eps)
        .with_weight_decay(config.weight_decay)
        .build();
    info!("optimizer: adam (lr = {})", optimizer.learn_rate());

    let batch_config = config.batch_config();
    if config.ngpu > 1 {
        info!(
            "batch size is automatically increased ({} -> {})",
            config.batch_size, batch_config.batch_size
        );
    }
    let train_plan = make_batchset(train_index.records(), &batch_config, &rng)?;
    let valid_plan = make_batchset(valid_index.records(), &batch_config, &rng)?;

    let reader: Arc<dyn FeatureReader> = Arc::new(ArchiveReader::new());
    let converter = Converter::new(reader, device);

    let mut run = RunState::new(model, optimizer);
    if let Some(resume) = &config.resume {
        run.resume(resume)?;
    }

    let updater = StandardUpdater::new(converter.clone(), config.grad_clip, config.ngpu);
    let step: StepFn<Tacotron, AdamOptimizer> =
        Box::new(move |run: &mut RunState<Tacotron, AdamOptimizer>, group: &[Arc<UtteranceRecord>]| {
            updater.update(run, group)
        });
    let eval_converter = converter.clone();
    let eval: EvalFn<Tacotron> = Box::new(move |model: &mut ModelHandle<Tacotron>| {
        evaluate::evaluate(model, &valid_plan, &eval_converter).map_err(Into::into)
    });

    let mut trainer = TrainLoop::new(
        config.outdir.clone(),
        Schedule::from(config),
        rng.clone(),
        step,
        eval,
    );

    if config.num_save_attention > 0 {
        let records = attention_records(valid_index.records(), config.num_save_attention);

        let att_converter = converter.without_targets();
        let att_dir = config.outdir.join("att_ws");
        trainer = trainer.with_plot(Box::new(move |model: &ModelHandle<Tacotron>, iteration| {
            let batch = att_converter.convert(&records)?;
            let weights = model.module().attention_weights(&batch)?;
            report::save_attention(&att_dir, iteration, &batch.ids, &weights)
        }));
    }

    trainer.run(&mut run, &train_plan)
}
