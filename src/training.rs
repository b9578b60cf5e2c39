use crate::checkpoint::{checkpoint_epoch, CheckpointStore};
use crate::config::TrainingConfig;
use crate::data::{build_loader, BatchSource, DataConfig, PairBatch, PairedImageDataset, SampleSource};
use crate::ema::EmaTracker;
use crate::error::{Result, TrainError};
use crate::loss::{feature_matching_loss, AdversarialCriterion, PerceptualLoss};
use crate::metrics::{LossLog, MetricsSink, TracingSink};
use crate::model::{condition_pair, Generator, MultiscaleDiscriminator};
use crate::replay::{ReplayBuffer, ReplaySample};
use crate::sampling::SampleWriter;
use burn::config::Config;
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{AdamW, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub const GENERATOR_TERMS: [&str; 3] = ["G_vgg", "G_adv", "G_adv_feat"];
pub const DISCRIMINATOR_TERMS: [&str; 2] = ["D_true", "D_false"];

type GeneratorOptimizer<B> = OptimizerAdaptor<AdamW, Generator<B>, B>;
type DiscriminatorOptimizer<B> = OptimizerAdaptor<AdamW, MultiscaleDiscriminator<B>, B>;

/// Where the trainer is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainerState {
    Initialized,
    Training { epoch: usize },
    Sampling { epoch: usize },
    Checkpointing { epoch: usize },
    Completed,
    Failed { epoch: usize },
}

/// Result of the generator and discriminator phases for one batch.
#[derive(Clone, Debug)]
pub struct BatchOutcome<B: Backend> {
    /// The replay-mixed fake pair the discriminator was trained on.
    pub fake: ReplaySample<B>,
    pub generator_loss: f64,
    pub discriminator_loss: f64,
}

/// Alternating generator/discriminator optimization with EMA smoothing,
/// replayed fakes, periodic samples and append-only checkpoints.
pub struct AdversarialTrainer<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
    generator: Generator<B>,
    discriminator: MultiscaleDiscriminator<B>,
    perceptual: PerceptualLoss<B>,
    criterion: AdversarialCriterion,
    optim_gen: GeneratorOptimizer<B>,
    optim_disc: DiscriminatorOptimizer<B>,
    ema: EmaTracker<B, Generator<B>>,
    replay: ReplayBuffer<ReplaySample<B::InnerBackend>>,
    store: CheckpointStore,
    samples: SampleWriter,
    state: TrainerState,
    start_epoch: usize,
}

impl<B: AutodiffBackend> AdversarialTrainer<B> {
    /// Validate `config` and build both networks, their optimizers and the
    /// training bookkeeping. Checkpoints go to `checkpoint_dir`, samples to
    /// its `images/` subdirectory.
    pub fn new(config: TrainingConfig, checkpoint_dir: impl Into<PathBuf>, device: B::Device) -> Result<Self> {
        config.validate()?;
        B::seed(&device, config.seed);

        let generator = config.model.init_generator::<B>(&device);
        let discriminator = config.model.init_discriminator::<B>(&device);
        let perceptual = config
            .loss
            .perceptual
            .init::<B>(config.model.output_channels, &device)?
            .no_grad();
        let optim_gen = config.optimizer_gen.init::<B, Generator<B>>();
        let optim_disc = config.optimizer_disc.init::<B, MultiscaleDiscriminator<B>>();
        let ema = EmaTracker::new(&generator);
        let replay = ReplayBuffer::new(config.replay_capacity, config.replay_swap_probability, config.seed)?;

        let checkpoint_dir = checkpoint_dir.into();
        let samples = SampleWriter::new(checkpoint_dir.join("images"));
        let store = CheckpointStore::new(checkpoint_dir);

        Ok(Self {
            criterion: AdversarialCriterion::new(config.loss.gan_mode.clone()),
            config,
            device,
            generator,
            discriminator,
            perceptual,
            optim_gen,
            optim_disc,
            ema,
            replay,
            store,
            samples,
            state: TrainerState::Initialized,
            start_epoch: 0,
        })
    }

    /// Load `{G, D}` from a checkpoint. Both the live and the EMA generator
    /// take the stored G, and training restarts at the epoch in the file name.
    pub fn resume_from(&mut self, path: &Path) -> Result<usize> {
        let (generator, discriminator) = CheckpointStore::load::<B, _, _>(
            path,
            self.generator.clone(),
            self.discriminator.clone(),
            &self.device,
        )?;
        self.generator = generator;
        self.discriminator = discriminator;
        self.ema.reset(&self.generator);

        self.start_epoch = match checkpoint_epoch(path) {
            Some(epoch) => epoch,
            None => {
                warn!(path = %path.display(), "checkpoint name carries no epoch, restarting at 0");
                0
            }
        };
        info!(path = %path.display(), epoch = self.start_epoch, "resuming training");
        Ok(self.start_epoch)
    }

    /// Run the generator phase, then the discriminator phase, on one batch.
    pub fn train_step(&mut self, batch: &PairBatch<B>, log: &mut LossLog) -> Result<BatchOutcome<B::InnerBackend>> {
        let generator_loss = self.generator_phase(batch, log)?;
        let (fake, discriminator_loss) = self.discriminator_phase(batch, log)?;
        log.finish_batch();

        Ok(BatchOutcome {
            fake,
            generator_loss,
            discriminator_loss,
        })
    }

    fn generator_phase(&mut self, batch: &PairBatch<B>, log: &mut LossLog) -> Result<f64> {
        let discriminator = self.discriminator.clone().no_grad();
        let input = batch.input.clone();
        let target = batch.target.clone();

        let fake = self.generator.forward(input.clone());
        let fake_outputs = discriminator.forward(condition_pair(input.clone(), fake.clone()));
        let real_outputs = discriminator.forward(condition_pair(input, target.clone()));

        let loss = log.aggregate(vec![
            (GENERATOR_TERMS[0], self.perceptual.forward(fake, target)),
            (GENERATOR_TERMS[1], self.criterion.forward(&fake_outputs, true)),
            (
                GENERATOR_TERMS[2],
                feature_matching_loss(&fake_outputs, &real_outputs, self.config.loss.lambda_feat),
            ),
        ])?;
        let value = loss.clone().into_scalar().elem::<f64>();

        let grads = GradientsParams::from_grads(loss.backward(), &self.generator);
        self.generator = self
            .optim_gen
            .step(self.config.learning_rate, self.generator.clone(), grads);
        self.ema.update(&self.generator, self.config.ema_decay)?;

        Ok(value)
    }

    fn discriminator_phase(
        &mut self,
        batch: &PairBatch<B>,
        log: &mut LossLog,
    ) -> Result<(ReplaySample<B::InnerBackend>, f64)> {
        let input = batch.input.clone().inner();
        let generated = self.generator.valid().forward(input.clone());
        let fake = self.replay.query_batch(ReplaySample {
            input,
            output: generated,
        });

        let real_outputs = self
            .discriminator
            .forward(condition_pair(batch.input.clone(), batch.target.clone()));
        let fake_outputs = self.discriminator.forward(condition_pair(
            Tensor::from_inner(fake.input.clone()),
            Tensor::from_inner(fake.output.clone()),
        ));

        let loss = log.aggregate(vec![
            (DISCRIMINATOR_TERMS[0], self.criterion.forward(&real_outputs, true)),
            (DISCRIMINATOR_TERMS[1], self.criterion.forward(&fake_outputs, false)),
        ])?;
        let value = loss.clone().into_scalar().elem::<f64>();

        let grads = GradientsParams::from_grads(loss.backward(), &self.discriminator);
        self.discriminator = self
            .optim_disc
            .step(self.config.learning_rate, self.discriminator.clone(), grads);

        Ok((fake, value))
    }

    /// One pass over `batches`, sampling and checkpointing every N batches
    /// and on the final batch. Returns the epoch's loss log.
    pub fn train_epoch<S, P>(&mut self, epoch: usize, batches: &S, samples: &P) -> Result<LossLog>
    where
        S: BatchSource<B> + ?Sized,
        P: SampleSource<B::InnerBackend> + ?Sized,
    {
        let mut log = LossLog::new();
        let mut iter = batches.batches().peekable();
        let mut iteration = 0;

        while let Some(batch) = iter.next() {
            let last = iter.peek().is_none();
            self.train_step(&batch, &mut log)?;
            debug!(epoch, iteration, losses = %log.summary(), "trained batch");

            if is_due(self.config.sample_every, iteration, last) {
                self.state = TrainerState::Sampling { epoch };
                if let Some(sample) = samples.sample() {
                    self.samples.write(self.ema.shadow(), &sample, epoch, iteration)?;
                }
            }
            if is_due(self.config.checkpoint_every, iteration, last) {
                self.state = TrainerState::Checkpointing { epoch };
                self.store.save(epoch, self.ema.shadow(), &self.discriminator)?;
            }

            self.state = TrainerState::Training { epoch };
            iteration += 1;
        }

        Ok(log)
    }

    /// Train from the start epoch through `num_epochs`, reporting each epoch's
    /// averages to `sink`. Any failure abandons the run with the epoch attached.
    pub fn fit<S, P>(&mut self, batches: &S, samples: &P, sink: &mut dyn MetricsSink) -> Result<()>
    where
        S: BatchSource<B> + ?Sized,
        P: SampleSource<B::InnerBackend> + ?Sized,
    {
        for epoch in self.start_epoch..self.config.num_epochs {
            self.state = TrainerState::Training { epoch };
            info!(epoch, total = self.config.num_epochs, "starting epoch");

            let log = match self.train_epoch(epoch, batches, samples) {
                Ok(log) => log,
                Err(err) => {
                    let err = err.in_epoch(epoch);
                    self.state = TrainerState::Failed { epoch };
                    error!(epoch, error = %err, "training failed");
                    return Err(err);
                }
            };

            sink.log_epoch(epoch, &log.averages());
            info!(epoch, batches = log.batches(), losses = %log.summary(), "finished epoch");
        }

        self.state = TrainerState::Completed;
        Ok(())
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn generator(&self) -> &Generator<B> {
        &self.generator
    }

    pub fn discriminator(&self) -> &MultiscaleDiscriminator<B> {
        &self.discriminator
    }

    pub fn ema(&self) -> &EmaTracker<B, Generator<B>> {
        &self.ema
    }

    pub fn replay(&self) -> &ReplayBuffer<ReplaySample<B::InnerBackend>> {
        &self.replay
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }
}

/// Zero-based `iteration` hits a period of `every` batches, or is the last one.
fn is_due(every: usize, iteration: usize, last: bool) -> bool {
    last || (every > 0 && (iteration + 1) % every == 0)
}

/// Train a pix2pixHD model from the paired folders under `config.data_dir`.
///
/// Checkpoints, samples and the resolved `config.json` are written under
/// `experiment_dir/checkpoints`.
pub fn train<B: AutodiffBackend>(
    experiment_dir: &Path,
    config: TrainingConfig,
    resume_from: Option<&Path>,
    device: B::Device,
) -> Result<()> {
    config.validate()?;
    let checkpoint_dir = experiment_dir.join("checkpoints");
    std::fs::create_dir_all(&checkpoint_dir)?;
    config.save(checkpoint_dir.join("config.json"))?;

    let data_dir = resolve_data_dir(experiment_dir, &config.data_dir);
    let data_config = DataConfig {
        image_size: config.model.image_size as u32,
        flip_probability: config.flip_probability,
    };

    let train_set = PairedImageDataset::open(
        &data_dir,
        &config.train_split,
        &config.source_folder,
        &config.target_folder,
    )?;
    if train_set.is_empty() {
        return Err(TrainError::DataUnavailable {
            path: data_dir.join(&config.train_split),
        });
    }
    let sample_set = match PairedImageDataset::open(
        &data_dir,
        &config.sample_split,
        &config.source_folder,
        &config.target_folder,
    ) {
        Ok(set) => set,
        Err(err @ TrainError::DataUnavailable { .. }) => {
            warn!(%err, "no sample split, sampling disabled");
            PairedImageDataset::from_pairs(Vec::new())
        }
        Err(err) => return Err(err),
    };
    info!(
        train = train_set.len(),
        samples = sample_set.len(),
        "loaded paired datasets"
    );

    let train_loader = build_loader::<B>(
        train_set,
        data_config.clone(),
        true,
        config.batch_size,
        config.num_workers,
        config.seed,
        &device,
    );
    let sample_loader = build_loader::<B::InnerBackend>(
        sample_set,
        data_config,
        false,
        config.batch_size,
        0,
        config.seed,
        &device,
    );

    let mut trainer = AdversarialTrainer::<B>::new(config, &checkpoint_dir, device)?;
    if let Some(path) = resume_from {
        trainer.resume_from(path)?;
    }

    let mut sink = TracingSink;
    trainer.fit(&train_loader, &sample_loader, &mut sink)?;
    info!(checkpoints = %checkpoint_dir.display(), "training completed");
    Ok(())
}

/// Resolve `data_dir` relative to the experiment directory if needed.
fn resolve_data_dir(experiment_dir: &Path, data_dir: &str) -> PathBuf {
    let candidate = PathBuf::from(data_dir);
    if candidate.is_relative() {
        experiment_dir.join(candidate)
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_events_fire_on_period_and_last_batch() {
        assert!(!is_due(100, 0, false));
        assert!(is_due(100, 99, false));
        assert!(is_due(100, 3, true));
        assert!(is_due(0, 3, true));
        assert!(!is_due(0, 99, false));
    }

    #[test]
    fn relative_data_dirs_live_under_the_experiment() {
        let experiment = Path::new("/runs/a");
        assert_eq!(resolve_data_dir(experiment, "data"), PathBuf::from("/runs/a/data"));
        assert_eq!(resolve_data_dir(experiment, "/data"), PathBuf::from("/data"));
    }
}
