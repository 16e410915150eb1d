//! The training worker.

use crate::{
    common::*,
    config::{Config, OptimizerConfig, TrainingConfig},
    data::{TrainingMessage, TrainingRecord},
    evaluation::TestImageEvaluator,
    utils::{self, LrScheduler, RateCounter},
};

/// Owns the model and runs optimization steps on received batches.
pub struct TrainingWorker {
    config: Arc<Config>,
    checkpoint_dir: PathBuf,
    num_batches: usize,
    device: Device,
    vs: nn::VarStore,
    model: YoloV3,
    yolo_loss: YoloLoss,
    evaluator: Option<TestImageEvaluator>,
    /// The number of finished epochs, saved along with the parameters.
    training_epoch: Tensor,
    start_epoch: usize,
}

impl TrainingWorker {
    /// Build the model and restore parameters per checkpoint loading method.
    pub fn new(
        config: Arc<Config>,
        run_dir: &Path,
        geometry: Arc<Geometry>,
        num_batches: usize,
    ) -> Result<Self> {
        let TrainingConfig {
            device,
            ref loss,
            ref load_checkpoint,
            ..
        } = config.training;
        info!("use device {:?}", device);

        let mut vs = nn::VarStore::new(device);
        let root = vs.root();

        info!("initializing model");
        let model = YoloV3Init {
            input_channels: 3,
            num_classes: geometry.num_classes(),
            num_anchors: geometry.scales()[0].anchors().len(),
        }
        .build(&root / "model")?;
        let yolo_loss = loss.to_init().build(geometry.clone())?;
        let training_epoch = root.zeros_no_train("training_epoch", &[]);

        let loaded = utils::try_load_checkpoint(&mut vs, &config.logging.dir, load_checkpoint)?;
        let start_epoch = match loaded {
            Some(_) => f64::from(&training_epoch) as usize,
            None => 0,
        };

        let evaluator = config
            .logging
            .test_image
            .as_ref()
            .map(|image_file| {
                TestImageEvaluator::new(
                    image_file,
                    run_dir.join("test_results"),
                    geometry.clone(),
                    config.logging.confidence_thresh,
                )
            })
            .transpose()?;

        Ok(Self {
            checkpoint_dir: run_dir.join("checkpoints"),
            num_batches,
            device,
            vs,
            model,
            yolo_loss,
            evaluator,
            training_epoch,
            start_epoch,
            config,
        })
    }

    /// The first epoch to train, which follows the restored epoch count.
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Consume messages until all epochs are trained, then save the final checkpoint.
    pub fn run(mut self, mut data_rx: mpsc::Receiver<TrainingMessage>) -> Result<()> {
        let TrainingConfig {
            batch_size,
            epochs,
            save_checkpoint_epochs,
            optimizer:
                OptimizerConfig {
                    ref lr_schedule,
                    alpha,
                    momentum,
                    weight_decay,
                },
            ..
        } = self.config.training;

        let init_step = self.start_epoch * self.num_batches;
        let mut lr_scheduler = LrScheduler::new(lr_schedule, init_step)?;
        let mut optimizer = nn::RmsProp {
            alpha: alpha.raw(),
            eps: 1e-7,
            wd: weight_decay.raw(),
            momentum: momentum.raw(),
            centered: false,
        }
        .build(&self.vs, lr_scheduler.lr())?;

        if self.start_epoch >= epochs {
            warn!(
                "the checkpoint already trained {} epochs, no more epochs to train",
                self.start_epoch
            );
        } else {
            info!("start training from epoch {}", self.start_epoch);
        }

        let mut rate_counter = RateCounter::with_second_interval();
        let mut epoch_loss = MeanLoss::default();
        let mut finished_epochs = self.start_epoch;

        while let Some(message) = data_rx.blocking_recv() {
            match message {
                TrainingMessage::Batch(record) => {
                    let TrainingRecord {
                        epoch,
                        step,
                        image,
                        targets,
                    } = record.to_device(self.device);

                    let lr = lr_scheduler.next();
                    optimizer.set_lr(lr);

                    let predictions = self.model.forward_t(&image, true)?;
                    let losses = self.yolo_loss.forward(&predictions, &targets)?;
                    let total_loss = f64::from(&losses.total_loss);
                    ensure!(
                        total_loss.is_finite(),
                        "non-finite loss at epoch {} step {}",
                        epoch,
                        step
                    );
                    optimizer.backward_step(&losses.total_loss);

                    epoch_loss.add(total_loss);
                    let mean_loss = epoch_loss.mean();

                    rate_counter.add(1.0);
                    match rate_counter.rate() {
                        Some(batch_rate) => info!(
                            "epoch: {}\tstep: {}\tlr: {:.6}\tloss: {:.5}\tmean loss: {:.5}\t{:.2} records/s",
                            epoch,
                            step,
                            lr,
                            total_loss,
                            mean_loss,
                            batch_rate * batch_size.get() as f64
                        ),
                        None => debug!(
                            "epoch: {}\tstep: {}\tlr: {:.6}\tloss: {:.5}\tmean loss: {:.5}",
                            epoch, step, lr, total_loss, mean_loss
                        ),
                    }
                }
                TrainingMessage::EpochEnd { epoch } => {
                    let mean_loss = epoch_loss.mean();
                    info!("epoch {} finished, mean loss {:.5}", epoch, mean_loss);
                    epoch_loss = MeanLoss::default();
                    finished_epochs = epoch + 1;

                    let _ = self.training_epoch.fill_(finished_epochs as f64);

                    if let Some(evaluator) = &self.evaluator {
                        let path = evaluator.evaluate(&mut self.model, self.device, epoch)?;
                        info!("save test result to {}", path.display());
                    }

                    if is_checkpoint_epoch(save_checkpoint_epochs, finished_epochs) {
                        let path = utils::save_checkpoint(
                            &self.vs,
                            &self.checkpoint_dir,
                            epoch,
                            mean_loss,
                        )?;
                        info!("save checkpoint to {}", path.display());
                    }
                }
            }
        }

        ensure!(
            finished_epochs >= epochs,
            "the data stream closed after {} epochs, but {} epochs are expected",
            finished_epochs,
            epochs
        );

        let path = utils::save_final_checkpoint(&self.vs, &self.checkpoint_dir)?;
        info!("training finished, save final checkpoint to {}", path.display());
        Ok(())
    }
}

/// Running mean of batch losses within an epoch.
#[derive(Debug, Clone, Default)]
struct MeanLoss {
    sum: f64,
    count: usize,
}

impl MeanLoss {
    fn add(&mut self, loss: f64) {
        self.sum += loss;
        self.count += 1;
    }

    /// Zero if no loss was added.
    fn mean(&self) -> f64 {
        self.sum / self.count.max(1) as f64
    }
}

/// Checkpoints are saved when the finished epoch count is a multiple of the period.
fn is_checkpoint_epoch(period: Option<NonZeroUsize>, finished_epochs: usize) -> bool {
    match period {
        Some(period) => finished_epochs > 0 && finished_epochs % period.get() == 0,
        None => false,
    }
}
