//! The training data pipeline.

use crate::{common::*, config::DatasetConfig};

/// The record that is accepted by training worker.
#[derive(Debug, TensorLike)]
pub struct TrainingRecord {
    pub epoch: usize,
    pub step: usize,
    /// Float images in `[batch, 3, height, width]` shape, ranging in `[0, 1]`.
    pub image: Tensor,
    pub targets: BatchTargets,
}

/// The message produced by the training stream.
#[derive(Debug)]
pub enum TrainingMessage {
    Batch(TrainingRecord),
    /// All batches of the epoch were produced.
    EpochEnd { epoch: usize },
}

/// Load all records of a label file.
///
/// Relative image paths are resolved against `image_dir`. Blank lines are skipped.
pub fn load_label_file(label_file: &Path, image_dir: &Path) -> Result<Vec<LabelRecord>> {
    let text = std::fs::read_to_string(label_file)
        .with_context(|| format!("failed to read label file '{}'", label_file.display()))?;

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| -> Result<_> {
            let mut record = parse_label_line(line).with_context(|| {
                format!(
                    "invalid label at {}:{}",
                    label_file.display(),
                    index + 1
                )
            })?;
            if record.image_file.is_relative() {
                record.image_file = image_dir.join(&record.image_file);
            }
            Ok(record)
        })
        .try_collect()
}

/// Load an image and resize it to `[height, width]`, as a `[3, height, width]` float tensor.
pub fn load_image(path: &Path, input_size: [usize; 2]) -> Result<Tensor> {
    let [height, width] = input_size;
    let image = vision::image::load_and_resize(path, width as i64, height as i64)
        .with_context(|| format!("failed to load image '{}'", path.display()))?;
    Ok(image.to_kind(Kind::Float) / 255.0)
}

/// Asynchronous data stream for training.
#[derive(Debug)]
pub struct TrainingStream {
    batch_size: usize,
    shuffle: bool,
    shuffle_seed: Option<u64>,
    prefetch: usize,
    input_size: [usize; 2],
    generator: LabelGenerator,
    records: Arc<Vec<LabelRecord>>,
}

impl TrainingStream {
    pub async fn new(
        batch_size: usize,
        config: &DatasetConfig,
        geometry: Arc<Geometry>,
    ) -> Result<Self> {
        ensure!(batch_size > 0, "batch_size must be positive");

        let records = {
            let label_file = config.label_file.clone();
            let image_dir = config.image_dir();
            tokio::task::spawn_blocking(move || load_label_file(&label_file, &image_dir)).await??
        };
        ensure!(!records.is_empty(), "the dataset has no records");
        info!("loaded {} records", records.len());

        let input_size = [geometry.input_h(), geometry.input_w()];

        Ok(Self {
            batch_size,
            shuffle: config.shuffle,
            shuffle_seed: config.shuffle_seed,
            prefetch: config.prefetch.get(),
            input_size,
            generator: LabelGenerator::new(geometry),
            records: Arc::new(records),
        })
    }

    pub fn num_records(&self) -> usize {
        self.records.len()
    }

    /// The number of batches per epoch, including the last partial batch.
    pub fn num_batches(&self) -> usize {
        (self.records.len() + self.batch_size - 1) / self.batch_size
    }

    /// Produce batches of epochs in `epochs`, each epoch followed by an
    /// [TrainingMessage::EpochEnd] marker.
    pub fn train_stream(&self, epochs: Range<usize>) -> BoxStream<'static, Result<TrainingMessage>> {
        let num_records = self.num_records();
        let num_batches = self.num_batches();
        let batch_size = self.batch_size;
        let shuffle = self.shuffle;
        let shuffle_seed = self.shuffle_seed;

        let jobs = stream::iter(epochs).flat_map(move |epoch| {
            let mut indexes = (0..num_records).collect_vec();
            if shuffle {
                let mut rng = match shuffle_seed {
                    Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(epoch as u64)),
                    None => StdRng::from_entropy(),
                };
                indexes.shuffle(&mut rng);
            }

            let batches: Vec<_> = indexes
                .chunks(batch_size)
                .enumerate()
                .map(|(batch_index, chunk)| Job::Batch {
                    epoch,
                    step: epoch * num_batches + batch_index,
                    indexes: chunk.to_vec(),
                })
                .chain(iter::once(Job::EpochEnd { epoch }))
                .collect();
            stream::iter(batches)
        });

        let records = self.records.clone();
        let generator = self.generator.clone();
        let input_size = self.input_size;

        jobs.map(move |job| {
            let records = records.clone();
            let generator = generator.clone();

            async move {
                match job {
                    Job::Batch {
                        epoch,
                        step,
                        indexes,
                    } => {
                        let batch = load_batch(&records, &indexes, &generator, input_size).await?;
                        let (image, targets) = batch;
                        Ok(TrainingMessage::Batch(TrainingRecord {
                            epoch,
                            step,
                            image,
                            targets,
                        }))
                    }
                    Job::EpochEnd { epoch } => Ok(TrainingMessage::EpochEnd { epoch }),
                }
            }
        })
        .buffered(self.prefetch)
        .boxed()
    }
}

#[derive(Debug)]
enum Job {
    Batch {
        epoch: usize,
        step: usize,
        indexes: Vec<usize>,
    },
    EpochEnd {
        epoch: usize,
    },
}

/// Load images and encode labels of a batch on the blocking thread pool.
async fn load_batch(
    records: &[LabelRecord],
    indexes: &[usize],
    generator: &LabelGenerator,
    input_size: [usize; 2],
) -> Result<(Tensor, BatchTargets)> {
    let futures = indexes.iter().map(|&index| {
        let record = records[index].clone();
        let generator = generator.clone();

        async move {
            let LabelRecord {
                image_file, labels, ..
            } = record;

            let image_future =
                tokio::task::spawn_blocking(move || load_image(&image_file, input_size));
            let target_future = tokio::task::spawn_blocking(move || {
                generator.generate(&labels).map(|target| {
                    if target.collisions > 0 {
                        debug!("{} boxes are overwritten in the same image", target.collisions);
                    }
                    target
                })
            });

            let (image, target) = futures::try_join!(image_future, target_future)?;
            Fallible::Ok((image?, target?))
        }
    });

    let (images, targets): (Vec<_>, Vec<_>) = futures::future::try_join_all(futures)
        .await?
        .into_iter()
        .unzip();

    let image = Tensor::f_stack(&images, 0)?;
    let targets = BatchTargets::from_images(&targets, Device::Cpu)?;
    Ok((image, targets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatasetConfig;

    fn temp_dir(name: &str) -> Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!("yolo-v3-data-{}-{}", name, std::process::id()));
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn write_dataset(dir: &Path) -> Result<PathBuf> {
        for name in ["a.png", "b.png", "c.png"] {
            let image = Tensor::zeros(&[3, 48, 64], (Kind::Uint8, Device::Cpu));
            vision::image::save(&image, dir.join(name))?;
        }
        let label_file = dir.join("train.txt");
        std::fs::write(
            &label_file,
            "a.png 48 64 8 8 40 32 0\n\nb.png 48 64\nc.png 48 64 0 0 64 48 1 10 10 20 20 0\n",
        )?;
        Ok(label_file)
    }

    fn small_geometry() -> Result<Arc<Geometry>> {
        let geometry = GeometryInit {
            input_size: [64, 64],
            num_classes: 2,
            ..GeometryInit::default_voc()
        }
        .build()?;
        Ok(Arc::new(geometry))
    }

    #[test]
    fn load_label_file_resolves_paths() -> Result<()> {
        let dir = temp_dir("labels")?;
        let label_file = write_dataset(&dir)?;
        let records = load_label_file(&label_file, &dir)?;

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].image_file, dir.join("a.png"));
        assert_eq!(records[1].labels.len(), 0);
        assert_eq!(records[2].labels.len(), 2);

        std::fs::write(&label_file, "a.png 48 64\nb.png 48 64 1 2 3\n")?;
        let err = load_label_file(&label_file, &dir).unwrap_err();
        assert!(format!("{:#}", err).contains(":2"), "{:#}", err);

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[tokio::test]
    async fn stream_batches_with_epoch_markers() -> Result<()> {
        let dir = temp_dir("stream")?;
        let label_file = write_dataset(&dir)?;
        let config = DatasetConfig {
            label_file,
            image_dir: None,
            shuffle: true,
            shuffle_seed: Some(1),
            prefetch: NonZeroUsize::new(2).unwrap(),
        };
        let stream = TrainingStream::new(2, &config, small_geometry()?).await?;
        assert_eq!(stream.num_batches(), 2);

        let messages: Vec<_> = stream.train_stream(1..3).try_collect().await?;
        assert_eq!(messages.len(), 6);

        let mut steps = vec![];
        for message in &messages {
            match message {
                TrainingMessage::Batch(record) => {
                    let batch_size = record.image.size()[0];
                    assert_eq!(record.image.size(), vec![batch_size, 3, 64, 64]);
                    assert_eq!(record.targets.batch_size(), batch_size);
                    steps.push((record.epoch, record.step));
                }
                TrainingMessage::EpochEnd { epoch } => steps.push((*epoch, usize::MAX)),
            }
        }
        assert_eq!(
            steps,
            vec![
                (1, 2),
                (1, 3),
                (1, usize::MAX),
                (2, 4),
                (2, 5),
                (2, usize::MAX)
            ]
        );

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
