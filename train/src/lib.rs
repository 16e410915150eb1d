//! The YOLO-v3 training program.

pub mod common;
pub mod config;
pub mod data;
pub mod evaluation;
pub mod train;
pub mod utils;

use crate::{common::*, config::Config, data::TrainingStream, train::TrainingWorker};

/// The entry of training program.
pub async fn start(config: Arc<Config>) -> Result<()> {
    let start_time = Local::now();
    let run_dir = config
        .logging
        .dir
        .join(format!("{}", start_time.format(utils::FILE_STRFTIME)));
    let checkpoint_dir = run_dir.join("checkpoints");

    // create dirs and save config
    {
        tokio::fs::create_dir_all(&checkpoint_dir).await?;
        let path = run_dir.join("config.json5");
        let text = serde_json::to_string_pretty(&*config)?;
        tokio::fs::write(&path, text).await?;
    }
    info!("logging to {}", run_dir.display());

    let geometry = Arc::new(config.geometry.to_init().build()?);

    // load dataset
    info!("loading dataset");
    let dataset = TrainingStream::new(
        config.training.batch_size.get(),
        &config.dataset,
        geometry.clone(),
    )
    .await?;

    // build the model and restore the checkpoint
    let worker = {
        let config = config.clone();
        let num_batches = dataset.num_batches();
        tokio::task::spawn_blocking(move || {
            TrainingWorker::new(config, &run_dir, geometry, num_batches)
        })
        .await??
    };
    let epochs = worker.start_epoch()..config.training.epochs;

    let (data_tx, data_rx) = mpsc::channel(2);

    // feeding worker
    let training_data_future = tokio::task::spawn(async move {
        let mut train_stream = dataset.train_stream(epochs);

        while let Some(message) = train_stream.next().await {
            data_tx
                .send(message?)
                .await
                .map_err(|_| format_err!("failed to send message to training worker"))?;
        }

        Fallible::Ok(())
    })
    .map(|result| Fallible::Ok(result??));

    // training worker
    let training_worker_future =
        tokio::task::spawn_blocking(move || worker.run(data_rx)).map(|result| Fallible::Ok(result??));

    futures::try_join!(training_data_future, training_worker_future)?;

    Ok(())
}
