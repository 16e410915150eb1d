use crate::{common::*, config::LoadCheckpoint};

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";
pub const FINAL_CHECKPOINT_FILE: &str = "final.ckpt";

/// The checkpoint file name for an epoch.
pub fn checkpoint_filename(time: &DateTime<Local>, epoch: usize, loss: f64) -> String {
    format!(
        "{}_{:04}_{:08.5}.ckpt",
        time.format(FILE_STRFTIME),
        epoch,
        loss
    )
}

/// Save parameters to a checkpoint file.
pub fn save_checkpoint(
    vs: &nn::VarStore,
    checkpoint_dir: &Path,
    epoch: usize,
    loss: f64,
) -> Result<PathBuf> {
    let filename = checkpoint_filename(&Local::now(), epoch, loss);
    let path = checkpoint_dir.join(filename);
    vs.save(&path)
        .with_context(|| format!("failed to save checkpoint '{}'", path.display()))?;
    Ok(path)
}

/// Save parameters to the final checkpoint file.
pub fn save_final_checkpoint(vs: &nn::VarStore, checkpoint_dir: &Path) -> Result<PathBuf> {
    let path = checkpoint_dir.join(FINAL_CHECKPOINT_FILE);
    vs.save(&path)
        .with_context(|| format!("failed to save checkpoint '{}'", path.display()))?;
    Ok(path)
}

/// Find the most recent epoch checkpoint among all runs in the logging directory.
pub fn find_recent_checkpoint(logging_dir: &Path) -> Result<Option<PathBuf>> {
    let checkpoint_filename_regex =
        Regex::new(r"^(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}\.\d{3}[+-]\d{4})_\d{4,}_\d+\.\d+\.ckpt$")?;

    let paths: Vec<_> = glob::glob(&format!("{}/*/checkpoints/*.ckpt", logging_dir.display()))?
        .try_collect()?;
    let checkpoint_file = paths
        .into_iter()
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?;
            let captures = checkpoint_filename_regex.captures(file_name)?;
            let datetime_str = captures.get(1)?.as_str();
            let datetime = DateTime::parse_from_str(datetime_str, FILE_STRFTIME).ok()?;
            Some((path, datetime))
        })
        .max_by_key(|(_path, datetime)| *datetime)
        .map(|(path, _datetime)| path);

    Ok(checkpoint_file)
}

/// Load parameters from a diretory with specified checkpoint loading method.
///
/// Returns the loaded file, if any.
pub fn try_load_checkpoint(
    vs: &mut nn::VarStore,
    logging_dir: &Path,
    load_checkpoint: &LoadCheckpoint,
) -> Result<Option<PathBuf>> {
    let path = match load_checkpoint {
        LoadCheckpoint::Disabled => {
            info!("checkpoint loading is disabled");
            None
        }
        LoadCheckpoint::FromRecent => {
            let checkpoint_file = find_recent_checkpoint(logging_dir)?;
            if checkpoint_file.is_none() {
                warn!("no checkpoint file found");
            }
            checkpoint_file
        }
        LoadCheckpoint::FromFile { file } => {
            ensure!(file.is_file(), "{} is not a file", file.display());
            Some(file.to_owned())
        }
    };

    if let Some(path) = &path {
        info!("load checkpoint file {}", path.display());
        vs.load_partial(path)
            .with_context(|| format!("failed to load checkpoint '{}'", path.display()))?;
    }

    Ok(path)
}
