//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use bbox::{prelude::*, CyCxHW};
pub use chrono::{DateTime, Local};
pub use futures::{
    future::FutureExt,
    stream::{self, BoxStream, StreamExt, TryStreamExt},
};
pub use itertools::Itertools;
pub use label::{parse_label_line, LabelRecord, RatioLabel};
pub use log::{debug, info, warn};
pub use noisy_float::prelude::*;
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use regex::Regex;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    iter,
    ops::Range,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
pub use tch::{
    kind::FLOAT_CPU,
    nn::{self, OptimizerConfig as _},
    vision, Device, IndexOp, Kind, Tensor,
};
pub use tch_goodies::TensorExt;
pub use tch_tensor_like::TensorLike;
pub use tokio::sync::mpsc;
pub use yolo_v3::{
    geometry::{Geometry, GeometryInit, ScaleInit},
    inference::{Detection, YoloInference, YoloInferenceInit},
    label::{BatchTargets, LabelGenerator},
    loss::{ClassificationLossKind, YoloLoss, YoloLossInit, YoloLossOutput},
    model::{DetectionModel, YoloV3, YoloV3Init},
};

pub type Fallible<T> = Result<T, Error>;
