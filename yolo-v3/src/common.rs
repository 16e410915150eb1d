pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use approx::{abs_diff_eq, assert_abs_diff_eq};
pub use bbox::{prelude::*, CyCxHW, HW};
pub use getset::{CopyGetters, Getters};
pub use itertools::{iproduct, izip, Itertools as _};
pub use label::RatioLabel;
pub use log::{debug, info, warn};
pub use ndarray::{s, Array3, Array4};
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    iter,
    ops::Range,
    sync::Arc,
};
pub use tch::{
    kind::FLOAT_CPU,
    nn::{self, ModuleT as _},
    Device, IndexOp, Kind, Tensor,
};
pub use tch_goodies::TensorExt as _;
pub use tch_tensor_like::TensorLike;
