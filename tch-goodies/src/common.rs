pub use anyhow::{bail, ensure, format_err, Result};
pub use serde::{Deserialize, Serialize};
pub use std::borrow::Borrow;
pub use tch::{nn, Device, IndexOp, Kind, Tensor};
