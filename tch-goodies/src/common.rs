pub use anyhow::{ensure, Result};
pub use getset::Getters;
pub use log::warn;
pub use serde::{Deserialize, Serialize};
pub use tch::{Device, Kind, Tensor};
pub use tch_tensor_like::TensorLike;
