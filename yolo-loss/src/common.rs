pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use getset::{CopyGetters, Getters};
pub use itertools::{chain, izip, Itertools as _};
pub use log::{debug, info, warn};
pub use noisy_float::prelude::*;
pub use rayon::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    collections::HashSet,
    fmt::Debug,
    iter,
    ops::Range,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};
pub use tch::{Device, IndexOp, Kind, Reduction, Tensor};
pub use tch_goodies::TensorExt as _;
pub use tch_tensor_like::TensorLike;
