//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use indexmap::{IndexMap, IndexSet};
pub use itertools::{izip, Itertools};
pub use noisy_float::prelude::*;
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    cmp::Ordering,
    collections::HashMap,
    fmt::Debug,
    iter,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};
pub use tch::{nn, vision, Device, IndexOp, Kind, Reduction, Tensor};
pub use tracing::{info, warn};
