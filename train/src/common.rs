//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use chrono::Local;
pub use futures::{
    future::FutureExt,
    stream::{self, StreamExt, TryStreamExt},
};
pub use indexmap::{IndexMap, IndexSet};
pub use itertools::{izip, Itertools};
pub use noisy_float::prelude::*;
pub use par_stream::{ParStreamExt, TryParStreamExt};
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Cow,
    fmt::Debug,
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
pub use structopt::StructOpt;
pub use tch::{
    nn::{self, OptimizerConfig as _},
    Device, Kind, Tensor,
};
pub use tfrecord::{EventWriter, EventWriterInit};
pub use tokio::sync::{broadcast, mpsc};
pub use tracing::{error, info, warn};
pub use yolo_v3::{
    bbox::LabeledBox,
    dataset::{Batch, BatchGenerator, BatchGeneratorInit, ImageAnnotation},
    eval::{self, MapEvaluator, MapEvaluatorInit},
    loss::{YoloLoss, YoloLossInit, YoloLossOutput},
    model::{YoloV3, YoloV3Init},
};

pub type Fallible<T> = Result<T, Error>;
