//! Messages between the feeding task, the training worker and the logger.

use crate::common::*;

/// A unit of work sent from the feeding task to the training worker.
#[derive(Debug)]
pub enum TrainingMessage {
    /// One training batch.
    Train { epoch: usize, batch: Batch },
    /// One validation batch.
    Validate { epoch: usize, batch: Batch },
    /// Every batch of the epoch was sent.
    EpochEnd { epoch: usize },
}

/// A scalar summary broadcast to the logging worker.
#[derive(Debug, Clone)]
pub struct LoggingMessage {
    pub tag: Cow<'static, str>,
    pub step: usize,
    pub value: f64,
}

impl LoggingMessage {
    pub fn new_scalar(tag: impl Into<Cow<'static, str>>, step: usize, value: f64) -> Self {
        Self {
            tag: tag.into(),
            step,
            value,
        }
    }
}
