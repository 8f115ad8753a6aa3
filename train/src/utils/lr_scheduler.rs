use crate::common::*;

/// The number of leading batches that ramp the learning rate. The count is
/// zero when training resumes from a prior checkpoint, else it spans the
/// configured warmup epochs over both generators.
pub fn warmup_schedule(
    weights_exist: bool,
    warmup_epochs: usize,
    train_times: usize,
    train_batches: usize,
    valid_times: usize,
    valid_batches: usize,
) -> usize {
    if weights_exist {
        0
    } else {
        warmup_epochs * (train_times * train_batches + valid_times * valid_batches)
    }
}

/// Ramps the learning rate linearly up to `max_lr` over the warmup
/// batches, then holds it constant.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    max_lr: f64,
    warmup_batches: usize,
    step: usize,
}

impl LrScheduler {
    pub fn new(max_lr: f64, warmup_batches: usize) -> Result<Self> {
        ensure!(max_lr > 0.0, "the lr must be positive");
        Ok(Self {
            max_lr,
            warmup_batches,
            step: 0,
        })
    }

    pub fn lr(&self) -> f64 {
        if self.step >= self.warmup_batches {
            self.max_lr
        } else {
            self.max_lr * (self.step + 1) as f64 / self.warmup_batches as f64
        }
    }

    /// Advances one batch and returns the new learning rate.
    pub fn next(&mut self) -> f64 {
        self.step += 1;
        self.lr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::abs_diff_eq;

    #[test]
    fn warmup_is_skipped_with_existing_weights() {
        assert_eq!(warmup_schedule(true, 3, 2, 100, 1, 25), 0);
    }

    #[test]
    fn warmup_counts_train_and_validation_batches() {
        assert_eq!(warmup_schedule(false, 3, 2, 100, 1, 25), 3 * (200 + 25));
    }

    #[test]
    fn lr_ramps_linearly_then_holds() -> Result<()> {
        let mut scheduler = LrScheduler::new(1e-4, 4)?;

        assert!(abs_diff_eq!(scheduler.lr(), 2.5e-5, epsilon = 1e-12));
        assert!(abs_diff_eq!(scheduler.next(), 5e-5, epsilon = 1e-12));
        assert!(abs_diff_eq!(scheduler.next(), 7.5e-5, epsilon = 1e-12));
        assert!(abs_diff_eq!(scheduler.next(), 1e-4, epsilon = 1e-12));
        assert!(abs_diff_eq!(scheduler.next(), 1e-4, epsilon = 1e-12));
        assert!(abs_diff_eq!(scheduler.next(), 1e-4, epsilon = 1e-12));
        Ok(())
    }

    #[test]
    fn zero_warmup_starts_at_full_lr() -> Result<()> {
        let scheduler = LrScheduler::new(1e-4, 0)?;
        assert!(abs_diff_eq!(scheduler.lr(), 1e-4, epsilon = 1e-12));
        Ok(())
    }
}
