pub const MIN_DELTA: f64 = 0.001;
pub const PATIENCE: usize = 3;

/// Stops training once the validation loss stops improving.
///
/// An epoch improves when its loss undercuts the best seen loss by at
/// least `min_delta`; `patience` consecutive non-improving epochs stop
/// the training.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    min_delta: f64,
    patience: usize,
    best: f64,
    bad_epochs: usize,
}

impl EarlyStopping {
    pub fn new(min_delta: f64, patience: usize) -> Self {
        Self {
            min_delta,
            patience,
            best: f64::INFINITY,
            bad_epochs: 0,
        }
    }

    /// Records the validation loss of one epoch and returns whether
    /// training should stop.
    pub fn update(&mut self, val_loss: f64) -> bool {
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.bad_epochs = 0;
            false
        } else {
            self.bad_epochs += 1;
            self.bad_epochs >= self.patience
        }
    }
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self::new(MIN_DELTA, PATIENCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_after_patience_exhausts() {
        let mut stopper = EarlyStopping::default();
        assert!(!stopper.update(1.0));
        assert!(!stopper.update(1.0));
        assert!(!stopper.update(1.0));
        assert!(stopper.update(1.0));
    }

    #[test]
    fn improvement_resets_patience() {
        let mut stopper = EarlyStopping::default();
        assert!(!stopper.update(1.0));
        assert!(!stopper.update(1.0));
        assert!(!stopper.update(0.5));
        assert!(!stopper.update(0.5));
        assert!(!stopper.update(0.5));
        assert!(stopper.update(0.5));
    }

    #[test]
    fn improvement_below_min_delta_does_not_count() {
        let mut stopper = EarlyStopping::new(0.001, 2);
        assert!(!stopper.update(1.0));
        assert!(!stopper.update(0.9995));
        assert!(stopper.update(0.9992));
    }
}
