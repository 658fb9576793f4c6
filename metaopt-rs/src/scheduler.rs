//! Learning rate schedules.

use candle_nn::Optimizer;

use crate::error::{MetaOptError, Result};

/// Piecewise-constant multiplier table keyed by epoch.
///
/// With breakpoints `[b0, b1, ..]` and multipliers `[r0, r1, ..]`, epochs
/// `< b0` use `r0`, epochs in `[b0, b1)` use `r1`, and so on. There is no
/// interpolation between entries.
#[derive(Debug, Clone, PartialEq)]
pub struct PiecewiseSchedule {
    breakpoints: Vec<usize>,
    multipliers: Vec<f64>,
}

impl PiecewiseSchedule {
    /// Create a schedule from breakpoints and multipliers.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Config`] unless there is exactly one more
    /// multiplier than breakpoints, breakpoints are strictly increasing and
    /// every multiplier is finite and non-negative.
    pub fn new(breakpoints: Vec<usize>, multipliers: Vec<f64>) -> Result<Self> {
        if multipliers.len() != breakpoints.len() + 1 {
            return Err(MetaOptError::config(format!(
                "learning rate schedule needs {} values for {} breakpoints, got {}",
                breakpoints.len() + 1,
                breakpoints.len(),
                multipliers.len()
            )));
        }
        if breakpoints.windows(2).any(|w| w[0] >= w[1]) {
            return Err(MetaOptError::config(format!(
                "learning rate breakpoints must be strictly increasing: {breakpoints:?}"
            )));
        }
        if multipliers.iter().any(|m| !m.is_finite() || *m < 0.0) {
            return Err(MetaOptError::config(format!(
                "learning rate values must be finite and non-negative: {multipliers:?}"
            )));
        }
        Ok(Self {
            breakpoints,
            multipliers,
        })
    }

    /// Parse whitespace-separated breakpoint and multiplier strings,
    /// e.g. `"20 40 50"` and `"1.0 0.06 0.012 0.0024"`.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Config`] for tokens that do not parse or an
    /// inconsistent table.
    pub fn parse(epochs: &str, values: &str) -> Result<Self> {
        let breakpoints = epochs
            .split_whitespace()
            .map(|tok| {
                tok.parse::<usize>().map_err(|e| {
                    MetaOptError::config(format!("invalid lr epoch '{tok}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let multipliers = values
            .split_whitespace()
            .map(|tok| {
                tok.parse::<f64>().map_err(|e| {
                    MetaOptError::config(format!("invalid lr value '{tok}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(breakpoints, multipliers)
    }

    /// Multiplier applied during `epoch`.
    #[must_use]
    pub fn multiplier(&self, epoch: usize) -> f64 {
        let idx = self.breakpoints.iter().take_while(|&&b| epoch >= b).count();
        self.multipliers[idx]
    }
}

/// Epoch-level learning rate scheduler.
pub struct LRScheduler {
    schedule: PiecewiseSchedule,
    base_lr: f64,
}

impl LRScheduler {
    /// Create a new scheduler.
    pub fn new(schedule: PiecewiseSchedule, base_lr: f64) -> Self {
        Self { schedule, base_lr }
    }

    /// Learning rate for `epoch`.
    #[must_use]
    pub fn get_lr(&self, epoch: usize) -> f64 {
        self.base_lr * self.schedule.multiplier(epoch)
    }

    /// Apply the rate for `epoch` to the optimizer and return it.
    pub fn step_epoch<O: Optimizer>(&self, epoch: usize, optimizer: &mut O) -> f64 {
        let lr = self.get_lr(epoch);
        optimizer.set_learning_rate(lr);
        lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_schedule() -> PiecewiseSchedule {
        PiecewiseSchedule::parse("20 40 50", "1.0 0.06 0.012 0.0024").unwrap()
    }

    #[test]
    fn test_table_lookup() {
        let schedule = default_schedule();
        assert_eq!(schedule.multiplier(10), 1.0);
        assert_eq!(schedule.multiplier(25), 0.06);
        assert_eq!(schedule.multiplier(45), 0.012);
        assert_eq!(schedule.multiplier(55), 0.0024);
    }

    #[test]
    fn test_boundaries_belong_to_next_segment() {
        let schedule = default_schedule();
        assert_eq!(schedule.multiplier(19), 1.0);
        assert_eq!(schedule.multiplier(20), 0.06);
        assert_eq!(schedule.multiplier(40), 0.012);
        assert_eq!(schedule.multiplier(50), 0.0024);
    }

    #[test]
    fn test_constant_schedule() {
        let schedule = PiecewiseSchedule::parse("", "0.5").unwrap();
        assert_eq!(schedule.multiplier(1), 0.5);
        assert_eq!(schedule.multiplier(1000), 0.5);
    }

    #[test]
    fn test_malformed_strings() {
        assert!(PiecewiseSchedule::parse("20 x", "1 2 3").is_err());
        assert!(PiecewiseSchedule::parse("20 40", "1 0.1").is_err());
        assert!(PiecewiseSchedule::parse("40 20", "1 0.1 0.01").is_err());
        assert!(PiecewiseSchedule::parse("20", "1 -0.1").is_err());
    }

    #[test]
    fn test_scheduler_scales_base_lr() {
        let scheduler = LRScheduler::new(default_schedule(), 0.1);
        assert!((scheduler.get_lr(1) - 0.1).abs() < 1e-12);
        assert!((scheduler.get_lr(25) - 0.006).abs() < 1e-12);
    }
}
