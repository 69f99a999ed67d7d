// Sweep domain model
use serde::Serialize;
use thiserror::Error;

use super::settle::SettleStatus;

#[derive(Debug, Error, PartialEq)]
pub enum SweepSpecError {
    #[error("sweep step must be a positive finite number, got {0}")]
    InvalidStep(f64),
    #[error("sweep bounds must be finite (start={start}, stop={stop})")]
    NonFiniteBounds { start: f64, stop: f64 },
    #[error("sweep would visit {points:e} setpoints, more than {max}", max = MAX_SETPOINTS)]
    TooManyPoints { points: f64 },
}

/// Upper bound on setpoints in one sweep.
pub const MAX_SETPOINTS: usize = 100_000;

/// Arithmetic sequence of setpoints, `stop` exclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepSpec {
    start: f64,
    stop: f64,
    step: f64,
}

impl SweepSpec {
    pub fn new(start: f64, stop: f64, step: f64) -> Result<Self, SweepSpecError> {
        if !start.is_finite() || !stop.is_finite() {
            return Err(SweepSpecError::NonFiniteBounds { start, stop });
        }
        if !step.is_finite() || step <= 0.0 {
            return Err(SweepSpecError::InvalidStep(step));
        }
        let points = ((stop - start) / step).ceil();
        if points > MAX_SETPOINTS as f64 {
            return Err(SweepSpecError::TooManyPoints { points });
        }
        Ok(Self { start, stop, step })
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    /// Number of setpoints: `ceil((stop - start) / step)`, zero for an empty range.
    ///
    /// The quotient is a float, so a span that is a whole number of steps can
    /// round up by one: `(20.0, 20.3, 0.1)` gives 4 points and the last one lands
    /// on `stop`. Same count as `numpy.arange`.
    pub fn len(&self) -> usize {
        let span = (self.stop - self.start) / self.step;
        if span <= 0.0 { 0 } else { span.ceil() as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Setpoints in sweep order. Each one is computed from its index so rounding
    /// error does not accumulate across long sweeps.
    pub fn setpoints(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.len()).map(move |i| self.start + i as f64 * self.step)
    }
}

/// One completed setpoint, as handed to the sinks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepRecord {
    pub index: usize,
    pub setpoint: f64,
    pub measurement: f64,
    pub outcome: SettleStatus,
    pub samples: usize,
    pub last_temperature: Option<f64>,
    pub time_ms: i64,
}

/// A setpoint that was abandoned before a measurement was taken.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedSetpoint {
    pub index: usize,
    pub setpoint: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepSummary {
    pub settled: usize,
    pub timed_out: usize,
    pub skipped: Vec<SkippedSetpoint>,
}

impl SweepSummary {
    pub fn recorded(&self) -> usize {
        self.settled + self.timed_out
    }

    pub fn note(&mut self, record: &SweepRecord) {
        match record.outcome {
            SettleStatus::Settled => self.settled += 1,
            SettleStatus::TimedOut => self.timed_out += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_degree_sweep_has_two_points() {
        let sweep = SweepSpec::new(20.0, 21.0, 0.5).unwrap();
        assert_eq!(sweep.len(), 2);
        assert_eq!(sweep.setpoints().collect::<Vec<_>>(), vec![20.0, 20.5]);
    }

    #[test]
    fn test_stop_is_exclusive_and_partial_step_is_included() {
        let sweep = SweepSpec::new(20.0, 21.2, 0.5).unwrap();
        assert_eq!(sweep.setpoints().collect::<Vec<_>>(), vec![20.0, 20.5, 21.0]);
    }

    #[test]
    fn test_full_rig_sweep() {
        let sweep = SweepSpec::new(20.0, 40.0, 0.5).unwrap();
        assert_eq!(sweep.len(), 40);
        assert_eq!(sweep.setpoints().last(), Some(39.5));
    }

    #[test]
    fn test_empty_range() {
        let sweep = SweepSpec::new(25.0, 20.0, 0.5).unwrap();
        assert!(sweep.is_empty());
        assert_eq!(sweep.setpoints().count(), 0);
    }

    #[test]
    fn test_rejects_non_positive_step() {
        assert_eq!(SweepSpec::new(20.0, 21.0, 0.0), Err(SweepSpecError::InvalidStep(0.0)));
        assert_eq!(SweepSpec::new(20.0, 21.0, -0.5), Err(SweepSpecError::InvalidStep(-0.5)));
        assert!(SweepSpec::new(20.0, f64::INFINITY, 0.5).is_err());
    }

    #[test]
    fn test_rejects_sweeps_with_absurd_point_counts() {
        assert!(matches!(
            SweepSpec::new(20.0, 40.0, 1e-300),
            Err(SweepSpecError::TooManyPoints { .. })
        ));
        assert!(SweepSpec::new(0.0, MAX_SETPOINTS as f64, 1.0).is_ok());
        assert!(SweepSpec::new(0.0, MAX_SETPOINTS as f64 + 1.0, 1.0).is_err());
    }

    #[test]
    fn test_float_quotient_can_round_up_to_stop() {
        let sweep = SweepSpec::new(20.0, 20.3, 0.1).unwrap();
        assert_eq!(sweep.len(), 4);
        let last = sweep.setpoints().last().unwrap();
        assert!((last - 20.3).abs() < 1e-9);
    }
}
