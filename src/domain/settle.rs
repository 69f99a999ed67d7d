// Settle criteria and the sliding sample window
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SettleConfigError {
    #[error("tolerance must be a positive finite number, got {0}")]
    InvalidTolerance(f64),
    #[error("window and max_samples must be non-zero")]
    EmptyBudget,
    #[error("required_in_band ({required}) exceeds max_samples ({max_samples})")]
    RequiredExceedsBudget { required: usize, max_samples: usize },
    #[error("required_in_band ({required}) must be smaller than the window ({window})")]
    RequiredExceedsWindow { required: usize, window: usize },
}

/// When a setpoint counts as reached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettleConfig {
    pub tolerance: f64,
    pub required_in_band: usize,
    pub max_samples: usize,
    pub window: usize,
    /// Wall-clock deadline for a single wait. `None` keeps the sample-count
    /// budget as the only limit, so a stalled feed waits forever.
    pub max_wait: Option<Duration>,
}

impl SettleConfig {
    pub fn new(
        tolerance: f64,
        required_in_band: usize,
        max_samples: usize,
        window: usize,
    ) -> Result<Self, SettleConfigError> {
        if !tolerance.is_finite() || tolerance <= 0.0 {
            return Err(SettleConfigError::InvalidTolerance(tolerance));
        }
        if window == 0 || max_samples == 0 {
            return Err(SettleConfigError::EmptyBudget);
        }
        if required_in_band > max_samples {
            return Err(SettleConfigError::RequiredExceedsBudget {
                required: required_in_band,
                max_samples,
            });
        }
        if required_in_band >= window {
            return Err(SettleConfigError::RequiredExceedsWindow {
                required: required_in_band,
                window,
            });
        }
        Ok(Self {
            tolerance,
            required_in_band,
            max_samples,
            window,
            max_wait: None,
        })
    }

    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Open interval: readings exactly on `target ± tolerance` are out of band.
    pub fn in_band(&self, target: f64, value: f64) -> bool {
        target - self.tolerance < value && value < target + self.tolerance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettleStatus {
    Settled,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettleOutcome {
    pub status: SettleStatus,
    pub samples: usize,
    pub last_temperature: Option<f64>,
}

impl SettleOutcome {
    pub fn is_settled(&self) -> bool {
        self.status == SettleStatus::Settled
    }
}

/// Trailing window of temperature readings for one setpoint.
#[derive(Debug, Clone)]
pub struct SettleWindow {
    readings: VecDeque<f64>,
    capacity: usize,
}

impl SettleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            readings: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.readings.push_back(value);
        while self.readings.len() > self.capacity {
            self.readings.pop_front();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn latest(&self) -> Option<f64> {
        self.readings.back().copied()
    }

    pub fn count_in_band(&self, target: f64, config: &SettleConfig) -> usize {
        self.readings
            .iter()
            .filter(|&&value| config.in_band(target, value))
            .count()
    }
}

/// Window bookkeeping for a single wait: feed it readings until it reports a
/// verdict.
#[derive(Debug)]
pub struct SettleTracker {
    target: f64,
    config: SettleConfig,
    window: SettleWindow,
    samples: usize,
}

impl SettleTracker {
    pub fn new(target: f64, config: SettleConfig) -> Self {
        Self {
            target,
            config,
            window: SettleWindow::new(config.window),
            samples: 0,
        }
    }

    /// Record one reading. Returns the verdict once the wait is decided.
    pub fn observe(&mut self, temperature: f64) -> Option<SettleOutcome> {
        self.samples += 1;
        self.window.push(temperature);

        if self.window.count_in_band(self.target, &self.config) > self.config.required_in_band {
            return Some(self.finish(SettleStatus::Settled));
        }
        if self.samples >= self.config.max_samples {
            return Some(self.finish(SettleStatus::TimedOut));
        }
        None
    }

    pub fn finish(&self, status: SettleStatus) -> SettleOutcome {
        SettleOutcome {
            status,
            samples: self.samples,
            last_temperature: self.window.latest(),
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn window(&self) -> &SettleWindow {
        &self.window
    }
}
