//! Session configuration: speed ranges, per-severity costs and counts.
//!
//! Defaults match the slider defaults of the interactive demo this crate
//! serves. Every value arriving from a client goes through
//! [`SessionConfig::validate`] before anything is generated or solved.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use utoipa::ToSchema;

use crate::emergency::Severity;

/// Default solve time limit: 30 seconds.
const DEFAULT_TIME_LIMIT_SECS: u64 = 30;

/// Upper bound on emergencies of one severity in a session.
pub const MAX_EMERGENCIES_PER_SEVERITY: i32 = 20;

/// Invalid ranges, counts or costs. Reported before any model is built.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid {name} range: min {min} must be positive and not exceed max {max}")]
    InvalidRange {
        name: &'static str,
        min: f64,
        max: f64,
    },
    #[error("emergency count for {severity} must not be negative (got {count})")]
    NegativeCount { severity: Severity, count: i32 },
    #[error("emergency count for {severity} must not exceed {max} (got {count})")]
    TooManyEmergencies {
        severity: Severity,
        count: i32,
        max: i32,
    },
    #[error("cost per km for {severity} must be a finite non-negative number (got {cost})")]
    InvalidCost { severity: Severity, cost: f64 },
    #[error("road network has {nodes} nodes, need at least {needed}")]
    NotEnoughNodes { nodes: usize, needed: usize },
}

/// Inclusive speed range in km/h.
///
/// # Examples
///
/// ```
/// use ambulance_routing::config::SpeedRange;
///
/// assert!(SpeedRange::new(20.0, 80.0).validate("capacity").is_ok());
/// assert!(SpeedRange::new(80.0, 20.0).validate("capacity").is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SpeedRange {
    pub min_kmh: f64,
    pub max_kmh: f64,
}

impl SpeedRange {
    pub fn new(min_kmh: f64, max_kmh: f64) -> Self {
        Self { min_kmh, max_kmh }
    }

    /// Fails unless `0 < min <= max` and both bounds are finite.
    pub fn validate(&self, name: &'static str) -> Result<(), ConfigError> {
        let finite = self.min_kmh.is_finite() && self.max_kmh.is_finite();
        if !finite || self.min_kmh <= 0.0 || self.min_kmh > self.max_kmh {
            return Err(ConfigError::InvalidRange {
                name,
                min: self.min_kmh,
                max: self.max_kmh,
            });
        }
        Ok(())
    }
}

/// Operating cost per kilometre for each severity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SeverityCosts {
    pub leve: f64,
    pub media: f64,
    pub critica: f64,
}

impl SeverityCosts {
    pub fn for_severity(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Leve => self.leve,
            Severity::Media => self.media,
            Severity::Critica => self.critica,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for severity in Severity::ALL {
            let cost = self.for_severity(severity);
            if !cost.is_finite() || cost < 0.0 {
                return Err(ConfigError::InvalidCost { severity, cost });
            }
        }
        Ok(())
    }
}

impl Default for SeverityCosts {
    fn default() -> Self {
        Self {
            leve: 100.0,
            media: 200.0,
            critica: 300.0,
        }
    }
}

/// Number of emergencies to generate per severity.
///
/// Signed so that a negative count coming from a client is reported as a
/// configuration error rather than a deserialization failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SeverityCounts {
    pub leve: i32,
    pub media: i32,
    pub critica: i32,
}

impl SeverityCounts {
    pub fn new(leve: i32, media: i32, critica: i32) -> Self {
        Self {
            leve,
            media,
            critica,
        }
    }

    pub fn for_severity(&self, severity: Severity) -> i32 {
        match severity {
            Severity::Leve => self.leve,
            Severity::Media => self.media,
            Severity::Critica => self.critica,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for severity in Severity::ALL {
            let count = self.for_severity(severity);
            if count < 0 {
                return Err(ConfigError::NegativeCount { severity, count });
            }
            if count > MAX_EMERGENCIES_PER_SEVERITY {
                return Err(ConfigError::TooManyEmergencies {
                    severity,
                    count,
                    max: MAX_EMERGENCIES_PER_SEVERITY,
                });
            }
        }
        Ok(())
    }

    /// Total emergencies requested. Negative counts contribute nothing.
    pub fn total(&self) -> usize {
        Severity::ALL
            .iter()
            .map(|&s| self.for_severity(s).max(0) as usize)
            .sum()
    }
}

impl Default for SeverityCounts {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}

/// Everything a session needs to generate emergencies and solve.
///
/// # Examples
///
/// ```
/// use ambulance_routing::config::SessionConfig;
///
/// let config = SessionConfig::default();
/// assert!(config.validate().is_ok());
/// assert_eq!(config.counts.total(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Range the required speed of each emergency is drawn from.
    pub required_speed: SpeedRange,
    /// Range the speed capacity of each street segment is drawn from.
    pub capacity: SpeedRange,
    pub costs: SeverityCosts,
    pub counts: SeverityCounts,
    /// Fixes the random generator for reproducible sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Stop the LP solver after this many seconds. `None` waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            required_speed: SpeedRange::new(30.0, 60.0),
            capacity: SpeedRange::new(20.0, 80.0),
            costs: SeverityCosts::default(),
            counts: SeverityCounts::default(),
            seed: None,
            time_limit_secs: Some(DEFAULT_TIME_LIMIT_SECS),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.required_speed.validate("required speed")?;
        self.capacity.validate("capacity")?;
        self.costs.validate()?;
        self.counts.validate()
    }

    /// Sets a fixed seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn solve_time_limit(&self) -> Option<Duration> {
        self.time_limit_secs.map(Duration::from_secs)
    }
}
