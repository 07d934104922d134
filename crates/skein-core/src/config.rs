//! Pipeline configuration.
//!
//! JSON documents deserialize into [`PipelineConfig`]; every field is
//! optional and falls back to the defaults below. `validate()` runs after
//! loading so a bad file fails at startup rather than mid-run.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compose::parallel::DEFAULT_DRAIN_GRACE;
use crate::domain::PipelineError;
use crate::middleware::{Backoff, RateLimiter, RetryPolicy};

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub retry: RetryConfig,
    /// Absent means no rate limiting.
    pub rate_limit: Option<RateLimitConfig>,
    pub parallel: ParallelConfig,
}

impl PipelineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, PipelineError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| PipelineError::Config(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        self.retry.validate()?;
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        Ok(())
    }
}

/// Retry settings. `base_delay_ms == 0` means no backoff; `multiplier == 1.0`
/// means a constant delay, anything above is exponential.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: Option<u64>,
    pub jitter: bool,
    pub honor_cancellation: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: None,
            jitter: false,
            honor_cancellation: true,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), PipelineError> {
        if self.max_attempts == 0 {
            return Err(PipelineError::Config("retry.max_attempts must be at least 1".into()));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(PipelineError::Config(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    pub fn to_policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.base_delay_ms);
        let backoff = if base.is_zero() {
            Backoff::None
        } else if self.multiplier == 1.0 && !self.jitter && self.max_delay_ms.is_none() {
            Backoff::Constant(base)
        } else {
            Backoff::Exponential {
                base,
                multiplier: self.multiplier,
                max: self.max_delay_ms.map(Duration::from_millis),
                jitter: self.jitter,
            }
        };
        RetryPolicy::default()
            .attempts(self.max_attempts)
            .backoff(backoff)
            .honor_cancellation(self.honor_cancellation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitConfig {
    pub permits: usize,
    pub interval_ms: u64,
}

impl RateLimitConfig {
    fn validate(&self) -> Result<(), PipelineError> {
        if self.permits == 0 {
            return Err(PipelineError::Config("rate_limit.permits must be at least 1".into()));
        }
        if self.interval_ms == 0 {
            return Err(PipelineError::Config("rate_limit.interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn build(&self) -> RateLimiter {
        RateLimiter::new(self.permits, Duration::from_millis(self.interval_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// How long cancelled children of a parallel group may keep running
    /// before they are aborted.
    pub drain_grace_ms: u64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            drain_grace_ms: DEFAULT_DRAIN_GRACE.as_millis() as u64,
        }
    }
}

impl ParallelConfig {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}
