//! Derived batch metrics and phase guardrails.

use crate::gateway::GatewayResponse;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rates and latency aggregates derived from one batch of responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    pub success_rate_pct: f64,
    pub error_rate_pct: f64,
    pub avg_elapsed: Duration,
    pub max_elapsed: Duration,
}

impl BatchMetrics {
    pub fn from_responses(responses: &[GatewayResponse]) -> Self {
        let total = responses.len();
        let successes = responses.iter().filter(|r| r.success).count();
        let failures = total - successes;
        let (success_rate_pct, error_rate_pct) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                successes as f64 / total as f64 * 100.0,
                failures as f64 / total as f64 * 100.0,
            )
        };
        let sum_elapsed: Duration = responses.iter().map(|r| r.elapsed).sum();
        let avg_elapsed =
            if total == 0 { Duration::ZERO } else { sum_elapsed / total as u32 };
        let max_elapsed = responses.iter().map(|r| r.elapsed).max().unwrap_or(Duration::ZERO);
        Self {
            total,
            successes,
            failures,
            success_rate_pct,
            error_rate_pct,
            avg_elapsed,
            max_elapsed,
        }
    }
}

/// Limits a phase may impose on its derived metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsGuardrails {
    pub max_error_rate_pct: Option<f64>,
    pub min_success_count: Option<usize>,
    pub max_avg_elapsed: Option<Duration>,
}

/// One guardrail breach.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailViolation {
    ErrorRateExceeded { observed_pct: f64, limit_pct: f64 },
    TooFewSuccesses { observed: usize, minimum: usize },
    AvgElapsedExceeded { observed: Duration, limit: Duration },
}

impl std::fmt::Display for GuardrailViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ErrorRateExceeded { observed_pct, limit_pct } => {
                write!(f, "error rate {:.1}% exceeds limit {:.1}%", observed_pct, limit_pct)
            }
            Self::TooFewSuccesses { observed, minimum } => {
                write!(f, "{} successes below minimum {}", observed, minimum)
            }
            Self::AvgElapsedExceeded { observed, limit } => {
                write!(f, "average latency {:?} exceeds limit {:?}", observed, limit)
            }
        }
    }
}

impl MetricsGuardrails {
    /// Evaluate every configured rule against `metrics`.
    pub fn check(&self, metrics: &BatchMetrics) -> Vec<GuardrailViolation> {
        let mut violations = Vec::new();
        if let Some(limit) = self.max_error_rate_pct {
            if metrics.error_rate_pct > limit {
                violations.push(GuardrailViolation::ErrorRateExceeded {
                    observed_pct: metrics.error_rate_pct,
                    limit_pct: limit,
                });
            }
        }
        if let Some(minimum) = self.min_success_count {
            if metrics.successes < minimum {
                violations.push(GuardrailViolation::TooFewSuccesses {
                    observed: metrics.successes,
                    minimum,
                });
            }
        }
        if let Some(limit) = self.max_avg_elapsed {
            if metrics.avg_elapsed > limit {
                violations.push(GuardrailViolation::AvgElapsedExceeded {
                    observed: metrics.avg_elapsed,
                    limit,
                });
            }
        }
        violations
    }
}
