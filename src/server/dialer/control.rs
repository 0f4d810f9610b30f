//! Predictive dialing control law.
//!
//! Decides how many concurrent calls to place per available operator,
//! adjusting the ratio with a proportional feedback term so the abandon
//! rate stays below the compliance target.

use serde::Serialize;

use crate::config::Settings;
use crate::models::CampaignStats;

/// Tuning constants for the dial-ratio feedback loop.
#[derive(Debug, Clone)]
pub struct DialerConfig {
    pub base_dial_ratio: f64,
    pub min_dial_ratio: f64,
    pub max_dial_ratio: f64,
    /// Compliance ceiling for `abandoned / (connected + abandoned)`.
    pub target_abandon_rate: f64,
    /// Below this many answered calls the base ratio is used as-is.
    pub sample_floor: i64,
    /// Gain of the proportional term.
    pub sensitivity: f64,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            base_dial_ratio: 3.0,
            min_dial_ratio: 1.0,
            max_dial_ratio: 5.0,
            target_abandon_rate: 0.03,
            sample_floor: 10,
            sensitivity: 10.0,
        }
    }
}

impl DialerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            base_dial_ratio: settings.default_dial_ratio,
            min_dial_ratio: settings.min_dial_ratio,
            max_dial_ratio: settings.max_dial_ratio,
            target_abandon_rate: settings.max_abandon_rate,
            sample_floor: settings.abandon_sample_floor,
            sensitivity: settings.abandon_sensitivity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DialingHealthStatus {
    Healthy,
    Warning,
    Critical,
}

/// Health view of the dialing operation for supervisors.
#[derive(Debug, Clone, Serialize)]
pub struct DialingHealth {
    pub status: DialingHealthStatus,
    pub current_abandon_rate: f64,
    pub target_abandon_rate: f64,
    pub recommended_dial_ratio: f64,
}

/// The proportional controller. Stateless; all inputs arrive per tick.
#[derive(Debug, Clone, Default)]
pub struct DialerOrchestrator {
    config: DialerConfig,
}

impl DialerOrchestrator {
    pub fn new(config: DialerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    /// Compute the dial ratio for the current stats.
    ///
    /// With fewer answered calls than the sample floor the base ratio is
    /// returned unchanged. Otherwise the ratio is scaled by
    /// `1 + sensitivity * (target - current)` and clamped to the
    /// configured bounds; with zero abandons a mild 1.1 boost applies.
    pub fn calculate_dial_ratio(&self, stats: &CampaignStats) -> f64 {
        let current = stats.abandon_rate();

        let total_answered = stats.connected_leads + stats.abandoned_leads;
        if total_answered < self.config.sample_floor {
            return self.config.base_dial_ratio;
        }

        let adjustment = if current > 0.0 {
            let error = self.config.target_abandon_rate - current;
            1.0 + error * self.config.sensitivity
        } else {
            1.1
        };

        (self.config.base_dial_ratio * adjustment)
            .clamp(self.config.min_dial_ratio, self.config.max_dial_ratio)
    }

    /// How many new calls to launch given the pool and in-flight state.
    pub fn calculate_calls_to_make(
        &self,
        available_operators: i64,
        dial_ratio: f64,
        pending_calls: i64,
    ) -> i64 {
        if available_operators <= 0 {
            return 0;
        }

        let target_calls = (available_operators as f64 * dial_ratio) as i64;
        (target_calls - pending_calls).max(0)
    }

    /// Launches stop entirely while the abandon rate exceeds 2x target.
    pub fn should_pause_dialing(&self, stats: &CampaignStats) -> bool {
        stats.abandon_rate() > self.config.target_abandon_rate * 2.0
    }

    pub fn get_dialing_health(&self, stats: &CampaignStats) -> DialingHealth {
        let current = stats.abandon_rate();
        let target = self.config.target_abandon_rate;

        let status = if current <= target {
            DialingHealthStatus::Healthy
        } else if current <= target * 1.5 {
            DialingHealthStatus::Warning
        } else {
            DialingHealthStatus::Critical
        };

        DialingHealth {
            status,
            current_abandon_rate: current,
            target_abandon_rate: target,
            recommended_dial_ratio: self.calculate_dial_ratio(stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LeadStatus;

    fn stats(connected: i64, abandoned: i64) -> CampaignStats {
        let mut s = CampaignStats::default();
        s.record(LeadStatus::Connected, connected);
        s.abandoned_leads = abandoned;
        s
    }

    fn orchestrator() -> DialerOrchestrator {
        DialerOrchestrator::new(DialerConfig::default())
    }

    #[test]
    fn base_ratio_below_sample_floor() {
        let o = orchestrator();
        // 9 answered calls: not enough data
        assert_eq!(o.calculate_dial_ratio(&stats(8, 1)), 3.0);
        // 10 answered calls: the control law kicks in
        let ratio = o.calculate_dial_ratio(&stats(9, 1));
        assert_ne!(ratio, 3.0);
    }

    #[test]
    fn high_abandon_rate_reduces_ratio() {
        let o = orchestrator();
        // 10/60 = 16.7% abandon rate, way above the 3% target
        let ratio = o.calculate_dial_ratio(&stats(50, 10));
        assert!(ratio < 3.0);
        assert!(ratio >= 1.0);
    }

    #[test]
    fn low_abandon_rate_increases_ratio() {
        let o = orchestrator();
        // 1/100 = 1% abandon rate, below target: ratio grows
        let ratio = o.calculate_dial_ratio(&stats(99, 1));
        assert!(ratio > 3.0);
        assert!(ratio <= 5.0);
    }

    #[test]
    fn zero_abandons_apply_mild_boost() {
        let o = orchestrator();
        let ratio = o.calculate_dial_ratio(&stats(50, 0));
        assert!((ratio - 3.3).abs() < 1e-9);
    }

    #[test]
    fn ratio_clamped_to_bounds() {
        let o = orchestrator();
        // Catastrophic abandon rate clamps at the minimum
        assert_eq!(o.calculate_dial_ratio(&stats(10, 90)), 1.0);
    }

    #[test]
    fn calls_to_make_arithmetic() {
        let o = orchestrator();
        assert_eq!(o.calculate_calls_to_make(4, 3.0, 0), 12);
        assert_eq!(o.calculate_calls_to_make(4, 3.0, 5), 7);
        // Already over target: never negative
        assert_eq!(o.calculate_calls_to_make(4, 3.0, 20), 0);
        // No operators, no calls
        assert_eq!(o.calculate_calls_to_make(0, 3.0, 0), 0);
        // Fractional targets floor
        assert_eq!(o.calculate_calls_to_make(3, 1.5, 0), 4);
    }

    #[test]
    fn pause_threshold_is_twice_target() {
        let o = orchestrator();
        // 16.7% > 6%
        assert!(o.should_pause_dialing(&stats(50, 10)));
        // 5% < 6%
        assert!(!o.should_pause_dialing(&stats(95, 5)));
        // Exactly at 2x target is not yet a pause
        assert!(!o.should_pause_dialing(&stats(94, 6)));
    }

    #[test]
    fn health_bands() {
        let o = orchestrator();
        assert_eq!(
            o.get_dialing_health(&stats(100, 0)).status,
            DialingHealthStatus::Healthy
        );
        // 4% is between target (3%) and 1.5x target (4.5%)
        assert_eq!(
            o.get_dialing_health(&stats(96, 4)).status,
            DialingHealthStatus::Warning
        );
        // 10% is critical
        assert_eq!(
            o.get_dialing_health(&stats(90, 10)).status,
            DialingHealthStatus::Critical
        );
    }

    #[test]
    fn health_reports_recommended_ratio() {
        let o = orchestrator();
        let health = o.get_dialing_health(&stats(50, 10));
        assert!(health.recommended_dial_ratio < 3.0);
        assert!((health.current_abandon_rate - 10.0 / 60.0).abs() < 1e-9);
    }
}
