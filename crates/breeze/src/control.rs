//! Position Controllers
//!
//! Turn a (current, desired) temperature pair into a vent opening in percent.
//! A higher reading than the set point opens the vent further.

use serde::{Deserialize, Serialize};

use crate::config::{ControlConfig, ControlPolicy, HysteresisConfig, PidConfig};

pub const MIN_POSITION: u8 = 0;
pub const MAX_POSITION: u8 = 100;

// ─────────────────────────────────────────────────────────────────────────────
// PID
// ─────────────────────────────────────────────────────────────────────────────

/// PID controller stepped once per telemetry update
///
/// `dt` is the fixed nominal step from the config, not the measured time
/// between updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidController {
    gains: PidConfig,
    integral: f64,
    previous_error: f64,
}

impl PidController {
    pub fn new(gains: PidConfig) -> Self {
        Self {
            gains,
            integral: 0.0,
            previous_error: 0.0,
        }
    }

    /// Raw controller output clamped to the position range
    pub fn output(&mut self, current: f32, desired: f32) -> f64 {
        let PidConfig { kp, ki, kd, dt } = self.gains;
        let error = f64::from(current) - f64::from(desired);

        self.integral += error * dt;
        let derivative = (error - self.previous_error) / dt;
        self.previous_error = error;

        (kp * error + ki * self.integral + kd * derivative)
            .clamp(f64::from(MIN_POSITION), f64::from(MAX_POSITION))
    }

    /// Output rounded to a whole percent
    pub fn compute(&mut self, current: f32, desired: f32) -> u8 {
        self.output(current, desired).round() as u8
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.previous_error = 0.0;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hysteresis
// ─────────────────────────────────────────────────────────────────────────────

/// Bang-bang controller with a dead-band around the set point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HysteresisController {
    thresholds: HysteresisConfig,
}

impl HysteresisController {
    pub fn new(thresholds: HysteresisConfig) -> Self {
        Self { thresholds }
    }

    /// Fully open above the band, fully closed below it, unchanged inside
    ///
    /// Inside the band with no known position there is nothing to keep, so
    /// the result is `None`.
    pub fn compute(&self, current: f32, desired: f32, position: Option<u8>) -> Option<u8> {
        if current > desired + self.thresholds.high_threshold {
            Some(MAX_POSITION)
        } else if current < desired - self.thresholds.low_threshold {
            Some(MIN_POSITION)
        } else {
            position
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

/// The controller a vent runs in auto mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum PositionController {
    Pid(PidController),
    Hysteresis(HysteresisController),
}

impl PositionController {
    pub fn from_config(config: &ControlConfig) -> Self {
        match config.policy {
            ControlPolicy::Pid => Self::Pid(PidController::new(config.pid)),
            ControlPolicy::Hysteresis => Self::Hysteresis(HysteresisController::new(config.hysteresis)),
        }
    }

    /// Target position, or `None` when the controller has no opinion
    pub fn compute(&mut self, current: f32, desired: f32, position: Option<u8>) -> Option<u8> {
        match self {
            Self::Pid(pid) => Some(pid.compute(current, desired)),
            Self::Hysteresis(h) => h.compute(current, desired, position),
        }
    }

    pub fn reset(&mut self) {
        if let Self::Pid(pid) = self {
            pid.reset();
        }
    }

    pub fn policy(&self) -> ControlPolicy {
        match self {
            Self::Pid(_) => ControlPolicy::Pid,
            Self::Hysteresis(_) => ControlPolicy::Hysteresis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_first_step() {
        let mut pid = PidController::new(PidConfig::default());
        let output = pid.output(26.0, 24.0);
        assert!((output - 4.1).abs() < 1e-9, "got {output}");
    }

    #[test]
    fn test_pid_accumulates_and_resets() {
        let mut pid = PidController::new(PidConfig::default());
        pid.output(26.0, 24.0);
        // error 2 again: 1.5*2 + 0.5*4 + 0.05*0
        let output = pid.output(26.0, 24.0);
        assert!((output - 5.0).abs() < 1e-9, "got {output}");

        pid.reset();
        assert_eq!(pid.integral(), 0.0);
        assert!((pid.output(26.0, 24.0) - 4.1).abs() < 1e-9);
    }

    #[test]
    fn test_pid_output_is_clamped() {
        let mut pid = PidController::new(PidConfig::default());
        assert_eq!(pid.compute(80.0, 20.0), MAX_POSITION);

        let mut pid = PidController::new(PidConfig::default());
        assert_eq!(pid.compute(18.0, 24.0), MIN_POSITION);
    }

    #[test]
    fn test_hysteresis_band() {
        let h = HysteresisController::new(HysteresisConfig::default());
        assert_eq!(h.compute(26.0, 24.0, Some(50)), Some(100));
        assert_eq!(h.compute(23.2, 24.0, Some(50)), Some(0));
        assert_eq!(h.compute(24.3, 24.0, Some(50)), Some(50));
        assert_eq!(h.compute(24.3, 24.0, None), None);
    }

    #[test]
    fn test_hysteresis_edges_stay_in_band() {
        let h = HysteresisController::new(HysteresisConfig::default());
        assert_eq!(h.compute(25.0, 24.0, Some(30)), Some(30));
        assert_eq!(h.compute(23.5, 24.0, Some(30)), Some(30));
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = ControlConfig::default();
        assert_eq!(
            PositionController::from_config(&config).policy(),
            ControlPolicy::Hysteresis
        );

        config.policy = ControlPolicy::Pid;
        let mut controller = PositionController::from_config(&config);
        assert_eq!(controller.compute(26.0, 24.0, None), Some(4));
    }
}
