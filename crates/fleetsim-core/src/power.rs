//! Power accounting.
//!
//! A [`PowerModel`] maps CPU utilization in `[0, 1]` to an instantaneous draw
//! in watts. Every model is monotonic in utilization. A [`PowerMeter`] sits
//! downstream of a host's CPU flow: each time the host's utilization changes
//! it integrates the previous draw into energy, so energy is exact for the
//! piecewise-constant rates the flow engine produces.

use serde::{Deserialize, Serialize};

/// Utilization-to-watts curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PowerModel {
    /// Same draw regardless of load.
    Constant { watts: f64 },
    /// `idle + (max - idle) * u`
    Linear { idle_watts: f64, max_watts: f64 },
    /// `idle + (max - idle) * u^2`
    Square { idle_watts: f64, max_watts: f64 },
    /// `idle + (max - idle) * u^3`
    Cubic { idle_watts: f64, max_watts: f64 },
    /// `idle + (max - idle) * sqrt(u)`
    Sqrt { idle_watts: f64, max_watts: f64 },
    /// Measured draw at evenly spaced utilization points from 0 to 1
    /// (e.g. 11 samples for 0%, 10%, ..., 100%), linearly interpolated.
    Interpolation { samples: Vec<f64> },
}

impl Default for PowerModel {
    fn default() -> Self {
        PowerModel::Linear {
            idle_watts: 200.0,
            max_watts: 350.0,
        }
    }
}

impl PowerModel {
    /// Draw in watts at `utilization`, clamped to `[0, 1]`.
    pub fn compute(&self, utilization: f64) -> f64 {
        let u = if utilization.is_nan() {
            0.0
        } else {
            utilization.clamp(0.0, 1.0)
        };
        match self {
            PowerModel::Constant { watts } => *watts,
            PowerModel::Linear {
                idle_watts,
                max_watts,
            } => idle_watts + (max_watts - idle_watts) * u,
            PowerModel::Square {
                idle_watts,
                max_watts,
            } => idle_watts + (max_watts - idle_watts) * u * u,
            PowerModel::Cubic {
                idle_watts,
                max_watts,
            } => idle_watts + (max_watts - idle_watts) * u.powi(3),
            PowerModel::Sqrt {
                idle_watts,
                max_watts,
            } => idle_watts + (max_watts - idle_watts) * u.sqrt(),
            PowerModel::Interpolation { samples } => interpolate(samples, u),
        }
    }

    /// Check that the curve is well formed and monotonic.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            PowerModel::Constant { watts } => {
                if !watts.is_finite() || *watts < 0.0 {
                    return Err(format!("constant power {} must be >= 0", watts));
                }
            }
            PowerModel::Linear {
                idle_watts,
                max_watts,
            }
            | PowerModel::Square {
                idle_watts,
                max_watts,
            }
            | PowerModel::Cubic {
                idle_watts,
                max_watts,
            }
            | PowerModel::Sqrt {
                idle_watts,
                max_watts,
            } => {
                if !idle_watts.is_finite() || *idle_watts < 0.0 {
                    return Err(format!("idle_watts {} must be >= 0", idle_watts));
                }
                if !max_watts.is_finite() || max_watts < idle_watts {
                    return Err(format!(
                        "max_watts ({}) must be >= idle_watts ({})",
                        max_watts, idle_watts
                    ));
                }
            }
            PowerModel::Interpolation { samples } => {
                if samples.len() < 2 {
                    return Err("interpolation needs at least 2 samples".to_string());
                }
                if samples.iter().any(|w| !w.is_finite() || *w < 0.0) {
                    return Err("interpolation samples must be finite and >= 0".to_string());
                }
                if samples.windows(2).any(|w| w[1] < w[0]) {
                    return Err("interpolation samples must be non-decreasing".to_string());
                }
            }
        }
        Ok(())
    }
}

fn interpolate(samples: &[f64], u: f64) -> f64 {
    match samples.len() {
        0 => 0.0,
        1 => samples[0],
        n => {
            let pos = u * (n - 1) as f64;
            let lo = (pos.floor() as usize).min(n - 2);
            let frac = pos - lo as f64;
            samples[lo] + (samples[lo + 1] - samples[lo]) * frac
        }
    }
}

/// Integrates a host's draw into energy.
#[derive(Debug, Clone, Serialize)]
pub struct PowerMeter {
    model: PowerModel,
    watts: f64,
    /// Joules since the last [`take_energy`](Self::take_energy).
    energy_joules: f64,
    last_update_ms: u64,
}

impl PowerMeter {
    /// A meter for a machine that is switched off.
    pub fn new(model: PowerModel, now_ms: u64) -> Self {
        Self {
            model,
            watts: 0.0,
            energy_joules: 0.0,
            last_update_ms: now_ms,
        }
    }

    pub fn model(&self) -> &PowerModel {
        &self.model
    }

    /// Current draw in watts.
    pub fn power_draw(&self) -> f64 {
        self.watts
    }

    /// The machine runs at `utilization` from `now_ms` on.
    pub fn update(&mut self, utilization: f64, now_ms: u64) {
        self.integrate(now_ms);
        self.watts = self.model.compute(utilization);
    }

    /// The machine draws nothing from `now_ms` on.
    pub fn set_off(&mut self, now_ms: u64) {
        self.integrate(now_ms);
        self.watts = 0.0;
    }

    /// Energy since the last read, without resetting.
    pub fn energy(&mut self, now_ms: u64) -> f64 {
        self.integrate(now_ms);
        self.energy_joules
    }

    /// Energy since the last read; starts a new accumulation period.
    pub fn take_energy(&mut self, now_ms: u64) -> f64 {
        self.integrate(now_ms);
        std::mem::take(&mut self.energy_joules)
    }

    fn integrate(&mut self, now_ms: u64) {
        if now_ms > self.last_update_ms {
            let dt = (now_ms - self.last_update_ms) as f64 / 1000.0;
            self.energy_joules += self.watts * dt;
            self.last_update_ms = now_ms;
        }
    }
}
