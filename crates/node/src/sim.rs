//! Stateful air humidity / temperature simulator for local development.
//!
//! Models a cheap networked climate sensor:
//! - Temporal coherence via random walk with mean reversion
//! - Diurnal cycle (warm, dry afternoons; cool, humid nights)
//! - Per-reading electronic noise
//! - Scenario-driven faults (HTTP 500s, garbled bodies)

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Humidity around 45%. Programs always run.
    Dry,
    /// Humidity around 80% with wide swings; occasionally crosses 95%
    /// at night.
    Humid,
    /// Humidity pinned above 95%. Every program is skipped.
    Saturated,
    /// Dry weather, but ~10% of requests fail with 500 and ~5% return a
    /// garbled body.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "humid" => Self::Humid,
            "saturated" => Self::Saturated,
            "flaky" => Self::Flaky,
            _ => Self::Dry,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dry => write!(f, "dry"),
            Self::Humid => write!(f, "humid"),
            Self::Saturated => write!(f, "saturated"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

struct Profile {
    humidity_center: f64,
    humidity_walk: f64,
    humidity_floor: f64,
    temperature_center: f64,
    error_prob: f64,
    garbled_prob: f64,
}

impl Profile {
    fn for_scenario(scenario: Scenario) -> Self {
        let (humidity_center, humidity_walk, humidity_floor, temperature_center) = match scenario {
            Scenario::Dry | Scenario::Flaky => (45.0, 1.5, 5.0, 24.0),
            Scenario::Humid => (82.0, 2.5, 5.0, 19.0),
            Scenario::Saturated => (98.0, 0.5, 96.0, 15.0),
        };
        let (error_prob, garbled_prob) = match scenario {
            Scenario::Flaky => (0.10, 0.05),
            _ => (0.0, 0.0),
        };
        Self {
            humidity_center,
            humidity_walk,
            humidity_floor,
            temperature_center,
            error_prob,
            garbled_prob,
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub temperature: f64,
    pub humidity: f64,
}

/// What the endpoint should answer for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Response {
    Reading(Sample),
    ServerError,
    Garbled,
}

pub struct AirSim {
    profile: Profile,
    humidity: f64,
    temperature: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    diurnal_period_s: f64,
}

impl AirSim {
    /// `diurnal_period_s` controls the day/night cycle length. Use 600 for
    /// fast dev iteration or 86400 for real time.
    pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
        let profile = Profile::for_scenario(scenario);
        Self {
            humidity: profile.humidity_center,
            temperature: profile.temperature_center,
            profile,
            mean_reversion: 0.05,
            noise_sigma: 0.3,
            diurnal_period_s,
        }
    }

    /// Advance the model one step and decide the reply. `now_s` is the time
    /// of day in seconds, used only for the diurnal phase.
    pub fn next(&mut self, now_s: f64) -> Response {
        let roll = fastrand::f64();
        if roll < self.profile.error_prob {
            return Response::ServerError;
        }
        if roll < self.profile.error_prob + self.profile.garbled_prob {
            return Response::Garbled;
        }
        Response::Reading(self.sample(now_s))
    }

    pub fn sample(&mut self, now_s: f64) -> Sample {
        let p = &self.profile;

        // -- Evolve the base values ---------------------------------------
        let pull = self.mean_reversion * (p.humidity_center - self.humidity);
        self.humidity = (self.humidity + pull + gaussian(0.0, p.humidity_walk))
            .clamp(p.humidity_floor, 100.0);

        let pull = self.mean_reversion * (p.temperature_center - self.temperature);
        self.temperature = (self.temperature + pull + gaussian(0.0, 0.2)).clamp(-20.0, 45.0);

        // -- Instantaneous reading ----------------------------------------
        // Peaks at "afternoon" (quarter period): warmer and drier.
        let phase = 2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s;
        let diurnal = phase.sin();

        let humidity = (self.humidity - 8.0 * diurnal + gaussian(0.0, self.noise_sigma))
            .clamp(p.humidity_floor, 100.0);
        let temperature = self.temperature + 5.0 * diurnal + gaussian(0.0, self.noise_sigma);

        Sample {
            temperature: round1(temperature),
            humidity: round1(humidity),
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ===========================================================================
// Tests
// ===========================================================================
