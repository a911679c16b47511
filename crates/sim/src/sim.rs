//! Stateful INA219 power-monitor simulator for local development.
//!
//! Models what a zone sensor on the microgrid bus reports:
//! - Load current as a random walk with mean reversion around 1.2 A
//! - Bus voltage hovering around 15 V with its own slow wander
//! - Per-reading measurement noise and occasional load spikes
//! - Per-channel calibration offsets
//! - Power derived from the rounded current and voltage, as the firmware does

use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6. Bounded to ±6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Low noise, no spikes.
    Steady,
    /// Wide swings and frequent load spikes.
    Noisy,
    /// Steady readings, but the node periodically goes silent so the relay
    /// marks its zones stale.
    Dropout,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "noisy" => Self::Noisy,
            "dropout" => Self::Dropout,
            _ => Self::Steady,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steady => write!(f, "steady"),
            Self::Noisy => write!(f, "noisy"),
            Self::Dropout => write!(f, "dropout"),
        }
    }
}

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

pub const BASE_CURRENT_MA: f64 = 1200.0;
pub const BASE_VOLTAGE_V: f64 = 15.0;
pub const MIN_CURRENT_MA: f64 = 100.0;
pub const MIN_VOLTAGE_V: f64 = 5.0;

/// One instantaneous INA219 reading, already rounded for the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub current_ma: f64,
    pub voltage_v: f64,
    pub power_mw: f64,
}

struct ChannelState {
    /// Underlying load current before noise (mA).
    current: f64,
    /// Underlying bus voltage before noise (V).
    voltage: f64,
    /// Permanent shunt calibration error (mA).
    offset: f64,
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub struct PowerSim {
    channels: Vec<ChannelState>,

    walk_sigma_ma: f64,
    noise_sigma_ma: f64,
    mean_reversion: f64,

    volt_walk_sigma: f64,
    volt_noise_sigma: f64,

    spike_prob: f32,
    spike_ma: f64,
}

impl PowerSim {
    /// Create a simulator with one channel per zone.
    pub fn new(scenario: Scenario, channel_count: usize) -> Self {
        let (walk, noise, mean_rev, volt_walk, volt_noise, spike_prob, spike_ma) = match scenario
        {
            Scenario::Steady | Scenario::Dropout => (20.0, 10.0, 0.10, 0.05, 0.05, 0.0_f32, 0.0),
            Scenario::Noisy => (120.0, 80.0, 0.05, 0.40, 0.30, 0.05, 600.0),
        };

        let channels = (0..channel_count)
            .map(|_| ChannelState {
                current: BASE_CURRENT_MA + gaussian(0.0, 30.0),
                voltage: BASE_VOLTAGE_V + gaussian(0.0, 0.1),
                offset: gaussian(0.0, 15.0),
            })
            .collect();

        Self {
            channels,
            walk_sigma_ma: walk,
            noise_sigma_ma: noise,
            mean_reversion: mean_rev,
            volt_walk_sigma: volt_walk,
            volt_noise_sigma: volt_noise,
            spike_prob,
            spike_ma,
        }
    }

    /// Produce the next reading for the channel at `index`.
    ///
    /// The underlying state evolves with each call, so call this once per
    /// channel per tick.
    pub fn sample(&mut self, index: usize) -> Sample {
        let ch = &mut self.channels[index];

        // -- Evolve the underlying values ---------------------------------

        let pull = self.mean_reversion * (BASE_CURRENT_MA - ch.current);
        ch.current = (ch.current + pull + gaussian(0.0, self.walk_sigma_ma))
            .max(MIN_CURRENT_MA);

        let volt_pull = self.mean_reversion * (BASE_VOLTAGE_V - ch.voltage);
        ch.voltage = (ch.voltage + volt_pull + gaussian(0.0, self.volt_walk_sigma))
            .max(MIN_VOLTAGE_V);

        // -- Build the instantaneous reading ------------------------------

        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_ma).abs()
        } else {
            0.0
        };

        let current = ch.current + ch.offset + gaussian(0.0, self.noise_sigma_ma) + spike;
        let voltage = ch.voltage + gaussian(0.0, self.volt_noise_sigma);

        let current_ma = round_to(current.max(MIN_CURRENT_MA), 1);
        let voltage_v = round_to(voltage.max(MIN_VOLTAGE_V), 2);
        Sample {
            current_ma,
            voltage_v,
            power_mw: round_to(current_ma * voltage_v, 1),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

// ---------------------------------------------------------------------------
// Dropout schedule
// ---------------------------------------------------------------------------

/// Counts published messages and says when to go silent.
#[derive(Debug)]
pub struct Dropout {
    after: u32,
    pause: Duration,
    sent: u32,
}

impl Dropout {
    pub fn new(after: u32, pause: Duration) -> Self {
        Self {
            after,
            pause,
            sent: 0,
        }
    }

    /// Record one published message. Returns the silence to observe once
    /// `after` messages have gone out since the last pause. `after == 0`
    /// never pauses.
    pub fn record_sent(&mut self) -> Option<Duration> {
        if self.after == 0 {
            return None;
        }
        self.sent += 1;
        if self.sent >= self.after {
            self.sent = 0;
            Some(self.pause)
        } else {
            None
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
