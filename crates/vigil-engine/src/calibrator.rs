//! Online recalibration of posture bounds.
//!
//! While a person holds a published posture, every feature that posture
//! bounds is sampled. Each round derives a candidate bound from the
//! interquartile range of the recent samples, widened by `iqr_tolerance`.
//! Only the ends a profile declares move; open ends stay open.
//!
//! A candidate is applied once two consecutive rounds agree within
//! `iqr_tolerance`. A round that disagrees with the previous one is a
//! spike and changes nothing. `rollback_after` consecutive spikes on any
//! bound return the profile to its baseline and restart sampling.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use vigil_models::BoundSpec;

use crate::classifier::{CalibrationProfile, PostureReading};
use crate::geometry::Feature;

/// Calibrator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibratorConfig {
    /// Samples kept per (posture, feature).
    pub window: usize,
    /// Samples needed before a bound is estimated.
    pub min_samples: usize,
    /// Time between recalibration rounds.
    pub update_interval: Duration,
    /// Widening around the quartiles; also the relative change between
    /// rounds that counts as a spike.
    pub iqr_tolerance: f64,
    pub rollback_after: u32,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        Self {
            window: 300,
            min_samples: 150,
            update_interval: Duration::from_secs(60),
            iqr_tolerance: 0.15,
            rollback_after: 3,
        }
    }
}

impl CalibratorConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let window = std::env::var("CALIBRATION_WINDOW")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.window)
            .max(4);
        Self {
            window,
            min_samples: window / 2,
            update_interval: std::env::var("CALIBRATION_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.update_interval),
            iqr_tolerance: std::env::var("CALIBRATION_IQR_TOLERANCE")
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|t| t.is_finite() && *t >= 0.0)
                .unwrap_or(defaults.iqr_tolerance),
            rollback_after: std::env::var("CALIBRATION_ROLLBACK_AFTER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.rollback_after)
                .max(1),
        }
    }
}

/// What one round did. Bounds are named `posture.feature`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationRound {
    pub updated: Vec<String>,
    pub spikes: Vec<String>,
    pub rolled_back: bool,
}

impl CalibrationRound {
    /// Whether the published profile changed.
    pub fn changed(&self) -> bool {
        self.rolled_back || !self.updated.is_empty()
    }
}

#[derive(Debug, Default)]
struct Series {
    samples: VecDeque<f64>,
    last_candidate: Option<BoundSpec>,
    spikes: u32,
}

/// Posture index within the profile, and the bounded feature.
type BoundKey = (usize, Feature);

/// Per-stream bound learner.
#[derive(Debug)]
pub struct ThresholdCalibrator {
    config: CalibratorConfig,
    baseline: Arc<CalibrationProfile>,
    current: Arc<CalibrationProfile>,
    series: HashMap<BoundKey, Series>,
    last_round: Option<Instant>,
}

impl ThresholdCalibrator {
    pub fn new(config: CalibratorConfig, baseline: Arc<CalibrationProfile>) -> Self {
        Self {
            config,
            current: Arc::clone(&baseline),
            baseline,
            series: HashMap::new(),
            last_round: None,
        }
    }

    pub fn config(&self) -> &CalibratorConfig {
        &self.config
    }

    /// Profile with the learned bounds.
    pub fn profile(&self) -> &Arc<CalibrationProfile> {
        &self.current
    }

    pub fn baseline(&self) -> &Arc<CalibrationProfile> {
        &self.baseline
    }

    /// Adopt a new baseline, as after a rule reload. Learned bounds and
    /// samples are dropped unless the baseline is unchanged.
    pub fn rebase(&mut self, baseline: Arc<CalibrationProfile>) {
        if *baseline == *self.baseline {
            return;
        }
        debug!(profile = %baseline.name, "Calibration baseline replaced");
        self.baseline = Arc::clone(&baseline);
        self.current = baseline;
        self.series.clear();
    }

    /// Record the bounded features of everyone holding a named posture.
    pub fn observe(&mut self, readings: &[PostureReading]) {
        let window = self.config.window.max(1);
        for reading in readings.iter().filter(|r| r.label.is_named()) {
            let Some(idx) = self.current.postures.iter().position(|p| p.label == reading.label) else {
                continue;
            };
            for (feature, _) in &self.current.postures[idx].bounds {
                let Some(value) = reading.features.get(*feature) else {
                    continue;
                };
                let series = self.series.entry((idx, *feature)).or_default();
                if series.samples.len() >= window {
                    series.samples.pop_front();
                }
                series.samples.push_back(value);
            }
        }
    }

    /// Samples held for `posture`'s `feature` bound.
    pub fn sample_count(&self, posture: &str, feature: Feature) -> usize {
        self.current
            .postures
            .iter()
            .position(|p| p.label.as_str() == posture)
            .and_then(|idx| self.series.get(&(idx, feature)))
            .map_or(0, |s| s.samples.len())
    }

    /// Run a round when `update_interval` has passed since the last one.
    /// The first call only starts the clock.
    pub fn maybe_recalibrate(&mut self, at: Instant) -> Option<CalibrationRound> {
        match self.last_round {
            Some(last) if at.saturating_duration_since(last) >= self.config.update_interval => {}
            Some(_) => return None,
            None => {
                self.last_round = Some(at);
                return None;
            }
        }
        self.last_round = Some(at);
        Some(self.recalibrate())
    }

    /// Run one round now.
    pub fn recalibrate(&mut self) -> CalibrationRound {
        let tolerance = self.config.iqr_tolerance;
        let mut round = CalibrationRound::default();
        let mut next = (*self.current).clone();
        let mut unstable = false;

        let mut keys: Vec<BoundKey> = self.series.keys().copied().collect();
        keys.sort();
        for key in keys {
            let Some(series) = self.series.get_mut(&key) else {
                continue;
            };
            if series.samples.len() < self.config.min_samples.max(1) {
                continue;
            }
            let (idx, feature) = key;
            let posture = &mut next.postures[idx];
            let Some(slot) = posture.bounds.iter_mut().find(|(f, _)| *f == feature) else {
                continue;
            };
            let name = format!("{}.{}", posture.label, feature);

            let mut sorted: Vec<f64> = series.samples.iter().copied().collect();
            let (q1, q3) = quartiles(&mut sorted);
            let candidate = BoundSpec {
                min: slot.1.min.map(|_| round4(q1 - tolerance * q1.abs())),
                max: slot.1.max.map(|_| round4(q3 + tolerance * q3.abs())),
            };

            match series.last_candidate.replace(candidate) {
                None => {}
                Some(previous) if drifted(&previous, &candidate, tolerance) => {
                    series.spikes += 1;
                    debug!(bound = %name, spikes = series.spikes, "Calibration spike");
                    unstable |= series.spikes >= self.config.rollback_after;
                    round.spikes.push(name);
                }
                Some(_) => {
                    series.spikes = 0;
                    if slot.1 != candidate {
                        info!(bound = %name, min = ?candidate.min, max = ?candidate.max, "Bound recalibrated");
                        slot.1 = candidate;
                        round.updated.push(name);
                    }
                }
            }
        }

        if unstable {
            warn!(profile = %self.baseline.name, spikes = ?round.spikes, "Calibration unstable, rolling back");
            self.rollback();
            round.updated.clear();
            round.rolled_back = true;
        } else if !round.updated.is_empty() {
            self.current = Arc::new(next);
        }
        round
    }

    /// Return to the baseline bounds and forget every sample.
    pub fn rollback(&mut self) {
        self.current = Arc::clone(&self.baseline);
        self.series.clear();
    }
}

/// 25th and 75th percentiles, linearly interpolated.
fn quartiles(values: &mut [f64]) -> (f64, f64) {
    values.sort_by(f64::total_cmp);
    (percentile(values, 0.25), percentile(values, 0.75))
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let pos = p * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
        }
    }
}

fn drifted(previous: &BoundSpec, candidate: &BoundSpec, tolerance: f64) -> bool {
    let moved = |a: Option<f64>, b: Option<f64>| match (a, b) {
        (Some(a), Some(b)) => (a - b).abs() / a.abs().max(1e-6) > tolerance,
        _ => false,
    };
    moved(previous.min, candidate.min) || moved(previous.max, candidate.max)
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
