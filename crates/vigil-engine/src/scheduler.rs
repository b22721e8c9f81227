//! Risk-adaptive sampling schedule.
//!
//! Each stream samples on a fixed grid `due(n) = anchor + n * interval`.
//! Slots are computed from the anchor, never by adding to "now", so a
//! stream that is served late does not drift. The interval follows the
//! stream's risk tier and widens for the least urgent tiers while the
//! inference batcher reports pressure.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use vigil_models::{RiskTier, Severity};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub high_interval: Duration,
    pub medium_interval: Duration,
    pub low_interval: Duration,
    /// Tier of a stream that does not name one.
    pub default_tier: RiskTier,
    /// Events at or above this severity escalate their stream.
    pub escalate_on: Severity,
    pub escalation_tier: RiskTier,
    /// How long an escalation lasts after the last escalating event.
    pub escalation_hold: Duration,
    /// Upper bound of the backpressure widening factor.
    pub max_widening: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            high_interval: Duration::from_secs(1),
            medium_interval: Duration::from_secs(2),
            low_interval: Duration::from_secs(5),
            default_tier: RiskTier::Medium,
            escalate_on: Severity::Critical,
            escalation_tier: RiskTier::High,
            escalation_hold: Duration::from_secs(300),
            max_widening: 8,
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            high_interval: env_secs("SCHEDULER_HIGH_INTERVAL_SECS", defaults.high_interval),
            medium_interval: env_secs("SCHEDULER_MEDIUM_INTERVAL_SECS", defaults.medium_interval),
            low_interval: env_secs("SCHEDULER_LOW_INTERVAL_SECS", defaults.low_interval),
            default_tier: std::env::var("SCHEDULER_DEFAULT_TIER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_tier),
            escalate_on: std::env::var("SCHEDULER_ESCALATE_ON")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.escalate_on),
            escalation_tier: std::env::var("SCHEDULER_ESCALATION_TIER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.escalation_tier),
            escalation_hold: env_secs("SCHEDULER_ESCALATION_HOLD_SECS", defaults.escalation_hold),
            max_widening: std::env::var("SCHEDULER_MAX_WIDENING")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_widening)
                .max(1),
        }
    }

    /// Base sampling interval of `tier`.
    pub fn interval_for(&self, tier: RiskTier) -> Duration {
        match tier {
            RiskTier::High => self.high_interval,
            RiskTier::Medium => self.medium_interval,
            RiskTier::Low => self.low_interval,
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .filter(|d| !d.is_zero())
        .unwrap_or(default)
}

/// Batcher load shared with every stream's scheduler.
///
/// Written by the batcher, read on every scheduling decision; plain
/// atomics keep both sides lock-free.
#[derive(Debug, Default)]
pub struct PressureGauge {
    level: AtomicU8,
    fill_permille: AtomicU32,
}

impl PressureGauge {
    pub const MAX_LEVEL: u8 = 3;

    pub fn new() -> Self {
        Self::default()
    }

    /// Pressure level for a queue fill ratio.
    pub fn level_for(fill: f64) -> u8 {
        if fill < 0.5 {
            0
        } else if fill < 0.75 {
            1
        } else if fill < 0.9 {
            2
        } else {
            Self::MAX_LEVEL
        }
    }

    /// Publish the current fill ratio. Returns the new level.
    pub fn publish_fill(&self, fill: f64) -> u8 {
        let fill = if fill.is_finite() { fill.clamp(0.0, 1.0) } else { 1.0 };
        let level = Self::level_for(fill);
        self.fill_permille.store((fill * 1000.0).round() as u32, Ordering::Relaxed);
        let previous = self.level.swap(level, Ordering::Relaxed);
        if previous != level {
            debug!(level, fill, "Inference pressure level changed");
        }
        level
    }

    pub fn level(&self) -> u8 {
        self.level.load(Ordering::Relaxed)
    }

    pub fn fill(&self) -> f64 {
        f64::from(self.fill_permille.load(Ordering::Relaxed)) / 1000.0
    }
}

/// An administratively forced tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ForcedTier {
    tier: RiskTier,
    until: Option<Instant>,
}

/// Sampling state of one stream. Owned by its worker.
#[derive(Debug, Clone)]
pub struct StreamSchedule {
    default_tier: RiskTier,
    escalated_until: Option<Instant>,
    forced: Option<ForcedTier>,
    anchor: Instant,
    interval: Duration,
    /// Index of the next pending slot.
    next_slot: u64,
    served: u64,
    missed_slots: u64,
}

impl StreamSchedule {
    fn new(default_tier: RiskTier, interval: Duration, start: Instant) -> Self {
        Self {
            default_tier,
            escalated_until: None,
            forced: None,
            anchor: start,
            interval,
            next_slot: 0,
            served: 0,
            missed_slots: 0,
        }
    }

    /// Instant of slot `n` on the current grid.
    pub fn due(&self, n: u64) -> Instant {
        self.anchor + slot_offset(self.interval, n)
    }

    pub fn anchor(&self) -> Instant {
        self.anchor
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn default_tier(&self) -> RiskTier {
        self.default_tier
    }

    pub fn served(&self) -> u64 {
        self.served
    }

    /// Slots skipped because the stream was served too late for them.
    pub fn missed_slots(&self) -> u64 {
        self.missed_slots
    }

    pub fn is_forced(&self) -> bool {
        self.forced.is_some()
    }

    pub fn escalated_until(&self) -> Option<Instant> {
        self.escalated_until
    }

    /// Tier in force at `now`: forced, else escalated, else default.
    pub fn tier_at(&self, config: &SchedulerConfig, now: Instant) -> RiskTier {
        if let Some(forced) = self.forced {
            if forced.until.map_or(true, |until| now < until) {
                return forced.tier;
            }
        }
        match self.escalated_until {
            Some(until) if now < until => {
                if self.default_tier.is_more_urgent_than(config.escalation_tier) {
                    self.default_tier
                } else {
                    config.escalation_tier
                }
            }
            _ => self.default_tier,
        }
    }

    /// Drop escalations and forced tiers whose hold has elapsed.
    fn expire(&mut self, now: Instant) {
        if self.forced.is_some_and(|f| f.until.is_some_and(|until| now >= until)) {
            self.forced = None;
        }
        if self.escalated_until.is_some_and(|until| now >= until) {
            self.escalated_until = None;
        }
    }

    /// Switch to `interval`, keeping the last served slot as the new origin.
    fn reanchor(&mut self, interval: Duration) {
        if interval == self.interval {
            return;
        }
        if self.next_slot > 0 {
            self.anchor = self.due(self.next_slot - 1);
            self.next_slot = 1;
        }
        self.interval = interval;
    }
}

fn slot_offset(interval: Duration, n: u64) -> Duration {
    let nanos = interval.as_nanos() * u128::from(n);
    let secs = u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX);
    Duration::new(secs, (nanos % 1_000_000_000) as u32)
}

/// Shared scheduling policy.
///
/// Holds configuration and the pressure gauge only; per-stream state lives
/// in each worker's [`StreamSchedule`], so no call here blocks.
#[derive(Debug, Clone)]
pub struct RiskScheduler {
    config: SchedulerConfig,
    pressure: Arc<PressureGauge>,
}

impl RiskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_gauge(config, Arc::new(PressureGauge::new()))
    }

    pub fn with_gauge(config: SchedulerConfig, pressure: Arc<PressureGauge>) -> Self {
        Self { config, pressure }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn pressure(&self) -> &Arc<PressureGauge> {
        &self.pressure
    }

    /// New schedule whose first slot is `start`.
    pub fn schedule(&self, default_tier: Option<RiskTier>, start: Instant) -> StreamSchedule {
        let tier = default_tier.unwrap_or(self.config.default_tier);
        StreamSchedule::new(tier, self.effective_interval(tier), start)
    }

    /// Widening factor for `tier` at the current pressure level.
    pub fn widening(&self, tier: RiskTier) -> u32 {
        let threshold = match tier {
            RiskTier::Low => 1,
            RiskTier::Medium => 2,
            RiskTier::High => return 1,
        };
        let level = self.pressure.level();
        if level < threshold {
            return 1;
        }
        let factor = 1u32 << u32::from(level - threshold + 1);
        factor.min(self.config.max_widening.max(1))
    }

    /// Interval of `tier` including backpressure widening.
    pub fn effective_interval(&self, tier: RiskTier) -> Duration {
        self.config.interval_for(tier) * self.widening(tier)
    }

    pub fn tier(&self, schedule: &StreamSchedule, now: Instant) -> RiskTier {
        schedule.tier_at(&self.config, now)
    }

    /// When the stream's next frame is due.
    ///
    /// Applies tier decay and the current widening first; a changed
    /// interval re-anchors the grid at the last served slot.
    pub fn next_due(&self, schedule: &mut StreamSchedule, now: Instant) -> Instant {
        schedule.expire(now);
        let tier = schedule.tier_at(&self.config, now);
        let interval = self.effective_interval(tier);
        if interval != schedule.interval {
            debug!(
                tier = %tier,
                from_ms = schedule.interval.as_millis() as u64,
                to_ms = interval.as_millis() as u64,
                "Sampling interval changed"
            );
            schedule.reanchor(interval);
        }
        schedule.due(schedule.next_slot)
    }

    /// Mark the pending slot served at `now`. Slots already in the past
    /// are skipped and counted. Returns the number skipped.
    pub fn complete(&self, schedule: &mut StreamSchedule, now: Instant) -> u64 {
        schedule.served += 1;
        schedule.next_slot += 1;

        if schedule.due(schedule.next_slot) >= now {
            return 0;
        }
        let elapsed = now.saturating_duration_since(schedule.anchor).as_nanos();
        let step = schedule.interval.as_nanos().max(1);
        let first_future = u64::try_from(elapsed.div_ceil(step)).unwrap_or(u64::MAX);
        let skipped = first_future.saturating_sub(schedule.next_slot);
        schedule.next_slot = first_future;
        schedule.missed_slots += skipped;
        skipped
    }

    /// Feed an emitted event's severity. Returns true if it escalated
    /// (or extended the escalation of) the stream.
    pub fn observe_event(&self, schedule: &mut StreamSchedule, severity: Severity, now: Instant) -> bool {
        if severity < self.config.escalate_on {
            return false;
        }
        let until = now + self.config.escalation_hold;
        if schedule.escalated_until.map_or(true, |current| current < now) {
            info!(
                tier = %self.config.escalation_tier,
                hold_secs = self.config.escalation_hold.as_secs(),
                "Escalating stream risk tier"
            );
        }
        schedule.escalated_until = Some(until);
        true
    }

    /// Force `tier` for `hold`, or until cleared when `hold` is `None`.
    pub fn force_tier(&self, schedule: &mut StreamSchedule, tier: RiskTier, hold: Option<Duration>, now: Instant) {
        schedule.forced = Some(ForcedTier {
            tier,
            until: hold.map(|h| now + h),
        });
    }

    pub fn clear_forced(&self, schedule: &mut StreamSchedule) {
        schedule.forced = None;
    }

    /// Restart the grid at `now`, as after a pause. Slots that passed while
    /// the stream was idle are not counted as missed.
    pub fn resume(&self, schedule: &mut StreamSchedule, now: Instant) {
        schedule.anchor = now;
        schedule.next_slot = 0;
    }

    /// Change the tier a stream decays back to.
    pub fn set_default_tier(&self, schedule: &mut StreamSchedule, tier: RiskTier) {
        schedule.default_tier = tier;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> RiskScheduler {
        RiskScheduler::new(SchedulerConfig {
            escalation_hold: Duration::from_secs(60),
            ..SchedulerConfig::default()
        })
    }

    #[test]
    fn test_due_is_computed_from_anchor() {
        let s = scheduler();
        let start = Instant::now();
        let schedule = s.schedule(Some(RiskTier::Medium), start);
        assert_eq!(schedule.due(0), start);
        assert_eq!(schedule.due(1_000_000), start + Duration::from_secs(2_000_000));

        let odd = StreamSchedule::new(RiskTier::Medium, Duration::from_millis(333), start);
        assert_eq!(odd.due(3000), start + Duration::from_secs(999));
    }

    #[test]
    fn test_late_service_does_not_drift() {
        let s = scheduler();
        let start = Instant::now();
        let mut schedule = s.schedule(Some(RiskTier::Medium), start);

        for n in 0..100u64 {
            let due = s.next_due(&mut schedule, start);
            assert_eq!(due, start + Duration::from_secs(2 * n));
            // Every tick is served 1.5 s late.
            let skipped = s.complete(&mut schedule, due + Duration::from_millis(1500));
            assert_eq!(skipped, 0);
        }
        assert_eq!(s.next_due(&mut schedule, start), start + Duration::from_secs(200));
        assert_eq!(schedule.missed_slots(), 0);
    }

    #[test]
    fn test_missed_slots_are_skipped() {
        let s = scheduler();
        let start = Instant::now();
        let mut schedule = s.schedule(Some(RiskTier::Medium), start);

        s.next_due(&mut schedule, start);
        // Slot 0 served 7 s late: slots 1..=3 (2, 4, 6 s) are gone.
        let skipped = s.complete(&mut schedule, start + Duration::from_secs(7));
        assert_eq!(skipped, 3);
        assert_eq!(schedule.missed_slots(), 3);
        assert_eq!(s.next_due(&mut schedule, start), start + Duration::from_secs(8));

        // Served exactly at the next slot boundary keeps that slot.
        s.complete(&mut schedule, start + Duration::from_secs(10));
        assert_eq!(s.next_due(&mut schedule, start), start + Duration::from_secs(10));
    }

    #[test]
    fn test_escalation_holds_and_decays() {
        let s = scheduler();
        let start = Instant::now();
        let mut schedule = s.schedule(Some(RiskTier::Low), start);

        assert!(!s.observe_event(&mut schedule, Severity::Warning, start));
        assert_eq!(s.tier(&schedule, start), RiskTier::Low);

        assert!(s.observe_event(&mut schedule, Severity::Critical, start));
        assert_eq!(s.tier(&schedule, start + Duration::from_secs(30)), RiskTier::High);

        // A second critical event extends the hold.
        s.observe_event(&mut schedule, Severity::Critical, start + Duration::from_secs(50));
        assert_eq!(s.tier(&schedule, start + Duration::from_secs(100)), RiskTier::High);
        assert_eq!(s.tier(&schedule, start + Duration::from_secs(110)), RiskTier::Low);
    }

    #[test]
    fn test_tier_change_reanchors_at_last_served_slot() {
        let s = scheduler();
        let start = Instant::now();
        let mut schedule = s.schedule(Some(RiskTier::Low), start);

        for _ in 0..3 {
            let due = s.next_due(&mut schedule, start);
            s.complete(&mut schedule, due);
        }
        // Slots 0, 5, 10 served; escalate just after the third.
        let now = start + Duration::from_secs(11);
        s.observe_event(&mut schedule, Severity::Critical, now);
        let due = s.next_due(&mut schedule, now);
        assert_eq!(due, start + Duration::from_secs(11));
        assert_eq!(schedule.anchor(), start + Duration::from_secs(10));
        assert_eq!(schedule.interval(), Duration::from_secs(1));

        s.complete(&mut schedule, due);
        assert_eq!(s.next_due(&mut schedule, due), start + Duration::from_secs(12));
    }

    #[test]
    fn test_widening_spares_high_tier() {
        let s = scheduler();
        assert_eq!(s.widening(RiskTier::Low), 1);

        s.pressure().publish_fill(0.6);
        assert_eq!(s.pressure().level(), 1);
        assert_eq!(s.widening(RiskTier::Low), 2);
        assert_eq!(s.widening(RiskTier::Medium), 1);

        s.pressure().publish_fill(0.8);
        assert_eq!(s.widening(RiskTier::Low), 4);
        assert_eq!(s.widening(RiskTier::Medium), 2);

        s.pressure().publish_fill(1.0);
        assert_eq!(s.widening(RiskTier::Low), 8);
        assert_eq!(s.widening(RiskTier::Medium), 4);
        assert_eq!(s.widening(RiskTier::High), 1);
        assert_eq!(s.effective_interval(RiskTier::Low), Duration::from_secs(40));
        assert_eq!(s.effective_interval(RiskTier::High), Duration::from_secs(1));
    }

    #[test]
    fn test_widening_capped() {
        let s = RiskScheduler::new(SchedulerConfig {
            max_widening: 3,
            ..SchedulerConfig::default()
        });
        s.pressure().publish_fill(0.95);
        assert_eq!(s.widening(RiskTier::Low), 3);
    }

    #[test]
    fn test_forced_tier_overrides_escalation() {
        let s = scheduler();
        let start = Instant::now();
        let mut schedule = s.schedule(None, start);
        assert_eq!(schedule.default_tier(), RiskTier::Medium);

        s.observe_event(&mut schedule, Severity::Critical, start);
        s.force_tier(&mut schedule, RiskTier::Low, Some(Duration::from_secs(10)), start);
        assert_eq!(s.tier(&schedule, start + Duration::from_secs(5)), RiskTier::Low);
        assert_eq!(s.tier(&schedule, start + Duration::from_secs(15)), RiskTier::High);

        s.force_tier(&mut schedule, RiskTier::Low, None, start);
        assert_eq!(s.tier(&schedule, start + Duration::from_secs(3600)), RiskTier::Low);
        s.clear_forced(&mut schedule);
        assert!(!schedule.is_forced());
        assert_eq!(s.tier(&schedule, start + Duration::from_secs(3600)), RiskTier::Medium);
    }

    #[test]
    fn test_resume_restarts_grid_without_missed_slots() {
        let s = scheduler();
        let start = Instant::now();
        let mut schedule = s.schedule(Some(RiskTier::Medium), start);
        let due = s.next_due(&mut schedule, start);
        s.complete(&mut schedule, due);

        let later = start + Duration::from_secs(61);
        s.resume(&mut schedule, later);
        assert_eq!(s.next_due(&mut schedule, later), later);
        assert_eq!(s.complete(&mut schedule, later), 0);
        assert_eq!(s.next_due(&mut schedule, later), later + Duration::from_secs(2));
        assert_eq!(schedule.missed_slots(), 0);
    }

    #[test]
    fn test_pressure_levels() {
        assert_eq!(PressureGauge::level_for(0.0), 0);
        assert_eq!(PressureGauge::level_for(0.5), 1);
        assert_eq!(PressureGauge::level_for(0.75), 2);
        assert_eq!(PressureGauge::level_for(0.9), 3);
        let gauge = PressureGauge::new();
        gauge.publish_fill(f64::NAN);
        assert_eq!(gauge.level(), 3);
        assert!((gauge.fill() - 1.0).abs() < 1e-9);
    }
}
