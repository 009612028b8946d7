use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::{Result, SimulationError};

/// Wall-clock source, in seconds since the Unix epoch.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> f64;
}

/// Epoch time taken once at construction, advanced by a monotonic
/// `Instant` so readings never go backwards when the wall clock is stepped.
#[derive(Debug, Clone, Copy)]
pub struct SystemTimeSource {
    epoch_at_anchor: f64,
    anchor: Instant,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            epoch_at_anchor: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default(),
            anchor: Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> f64 {
        self.epoch_at_anchor + self.anchor.elapsed().as_secs_f64()
    }
}

/// Hand-driven clock for tests. Clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    bits: Arc<AtomicU64>,
}

impl ManualTimeSource {
    pub fn new(now: f64) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(now.to_bits())),
        }
    }

    pub fn set(&self, now: f64) {
        self.bits.store(now.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: f64) {
        self.set(self.now() + seconds);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

/// Start/finish bookkeeping and scaled elapsed time.
pub struct SimulationClock {
    source: Arc<dyn TimeSource>,
    start_time: Option<f64>,
    finish_time: Option<f64>,
    time_scalar: f64,
}

impl Default for SimulationClock {
    fn default() -> Self {
        Self {
            source: Arc::new(SystemTimeSource::new()),
            start_time: None,
            finish_time: None,
            time_scalar: 1.0,
        }
    }
}

impl SimulationClock {
    pub fn new(time_scalar: f64) -> Result<Self> {
        Self::with_time_source(Arc::new(SystemTimeSource::new()), time_scalar)
    }

    pub fn with_time_source(source: Arc<dyn TimeSource>, time_scalar: f64) -> Result<Self> {
        validate_scalar(time_scalar)?;
        Ok(Self {
            source,
            start_time: None,
            finish_time: None,
            time_scalar,
        })
    }

    pub fn set_time_source(&mut self, source: Arc<dyn TimeSource>) {
        self.source = source;
    }

    /// Only allowed before `start`, so elapsed time stays consistent.
    pub fn set_time_scalar(&mut self, time_scalar: f64) -> Result<()> {
        validate_scalar(time_scalar)?;
        if self.start_time.is_some() {
            return Err(SimulationError::AlreadyStarted);
        }
        self.time_scalar = time_scalar;
        Ok(())
    }

    pub fn time_scalar(&self) -> f64 {
        self.time_scalar
    }

    pub fn start_time(&self) -> Option<f64> {
        self.start_time
    }

    pub fn finish_time(&self) -> Option<f64> {
        self.finish_time
    }

    pub fn is_running(&self) -> bool {
        self.start_time.is_some() && self.finish_time.is_none()
    }

    pub fn start(&mut self) -> Result<()> {
        match (self.start_time, self.finish_time) {
            (None, _) => {
                self.start_time = Some(self.source.now());
                Ok(())
            }
            (Some(_), None) => Err(SimulationError::AlreadyStarted),
            (Some(_), Some(_)) => Err(SimulationError::AlreadyFinished),
        }
    }

    pub fn finish(&mut self) -> Result<()> {
        match (self.start_time, self.finish_time) {
            (None, _) => Err(SimulationError::NotStarted),
            (Some(_), Some(_)) => Err(SimulationError::AlreadyFinished),
            (Some(start), None) => {
                // Never let the frozen reading fall below zero.
                self.finish_time = Some(self.source.now().max(start));
                Ok(())
            }
        }
    }

    /// Zero before start, live while running, frozen after finish.
    pub fn elapsed(&self) -> f64 {
        match (self.start_time, self.finish_time) {
            (None, _) => 0.0,
            (Some(start), Some(finish)) => (finish - start) * self.time_scalar,
            (Some(start), None) => (self.source.now() - start).max(0.0) * self.time_scalar,
        }
    }

    /// Wall-clock time needed to cover `simulated` of simulation time.
    pub fn wall_duration(&self, simulated: Duration) -> Duration {
        Duration::try_from_secs_f64(simulated.as_secs_f64() / self.time_scalar).unwrap_or(Duration::MAX)
    }
}

fn validate_scalar(time_scalar: f64) -> Result<()> {
    if time_scalar.is_finite() && time_scalar > 0.0 {
        Ok(())
    } else {
        Err(SimulationError::InvalidTimeScalar(time_scalar))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(scalar: f64) -> (SimulationClock, ManualTimeSource) {
        let time = ManualTimeSource::new(1_700_000_000.0);
        let clock = SimulationClock::with_time_source(Arc::new(time.clone()), scalar).unwrap();
        (clock, time)
    }

    #[test]
    fn elapsed_is_zero_before_start() {
        let (clock, time) = clock(1.0);
        time.advance(30.0);
        assert_eq!(clock.elapsed(), 0.0);
        assert!(!clock.is_running());
    }

    #[test]
    fn elapsed_scales_and_freezes() {
        let (mut clock, time) = clock(10.0);
        clock.start().unwrap();
        time.advance(0.5);
        assert!((clock.elapsed() - 5.0).abs() < 1e-9);
        time.advance(0.25);
        let before_finish = clock.elapsed();
        assert!(before_finish >= 5.0);

        clock.finish().unwrap();
        let frozen = clock.elapsed();
        time.advance(100.0);
        assert_eq!(clock.elapsed(), frozen);
        assert!((frozen - 7.5).abs() < 1e-9);
    }

    #[test]
    fn lifecycle_misuse_is_reported() {
        let (mut clock, _time) = clock(1.0);
        assert!(matches!(clock.finish(), Err(SimulationError::NotStarted)));
        clock.start().unwrap();
        assert!(matches!(clock.start(), Err(SimulationError::AlreadyStarted)));
        assert!(matches!(clock.set_time_scalar(2.0), Err(SimulationError::AlreadyStarted)));
        clock.finish().unwrap();
        assert!(matches!(clock.finish(), Err(SimulationError::AlreadyFinished)));
        assert!(matches!(clock.start(), Err(SimulationError::AlreadyFinished)));
    }

    #[test]
    fn rejects_non_positive_scalar() {
        assert!(SimulationClock::new(0.0).is_err());
        assert!(SimulationClock::new(-1.0).is_err());
        assert!(SimulationClock::new(f64::NAN).is_err());
    }

    #[test]
    fn system_time_never_goes_backwards() {
        let source = SystemTimeSource::new();
        let mut last = source.now();
        assert!(last > 1_600_000_000.0);
        for _ in 0..1000 {
            let now = source.now();
            assert!(now >= last);
            last = now;
        }

        let mut clock = SimulationClock::new(1.0).unwrap();
        clock.start().unwrap();
        let first = clock.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert!(clock.elapsed() >= first);
    }

    #[test]
    fn wall_duration_divides_by_scalar() {
        let (clock, _time) = clock(100.0);
        assert_eq!(clock.wall_duration(Duration::from_secs(500)), Duration::from_secs(5));
    }
}
