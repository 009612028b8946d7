pub mod clock;
pub mod goals;
pub mod replay;
pub mod report;
pub mod source;

pub use clock::{ManualTimeSource, SimulationClock, SystemTimeSource, TimeSource};
pub use goals::{Goal, GoalSet, SimulationEvent};
pub use replay::{ReplayError, ReplaySource};
pub use report::{GoalReport, SimulationReport};
pub use source::{SensorRequest, ValueSource, ZeroSource};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

pub const DEFAULT_NAME: &str = "UNNAMED SIMULATION";

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("Simulation already started")]
    AlreadyStarted,

    #[error("Simulation not started")]
    NotStarted,

    #[error("Simulation already finished")]
    AlreadyFinished,

    #[error("Time scalar must be a positive number, got {0}")]
    InvalidTimeScalar(f64),

    #[error("Goal margin must be a non-negative number, got {0}")]
    InvalidMargin(f64),
}

pub type Result<T> = std::result::Result<T, SimulationError>;

/// One value handed to the device, at the simulation time it was produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: f64,
    pub value: f64,
}

/// A single test run: clock, value source, goals and the record of what was sent.
///
/// Goals and history are only mutated by whoever holds the simulation; when
/// shared with the dispatch loop that is the [`SimulationHandle`] lock.
pub struct Simulation {
    run_id: Uuid,
    name: String,
    clock: SimulationClock,
    source: Box<dyn ValueSource>,
    goals: GoalSet,
    history: BTreeMap<String, Vec<Sample>>,
}

impl Simulation {
    pub fn new(name: impl Into<String>, source: impl ValueSource + 'static) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            name: name.into(),
            clock: SimulationClock::default(),
            source: Box::new(source),
            goals: GoalSet::new(),
            history: BTreeMap::new(),
        }
    }

    pub fn with_time_scalar(mut self, time_scalar: f64) -> Result<Self> {
        self.clock.set_time_scalar(time_scalar)?;
        Ok(self)
    }

    pub fn with_time_source(mut self, source: Arc<dyn TimeSource>) -> Self {
        self.clock.set_time_source(source);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> &SimulationClock {
        &self.clock
    }

    pub fn goals(&self) -> &GoalSet {
        &self.goals
    }

    pub fn history(&self) -> &BTreeMap<String, Vec<Sample>> {
        &self.history
    }

    pub fn set_time_scalar(&mut self, time_scalar: f64) -> Result<()> {
        self.clock.set_time_scalar(time_scalar)
    }

    pub fn is_running(&self) -> bool {
        self.clock.is_running()
    }

    pub fn start(&mut self) -> Result<()> {
        self.clock.start()?;
        log::info!("Started simulation: {}", self.name);
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        self.clock.finish()?;
        log::info!(
            "Finished simulation: {} ({:.3}s simulated, {}/{} goals met, {} missed)",
            self.name,
            self.clock.elapsed(),
            self.goals.met_count(),
            self.goals.len(),
            self.goals.missed_count()
        );
        Ok(())
    }

    pub fn time_elapsed(&self) -> f64 {
        self.clock.elapsed()
    }

    /// Ask the value source for a reading; record it while the run is live.
    pub fn get_value(&mut self, request: &SensorRequest) -> f64 {
        let elapsed = self.clock.elapsed();
        let value = self.source.compute(request, elapsed);
        if self.clock.is_running() {
            self.history
                .entry(request.column_name.clone())
                .or_default()
                .push(Sample { time: elapsed, value });
        }
        value
    }

    pub fn add_goal(&mut self, goal: Goal) -> &[Goal] {
        log::info!("{}: Added goal {}", self.name, goal);
        self.goals.add(goal)
    }

    /// An event named `name` stamped with the current elapsed time.
    pub fn event_now(&self, name: impl Into<String>) -> SimulationEvent {
        SimulationEvent::new(name, self.clock.elapsed())
    }

    /// See [`GoalSet::process_event`]; `met_at` is the current elapsed time.
    pub fn process_event(&mut self, event: &SimulationEvent) -> Option<bool> {
        log::debug!("Got event {}", event);
        let now = self.clock.elapsed();
        self.goals.process_event(event, now)
    }

    pub fn report(&self) -> SimulationReport {
        SimulationReport::from_simulation(self)
    }
}

/// Shared access to a [`Simulation`] for the caller and the dispatch loop.
#[derive(Clone)]
pub struct SimulationHandle {
    inner: Arc<Mutex<Simulation>>,
}

impl SimulationHandle {
    pub fn new(simulation: Simulation) -> Self {
        Self {
            inner: Arc::new(Mutex::new(simulation)),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, Simulation> {
        self.inner.lock().await
    }

    pub async fn start(&self) -> Result<()> {
        self.inner.lock().await.start()
    }

    pub async fn finish(&self) -> Result<()> {
        self.inner.lock().await.finish()
    }

    /// Start, wait out `simulated` seconds of simulation time, then finish.
    pub async fn run_for(&self, simulated: Duration) -> Result<()> {
        let wall = {
            let mut simulation = self.inner.lock().await;
            simulation.start()?;
            simulation.clock().wall_duration(simulated)
        };
        tokio::time::sleep(wall).await;
        self.finish().await
    }

    pub async fn report(&self) -> SimulationReport {
        self.inner.lock().await.report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_simulation(scalar: f64) -> (Simulation, ManualTimeSource) {
        let time = ManualTimeSource::new(1_000.0);
        let sim = Simulation::new("test", |_: &SensorRequest, t: f64| t * 2.0)
            .with_time_source(Arc::new(time.clone()))
            .with_time_scalar(scalar)
            .unwrap();
        (sim, time)
    }

    #[test]
    fn history_is_only_recorded_while_running() {
        let (mut sim, time) = manual_simulation(1.0);
        let req = SensorRequest::new("BME280", "temperature");

        assert_eq!(sim.get_value(&req), 0.0);
        assert!(sim.history().is_empty());

        sim.start().unwrap();
        time.advance(1.5);
        assert_eq!(sim.get_value(&req), 3.0);
        time.advance(0.5);
        assert_eq!(sim.get_value(&req), 4.0);

        sim.finish().unwrap();
        time.advance(10.0);
        assert_eq!(sim.get_value(&req), 4.0);

        let samples = &sim.history()["temperature"];
        assert_eq!(
            samples,
            &vec![Sample { time: 1.5, value: 3.0 }, Sample { time: 2.0, value: 4.0 }]
        );
    }

    #[test]
    fn history_is_keyed_by_column() {
        let (mut sim, _time) = manual_simulation(1.0);
        sim.start().unwrap();
        sim.get_value(&SensorRequest::new("BME280", "temperature"));
        sim.get_value(&SensorRequest::new("BME280", "pressure"));
        sim.get_value(&SensorRequest::new("MS5611", "pressure"));
        assert_eq!(sim.history()["temperature"].len(), 1);
        assert_eq!(sim.history()["pressure"].len(), 2);
    }

    #[test]
    fn events_are_matched_against_scaled_time() {
        let (mut sim, time) = manual_simulation(10.0);
        sim.add_goal(Goal::new(SimulationEvent::new("APOGEE", 5.0), 0.5).unwrap());
        sim.start().unwrap();
        time.advance(0.51);

        let event = sim.event_now("APOGEE");
        assert!((event.time - 5.1).abs() < 1e-6);
        assert_eq!(sim.process_event(&event), Some(true));
        let goal = &sim.goals().as_slice()[0];
        assert!((goal.met_at().unwrap() - 5.1).abs() < 1e-6);
    }

    #[test]
    fn instances_do_not_share_goals() {
        let (mut a, _) = manual_simulation(1.0);
        let (b, _) = manual_simulation(1.0);
        a.add_goal(Goal::new(SimulationEvent::new("X", 1.0), 1.0).unwrap());
        assert_eq!(a.goals().len(), 1);
        assert!(b.goals().is_empty());
    }

    #[tokio::test]
    async fn handle_runs_to_completion() {
        let sim = Simulation::new("fast", ZeroSource).with_time_scalar(1000.0).unwrap();
        let handle = SimulationHandle::new(sim);
        handle.run_for(Duration::from_secs(20)).await.unwrap();

        {
            let sim = handle.lock().await;
            assert!(!sim.is_running());
            assert!(sim.time_elapsed() >= 19.0);
        }
        assert!(matches!(handle.start().await, Err(SimulationError::AlreadyFinished)));
    }
}
