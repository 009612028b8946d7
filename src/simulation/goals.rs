use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Result, SimulationError};

/// A named occurrence at a simulation-relative time, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationEvent {
    pub name: String,
    pub time: f64,
}

impl SimulationEvent {
    pub fn new(name: impl Into<String>, time: f64) -> Self {
        Self {
            name: name.into(),
            time,
        }
    }
}

impl fmt::Display for SimulationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}s", self.name, self.time)
    }
}

/// Expectation that `event.name` is reported within `time_margin` of `event.time`.
///
/// A goal resolves exactly once, to either met or missed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    event: SimulationEvent,
    time_margin: f64,
    met: bool,
    missed: bool,
    met_at: Option<f64>,
}

impl Goal {
    pub fn new(event: SimulationEvent, time_margin: f64) -> Result<Self> {
        if !time_margin.is_finite() || time_margin < 0.0 {
            return Err(SimulationError::InvalidMargin(time_margin));
        }
        Ok(Self {
            event,
            time_margin,
            met: false,
            missed: false,
            met_at: None,
        })
    }

    pub fn event(&self) -> &SimulationEvent {
        &self.event
    }

    pub fn name(&self) -> &str {
        &self.event.name
    }

    pub fn target_time(&self) -> f64 {
        self.event.time
    }

    pub fn time_margin(&self) -> f64 {
        self.time_margin
    }

    pub fn met(&self) -> bool {
        self.met
    }

    pub fn missed(&self) -> bool {
        self.missed
    }

    /// Simulation time at which the goal was evaluated.
    pub fn met_at(&self) -> Option<f64> {
        self.met_at
    }

    pub fn is_resolved(&self) -> bool {
        self.met || self.missed
    }

    /// Inclusive acceptance window.
    pub fn window(&self) -> (f64, f64) {
        (self.event.time - self.time_margin, self.event.time + self.time_margin)
    }

    fn accepts(&self, event: &SimulationEvent) -> bool {
        !self.is_resolved() && self.event.name == event.name
    }

    fn resolve(&mut self, event_time: f64, now: f64) -> bool {
        let (low, high) = self.window();
        self.met = low <= event_time && event_time <= high;
        self.missed = !self.met;
        self.met_at = Some(now);
        self.met
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.met {
            "met"
        } else if self.missed {
            "missed"
        } else {
            "pending"
        };
        write!(f, "{} ±{}s [{}]", self.event, self.time_margin, state)
    }
}

/// Goals in evaluation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalSet {
    goals: Vec<Goal>,
}

impl GoalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, goal: Goal) -> &[Goal] {
        self.goals.push(goal);
        &self.goals
    }

    /// Resolve the earliest unresolved goal named like `event`.
    ///
    /// Returns `None` when no goal is eligible; nothing changes in that case.
    pub fn process_event(&mut self, event: &SimulationEvent, now: f64) -> Option<bool> {
        let goal = self.goals.iter_mut().find(|goal| goal.accepts(event))?;
        let met = goal.resolve(event.time, now);
        if met {
            log::info!("[{:.3}] Goal met: {}", now, goal);
        } else {
            log::warn!("[{:.3}] Goal missed: {} (reported at {}s)", now, goal, event.time);
        }
        Some(met)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Goal> {
        self.goals.iter()
    }

    pub fn as_slice(&self) -> &[Goal] {
        &self.goals
    }

    pub fn len(&self) -> usize {
        self.goals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }

    pub fn met_count(&self) -> usize {
        self.goals.iter().filter(|g| g.met).count()
    }

    pub fn missed_count(&self) -> usize {
        self.goals.iter().filter(|g| g.missed).count()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Goal> {
        self.goals.iter().filter(|g| !g.is_resolved())
    }

    pub fn all_met(&self) -> bool {
        self.goals.iter().all(|g| g.met)
    }
}

impl<'a> IntoIterator for &'a GoalSet {
    type Item = &'a Goal;
    type IntoIter = std::slice::Iter<'a, Goal>;

    fn into_iter(self) -> Self::IntoIter {
        self.goals.iter()
    }
}
