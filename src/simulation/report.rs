use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Goal, Sample, Simulation};

/// Post-run snapshot consumed by plotting tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub name: String,
    pub time_scalar: f64,
    pub start_time: Option<f64>,
    pub finish_time: Option<f64>,
    pub elapsed: f64,
    pub goals: Vec<GoalReport>,
    pub history: BTreeMap<String, Vec<Sample>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalReport {
    pub name: String,
    pub target_time: f64,
    pub time_margin: f64,
    pub met: bool,
    pub missed: bool,
    pub met_at: Option<f64>,
}

impl From<&Goal> for GoalReport {
    fn from(goal: &Goal) -> Self {
        Self {
            name: goal.name().to_string(),
            target_time: goal.target_time(),
            time_margin: goal.time_margin(),
            met: goal.met(),
            missed: goal.missed(),
            met_at: goal.met_at(),
        }
    }
}

impl SimulationReport {
    pub fn from_simulation(simulation: &Simulation) -> Self {
        let clock = simulation.clock();
        Self {
            run_id: simulation.run_id(),
            generated_at: Utc::now(),
            name: simulation.name().to_string(),
            time_scalar: clock.time_scalar(),
            start_time: clock.start_time(),
            finish_time: clock.finish_time(),
            elapsed: clock.elapsed(),
            goals: simulation.goals().iter().map(GoalReport::from).collect(),
            history: simulation.history().clone(),
        }
    }

    pub fn all_goals_met(&self) -> bool {
        self.goals.iter().all(|g| g.met)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = self.to_json().map_err(std::io::Error::from)?;
        fs::write(path, json)?;
        log::info!("Wrote simulation report to {}", path.display());
        Ok(())
    }
}
