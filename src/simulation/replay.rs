//! Replay of a recorded flight as a value source.
//!
//! Reads the CSV export produced by OpenRocket:
//!
//! ```text
//! # Time (s),Altitude (m),Vertical velocity (m/s),Air pressure (mbar)
//! # Event LAUNCH occurred at t=0 seconds
//! 0,0,0,1013.25
//! 0.01,0.02,3.1,1013.24
//! # Event APOGEE occurred at t=12.4 seconds
//! ```
//!
//! Column labels lose their unit suffix and become snake_case (`time`,
//! `vertical_velocity`, `air_pressure`). Event comments are collected so they
//! can be turned into goals.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use csv::{ReaderBuilder, Trim};

use super::{Goal, SensorRequest, Simulation, SimulationEvent, ValueSource};

pub const TIME_COLUMN: &str = "time";

const EVENT_MARKER: &str = " occurred at t=";

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Replay data has no header line")]
    MissingHeader,

    #[error("Replay data has no '{}' column", TIME_COLUMN)]
    MissingTimeColumn,

    #[error("Line {line}: expected {expected} fields, found {found}")]
    ColumnCount { line: u64, expected: usize, found: usize },

    #[error("Line {line}: invalid number '{value}'")]
    InvalidNumber { line: u64, value: String },

    #[error("Replay data has no rows")]
    Empty,
}

#[derive(Debug, Clone)]
pub struct ReplaySource {
    columns: Vec<String>,
    column_index: HashMap<String, usize>,
    time_index: usize,
    rows: Vec<Vec<f64>>,
    events: Vec<SimulationEvent>,
}

impl ReplaySource {
    pub fn from_path(path: &Path) -> Result<Self, ReplayError> {
        let text = fs::read_to_string(path)?;
        let source = Self::parse(&text)?;
        log::info!(
            "Loaded replay {}: {} rows, {} columns, {} events",
            path.display(),
            source.rows.len(),
            source.columns.len(),
            source.events.len()
        );
        Ok(source)
    }

    pub fn parse(text: &str) -> Result<Self, ReplayError> {
        let mut lines = text.lines();
        let header = lines.next().ok_or(ReplayError::MissingHeader)?;
        let columns: Vec<String> = header
            .trim_matches(|c: char| c == '#' || c.is_whitespace())
            .split(',')
            .map(normalize_column)
            .collect();
        if columns.iter().all(String::is_empty) {
            return Err(ReplayError::MissingHeader);
        }
        let column_index: HashMap<String, usize> = columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        let time_index = *column_index.get(TIME_COLUMN).ok_or(ReplayError::MissingTimeColumn)?;

        let events = lines
            .filter(|line| line.trim_start().starts_with('#'))
            .filter_map(parse_event_annotation)
            .collect();

        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .comment(Some(b'#'))
            .trim(Trim::All)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            if record.len() != columns.len() {
                return Err(ReplayError::ColumnCount {
                    line,
                    expected: columns.len(),
                    found: record.len(),
                });
            }
            let row = record
                .iter()
                .map(|field| {
                    field.parse::<f64>().map_err(|_| ReplayError::InvalidNumber {
                        line,
                        value: field.to_string(),
                    })
                })
                .collect::<Result<Vec<f64>, _>>()?;
            rows.push(row);
        }
        if rows.is_empty() {
            return Err(ReplayError::Empty);
        }

        // OpenRocket exports pressure in mbar; sensors report pascals.
        if let Some(&pressure) = column_index.get("air_pressure") {
            for row in rows.iter_mut() {
                row[pressure] *= 100.0;
            }
        }

        Ok(Self {
            columns,
            column_index,
            time_index,
            rows,
            events,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn events(&self) -> &[SimulationEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Time of the last recorded row.
    pub fn duration(&self) -> f64 {
        self.rows.last().map(|row| row[self.time_index]).unwrap_or_default()
    }

    /// Value of `column` in the first row at or after `elapsed`; the last row
    /// once the recording has run out.
    pub fn value_at(&self, column: &str, elapsed: f64) -> Option<f64> {
        let index = *self.column_index.get(column)?;
        self.rows
            .iter()
            .find(|row| row[self.time_index] >= elapsed)
            .or_else(|| self.rows.last())
            .map(|row| row[index])
    }

    /// One goal per recorded event whose name is listed in `names`.
    pub fn goals_for<S: AsRef<str>>(&self, names: &[S], margin: f64) -> super::Result<Vec<Goal>> {
        self.events
            .iter()
            .filter(|event| names.iter().any(|name| name.as_ref() == event.name))
            .map(|event| Goal::new(event.clone(), margin))
            .collect()
    }

    /// Build a simulation replaying this data, with goals for `goal_names`.
    pub fn into_simulation<S: AsRef<str>>(
        self,
        name: impl Into<String>,
        goal_names: &[S],
        margin: f64,
    ) -> super::Result<Simulation> {
        let goals = self.goals_for(goal_names, margin)?;
        let mut simulation = Simulation::new(name, self);
        for goal in goals {
            simulation.add_goal(goal);
        }
        Ok(simulation)
    }
}

impl ValueSource for ReplaySource {
    fn compute(&self, request: &SensorRequest, elapsed: f64) -> f64 {
        match self.value_at(&request.column_name, elapsed) {
            Some(value) => value,
            None => {
                log::warn!("{} not in replay data, returning 0", request.column_name);
                0.0
            }
        }
    }
}

fn normalize_column(label: &str) -> String {
    let label = label.trim();
    let base = match label.rfind(' ') {
        Some(unit_start) => &label[..unit_start],
        None => label,
    };
    base.replace(' ', "_").replace(['(', ')'], "").to_lowercase()
}

fn parse_event_annotation(line: &str) -> Option<SimulationEvent> {
    let (before, after) = line.split_once(EVENT_MARKER)?;
    let name = before.split_whitespace().last()?;
    if !name.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
        return None;
    }
    let time = after.trim().strip_suffix("seconds")?.trim().parse::<f64>().ok()?;
    Some(SimulationEvent::new(name, time))
}
