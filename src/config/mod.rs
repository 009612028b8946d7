//! Run configuration, loadable from a JSON file.
//!
//! Every field has a default, so a file only needs the values it changes:
//!
//! ```json
//! {
//!   "server": { "port": "/dev/ttyACM0", "sensors_under_test": ["BME280"] },
//!   "simulation": { "time_scalar": 10, "goals": [{ "name": "APOGEE", "time": 5, "margin": 0.5 }] }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serial::protocol::ProtocolConfig;
use crate::serial::DEFAULT_BAUD_RATE;
use crate::simulation::{self, Goal, SimulationError, SimulationEvent};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: String,
    pub baud_rate: u32,
    pub sensors_under_test: Vec<String>,
    /// Echo protocol traffic at info level.
    pub debug: bool,
    /// Echo non-protocol device output.
    pub serial_monitor: bool,
    pub protocol: ProtocolConfig,
    /// Upper bound on how long `stop` waits for an idle reader.
    pub poll_interval_ms: u64,
    pub read_chunk: usize,
    pub max_partial_line: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            sensors_under_test: Vec::new(),
            debug: false,
            serial_monitor: true,
            protocol: ProtocolConfig::default(),
            poll_interval_ms: 25,
            read_chunk: 512,
            max_partial_line: 8192,
        }
    }
}

impl ServerConfig {
    pub fn new(port: impl Into<String>, sensors_under_test: Vec<String>) -> Self {
        Self {
            port: port.into(),
            sensors_under_test,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be non-zero".into()));
        }
        if self.protocol.prefix.is_empty() || self.protocol.separator.is_empty() {
            return Err(ConfigError::Invalid("protocol prefix and separator must be non-empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be non-zero".into()));
        }
        if self.read_chunk == 0 || self.max_partial_line < self.read_chunk {
            return Err(ConfigError::Invalid(
                "read_chunk must be non-zero and no larger than max_partial_line".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalConfig {
    pub name: String,
    pub time: f64,
    /// Falls back to `SimulationConfig::goal_margin`.
    #[serde(default)]
    pub margin: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub name: String,
    pub time_scalar: f64,
    pub goal_margin: f64,
    pub goals: Vec<GoalConfig>,
    /// OpenRocket CSV to replay instead of answering zeros.
    pub replay: Option<PathBuf>,
    /// Replay events that become goals.
    pub replay_goals: Vec<String>,
    /// Simulated seconds to run for; run until interrupted when absent.
    pub run_for: Option<f64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            name: simulation::DEFAULT_NAME.to_string(),
            time_scalar: 1.0,
            goal_margin: 1.0,
            goals: Vec::new(),
            replay: None,
            replay_goals: Vec::new(),
            run_for: None,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.time_scalar.is_finite() && self.time_scalar > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "time_scalar must be positive, got {}",
                self.time_scalar
            )));
        }
        let margins = std::iter::once(self.goal_margin).chain(self.goals.iter().filter_map(|g| g.margin));
        for margin in margins {
            if !(margin.is_finite() && margin >= 0.0) {
                return Err(ConfigError::Invalid(format!("goal margin must be non-negative, got {}", margin)));
            }
        }
        if let Some(run_for) = self.run_for {
            if !(run_for.is_finite() && run_for >= 0.0) {
                return Err(ConfigError::Invalid(format!("run_for must be non-negative, got {}", run_for)));
            }
        }
        Ok(())
    }

    pub fn goals(&self) -> std::result::Result<Vec<Goal>, SimulationError> {
        self.goals
            .iter()
            .map(|g| {
                Goal::new(
                    SimulationEvent::new(g.name.clone(), g.time),
                    g.margin.unwrap_or(self.goal_margin),
                )
            })
            .collect()
    }

    pub fn run_duration(&self) -> Option<Duration> {
        self.run_for.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub server: ServerConfig,
    pub simulation: SimulationConfig,
}

impl RunConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: RunConfig = serde_json::from_str(&contents)?;
        log::debug!("Loaded run configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.simulation.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_firmware_library() {
        let config = ServerConfig::default();
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.protocol.prefix, "@VS:");
        assert_eq!(config.protocol.separator, ":");
        assert!(config.serial_monitor);
        assert!(!config.debug);
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r##"{{
                "server": {{ "port": "COM5", "sensors_under_test": ["BME280"], "protocol": {{ "prefix": "#VS#" }} }},
                "simulation": {{ "time_scalar": 10, "goal_margin": 0.5,
                                 "goals": [{{ "name": "TEMP_ABOVE_5", "time": 5 }},
                                           {{ "name": "TEMP_ABOVE_7", "time": 7, "margin": 1.5 }}] }}
            }}"##
        )
        .unwrap();
        file.flush().unwrap();

        let config = RunConfig::from_path(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, "COM5");
        assert_eq!(config.server.baud_rate, 115200);
        assert_eq!(config.server.protocol.prefix, "#VS#");
        assert_eq!(config.server.protocol.separator, ":");

        let goals = config.simulation.goals().unwrap();
        assert_eq!(goals.len(), 2);
        assert_eq!(goals[0].time_margin(), 0.5);
        assert_eq!(goals[1].time_margin(), 1.5);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = RunConfig::default();
        config.simulation.time_scalar = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = RunConfig::default();
        config.server.protocol.separator.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = RunConfig::default();
        config.simulation.goals.push(GoalConfig {
            name: "X".into(),
            time: 1.0,
            margin: Some(-1.0),
        });
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
