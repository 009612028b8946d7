use std::fmt;

use serde::{Deserialize, Serialize};

/// What the device asked for: a logical sensor and one of its quantities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorRequest {
    pub sensor_name: String,
    pub column_name: String,
}

impl SensorRequest {
    pub fn new(sensor_name: impl Into<String>, column_name: impl Into<String>) -> Self {
        Self {
            sensor_name: sensor_name.into(),
            column_name: column_name.into(),
        }
    }
}

impl fmt::Display for SensorRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sensor_name, self.column_name)
    }
}

/// Produces synthetic readings.
///
/// Implementations should be a function of `request` and `elapsed` only and
/// must not block: the dispatch loop waits on them while the device waits on
/// the reply.
pub trait ValueSource: Send {
    fn compute(&self, request: &SensorRequest, elapsed: f64) -> f64;
}

/// Always answers `0`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZeroSource;

impl ValueSource for ZeroSource {
    fn compute(&self, _request: &SensorRequest, _elapsed: f64) -> f64 {
        0.0
    }
}

impl<F> ValueSource for F
where
    F: Fn(&SensorRequest, f64) -> f64 + Send,
{
    fn compute(&self, request: &SensorRequest, elapsed: f64) -> f64 {
        self(request, elapsed)
    }
}
