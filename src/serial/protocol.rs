//! Line protocol spoken by the device firmware.
//!
//! Protocol lines look like `@VS:REQ:BME280:temperature`: a fixed prefix, then
//! a command name and its arguments joined by a separator. Anything without the
//! prefix is console output from the sketch and is passed through untouched.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::simulation::SensorRequest;

pub const DEFAULT_PREFIX: &str = "@VS:";
pub const DEFAULT_SEPARATOR: &str = ":";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandName {
    IsTest,
    Request,
    Event,
    Log,
}

impl CommandName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::IsTest => "ISTEST",
            CommandName::Request => "REQ",
            CommandName::Event => "EVENT",
            CommandName::Log => "LOG",
        }
    }

    /// Case-sensitive lookup of a wire token.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "ISTEST" => Some(CommandName::IsTest),
            "REQ" => Some(CommandName::Request),
            "EVENT" => Some(CommandName::Event),
            "LOG" => Some(CommandName::Log),
            _ => None,
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    IsTest { sensor_name: String },
    Request(SensorRequest),
    Event { name: String },
    Log { text: String },
}

impl Command {
    pub fn name(&self) -> CommandName {
        match self {
            Command::IsTest { .. } => CommandName::IsTest,
            Command::Request(_) => CommandName::Request,
            Command::Event { .. } => CommandName::Event,
            Command::Log { .. } => CommandName::Log,
        }
    }
}

/// Classification of one received line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<'a> {
    Command(Command),
    Passthrough(&'a str),
    Blank,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("{command} is missing argument {argument}")]
    MissingArgument {
        command: CommandName,
        argument: &'static str,
    },
}

/// Host-to-device answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reply {
    Flag(bool),
    Value(f64),
}

impl Reply {
    /// Canonical wire form, newline terminated.
    pub fn encode(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Flag(flag) => write!(f, "{}", flag),
            // Keep extreme magnitudes short enough for the firmware's line buffer.
            Reply::Value(value) if *value != 0.0 && !(1e-6..1e15).contains(&value.abs()) => {
                write!(f, "{:e}", value)
            }
            Reply::Value(value) => write!(f, "{}", value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub prefix: String,
    pub separator: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            separator: DEFAULT_SEPARATOR.to_string(),
        }
    }
}

impl ProtocolConfig {
    pub fn new(prefix: impl Into<String>, separator: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            separator: separator.into(),
        }
    }

    /// Strip terminators and whitespace, then classify the line.
    pub fn decode_line<'a>(&self, raw: &'a str) -> Result<Frame<'a>, ProtocolError> {
        let line = raw.trim();
        if line.is_empty() {
            return Ok(Frame::Blank);
        }
        match line.strip_prefix(self.prefix.as_str()) {
            Some(body) => self.decode_command(body).map(Frame::Command),
            None => Ok(Frame::Passthrough(line)),
        }
    }

    /// Parse the part of a protocol line after the prefix.
    pub fn decode_command(&self, body: &str) -> Result<Command, ProtocolError> {
        // Only the whole line is trimmed; arguments are matched exactly.
        let (token, rest) = match body.split_once(self.separator.as_str()) {
            Some((token, rest)) => (token, Some(rest)),
            None => (body, None),
        };
        if token.is_empty() {
            return Err(ProtocolError::EmptyCommand);
        }
        let name = CommandName::from_token(token)
            .ok_or_else(|| ProtocolError::UnknownCommand(token.to_string()))?;

        let mut args = rest.unwrap_or_default().split(self.separator.as_str());
        let mut required = |argument: &'static str| -> Result<String, ProtocolError> {
            match args.next() {
                Some(arg) if !arg.is_empty() => Ok(arg.to_string()),
                _ => Err(ProtocolError::MissingArgument {
                    command: name,
                    argument,
                }),
            }
        };

        match name {
            // `ISTEST:` with an empty name still gets an answer so the
            // firmware never blocks on it.
            CommandName::IsTest => match rest {
                Some(rest) => {
                    let sensor_name = rest.split(self.separator.as_str()).next().unwrap_or_default();
                    Ok(Command::IsTest {
                        sensor_name: sensor_name.to_string(),
                    })
                }
                None => Err(ProtocolError::MissingArgument {
                    command: name,
                    argument: "sensor_name",
                }),
            },
            CommandName::Request => {
                let sensor_name = required("sensor_name")?;
                let column_name = required("column_name")?;
                Ok(Command::Request(SensorRequest::new(sensor_name, column_name)))
            }
            CommandName::Event => Ok(Command::Event {
                name: required("event_name")?,
            }),
            // LOG keeps its text verbatim, separators included.
            CommandName::Log => Ok(Command::Log {
                text: rest.unwrap_or_default().to_string(),
            }),
        }
    }

    /// Device-side framing of a command, as the firmware library emits it.
    pub fn encode_command(&self, command: &Command) -> String {
        let args: Vec<&str> = match command {
            Command::IsTest { sensor_name } => vec![sensor_name.as_str()],
            Command::Request(request) => vec![request.sensor_name.as_str(), request.column_name.as_str()],
            Command::Event { name } => vec![name.as_str()],
            Command::Log { text } => vec![text.as_str()],
        };
        let mut line = format!("{}{}", self.prefix, command.name());
        for arg in args {
            line.push_str(&self.separator);
            line.push_str(arg);
        }
        line.push('\n');
        line
    }
}
