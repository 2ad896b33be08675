//! Prediction targets: trip starts and trip ends per station-hour.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Start,
    End,
}

pub const ALL_SCENARIOS: [Scenario; 2] = [Scenario::Start, Scenario::End];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScenarioError {
    #[error("unsupported scenario: {0} (expected 'start' or 'end')")]
    UnsupportedScenario(String),
}

impl Scenario {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
        }
    }
}

pub fn parse_scenario(input: &str) -> Result<Scenario, ScenarioError> {
    match input.trim().to_ascii_lowercase().as_str() {
        "start" | "starts" => Ok(Scenario::Start),
        "end" | "ends" => Ok(Scenario::End),
        _ => Err(ScenarioError::UnsupportedScenario(input.to_string())),
    }
}

impl FromStr for Scenario {
    type Err = ScenarioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_scenario(s)
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
