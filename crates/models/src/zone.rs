use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Zone used when a caller does not name one.
pub const DEFAULT_ZONE: &str = "default";

/// Whether bitmap materialization is synchronous with tuple writes (SC) or
/// allowed to lag behind them (EC). Under EC the evaluator always falls back
/// to the tuple store on a bitmap miss, so decisions stay correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyMode {
    #[serde(rename = "SC")]
    Strong,
    #[serde(rename = "EC")]
    Eventual,
}

impl ConsistencyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsistencyMode::Strong => "SC",
            ConsistencyMode::Eventual => "EC",
        }
    }
}

impl Default for ConsistencyMode {
    fn default() -> Self {
        ConsistencyMode::Eventual
    }
}

impl fmt::Display for ConsistencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsistencyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SC" => Ok(ConsistencyMode::Strong),
            "EC" => Ok(ConsistencyMode::Eventual),
            other => Err(format!("Invalid consistency mode: {}", other)),
        }
    }
}
