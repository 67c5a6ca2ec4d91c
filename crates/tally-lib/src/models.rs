//! Core data models for event tallying

use serde::{Deserialize, Serialize};
use std::fmt;

/// Named event kinds produced by the event source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventName {
    #[serde(rename = "A")]
    A,
    #[serde(rename = "B")]
    B,
}

impl EventName {
    /// Every event name, in a fixed order
    pub const ALL: [EventName; 2] = [EventName::A, EventName::B];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::A => "A",
            EventName::B => "B",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
