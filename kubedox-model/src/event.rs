use serde::{Deserialize, Serialize};
use std::fmt;

/// Change classification attached to every registry notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    /// Object observed for the first time
    Add,
    /// Object modified; carries the new state
    Update,
    /// Object removed; carries the last known state
    Delete,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::Add => "add",
            Event::Update => "update",
            Event::Delete => "delete",
        };
        f.write_str(name)
    }
}
