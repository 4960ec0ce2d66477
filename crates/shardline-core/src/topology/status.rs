//! Topology lifecycle status.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Lifecycle of a topology version: `draft -> ready -> stale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyStatus {
    /// Being populated by a migration.
    Draft,
    /// Serving reads and writes.
    Ready,
    /// Superseded by a newer version.
    Stale,
}

impl TopologyStatus {
    /// Lowercase name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyStatus::Draft => "draft",
            TopologyStatus::Ready => "ready",
            TopologyStatus::Stale => "stale",
        }
    }

    /// Whether moving to `next` is allowed.
    pub fn can_transition_to(&self, next: TopologyStatus) -> bool {
        matches!(
            (self, next),
            (TopologyStatus::Draft, TopologyStatus::Ready)
                | (TopologyStatus::Ready, TopologyStatus::Stale)
        )
    }

    /// Validate a transition.
    pub fn transition(&self, next: TopologyStatus) -> Result<TopologyStatus, Error> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for TopologyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopologyStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(TopologyStatus::Draft),
            "ready" => Ok(TopologyStatus::Ready),
            "stale" => Ok(TopologyStatus::Stale),
            other => Err(Error::InvalidData(format!("unknown topology status: {}", other))),
        }
    }
}
