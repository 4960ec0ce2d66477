//! Change log entries and listener subscriptions.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::value::{Context, Row};

/// Subscription table matching every table.
pub const WILDCARD: &str = "*";

/// Listener used by the replication engine.
pub const REPLICATION_LISTENER: &str = "replication";

/// Listener used by the migration engine.
pub const MIGRATION_LISTENER: &str = "migration";

/// Kind of mutation recorded in a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Row created.
    Create,
    /// Row updated; data holds the row after the update.
    Update,
    /// Row deleted; data holds the row before the delete.
    Delete,
}

impl Action {
    /// Lowercase name as stored by the drivers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(Error::UnknownAction(other.to_string())),
        }
    }
}

/// One change log row, delivered to exactly one listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Log sequence number; increases in insertion order per storage.
    pub id: u64,
    /// Physical table the mutation touched.
    pub table: String,
    /// Mutation kind.
    pub action: Action,
    /// Row snapshot.
    pub data: Row,
    /// Request context at mutation time.
    pub context: Context,
    /// Listener this entry is addressed to.
    pub listener: String,
}

/// A listener registration for one table or [`WILDCARD`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Subscription {
    /// Listener name.
    pub listener: String,
    /// Table name or `*`.
    pub table: String,
}

impl Subscription {
    /// Create a subscription.
    pub fn new(listener: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            listener: listener.into(),
            table: table.into(),
        }
    }

    /// Whether a mutation on `table` must be logged for this subscription.
    pub fn matches(&self, table: &str) -> bool {
        self.table == table || self.table == WILDCARD
    }
}

/// Distinct listeners interested in `table`.
///
/// A listener subscribed both to the table and to `*` still receives a
/// single entry per mutation.
pub fn listeners_for<'a>(
    subscriptions: impl IntoIterator<Item = &'a Subscription>,
    table: &str,
) -> Vec<String> {
    subscriptions
        .into_iter()
        .filter(|s| s.matches(table))
        .map(|s| s.listener.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Build the change rows for one mutation.
pub fn changes_for(
    listeners: &[String],
    table: &str,
    action: Action,
    data: &Row,
    context: &Context,
) -> Vec<Change> {
    listeners
        .iter()
        .map(|listener| Change {
            id: 0,
            table: table.to_string(),
            action,
            data: data.clone(),
            context: context.clone(),
            listener: listener.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parse() {
        assert_eq!("update".parse::<Action>().unwrap(), Action::Update);
        assert!(matches!(
            "upsert".parse::<Action>(),
            Err(Error::UnknownAction(a)) if a == "upsert"
        ));
        assert_eq!(Action::Delete.to_string(), "delete");
    }

    #[test]
    fn test_listeners_dedup() {
        let subs = vec![
            Subscription::new("replication", "app_post"),
            Subscription::new("replication", WILDCARD),
            Subscription::new("audit", WILDCARD),
            Subscription::new("migration", "app_other"),
        ];
        assert_eq!(listeners_for(&subs, "app_post"), vec!["audit", "replication"]);
        assert_eq!(listeners_for(&subs, "app_other"), vec!["audit", "migration", "replication"]);
    }
}
