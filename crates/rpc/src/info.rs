//! Introspection snapshots.

use serde::{Deserialize, Serialize};

/// How much detail an info snapshot carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Identity and configuration only.
    #[default]
    Basic,
    /// Everything, including live task and consumer state.
    Full,
}

/// A component that can describe itself as JSON.
pub trait InfoCollector: Send + Sync {
    /// Builds a snapshot at the requested scope.
    fn collect(&self, scope: Scope) -> serde_json::Value;
}
