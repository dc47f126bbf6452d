//! The normalized `Issue` shape (§3).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An issue as the core sees it: the two fields it reasons about
/// (`id`, `updated_at`) plus `closed_at` for the closed-issues pre-filter,
/// with every other field carried through opaque to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<i64>,
    /// Everything else (title, status, priority, type, assignee, labels,
    /// dependencies, dependents, description, design, acceptance, notes),
    /// echoed verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Issue {
    /// Same `updated_at` as `other`? Used by the diff law's tie-breaking
    /// rule (§8 invariant 2: ties are not updates).
    pub fn same_version_as(&self, other: &Issue) -> bool {
        self.updated_at == other.updated_at
    }
}
