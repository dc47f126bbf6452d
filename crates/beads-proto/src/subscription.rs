//! The closed set of list subscription types and their parameters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A subscription type, as named on the wire (§4.2 of the bridge contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionType {
    AllIssues,
    Epics,
    IssuesForEpic,
    BlockedIssues,
    ReadyIssues,
    InProgressIssues,
    ClosedIssues,
}

impl SubscriptionType {
    /// The wire tag for this type, also used as the key prefix.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllIssues => "all-issues",
            Self::Epics => "epics",
            Self::IssuesForEpic => "issues-for-epic",
            Self::BlockedIssues => "blocked-issues",
            Self::ReadyIssues => "ready-issues",
            Self::InProgressIssues => "in-progress-issues",
            Self::ClosedIssues => "closed-issues",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "all-issues" => Self::AllIssues,
            "epics" => Self::Epics,
            "issues-for-epic" => Self::IssuesForEpic,
            "blocked-issues" => Self::BlockedIssues,
            "ready-issues" => Self::ReadyIssues,
            "in-progress-issues" => Self::InProgressIssues,
            "closed-issues" => Self::ClosedIssues,
            _ => return None,
        })
    }
}

/// A scalar parameter value (the only kinds §3 allows in a subscription's
/// `params` map).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    String(String),
    Number(f64),
    Bool(bool),
}

impl ParamValue {
    /// Renders this value the way `key_of` (§4.3) encodes it: natural JSON
    /// scalar form, no quoting.
    pub fn encode(&self) -> String {
        match self {
            ParamValue::String(s) => s.clone(),
            ParamValue::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            ParamValue::Bool(b) => b.to_string(),
        }
    }
}

/// Subscription parameters: an unordered map of scalar values. Order is
/// never significant (§4.3's determinism invariant); callers may construct
/// this from any iteration order.
pub type SubscriptionParams = BTreeMap<String, ParamValue>;

/// A full subscription spec: `(type, params)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSpec {
    pub kind: SubscriptionType,
    pub params: SubscriptionParams,
}

impl SubscriptionSpec {
    pub fn new(kind: SubscriptionType, params: SubscriptionParams) -> Self {
        Self { kind, params }
    }

    /// Convenience constructor for parameterless subscriptions.
    pub fn bare(kind: SubscriptionType) -> Self {
        Self {
            kind,
            params: SubscriptionParams::new(),
        }
    }
}
