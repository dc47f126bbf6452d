//! C2: `(subscription-type, params) -> argv` and JSON normalization (§4.2).

use beads_proto::issue::Issue;
use beads_proto::subscription::{ParamValue, SubscriptionSpec, SubscriptionType};
use chrono::DateTime;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapperError {
    #[error("subscription type `{0:?}` requires parameter `{1}`")]
    MissingParam(SubscriptionType, &'static str),
}

/// Builds the concrete argv for a subscription spec, per the §4.2 table.
/// Does not include the `--db` injection — that is `TrackerConfig`'s job,
/// applied by the caller right before invoking the CLI adapter.
pub fn argv_for(spec: &SubscriptionSpec) -> Result<Vec<String>, MapperError> {
    let argv = match spec.kind {
        SubscriptionType::AllIssues => vec!["list".to_string(), "--json".to_string()],
        SubscriptionType::Epics => vec![
            "list".to_string(),
            "--json".to_string(),
            "--type".to_string(),
            "epic".to_string(),
        ],
        SubscriptionType::IssuesForEpic => {
            let epic_id = require_param(spec, "epic_id")?;
            vec![
                "list".to_string(),
                "--json".to_string(),
                "--epic".to_string(),
                epic_id,
            ]
        }
        SubscriptionType::BlockedIssues => vec!["blocked".to_string(), "--json".to_string()],
        SubscriptionType::ReadyIssues => vec!["ready".to_string(), "--json".to_string()],
        SubscriptionType::InProgressIssues => vec![
            "list".to_string(),
            "--json".to_string(),
            "--status".to_string(),
            "in_progress".to_string(),
        ],
        SubscriptionType::ClosedIssues => vec![
            "list".to_string(),
            "--json".to_string(),
            "--status".to_string(),
            "closed".to_string(),
        ],
    };
    Ok(argv)
}

fn require_param(spec: &SubscriptionSpec, name: &'static str) -> Result<String, MapperError> {
    spec.params
        .get(name)
        .map(ParamValue::encode)
        .ok_or(MapperError::MissingParam(spec.kind, name))
}

/// Normalizes a raw JSON array returned by the CLI into the issue shape of
/// §3. Elements whose `id` is empty (or missing) are dropped.
pub fn normalize(raw: Value) -> Vec<Issue> {
    match raw {
        Value::Array(items) => items.into_iter().filter_map(normalize_one).collect(),
        other => normalize_one(other).into_iter().collect(),
    }
}

/// Normalizes a single JSON object into an `Issue`, used both by `normalize`
/// and by `show-issue`'s array-or-object reply (§4.7).
pub fn normalize_one(raw: Value) -> Option<Issue> {
    let Value::Object(mut obj) = raw else {
        return None;
    };

    let id = take_id(&mut obj)?;
    let updated_at = take_timestamp(&mut obj, "updated_at").unwrap_or(0);
    let closed_at = take_timestamp(&mut obj, "closed_at");

    Some(Issue {
        id,
        updated_at,
        closed_at,
        extra: obj,
    })
}

fn take_id(obj: &mut Map<String, Value>) -> Option<String> {
    let id = match obj.remove("id")? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if id.is_empty() { None } else { Some(id) }
}

/// Parses a timestamp field as epoch ms: a number is used as-is, a string is
/// parsed as RFC-3339, anything else (including absent/null) yields `None`
/// here and `0` is substituted by the caller for the required `updated_at`
/// field.
fn take_timestamp(obj: &mut Map<String, Value>, field: &str) -> Option<i64> {
    match obj.remove(field) {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}

/// The `closed-issues` pre-diff filter (§4.2): when `since` is a finite
/// positive number, retain only items whose `closed_at` is present and at
/// least `since`. Applied before the registry ever sees the items so that
/// "since" windows produce predictable snapshots (§4.2).
pub fn filter_closed_since(issues: Vec<Issue>, since: Option<f64>) -> Vec<Issue> {
    let Some(since) = since.filter(|s| s.is_finite() && *s > 0.0) else {
        return issues;
    };
    issues
        .into_iter()
        .filter(|issue| issue.closed_at.is_some_and(|c| (c as f64) >= since))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use beads_proto::subscription::SubscriptionParams;
    use serde_json::json;

    fn spec(kind: SubscriptionType, params: SubscriptionParams) -> SubscriptionSpec {
        SubscriptionSpec::new(kind, params)
    }

    #[test]
    fn all_issues_argv() {
        let argv = argv_for(&SubscriptionSpec::bare(SubscriptionType::AllIssues)).unwrap();
        assert_eq!(argv, vec!["list", "--json"]);
    }

    #[test]
    fn issues_for_epic_requires_epic_id() {
        let err = argv_for(&SubscriptionSpec::bare(SubscriptionType::IssuesForEpic)).unwrap_err();
        assert_eq!(err, MapperError::MissingParam(SubscriptionType::IssuesForEpic, "epic_id"));
    }

    #[test]
    fn issues_for_epic_argv_with_param() {
        let mut params = SubscriptionParams::new();
        params.insert("epic_id".to_string(), ParamValue::String("EPIC-1".to_string()));
        let argv = argv_for(&spec(SubscriptionType::IssuesForEpic, params)).unwrap();
        assert_eq!(argv, vec!["list", "--json", "--epic", "EPIC-1"]);
    }

    #[test]
    fn normalize_drops_empty_id() {
        let issues = normalize(json!([{"id": "", "updated_at": 1}, {"id": "A", "updated_at": 2}]));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].id, "A");
    }

    #[test]
    fn normalize_parses_numeric_and_string_timestamps() {
        let issues = normalize(json!([
            {"id": "A", "updated_at": 1000, "closed_at": "2024-01-01T00:00:00Z"},
        ]));
        assert_eq!(issues[0].updated_at, 1000);
        assert!(issues[0].closed_at.is_some());
    }

    #[test]
    fn normalize_defaults_missing_updated_at_to_zero() {
        let issues = normalize(json!([{"id": "A"}]));
        assert_eq!(issues[0].updated_at, 0);
        assert_eq!(issues[0].closed_at, None);
    }

    #[test]
    fn normalize_carries_extra_fields_through() {
        let issues = normalize(json!([{"id": "A", "updated_at": 1, "title": "Fix bug", "priority": 2}]));
        assert_eq!(issues[0].extra.get("title").unwrap(), "Fix bug");
        assert_eq!(issues[0].extra.get("priority").unwrap(), 2);
    }

    #[test]
    fn closed_issues_since_filter() {
        let issues = vec![
            Issue { id: "old".into(), updated_at: 1, closed_at: Some(8000), extra: Map::new() },
            Issue { id: "recent".into(), updated_at: 1, closed_at: Some(9900), extra: Map::new() },
            Issue { id: "open".into(), updated_at: 1, closed_at: None, extra: Map::new() },
        ];
        let filtered = filter_closed_since(issues, Some(9000.0));
        let ids: Vec<_> = filtered.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["recent"]);
    }

    #[test]
    fn closed_issues_no_filter_when_since_absent() {
        let issues = vec![Issue { id: "open".into(), updated_at: 1, closed_at: None, extra: Map::new() }];
        assert_eq!(filter_closed_since(issues.clone(), None).len(), 1);
        assert_eq!(filter_closed_since(issues, Some(-1.0)).len(), 1);
    }
}
