//! Subscription key derivation (§4.3).
//!
//! `key_of(type, params)` is a pure function: two specs with the same
//! logical meaning, regardless of the order their params were supplied in,
//! produce identical keys. This is invariant 1 in §8 ("key determinism").

use std::fmt;

use crate::subscription::{SubscriptionParams, SubscriptionSpec};

/// A canonical, deterministic string identifying one subscription's
/// materialized state in the registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the canonical key for a subscription spec.
///
/// `type + "?" + joined(sort(params))`, each pair `name=value`, names
/// sorted lexicographically. Empty params yields just `type`.
pub fn key_of(spec: &SubscriptionSpec) -> SubscriptionKey {
    key_of_parts(spec.kind.as_str(), &spec.params)
}

fn key_of_parts(type_tag: &str, params: &SubscriptionParams) -> SubscriptionKey {
    if params.is_empty() {
        return SubscriptionKey(type_tag.to_string());
    }
    // `SubscriptionParams` is a `BTreeMap`, so iteration is already
    // lexicographic by name; no separate sort step is needed here.
    let joined = params
        .iter()
        .map(|(name, value)| format!("{name}={}", value.encode()))
        .collect::<Vec<_>>()
        .join("&");
    SubscriptionKey(format!("{type_tag}?{joined}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{ParamValue, SubscriptionType};

    #[test]
    fn bare_key_is_just_the_type() {
        let spec = SubscriptionSpec::bare(SubscriptionType::AllIssues);
        assert_eq!(key_of(&spec).as_str(), "all-issues");
    }

    #[test]
    fn params_are_sorted_regardless_of_insertion_order() {
        let mut a = SubscriptionParams::new();
        a.insert("status".to_string(), ParamValue::String("open".into()));
        a.insert("limit".to_string(), ParamValue::Number(50.0));

        let mut b = SubscriptionParams::new();
        b.insert("limit".to_string(), ParamValue::Number(50.0));
        b.insert("status".to_string(), ParamValue::String("open".into()));

        let key_a = key_of_parts("list", &a);
        let key_b = key_of_parts("list", &b);
        assert_eq!(key_a, key_b);
        assert_eq!(key_a.as_str(), "list?limit=50&status=open");
    }
}
