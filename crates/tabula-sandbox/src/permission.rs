//! Permission strings and wildcard matching.
//!
//! Permissions are dotted strings such as `network`, `data.write` or
//! `notifications.send`. A granted permission matches a required one when
//! they are equal, when the grant is `*`, or when the grant is `prefix.*`
//! and the requirement is `prefix` or starts with `prefix.`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Check whether a single granted permission covers `required`.
#[must_use]
pub fn permission_matches(granted: &str, required: &str) -> bool {
    if granted == "*" || granted == required {
        return true;
    }
    match granted.strip_suffix(".*") {
        Some(prefix) => {
            required == prefix
                || required
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'))
        },
        None => false,
    }
}

/// The set of permissions a plugin declared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<String>);

impl PermissionSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any granted permission covers `required`.
    #[must_use]
    pub fn allows(&self, required: &str) -> bool {
        self.0.iter().any(|granted| permission_matches(granted, required))
    }

    /// Requirements from `required` that no grant covers, in input order.
    #[must_use]
    pub fn missing<'a, I>(&self, required: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut missing: Vec<String> = Vec::new();
        for perm in required {
            if !self.allows(perm) && !missing.iter().any(|m| m == perm) {
                missing.push(perm.to_owned());
            }
        }
        missing
    }

    /// Add a permission.
    pub fn insert(&mut self, permission: impl Into<String>) {
        self.0.insert(permission.into());
    }

    /// Iterate over granted permissions.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Number of grants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is granted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_global_wildcard() {
        assert!(permission_matches("network", "network"));
        assert!(permission_matches("*", "data.write"));
        assert!(!permission_matches("network", "database"));
    }

    #[test]
    fn test_prefix_wildcard() {
        assert!(permission_matches("data.*", "data.write"));
        assert!(permission_matches("data.*", "data"));
        assert!(permission_matches("data.*", "data.rows.delete"));
        assert!(!permission_matches("data.*", "database"));
        assert!(!permission_matches("data.*", "metadata.read"));
    }

    #[test]
    fn test_missing_deduplicates() {
        let set: PermissionSet = ["network", "ui.*"].into_iter().collect();
        let missing = set.missing(["network", "ui.views", "data.write", "data.write"]);
        assert_eq!(missing, vec!["data.write".to_string()]);
    }

    #[test]
    fn test_serde_transparent() {
        let set: PermissionSet = serde_json::from_str(r#"["network","data.*"]"#).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.allows("data.read"));
    }
}
