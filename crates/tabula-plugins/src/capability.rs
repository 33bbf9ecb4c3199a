//! The capability model.
//!
//! A [`Capability`] is an extension point a plugin may implement. Each
//! capability carries static relationships defined here once: the
//! capabilities it depends on, the ones it conflicts with, its default
//! priority, and the permissions a plugin must declare to claim it.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tabula_sandbox::PermissionSet;

/// A named extension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Contributes spreadsheet views.
    ViewProvider,
    /// Contributes cell field types.
    FieldType,
    /// Contributes formula functions.
    Formula,
    /// Reacts to data events.
    Trigger,
    /// Performs actions on data.
    Action,
    /// Contributes user commands.
    Command,
    /// Connects an external data source.
    DataSource,
    /// Authenticates users.
    AuthProvider,
    /// Runs work on a schedule.
    ScheduledJob,
    /// Delivers notifications.
    NotificationChannel,
    /// Contributes a settings page.
    SettingsPage,
}

impl Capability {
    /// Every capability, in manifest declaration order.
    pub const ALL: [Self; 11] = [
        Self::ViewProvider,
        Self::FieldType,
        Self::Formula,
        Self::Trigger,
        Self::Action,
        Self::Command,
        Self::DataSource,
        Self::AuthProvider,
        Self::ScheduledJob,
        Self::NotificationChannel,
        Self::SettingsPage,
    ];

    /// Kebab-case tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ViewProvider => "view-provider",
            Self::FieldType => "field-type",
            Self::Formula => "formula",
            Self::Trigger => "trigger",
            Self::Action => "action",
            Self::Command => "command",
            Self::DataSource => "data-source",
            Self::AuthProvider => "auth-provider",
            Self::ScheduledJob => "scheduled-job",
            Self::NotificationChannel => "notification-channel",
            Self::SettingsPage => "settings-page",
        }
    }

    /// Capabilities that must also be available when this one is claimed.
    #[must_use]
    pub fn depends_on(self) -> &'static [Self] {
        match self {
            Self::ScheduledJob => &[Self::Trigger],
            Self::Trigger => &[Self::Action],
            Self::SettingsPage => &[Self::ViewProvider],
            _ => &[],
        }
    }

    /// Capabilities that may not be claimed together with this one.
    ///
    /// Only one side of each pair is listed; [`find_conflicts`] checks both
    /// directions.
    #[must_use]
    pub fn conflicts_with(self) -> &'static [Self] {
        match self {
            Self::AuthProvider => &[Self::DataSource],
            _ => &[],
        }
    }

    /// Default priority. Higher wins when several plugins implement the
    /// same capability.
    #[must_use]
    pub fn priority(self) -> i32 {
        match self {
            Self::AuthProvider => 100,
            Self::DataSource => 80,
            Self::FieldType => 60,
            Self::ViewProvider | Self::Formula => 50,
            Self::Action | Self::Trigger => 40,
            Self::Command => 30,
            Self::NotificationChannel | Self::ScheduledJob => 20,
            Self::SettingsPage => 10,
        }
    }

    /// Permissions a plugin must declare to claim this capability.
    #[must_use]
    pub fn required_permissions(self) -> &'static [&'static str] {
        match self {
            Self::ViewProvider | Self::FieldType | Self::Formula | Self::Command => &[],
            Self::DataSource => &["network", "database"],
            Self::AuthProvider => &["auth.credentials"],
            Self::Action => &["data.write"],
            Self::Trigger => &["events.subscribe"],
            Self::ScheduledJob => &["scheduler"],
            Self::NotificationChannel => &["notifications.send", "network"],
            Self::SettingsPage => &["config.write"],
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown capability tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown capability: {0}")]
pub struct UnknownCapability(pub String);

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCapability(s.to_owned()))
    }
}

/// The requested capabilities plus everything they transitively depend on.
///
/// Breadth-first over [`Capability::depends_on`]. Requested capabilities
/// keep their order; dependencies follow in discovery order.
#[must_use]
pub fn resolve_dependencies(capabilities: &[Capability]) -> Vec<Capability> {
    let mut seen: BTreeSet<Capability> = BTreeSet::new();
    let mut resolved = Vec::new();
    let mut queue: VecDeque<Capability> = capabilities.iter().copied().collect();

    while let Some(cap) = queue.pop_front() {
        if !seen.insert(cap) {
            continue;
        }
        resolved.push(cap);
        queue.extend(cap.depends_on().iter().copied());
    }
    resolved
}

/// The subset of `capabilities` that conflicts with another member of the set.
///
/// Symmetric: a pair is flagged when either side lists the other.
#[must_use]
pub fn find_conflicts(capabilities: &[Capability]) -> Vec<Capability> {
    let mut conflicting = Vec::new();
    for &cap in capabilities {
        let clashes = capabilities.iter().any(|&other| {
            other != cap
                && (cap.conflicts_with().contains(&other) || other.conflicts_with().contains(&cap))
        });
        if clashes && !conflicting.contains(&cap) {
            conflicting.push(cap);
        }
    }
    conflicting
}

/// Required permissions of `capabilities` that `granted` does not cover.
///
/// Wildcard grants (`*`, `prefix.*`) are honoured.
#[must_use]
pub fn missing_permissions(capabilities: &[Capability], granted: &PermissionSet) -> Vec<String> {
    granted.missing(
        capabilities
            .iter()
            .flat_map(|cap| cap.required_permissions().iter().copied()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depends_on_is_acyclic() {
        // Depth-first walk with an in-progress set; re-entering an
        // in-progress node would mean the static table has a cycle.
        fn visit(
            cap: Capability,
            visiting: &mut BTreeSet<Capability>,
            done: &mut BTreeSet<Capability>,
        ) {
            if done.contains(&cap) {
                return;
            }
            assert!(visiting.insert(cap), "capability cycle through {cap}");
            for &dep in cap.depends_on() {
                visit(dep, visiting, done);
            }
            visiting.remove(&cap);
            done.insert(cap);
        }

        let mut done = BTreeSet::new();
        for cap in Capability::ALL {
            visit(cap, &mut BTreeSet::new(), &mut done);
        }
        assert_eq!(done.len(), Capability::ALL.len());
    }

    #[test]
    fn test_serde_kebab_case() {
        let json = serde_json::to_string(&Capability::NotificationChannel).unwrap();
        assert_eq!(json, "\"notification-channel\"");
        let parsed: Capability = serde_json::from_str("\"field-type\"").unwrap();
        assert_eq!(parsed, Capability::FieldType);
    }

    #[test]
    fn test_from_str_round_trips_display() {
        for cap in Capability::ALL {
            assert_eq!(cap.to_string().parse::<Capability>().unwrap(), cap);
        }
        assert!("widget".parse::<Capability>().is_err());
    }

    #[test]
    fn test_resolve_dependencies_closure() {
        let resolved = resolve_dependencies(&[Capability::ScheduledJob]);
        assert_eq!(
            resolved,
            vec![Capability::ScheduledJob, Capability::Trigger, Capability::Action]
        );

        let resolved = resolve_dependencies(&[Capability::FieldType, Capability::Action]);
        assert_eq!(resolved, vec![Capability::FieldType, Capability::Action]);
    }

    #[test]
    fn test_resolve_dependencies_deduplicates() {
        let resolved = resolve_dependencies(&[Capability::Trigger, Capability::ScheduledJob]);
        assert_eq!(
            resolved,
            vec![Capability::Trigger, Capability::ScheduledJob, Capability::Action]
        );
    }

    #[test]
    fn test_find_conflicts_symmetric() {
        let conflicts = find_conflicts(&[Capability::DataSource, Capability::AuthProvider]);
        assert_eq!(conflicts, vec![Capability::DataSource, Capability::AuthProvider]);

        let conflicts = find_conflicts(&[Capability::DataSource, Capability::Formula]);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_missing_permissions() {
        let granted: PermissionSet = ["network"].into_iter().collect();
        let missing = missing_permissions(&[Capability::DataSource], &granted);
        assert_eq!(missing, vec!["database".to_owned()]);

        let granted: PermissionSet = ["*"].into_iter().collect();
        assert!(missing_permissions(&Capability::ALL, &granted).is_empty());

        let granted: PermissionSet = ["notifications.*", "network"].into_iter().collect();
        assert!(missing_permissions(&[Capability::NotificationChannel], &granted).is_empty());
    }

    #[test]
    fn test_field_type_needs_no_permissions() {
        assert!(missing_permissions(&[Capability::FieldType], &PermissionSet::new()).is_empty());
    }
}
