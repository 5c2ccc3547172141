//! Degradation rules - what each reduced mode takes away from the user
//!
//! The UI layer reads this table to explain why a feature is disabled or
//! limited while the store is not running on its durable backend.
use super::{Feature, OperatingMode, OperatingStatus};
use serde::Serialize;

/// How a feature is reduced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationType {
    /// Feature is unavailable
    Disabled,

    /// Feature works with reduced guarantees
    Limited,
}

/// One row of the degradation table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradationRule {
    pub feature: Feature,

    /// Mode the feature needs to be fully available
    pub required_mode: OperatingMode,
    pub degradation_type: DegradationType,
    pub message: &'static str,
}

impl DegradationRule {
    /// Get severity level (0-10, where 10 is most severe degradation)
    pub fn severity(&self) -> u8 {
        match (self.feature, self.degradation_type) {
            (Feature::Persistence, _) => 9,
            (Feature::Crud, DegradationType::Disabled) => 10,
            (Feature::Crud, DegradationType::Limited) => 6,
            (Feature::RecoverySnapshot, _) => 7,
            (Feature::History, _) => 4,
            (Feature::Search, _) => 3,
            (Feature::Pooling, _) => 2,
        }
    }
}

/// Static degradation table
pub const DEGRADATION_RULES: &[DegradationRule] = &[
    DegradationRule {
        feature: Feature::Persistence,
        required_mode: OperatingMode::Primary,
        degradation_type: DegradationType::Disabled,
        message: "Tickets are kept in memory only; they are protected by the recovery snapshot until the database is writable again",
    },
    DegradationRule {
        feature: Feature::Search,
        required_mode: OperatingMode::Primary,
        degradation_type: DegradationType::Disabled,
        message: "Full-text ticket search needs the database and is unavailable",
    },
    DegradationRule {
        feature: Feature::Pooling,
        required_mode: OperatingMode::Primary,
        degradation_type: DegradationType::Disabled,
        message: "Connection pooling is disabled; concurrent agents share one in-memory store",
    },
    DegradationRule {
        feature: Feature::History,
        required_mode: OperatingMode::Primary,
        degradation_type: DegradationType::Disabled,
        message: "Ticket history and audit trail are not recorded",
    },
    DegradationRule {
        feature: Feature::Crud,
        required_mode: OperatingMode::Primary,
        degradation_type: DegradationType::Limited,
        message: "Tickets can be created and edited, but changes are not durable",
    },
    DegradationRule {
        feature: Feature::RecoverySnapshot,
        required_mode: OperatingMode::Fallback,
        degradation_type: DegradationType::Disabled,
        message: "Recovery snapshots are paused while tickets are reconstructed",
    },
];

/// Rules in effect for a mode, most severe first
pub fn active_degradations(mode: OperatingMode) -> Vec<&'static DegradationRule> {
    let mut rules: Vec<_> = DEGRADATION_RULES
        .iter()
        .filter(|rule| mode.rank() > rule.required_mode.rank())
        .collect();
    rules.sort_by(|a, b| b.severity().cmp(&a.severity()));
    rules
}

/// Rules in effect for a status.
///
/// An alternate database keeps tickets durable, so the persistence and
/// CRUD rules do not apply there.
pub fn status_degradations(status: &OperatingStatus) -> Vec<&'static DegradationRule> {
    let on_alternate = status.on_alternate();
    active_degradations(status.mode)
        .into_iter()
        .filter(|rule| !(on_alternate && matches!(rule.feature, Feature::Persistence | Feature::Crud)))
        .collect()
}

fn alternate_note(status: &OperatingStatus) -> Option<String> {
    let path = status.backing_location.as_deref().filter(|_| status.on_alternate())?;
    Some(format!(
        "Tickets are written to the alternate database {}; they move back once the primary database is writable",
        path.display()
    ))
}

/// User-facing messages for a status
pub fn degradation_messages(status: &OperatingStatus) -> Vec<String> {
    let mut messages: Vec<String> = alternate_note(status)
        .map(|note| format!("{}: {}", Feature::Persistence, note))
        .into_iter()
        .collect();
    messages.extend(
        status_degradations(status)
            .into_iter()
            .map(|rule| format!("{}: {}", rule.feature, rule.message)),
    );
    messages
}

/// Generate a degradation summary for logs and the CLI
pub fn summary(status: &OperatingStatus) -> String {
    let rules = status_degradations(status);
    if rules.is_empty() {
        return "All features available".to_string();
    }

    let mut summary = format!("Reduced functionality ({} rules):\n", rules.len());
    if let Some(note) = alternate_note(status) {
        summary.push_str(&format!("  - {}\n", note));
    }
    for rule in rules {
        summary.push_str(&format!(
            "  - {} [{:?}] {}\n",
            rule.feature, rule.degradation_type, rule.message
        ));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn status(mode: OperatingMode, location: Option<&str>) -> OperatingStatus {
        OperatingStatus::initial(mode, location.map(PathBuf::from), "test")
    }

    #[test]
    fn test_primary_has_no_degradations() {
        assert!(active_degradations(OperatingMode::Primary).is_empty());
        let primary = status(OperatingMode::Primary, Some("/data/tickets.db"));
        assert_eq!(summary(&primary), "All features available");
        assert!(degradation_messages(&primary).is_empty());
    }

    #[test]
    fn test_fallback_degradations() {
        let features: Vec<_> = active_degradations(OperatingMode::Fallback)
            .iter()
            .map(|rule| rule.feature)
            .collect();

        assert!(features.contains(&Feature::Persistence));
        assert!(features.contains(&Feature::Search));
        assert!(features.contains(&Feature::Pooling));
        assert!(!features.contains(&Feature::RecoverySnapshot));

        let crud = active_degradations(OperatingMode::Fallback)
            .into_iter()
            .find(|rule| rule.feature == Feature::Crud)
            .unwrap();
        assert_eq!(crud.degradation_type, DegradationType::Limited);
    }

    #[test]
    fn test_recovering_includes_fallback_rules() {
        let fallback = active_degradations(OperatingMode::Fallback).len();
        let recovering = active_degradations(OperatingMode::Recovering);

        assert!(recovering.len() > fallback);
        assert!(recovering
            .iter()
            .any(|rule| rule.feature == Feature::RecoverySnapshot));
    }

    #[test]
    fn test_rules_sorted_by_severity() {
        let rules = active_degradations(OperatingMode::Recovering);
        assert!(rules.windows(2).all(|w| w[0].severity() >= w[1].severity()));
        assert_eq!(rules[0].feature, Feature::Persistence);
    }

    #[test]
    fn test_rules_agree_with_feature_matrix() {
        // A rule is active exactly when the matrix disables or limits the feature
        for mode in [OperatingMode::Fallback, OperatingMode::Recovering] {
            let features = mode.features();
            for rule in active_degradations(mode) {
                if rule.degradation_type == DegradationType::Disabled {
                    assert_eq!(
                        features.get(&rule.feature),
                        Some(&false),
                        "{:?} should be disabled in {:?}",
                        rule.feature,
                        mode
                    );
                }
            }
        }
    }

    #[test]
    fn test_messages_mention_feature() {
        let memory = status(OperatingMode::Fallback, None);
        let messages = degradation_messages(&memory);
        assert!(messages.iter().any(|m| m.starts_with("search:")));
        assert!(messages.iter().any(|m| m.contains("memory only")));
        assert!(summary(&memory).contains("Reduced functionality"));
    }

    #[test]
    fn test_alternate_database_is_not_reported_as_memory() {
        let alternate = status(OperatingMode::Fallback, Some("/var/tmp/tickets.db"));

        let features: Vec<_> = status_degradations(&alternate)
            .iter()
            .map(|rule| rule.feature)
            .collect();
        assert!(!features.contains(&Feature::Persistence));
        assert!(!features.contains(&Feature::Crud));
        assert!(features.contains(&Feature::Search));

        let messages = degradation_messages(&alternate);
        assert!(messages.iter().all(|m| !m.contains("memory only")));
        assert!(messages[0].contains("/var/tmp/tickets.db"));
        assert!(summary(&alternate).contains("alternate database"));
    }
}
