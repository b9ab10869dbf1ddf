use crate::model::{EvaluationComponent, Identity};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

/// Component weights are percent points; an element's schema must account
/// for exactly 90 of the final grade (presence and participation carry the
/// remaining 10).
pub const WEIGHT_TOTAL: f64 = 90.0;
pub const WEIGHT_MAX: f64 = 90.0;

/// 2-decimal rounding applied before comparing the weight sum, so entries
/// like 33.33 + 33.33 + 23.34 pass.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// A component as it arrives from the editor: name and weight may still be
/// blank, and only previously persisted components carry a key.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDraft {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SchemaError {
    EmptySchema,
    IncompleteComponent { index: usize },
    DuplicateKey { key: String },
    WeightMismatch { total: f64 },
}

impl SchemaError {
    pub fn code(&self) -> &'static str {
        match self {
            SchemaError::EmptySchema => "schema_invalid",
            SchemaError::IncompleteComponent { .. } => "schema_invalid",
            SchemaError::DuplicateKey { .. } => "schema_invalid",
            SchemaError::WeightMismatch { .. } => "weight_mismatch",
        }
    }

    pub fn message(&self) -> String {
        match self {
            SchemaError::EmptySchema => "schema must have at least one component".to_string(),
            SchemaError::IncompleteComponent { index } => {
                format!("component {} needs a name and a weight", index + 1)
            }
            SchemaError::DuplicateKey { key } => {
                format!("component key {} appears more than once", key)
            }
            SchemaError::WeightMismatch { total } => format!(
                "component weights must sum to {}, currently {}",
                WEIGHT_TOTAL, total
            ),
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            SchemaError::EmptySchema => None,
            SchemaError::IncompleteComponent { index } => Some(json!({ "index": index })),
            SchemaError::DuplicateKey { key } => Some(json!({ "key": key })),
            SchemaError::WeightMismatch { total } => {
                Some(json!({ "total": total, "expected": WEIGHT_TOTAL }))
            }
        }
    }
}

/// Running total the editor displays while the user types. Blank weights
/// count as 0 so the number is always meaningful mid-edit.
pub fn weight_total(components: &[ComponentDraft]) -> f64 {
    round2(components.iter().filter_map(|c| c.weight).sum())
}

/// Gate run before every schema save, and re-run by the UI on every edit.
pub fn validate(components: &[ComponentDraft]) -> Result<(), SchemaError> {
    if components.is_empty() {
        return Err(SchemaError::EmptySchema);
    }
    for (i, c) in components.iter().enumerate() {
        let name_ok = !c.name.trim().is_empty();
        let weight_ok = matches!(c.weight, Some(w) if (0.0..=WEIGHT_MAX).contains(&w));
        if !name_ok || !weight_ok {
            return Err(SchemaError::IncompleteComponent { index: i });
        }
    }
    // Keys address persisted scores, so a schema can never carry one twice.
    let mut seen = std::collections::HashSet::new();
    for c in components {
        if let Some(key) = c.key.as_deref().filter(|k| !k.trim().is_empty()) {
            if !seen.insert(key) {
                return Err(SchemaError::DuplicateKey {
                    key: key.to_string(),
                });
            }
        }
    }
    let total = weight_total(components);
    if total != WEIGHT_TOTAL {
        return Err(SchemaError::WeightMismatch { total });
    }
    Ok(())
}

/// Keys are minted only for components that arrive without one; persisted
/// keys never change, so existing scores stay addressable after renames.
pub fn new_component_key() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("c{}{}", millis, &suffix[..8])
}

/// Resolves drafts into persistable components, minting keys where needed.
/// Callers must have run `validate` first.
pub fn resolve_components(drafts: &[ComponentDraft]) -> Vec<EvaluationComponent> {
    drafts
        .iter()
        .map(|d| EvaluationComponent {
            key: d
                .key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .unwrap_or_else(new_component_key),
            name: d.name.trim().to_string(),
            weight: d.weight.unwrap_or(0.0),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    Editable,
    Locked,
}

impl LockState {
    /// Derived on load, never stored: locked as soon as any grade exists
    /// for the element. The Editable -> Locked transition is observed on
    /// the next reload after a first save, not computed locally.
    pub fn from_has_grades(has_grades: bool) -> Self {
        if has_grades {
            LockState::Locked
        } else {
            LockState::Editable
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteGate {
    Allowed,
    /// Admin writing over a locked schema: allowed only once the caller
    /// confirms that every dependent final grade will be recalculated.
    ConfirmRequired,
    Denied,
}

/// Lock policy for schema writes. Non-admins are blocked outright while
/// locked; admins must pass an explicit confirmation flag.
pub fn gate_write(lock: LockState, identity: &Identity, confirmed: bool) -> WriteGate {
    match lock {
        LockState::Editable => WriteGate::Allowed,
        LockState::Locked if !identity.is_admin() => WriteGate::Denied,
        LockState::Locked if confirmed => WriteGate::Allowed,
        LockState::Locked => WriteGate::ConfirmRequired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    fn draft(name: &str, weight: Option<f64>) -> ComponentDraft {
        ComponentDraft {
            key: None,
            name: name.to_string(),
            weight,
        }
    }

    fn identity(role: Role) -> Identity {
        Identity {
            user_id: "u1".into(),
            role,
        }
    }

    #[test]
    fn empty_schema_rejected() {
        assert_eq!(validate(&[]), Err(SchemaError::EmptySchema));
    }

    #[test]
    fn component_without_name_or_weight_rejected() {
        let drafts = vec![draft("Test 1", Some(40.0)), draft("  ", Some(50.0))];
        assert_eq!(
            validate(&drafts),
            Err(SchemaError::IncompleteComponent { index: 1 })
        );

        let drafts = vec![draft("Test 1", Some(40.0)), draft("Test 2", None)];
        assert_eq!(
            validate(&drafts),
            Err(SchemaError::IncompleteComponent { index: 1 })
        );
    }

    #[test]
    fn forty_fifty_sums_to_ninety_and_passes() {
        let drafts = vec![draft("Test1", Some(40.0)), draft("Test2", Some(50.0))];
        assert_eq!(weight_total(&drafts), 90.0);
        assert_eq!(validate(&drafts), Ok(()));
    }

    #[test]
    fn extra_component_pushes_total_past_ninety() {
        let drafts = vec![
            draft("Test1", Some(40.0)),
            draft("Test2", Some(50.0)),
            draft("Quiz", Some(5.0)),
        ];
        assert_eq!(
            validate(&drafts),
            Err(SchemaError::WeightMismatch { total: 95.0 })
        );
    }

    #[test]
    fn repeated_component_key_rejected() {
        let drafts = vec![
            ComponentDraft {
                key: Some("kX".into()),
                name: "Test1".into(),
                weight: Some(40.0),
            },
            ComponentDraft {
                key: Some("kX".into()),
                name: "Test2".into(),
                weight: Some(50.0),
            },
        ];
        assert_eq!(
            validate(&drafts),
            Err(SchemaError::DuplicateKey { key: "kX".into() })
        );
    }

    #[test]
    fn fractional_weights_compare_after_rounding() {
        let drafts = vec![
            draft("A", Some(33.33)),
            draft("B", Some(33.33)),
            draft("C", Some(23.34)),
        ];
        assert_eq!(validate(&drafts), Ok(()));
    }

    #[test]
    fn resolve_mints_keys_only_for_new_components() {
        let drafts = vec![
            ComponentDraft {
                key: Some("kept".into()),
                name: "Old".into(),
                weight: Some(40.0),
            },
            draft("New", Some(50.0)),
        ];
        let resolved = resolve_components(&drafts);
        assert_eq!(resolved[0].key, "kept");
        assert!(!resolved[1].key.is_empty());
        assert_ne!(resolved[1].key, "kept");
    }

    #[test]
    fn component_keys_are_distinct() {
        let a = new_component_key();
        let b = new_component_key();
        assert_ne!(a, b);
    }

    #[test]
    fn lock_gate_matrix() {
        let teacher = identity(Role::Teacher);
        let admin = identity(Role::Admin);

        assert_eq!(
            gate_write(LockState::Editable, &teacher, false),
            WriteGate::Allowed
        );
        assert_eq!(
            gate_write(LockState::Locked, &teacher, false),
            WriteGate::Denied
        );
        // Even a confirming teacher stays blocked.
        assert_eq!(
            gate_write(LockState::Locked, &teacher, true),
            WriteGate::Denied
        );
        assert_eq!(
            gate_write(LockState::Locked, &admin, false),
            WriteGate::ConfirmRequired
        );
        assert_eq!(
            gate_write(LockState::Locked, &admin, true),
            WriteGate::Allowed
        );
    }
}
