use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Grades everywhere in this engine are on a 0..20 scale.
pub const GRADE_MAX: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Admin,
}

/// The identity acting on the engine. Injected per session via `session.set`
/// and passed explicitly into the lock gate and the save orchestrator so both
/// stay testable with synthetic identities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationComponent {
    /// Immutable identity once persisted; scored data stays addressable
    /// across renames and reorders.
    pub key: String,
    pub name: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentScore {
    pub key: String,
    pub score: Option<f64>,
}

/// One student's authoritative record for a course element, as last fetched
/// from the store. `presence` and `final_grade` are server-managed; the
/// engine never writes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub student_id: String,
    pub presence: Option<f64>,
    pub participation: Option<f64>,
    /// Legacy single score, used only when the element has no schema
    /// components.
    pub evaluation: Option<f64>,
    pub evaluations: Vec<ComponentScore>,
    pub final_grade: Option<f64>,
    pub is_editable: bool,
}

impl GradeRecord {
    pub fn component_score(&self, key: &str) -> Option<f64> {
        self.evaluations
            .iter()
            .find(|c| c.key == key)
            .and_then(|c| c.score)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub last_name: String,
    pub first_name: String,
    pub student_no: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseElement {
    pub id: String,
    pub name: String,
}

/// How grades are scored for a course element. Decided once from the fetched
/// schema; the save path never re-checks "is the schema empty" after this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScoringMode {
    LegacySingleScore,
    SchemaComponents(BTreeSet<String>),
}

impl ScoringMode {
    pub fn from_components(components: &[EvaluationComponent]) -> Self {
        if components.is_empty() {
            ScoringMode::LegacySingleScore
        } else {
            ScoringMode::SchemaComponents(
                components.iter().map(|c| c.key.clone()).collect(),
            )
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, ScoringMode::LegacySingleScore)
    }
}

/// The full per-student payload submitted to the store. Always complete:
/// untouched fields carry the last-known server value, and in schema mode
/// `evaluations` covers every current component (the server treats the array
/// as a replacement, never a diff).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradePayload {
    pub student_id: String,
    pub element_id: String,
    pub participation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluations: Option<Vec<ComponentScore>>,
}
