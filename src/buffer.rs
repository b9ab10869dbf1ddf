use crate::model::GRADE_MAX;
use serde::Serialize;
use std::collections::HashMap;

/// A grade field addressable by the edit buffer. Component scores are keyed
/// by the schema component key, never by position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    Participation,
    Evaluation,
    Component(String),
}

impl Field {
    pub fn label(&self) -> String {
        match self {
            Field::Participation => "participation".to_string(),
            Field::Evaluation => "evaluation".to_string(),
            Field::Component(key) => format!("evaluations.{}", key),
        }
    }
}

/// Sparse overlay of one student's typed edits. Values are the raw strings
/// from the editor, stored verbatim; validation happens at save time so
/// typing is never blocked.
#[derive(Debug, Clone, Default)]
pub struct RowEdit {
    pub participation: Option<String>,
    pub evaluation: Option<String>,
    pub evaluations: HashMap<String, String>,
}

impl RowEdit {
    pub fn get(&self, field: &Field) -> Option<&str> {
        match field {
            Field::Participation => self.participation.as_deref(),
            Field::Evaluation => self.evaluation.as_deref(),
            Field::Component(key) => self.evaluations.get(key).map(|s| s.as_str()),
        }
    }

    fn set(&mut self, field: &Field, value: String) {
        match field {
            Field::Participation => self.participation = Some(value),
            Field::Evaluation => self.evaluation = Some(value),
            Field::Component(key) => {
                self.evaluations.insert(key.clone(), value);
            }
        }
    }

    fn fields(&self) -> Vec<(Field, &str)> {
        let mut out = Vec::new();
        if let Some(v) = self.participation.as_deref() {
            out.push((Field::Participation, v));
        }
        if let Some(v) = self.evaluation.as_deref() {
            out.push((Field::Evaluation, v));
        }
        for (k, v) in &self.evaluations {
            out.push((Field::Component(k.clone()), v.as_str()));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueError {
    pub raw: String,
    pub reason: String,
}

/// Save-time parse of one buffered value. Blank means "no score", anything
/// else must be a number in [0, 20]. Accepts decimal commas since grade
/// sheets in the field carry both notations.
pub fn parse_grade(raw: &str) -> Result<Option<f64>, ValueError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let normalized = trimmed.replace(',', ".");
    let value: f64 = normalized.parse().map_err(|_| ValueError {
        raw: raw.to_string(),
        reason: "not a number".to_string(),
    })?;
    if !value.is_finite() || !(0.0..=GRADE_MAX).contains(&value) {
        return Err(ValueError {
            raw: raw.to_string(),
            reason: format!("must be between 0 and {}", GRADE_MAX),
        });
    }
    Ok(Some(value))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidCell {
    pub student_id: String,
    pub field: String,
    pub raw: String,
    pub reason: String,
}

/// In-memory overlay of unsaved edits for one grade sheet, keyed by student.
/// Never persisted; lives for one editing session. Entries are cleared
/// whole-student on confirmed save, or wholesale on reload.
#[derive(Debug, Clone, Default)]
pub struct EditBuffer {
    entries: HashMap<String, RowEdit>,
}

impl EditBuffer {
    pub fn set_field(&mut self, student_id: &str, field: &Field, value: &str) {
        self.entries
            .entry(student_id.to_string())
            .or_default()
            .set(field, value.to_string());
    }

    pub fn entry(&self, student_id: &str) -> Option<&RowEdit> {
        self.entries.get(student_id)
    }

    /// Overlay-if-present-else-original. Pure read; repeated calls without
    /// intervening writes return the same answer.
    pub fn effective<'a>(
        &'a self,
        student_id: &str,
        field: &Field,
        original: Option<&'a str>,
    ) -> Option<&'a str> {
        self.entries
            .get(student_id)
            .and_then(|e| e.get(field))
            .or(original)
    }

    pub fn clear(&mut self, student_id: &str) {
        self.entries.remove(student_id);
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Students with at least one buffered edit, in stable order.
    pub fn touched(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_invalid(&self) -> bool {
        !self.invalid_cells().is_empty()
    }

    /// Every buffered value that would fail at save time, across all
    /// students and fields, for inline display.
    pub fn invalid_cells(&self) -> Vec<InvalidCell> {
        let mut out = Vec::new();
        let mut student_ids: Vec<&String> = self.entries.keys().collect();
        student_ids.sort();
        for sid in student_ids {
            let edit = &self.entries[sid];
            for (field, raw) in edit.fields() {
                if let Err(e) = parse_grade(raw) {
                    out.push(InvalidCell {
                        student_id: sid.clone(),
                        field: field.label(),
                        raw: e.raw,
                        reason: e.reason,
                    });
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_grade_accepts_blank_and_range() {
        assert_eq!(parse_grade(""), Ok(None));
        assert_eq!(parse_grade("   "), Ok(None));
        assert_eq!(parse_grade("0"), Ok(Some(0.0)));
        assert_eq!(parse_grade("20"), Ok(Some(20.0)));
        assert_eq!(parse_grade("12.5"), Ok(Some(12.5)));
        assert_eq!(parse_grade("12,5"), Ok(Some(12.5)));
    }

    #[test]
    fn parse_grade_rejects_out_of_range_and_garbage() {
        assert!(parse_grade("25").is_err());
        assert!(parse_grade("-1").is_err());
        assert!(parse_grade("20.01").is_err());
        assert!(parse_grade("abc").is_err());
        assert!(parse_grade("1/2").is_err());
    }

    #[test]
    fn effective_prefers_overlay_then_falls_back() {
        let mut buf = EditBuffer::default();
        assert_eq!(
            buf.effective("s1", &Field::Participation, Some("14")),
            Some("14")
        );

        buf.set_field("s1", &Field::Participation, "17");
        assert_eq!(
            buf.effective("s1", &Field::Participation, Some("14")),
            Some("17")
        );
        // Idempotent under repeated reads.
        assert_eq!(
            buf.effective("s1", &Field::Participation, Some("14")),
            Some("17")
        );
        // Other students untouched.
        assert_eq!(
            buf.effective("s2", &Field::Participation, Some("14")),
            Some("14")
        );
    }

    #[test]
    fn entries_are_per_student_and_clear_whole_rows() {
        let mut buf = EditBuffer::default();
        buf.set_field("s1", &Field::Participation, "10");
        buf.set_field("s1", &Field::Component("k1".into()), "12");
        buf.set_field("s2", &Field::Component("k1".into()), "8");

        assert_eq!(buf.touched(), vec!["s1".to_string(), "s2".to_string()]);

        buf.clear("s1");
        assert!(buf.entry("s1").is_none());
        assert_eq!(
            buf.effective("s2", &Field::Component("k1".into()), None),
            Some("8")
        );

        buf.clear_all();
        assert!(buf.is_empty());
    }

    #[test]
    fn has_invalid_flags_any_bad_cell() {
        let mut buf = EditBuffer::default();
        buf.set_field("s1", &Field::Participation, "15");
        assert!(!buf.has_invalid());

        buf.set_field("s2", &Field::Participation, "25");
        assert!(buf.has_invalid());

        let cells = buf.invalid_cells();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].student_id, "s2");
        assert_eq!(cells[0].field, "participation");
    }

    #[test]
    fn blank_buffered_value_is_not_invalid() {
        let mut buf = EditBuffer::default();
        buf.set_field("s1", &Field::Evaluation, "");
        assert!(!buf.has_invalid());
    }
}
