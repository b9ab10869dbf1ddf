use crate::buffer::{parse_grade, EditBuffer, Field, InvalidCell};
use crate::model::{
    ComponentScore, EvaluationComponent, GradePayload, GradeRecord, Identity, ScoringMode,
};
use crate::sheet::GradeSheet;
use crate::store::{GradeStore, StoreError, StudentGrade};

/// Orchestration failures for the single-row save path. Lock errors stay
/// distinguishable from generic transport failures all the way to the UI,
/// and the buffer entry survives every failure so typed input is never lost.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveError {
    /// No buffered edits for this student; nothing to submit.
    NoChanges,
    /// Buffered values failed save-time validation; nothing was submitted.
    Invalid(Vec<InvalidCell>),
    /// Client-side precondition: the record is not editable, so no store
    /// call is made at all.
    RowLocked { admin: bool },
    /// The store rejected the write as locked.
    Forbidden { admin: bool },
    NotFound(String),
    Transport(String),
}

impl SaveError {
    pub fn code(&self) -> &'static str {
        match self {
            SaveError::NoChanges => "no_changes",
            SaveError::Invalid(_) => "invalid_grades",
            SaveError::RowLocked { .. } | SaveError::Forbidden { .. } => "row_locked",
            SaveError::NotFound(_) => "not_found",
            SaveError::Transport(_) => "store_failed",
        }
    }

    pub fn message(&self) -> String {
        match self {
            SaveError::NoChanges => "no edits to save".to_string(),
            SaveError::Invalid(cells) => format!("{} grade(s) failed validation", cells.len()),
            SaveError::RowLocked { admin } | SaveError::Forbidden { admin } => {
                if *admin {
                    "row is locked; unlock it before saving".to_string()
                } else {
                    "row is locked; contact an administrator".to_string()
                }
            }
            SaveError::NotFound(what) => format!("not found: {}", what),
            SaveError::Transport(msg) => format!("save failed: {}", msg),
        }
    }
}

/// Resolves one field to `edited ?? existing`: a buffered value wins when it
/// parses to a number; a blank edit falls back to the last-known server
/// value. Untouched fields are never implicitly zeroed.
fn resolve_field(
    buffer: &EditBuffer,
    student_id: &str,
    field: &Field,
    existing: Option<f64>,
) -> Result<Option<f64>, InvalidCell> {
    match buffer.entry(student_id).and_then(|e| e.get(field)) {
        Some(raw) => match parse_grade(raw) {
            Ok(Some(v)) => Ok(Some(v)),
            Ok(None) => Ok(existing),
            Err(e) => Err(InvalidCell {
                student_id: student_id.to_string(),
                field: field.label(),
                raw: e.raw,
                reason: e.reason,
            }),
        },
        None => Ok(existing),
    }
}

/// Builds the complete payload for one student. In schema mode the
/// evaluations array always covers the full current component list (the
/// server replaces, never merges); legacy mode sends the single evaluation
/// field instead.
pub fn build_payload(
    element_id: &str,
    row: &StudentGrade,
    buffer: &EditBuffer,
    mode: &ScoringMode,
    components: &[EvaluationComponent],
) -> Result<GradePayload, Vec<InvalidCell>> {
    let student_id = row.student.id.as_str();
    let record = row.grade.as_ref();
    let mut invalid = Vec::new();

    let participation = match resolve_field(
        buffer,
        student_id,
        &Field::Participation,
        record.and_then(|g| g.participation),
    ) {
        Ok(v) => v,
        Err(c) => {
            invalid.push(c);
            None
        }
    };

    let mut evaluation = None;
    let mut evaluations = None;
    match mode {
        ScoringMode::LegacySingleScore => {
            match resolve_field(
                buffer,
                student_id,
                &Field::Evaluation,
                record.and_then(|g| g.evaluation),
            ) {
                Ok(v) => evaluation = v,
                Err(c) => invalid.push(c),
            }
        }
        ScoringMode::SchemaComponents(_) => {
            let mut scores = Vec::with_capacity(components.len());
            for c in components {
                let field = Field::Component(c.key.clone());
                match resolve_field(
                    buffer,
                    student_id,
                    &field,
                    record.and_then(|g| g.component_score(&c.key)),
                ) {
                    Ok(v) => scores.push(ComponentScore {
                        key: c.key.clone(),
                        score: v,
                    }),
                    Err(cell) => invalid.push(cell),
                }
            }
            evaluations = Some(scores);
        }
    }

    if !invalid.is_empty() {
        return Err(invalid);
    }
    Ok(GradePayload {
        student_id: student_id.to_string(),
        element_id: element_id.to_string(),
        participation,
        evaluation,
        evaluations,
    })
}

#[derive(Debug)]
pub struct RowSaved {
    pub record: GradeRecord,
}

/// Single-row save. Refuses before any store call when the row is locked;
/// on success merges the returned record, clears the student's buffer entry
/// and stamps the transient saved marker; on failure the buffer entry is
/// preserved.
pub fn save_row(
    store: &dyn GradeStore,
    identity: &Identity,
    sheet: &mut GradeSheet,
    student_id: &str,
) -> Result<RowSaved, SaveError> {
    let row = sheet
        .row(student_id)
        .ok_or_else(|| SaveError::NotFound(format!("student {}", student_id)))?;

    if !sheet.row_is_editable(student_id) {
        return Err(SaveError::RowLocked {
            admin: identity.is_admin(),
        });
    }
    if sheet.buffer.entry(student_id).is_none() {
        return Err(SaveError::NoChanges);
    }

    let payload = build_payload(
        &sheet.element.id,
        row,
        &sheet.buffer,
        &sheet.mode,
        &sheet.components,
    )
    .map_err(SaveError::Invalid)?;

    match store.save_grade(&payload) {
        Ok(updated) => {
            if let Some(r) = sheet.row_mut(student_id) {
                r.grade = Some(updated.clone());
            }
            sheet.buffer.clear(student_id);
            sheet.mark_saved(student_id);
            Ok(RowSaved { record: updated })
        }
        Err(StoreError::Forbidden) => Err(SaveError::Forbidden {
            admin: identity.is_admin(),
        }),
        Err(StoreError::NotFound(what)) => Err(SaveError::NotFound(what)),
        Err(StoreError::Transport(msg)) => Err(SaveError::Transport(msg)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkFailureKind {
    /// At least one row came back locked.
    Locked,
    Generic,
}

#[derive(Debug, PartialEq)]
pub enum BulkOutcome {
    /// Empty buffer; nothing submitted.
    NoChanges,
    /// Fail-fast: at least one buffered value is invalid, nothing submitted.
    Invalid(Vec<InvalidCell>),
    /// Every touched row is locked; nothing submitted.
    AllRowsLocked,
    Saved {
        saved: usize,
        skipped_locked: usize,
    },
    /// One or more saves failed. The whole record set has been reloaded from
    /// the store, so local state is authoritative and the buffer is empty.
    Failed {
        kind: BulkFailureKind,
        failed: Vec<String>,
        saved: usize,
    },
}

/// Bulk save: one store call per touched, editable student. Every request
/// is dispatched and collected before the outcome is decided, and any
/// failure among them reconciles by reloading the entire record set rather
/// than rolling back selectively. Success reloads too, which is what clears
/// the buffer.
pub fn save_all(
    store: &dyn GradeStore,
    _identity: &Identity,
    sheet: &mut GradeSheet,
) -> Result<BulkOutcome, StoreError> {
    if sheet.buffer.is_empty() {
        return Ok(BulkOutcome::NoChanges);
    }

    let invalid = sheet.buffer.invalid_cells();
    if !invalid.is_empty() {
        return Ok(BulkOutcome::Invalid(invalid));
    }

    let touched = sheet.buffer.touched();
    let mut skipped_locked = 0usize;
    let eligible: Vec<String> = touched
        .into_iter()
        .filter(|sid| {
            let editable = sheet.row_is_editable(sid);
            if !editable {
                skipped_locked += 1;
            }
            editable
        })
        .collect();

    if eligible.is_empty() {
        return Ok(BulkOutcome::AllRowsLocked);
    }

    let mut payloads = Vec::with_capacity(eligible.len());
    for sid in &eligible {
        let Some(row) = sheet.row(sid) else {
            continue;
        };
        // Validation already passed over the whole buffer.
        match build_payload(
            &sheet.element.id,
            row,
            &sheet.buffer,
            &sheet.mode,
            &sheet.components,
        ) {
            Ok(p) => payloads.push(p),
            Err(cells) => return Ok(BulkOutcome::Invalid(cells)),
        }
    }

    // Dispatch everything and collect every result before deciding; a late
    // failure must not leave earlier requests unaccounted for.
    let mut saved = 0usize;
    let mut failed = Vec::new();
    let mut any_forbidden = false;
    for payload in &payloads {
        match store.save_grade(payload) {
            Ok(_) => saved += 1,
            Err(e) => {
                if e == StoreError::Forbidden {
                    any_forbidden = true;
                }
                failed.push(payload.student_id.clone());
            }
        }
    }

    // Partial success is reconciled as total failure: refetch everything so
    // the sheet reflects authoritative state, never a half-applied buffer.
    sheet.reload(store)?;

    if failed.is_empty() {
        Ok(BulkOutcome::Saved {
            saved,
            skipped_locked,
        })
    } else {
        Ok(BulkOutcome::Failed {
            kind: if any_forbidden {
                BulkFailureKind::Locked
            } else {
                BulkFailureKind::Generic
            },
            failed,
            saved,
        })
    }
}
