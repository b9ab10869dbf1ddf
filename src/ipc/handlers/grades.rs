use crate::buffer::Field;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::ScoringMode;
use crate::save::{save_all, save_row, BulkFailureKind, BulkOutcome, SaveError};
use crate::sheet::GradeSheet;
use crate::store::StoreError;
use serde_json::json;

fn format_grade(v: Option<f64>) -> String {
    match v {
        Some(x) => {
            if x.fract() == 0.0 {
                format!("{}", x as i64)
            } else {
                format!("{}", x)
            }
        }
        None => String::new(),
    }
}

/// The effective view the UI renders: buffered raw text where the user has
/// typed, formatted server values everywhere else.
fn sheet_view(sheet: &mut GradeSheet) -> serde_json::Value {
    let recently_saved = sheet.recently_saved();
    let mode = match sheet.mode {
        ScoringMode::LegacySingleScore => "legacy",
        ScoringMode::SchemaComponents(_) => "components",
    };

    let mut rows = Vec::with_capacity(sheet.rows.len());
    for row in &sheet.rows {
        let sid = row.student.id.as_str();
        let grade = row.grade.as_ref();
        let editable = grade.map(|g| g.is_editable).unwrap_or(true);

        let participation_orig = format_grade(grade.and_then(|g| g.participation));
        let participation = sheet
            .buffer
            .effective(sid, &Field::Participation, Some(participation_orig.as_str()))
            .unwrap_or("")
            .to_string();

        let mut effective = json!({ "participation": participation });
        match &sheet.mode {
            ScoringMode::LegacySingleScore => {
                let orig = format_grade(grade.and_then(|g| g.evaluation));
                effective["evaluation"] = json!(sheet
                    .buffer
                    .effective(sid, &Field::Evaluation, Some(orig.as_str()))
                    .unwrap_or(""));
            }
            ScoringMode::SchemaComponents(_) => {
                let mut scores = serde_json::Map::new();
                for c in &sheet.components {
                    let orig = format_grade(grade.and_then(|g| g.component_score(&c.key)));
                    let field = Field::Component(c.key.clone());
                    scores.insert(
                        c.key.clone(),
                        json!(sheet
                            .buffer
                            .effective(sid, &field, Some(orig.as_str()))
                            .unwrap_or("")),
                    );
                }
                effective["evaluations"] = serde_json::Value::Object(scores);
            }
        }

        rows.push(json!({
            "student": row.student,
            "presence": grade.and_then(|g| g.presence),
            "finalGrade": grade.and_then(|g| g.final_grade),
            "editable": editable,
            "dirty": sheet.buffer.entry(sid).is_some(),
            "recentlySaved": recently_saved.iter().any(|s| s == sid),
            "effective": effective,
        }));
    }

    json!({
        "element": sheet.element,
        "locked": sheet.lock,
        "mode": mode,
        "components": sheet.components,
        "rows": rows,
        "invalid": sheet.buffer.invalid_cells(),
    })
}

fn handle_grades_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(element_id) = req.params.get("elementId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.elementId", None);
    };

    match GradeSheet::open(store, element_id) {
        Ok(mut sheet) => {
            let view = sheet_view(&mut sheet);
            state.sheets.insert(element_id.to_string(), sheet);
            ok(&req.id, view)
        }
        Err(StoreError::NotFound(what)) => err(&req.id, "not_found", what, None),
        Err(e) => err(&req.id, "store_failed", e.to_string(), None),
    }
}

fn handle_grades_sheet(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(element_id) = req.params.get("elementId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.elementId", None);
    };
    let Some(sheet) = state.sheets.get_mut(element_id) else {
        return err(&req.id, "not_found", "no open sheet for element", None);
    };
    let view = sheet_view(sheet);
    ok(&req.id, view)
}

fn parse_field(sheet: &GradeSheet, req: &Request) -> Result<Field, serde_json::Value> {
    let field = req.params.get("field").and_then(|v| v.as_str());
    match field {
        Some("participation") => Ok(Field::Participation),
        Some("evaluation") => {
            if !sheet.mode.is_legacy() {
                return Err(err(
                    &req.id,
                    "bad_params",
                    "this element scores by components, not a single evaluation",
                    None,
                ));
            }
            Ok(Field::Evaluation)
        }
        Some("component") => {
            let Some(key) = req.params.get("key").and_then(|v| v.as_str()) else {
                return Err(err(&req.id, "bad_params", "missing params.key", None));
            };
            if !sheet.components.iter().any(|c| c.key == key) {
                return Err(err(
                    &req.id,
                    "bad_params",
                    format!("unknown component key {}", key),
                    None,
                ));
            }
            Ok(Field::Component(key.to_string()))
        }
        _ => Err(err(
            &req.id,
            "bad_params",
            "field must be participation, evaluation or component",
            None,
        )),
    }
}

/// Buffers one keystrokeful of input verbatim. Never rejects a value on
/// shape; only unknown targets fail.
fn handle_grades_set_field(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(element_id) = req.params.get("elementId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.elementId", None);
    };
    let Some(student_id) = req.params.get("studentId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.studentId", None);
    };
    let Some(value) = req.params.get("value").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.value", None);
    };
    let Some(sheet) = state.sheets.get_mut(element_id) else {
        return err(&req.id, "not_found", "no open sheet for element", None);
    };
    if sheet.row(student_id).is_none() {
        return err(&req.id, "not_found", "student not on this sheet", None);
    }

    let field = match parse_field(sheet, req) {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    sheet.buffer.set_field(student_id, &field, value);
    ok(
        &req.id,
        json!({
            "dirty": true,
            "invalid": sheet.buffer.invalid_cells(),
        }),
    )
}

fn handle_grades_revert_row(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(element_id) = req.params.get("elementId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.elementId", None);
    };
    let Some(student_id) = req.params.get("studentId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.studentId", None);
    };
    let Some(sheet) = state.sheets.get_mut(element_id) else {
        return err(&req.id, "not_found", "no open sheet for element", None);
    };

    sheet.buffer.clear(student_id);
    ok(&req.id, json!({ "dirty": false }))
}

fn save_error_response(req: &Request, e: SaveError) -> serde_json::Value {
    let details = match &e {
        SaveError::Invalid(cells) => Some(json!({ "cells": cells })),
        _ => None,
    };
    err(&req.id, e.code(), e.message(), details)
}

fn handle_grades_save_row(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(identity) = state.identity.as_ref() else {
        return err(&req.id, "no_session", "set a session identity first", None);
    };
    let Some(element_id) = req.params.get("elementId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.elementId", None);
    };
    let Some(student_id) = req.params.get("studentId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.studentId", None);
    };
    let Some(sheet) = state.sheets.get_mut(element_id) else {
        return err(&req.id, "not_found", "no open sheet for element", None);
    };

    match save_row(store, identity, sheet, student_id) {
        Ok(saved) => ok(
            &req.id,
            json!({
                "record": saved.record,
                "recentlySaved": true,
            }),
        ),
        Err(e) => save_error_response(req, e),
    }
}

fn handle_grades_save_all(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(identity) = state.identity.as_ref() else {
        return err(&req.id, "no_session", "set a session identity first", None);
    };
    let Some(element_id) = req.params.get("elementId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.elementId", None);
    };
    let Some(sheet) = state.sheets.get_mut(element_id) else {
        return err(&req.id, "not_found", "no open sheet for element", None);
    };

    match save_all(store, identity, sheet) {
        Ok(BulkOutcome::NoChanges) => ok(&req.id, json!({ "status": "noChanges", "saved": 0 })),
        Ok(BulkOutcome::Invalid(cells)) => err(
            &req.id,
            "invalid_grades",
            format!("{} grade(s) failed validation; nothing was saved", cells.len()),
            Some(json!({ "cells": cells })),
        ),
        Ok(BulkOutcome::AllRowsLocked) => err(
            &req.id,
            "all_rows_locked",
            "every edited row is locked; nothing to save",
            None,
        ),
        Ok(BulkOutcome::Saved {
            saved,
            skipped_locked,
        }) => ok(
            &req.id,
            json!({
                "status": "saved",
                "saved": saved,
                "skippedLocked": skipped_locked,
            }),
        ),
        Ok(BulkOutcome::Failed {
            kind,
            failed,
            saved,
        }) => {
            let (code, message) = match kind {
                BulkFailureKind::Locked => (
                    "row_locked",
                    "one or more rows are locked; the sheet was reloaded from the store",
                ),
                BulkFailureKind::Generic => (
                    "store_failed",
                    "one or more saves failed; the sheet was reloaded from the store",
                ),
            };
            err(
                &req.id,
                code,
                message,
                Some(json!({
                    "failed": failed,
                    "saved": saved,
                    "reloaded": true,
                })),
            )
        }
        Err(e) => err(&req.id, "store_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.open" => Some(handle_grades_open(state, req)),
        "grades.sheet" => Some(handle_grades_sheet(state, req)),
        "grades.setField" => Some(handle_grades_set_field(state, req)),
        "grades.revertRow" => Some(handle_grades_revert_row(state, req)),
        "grades.saveRow" => Some(handle_grades_save_row(state, req)),
        "grades.saveAll" => Some(handle_grades_save_all(state, req)),
        _ => None,
    }
}
